//! Display-name generation for peers that log in without choosing a name

use markov_namegen::{CharacterChainGenerator, RandomTextGenerator};

/// Training corpus: names of go masters and go vocabulary, so generated
/// names sound like they belong at a go board
const TRAINING_NAMES: &[&str] = &[
    "Shusaku", "Dosaku", "Jowa", "Shuei", "Shuwa", "Genan", "Inseki", "Honinbo",
    "Sakata", "Takagawa", "Kitani", "Fujisawa", "Otake", "Kato", "Cho", "Kobayashi",
    "Rin", "Kaiho", "Iyama", "Yuta", "Iyuta", "Shinji", "Sedol", "Changho",
    "Hikaru", "Akira", "Touya", "Sai", "Kaga", "Waya", "Isumi", "Ochi",
    "Hoshi", "Komoku", "Sansan", "Tengen", "Hane", "Kosumi", "Keima", "Nobi",
    "Tesuji", "Joseki", "Fuseki", "Sente", "Gote", "Miai", "Atari", "Shicho",
];

fn create_name_generator() -> CharacterChainGenerator {
    CharacterChainGenerator::builder()
        .with_order(2)
        .with_prior(0.005)
        .train(TRAINING_NAMES.iter().copied())
        .build()
}

/// Generate a pronounceable display name such as "Shuwaki" or "Tesumi"
///
/// Only alphanumeric characters are produced so the name can double as a
/// peer id. Length is kept between 3 and 10 characters.
pub fn generate_display_name() -> String {
    let mut generator = create_name_generator();

    loop {
        let name = generator.generate_one();
        let len = name.chars().count();
        if (3..=10).contains(&len) && name.chars().all(|c| c.is_alphanumeric()) {
            return name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_display_name() {
        let name = generate_display_name();
        let len = name.chars().count();
        assert!((3..=10).contains(&len));
        assert!(name.chars().all(|c| c.is_alphanumeric()));
    }

    #[test]
    fn test_display_names_vary() {
        let names: std::collections::HashSet<String> =
            (0..20).map(|_| generate_display_name()).collect();
        assert!(names.len() > 3, "Should generate reasonably varied names");
    }
}
