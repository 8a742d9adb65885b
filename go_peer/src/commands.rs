//! Console line parsing

use anyhow::{anyhow, bail, Context, Result};
use ring_arena::{GameId, NodeCommand, PeerId};

/// Games the short forms of the commands refer to
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Game being played or last started
    pub current: Option<GameId>,
    /// Last invitation received
    pub invite: Option<GameId>,
}

/// What a console line asks for
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Forwarded to the node
    Node(NodeCommand),
    /// Print a board
    Board(GameId),
    Stats,
    Help,
    Quit,
}

pub const HELP: &[&str] = &[
    "join                         enter the ring",
    "online                       list peers answering an online query",
    "find <peer>                  look a peer up by id",
    "findgame <game>              look up the host of an open game",
    "invite <peer|ai> [size] [komi]",
    "accept [game] | decline [game] | cancel [game]",
    "play [game] <x> <y>          place a stone",
    "pass [game] | pause [game] | surrender [game] | reconnect [game]",
    "chat <text>                  talk to the opponent of the current game",
    "history [peer] [limit]       finished games",
    "board [game]                 show the board",
    "stats | help | quit",
];

const DEFAULT_BOARD_SIZE: u8 = 19;
const DEFAULT_KOMI: f32 = 6.5;
const DEFAULT_HISTORY_LIMIT: usize = 10;

fn number<T: std::str::FromStr>(word: &str, what: &str) -> Result<T> {
    word.parse().map_err(|_| anyhow!("'{}' is not a valid {}", word, what))
}

fn peer(word: Option<&str>) -> Result<PeerId> {
    let word = word.context("missing peer id")?;
    Ok(PeerId::from_name(word)?)
}

/// Explicit game id, else the fallback
fn game(word: Option<&str>, fallback: Option<&GameId>) -> Result<GameId> {
    match word {
        Some(id) => Ok(GameId::from(id)),
        None => fallback.cloned().context("no game selected, give its id"),
    }
}

/// Parse one console line; blank lines give `None`
pub fn parse_line(line: &str, selection: &Selection) -> Result<Option<Input>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let arg = |i: usize| args.get(i).copied();
    let current = selection.current.as_ref();

    let input = match verb.to_lowercase().as_str() {
        "join" => Input::Node(NodeCommand::Join),
        "online" => Input::Node(NodeCommand::OnlinePeers),
        "find" => Input::Node(NodeCommand::LookupPeer(peer(arg(0))?)),
        "findgame" => Input::Node(NodeCommand::LookupGame(game(arg(0), None)?)),
        "invite" => {
            let target = arg(0).context("missing peer id")?;
            let board_size = arg(1).map(|w| number(w, "board size")).transpose()?.unwrap_or(DEFAULT_BOARD_SIZE);
            let komi = arg(2).map(|w| number(w, "komi")).transpose()?.unwrap_or(DEFAULT_KOMI);
            if !(2..=25).contains(&board_size) {
                bail!("board size must be between 2 and 25");
            }
            if target.eq_ignore_ascii_case("ai") {
                Input::Node(NodeCommand::InviteAi { board_size, komi })
            } else {
                Input::Node(NodeCommand::Invite {
                    peer: PeerId::from_name(target)?,
                    board_size,
                    komi,
                })
            }
        }
        "accept" => Input::Node(NodeCommand::Accept(game(arg(0), selection.invite.as_ref())?)),
        "decline" => Input::Node(NodeCommand::Decline(game(arg(0), selection.invite.as_ref())?)),
        "cancel" => Input::Node(NodeCommand::CancelInvite(game(arg(0), current)?)),
        "play" => {
            let (game_id, x, y) = match args.as_slice() {
                [x, y] => (game(None, current)?, *x, *y),
                [id, x, y] => (GameId::from(*id), *x, *y),
                _ => bail!("usage: play [game] <x> <y>"),
            };
            Input::Node(NodeCommand::Play {
                game_id,
                x: number(x, "coordinate")?,
                y: number(y, "coordinate")?,
            })
        }
        "pass" => Input::Node(NodeCommand::Pass(game(arg(0), current)?)),
        "pause" => Input::Node(NodeCommand::Pause(game(arg(0), current)?)),
        "surrender" => Input::Node(NodeCommand::Surrender(game(arg(0), current)?)),
        "reconnect" => Input::Node(NodeCommand::Reconnect(game(arg(0), current)?)),
        "chat" => {
            if args.is_empty() {
                bail!("nothing to say");
            }
            Input::Node(NodeCommand::Chat {
                game_id: game(None, current)?,
                text: args.join(" "),
            })
        }
        "history" => {
            // a lone number is a limit, anything else a peer id
            let (peer, limit) = match args.as_slice() {
                [] => (None, DEFAULT_HISTORY_LIMIT),
                [word] => match word.parse::<usize>() {
                    Ok(limit) => (None, limit),
                    Err(_) => (Some(PeerId::from_name(*word)?), DEFAULT_HISTORY_LIMIT),
                },
                [word, limit, ..] => (Some(PeerId::from_name(*word)?), number(limit, "limit")?),
            };
            Input::Node(NodeCommand::History { peer, limit })
        }
        "board" => Input::Board(game(arg(0), current)?),
        "stats" => Input::Stats,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => bail!("unknown command '{}', try 'help'", other),
    };
    Ok(Some(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected() -> Selection {
        Selection {
            current: Some(GameId::from("g1")),
            invite: Some(GameId::from("g2")),
        }
    }

    #[test]
    fn test_blank_line() {
        assert_eq!(parse_line("   ", &Selection::default()).unwrap(), None);
    }

    #[test]
    fn test_invite_defaults_and_ai() {
        let input = parse_line("invite bob", &Selection::default()).unwrap();
        assert_eq!(
            input,
            Some(Input::Node(NodeCommand::Invite {
                peer: PeerId::from_name("bob").unwrap(),
                board_size: 19,
                komi: 6.5,
            }))
        );
        let input = parse_line("invite AI 9 0.5", &Selection::default()).unwrap();
        assert_eq!(
            input,
            Some(Input::Node(NodeCommand::InviteAi {
                board_size: 9,
                komi: 0.5,
            }))
        );
        assert!(parse_line("invite bob 40", &Selection::default()).is_err());
        assert!(parse_line("invite bob nine", &Selection::default()).is_err());
    }

    #[test]
    fn test_short_forms_use_the_selection() {
        let selection = selected();
        assert_eq!(
            parse_line("play 3 4", &selection).unwrap(),
            Some(Input::Node(NodeCommand::Play {
                game_id: GameId::from("g1"),
                x: 3,
                y: 4,
            }))
        );
        assert_eq!(
            parse_line("play g9 0 0", &selection).unwrap(),
            Some(Input::Node(NodeCommand::Play {
                game_id: GameId::from("g9"),
                x: 0,
                y: 0,
            }))
        );
        assert_eq!(
            parse_line("accept", &selection).unwrap(),
            Some(Input::Node(NodeCommand::Accept(GameId::from("g2"))))
        );
        assert_eq!(
            parse_line("pass", &selection).unwrap(),
            Some(Input::Node(NodeCommand::Pass(GameId::from("g1"))))
        );
        assert_eq!(
            parse_line("chat good game", &selection).unwrap(),
            Some(Input::Node(NodeCommand::Chat {
                game_id: GameId::from("g1"),
                text: "good game".to_string(),
            }))
        );
        assert!(parse_line("pass", &Selection::default()).is_err());
    }

    #[test]
    fn test_history_forms() {
        let none = Selection::default();
        assert_eq!(
            parse_line("history", &none).unwrap(),
            Some(Input::Node(NodeCommand::History { peer: None, limit: 10 }))
        );
        assert_eq!(
            parse_line("history 3", &none).unwrap(),
            Some(Input::Node(NodeCommand::History { peer: None, limit: 3 }))
        );
        assert_eq!(
            parse_line("history bob 2", &none).unwrap(),
            Some(Input::Node(NodeCommand::History {
                peer: Some(PeerId::from_name("bob").unwrap()),
                limit: 2,
            }))
        );
    }

    #[test]
    fn test_local_commands_and_errors() {
        let selection = selected();
        assert_eq!(parse_line("board", &selection).unwrap(), Some(Input::Board(GameId::from("g1"))));
        assert_eq!(parse_line("QUIT", &selection).unwrap(), Some(Input::Quit));
        assert!(parse_line("find", &selection).is_err());
        assert!(parse_line("find bad/id", &selection).is_err());
        assert!(parse_line("dance", &selection).is_err());
    }
}
