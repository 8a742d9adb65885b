//! ASCII rendering of a session

use ring_arena::session::SimpleBoard;
use ring_arena::{PeerId, SessionSnapshot, StoneColor};

fn stone_char(color: Option<StoneColor>) -> char {
    match color {
        Some(StoneColor::Black) => 'X',
        Some(StoneColor::White) => 'O',
        None => '.',
    }
}

/// Board lines followed by a status line; the last stone is shown in brackets
pub fn render_board(snapshot: &SessionSnapshot, local: &PeerId) -> Vec<String> {
    let size = snapshot.board_size as i32;
    let board = SimpleBoard::replay(snapshot.board_size, &snapshot.moves);
    let last = snapshot.moves.last().filter(|m| !m.is_pass()).map(|m| (m.x, m.y));

    let mut lines = Vec::with_capacity(size as usize + 2);
    let header: String = (0..size).map(|x| format!("{:>2}", x % 100)).collect();
    lines.push(format!("   {}", header));
    for y in 0..size {
        let mut line = format!("{:>2} ", y);
        // brackets take the place of the separating spaces so columns stay aligned
        let mut close = false;
        for x in 0..size {
            let marked = last == Some((x, y));
            line.push(if marked { '[' } else if close { ']' } else { ' ' });
            line.push(stone_char(board.stone(x, y)));
            close = marked;
        }
        if close {
            line.push(']');
        }
        lines.push(line);
    }

    let you = if &snapshot.black == local {
        "black (X)"
    } else if &snapshot.white == local {
        "white (O)"
    } else {
        "spectator"
    };
    lines.push(format!(
        "game {}  move {}  {} to play  you: {}  [{}]",
        snapshot.game_id, snapshot.version, snapshot.turn, you, snapshot.state
    ));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring_arena::session::{TimeBudgets, SNAPSHOT_SCHEMA};
    use ring_arena::{GameId, Move, SessionState};

    fn snapshot(moves: Vec<Move>) -> SessionSnapshot {
        SessionSnapshot {
            schema: SNAPSHOT_SCHEMA,
            game_id: GameId::from("g"),
            host_id: PeerId::from_name("alice").unwrap(),
            black: PeerId::from_name("alice").unwrap(),
            white: PeerId::from_name("bob").unwrap(),
            board_size: 3,
            komi: 0.5,
            version: moves.len() as u64,
            turn: if moves.len() % 2 == 0 { StoneColor::Black } else { StoneColor::White },
            moves,
            state: SessionState::Active,
            last_move_at_ms: 0,
            winner: None,
            budgets: TimeBudgets::uniform(1000),
        }
    }

    #[test]
    fn test_empty_board() {
        let lines = render_board(&snapshot(Vec::new()), &PeerId::from_name("alice").unwrap());
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "    0 1 2");
        assert_eq!(lines[1], " 0  . . .");
        assert!(lines[4].contains("you: black (X)"));
        assert!(lines[4].contains("black to play"));
    }

    #[test]
    fn test_last_move_is_marked() {
        let moves = vec![
            Move::place(0, 0, StoneColor::Black),
            Move::place(2, 1, StoneColor::White),
        ];
        let lines = render_board(&snapshot(moves), &PeerId::from_name("bob").unwrap());
        assert_eq!(lines[1], " 0  X . .");
        assert_eq!(lines[2], " 1  . .[O]");
        assert!(lines[4].contains("you: white (O)"));
    }
}
