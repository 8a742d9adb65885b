//! Collaborators consumed by the session layer: rules, AI, persistence
//!
//! The session layer only talks to these traits. The default implementations
//! are deliberately small so a node can run without external programs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use super::game::{Move, SessionSnapshot, StoneColor};
use crate::error::{ArenaError, Result};

/// Result of submitting a stone to the rule engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    pub accepted: bool,
    pub captures: u32,
}

impl MoveOutcome {
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            captures: 0,
        }
    }
}

/// Final score of a game
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub black: f32,
    pub white: f32,
    pub winner: Option<StoneColor>,
}

/// Board rules, one instance per game
///
/// `apply_move` with `enforce_legality == false` replays a move that was
/// already validated elsewhere (snapshot adoption).
pub trait RuleEngine: Send {
    fn apply_move(&mut self, x: i32, y: i32, color: StoneColor, enforce_legality: bool) -> MoveOutcome;

    fn score(&self, komi: f32) -> ScoreResult;
}

/// Factory creating a rule engine for a board size
pub type RuleEngineFactory = Arc<dyn Fn(u8) -> Box<dyn RuleEngine> + Send + Sync>;

/// Move suggestion from the AI collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiMove {
    Place(i32, i32),
    Pass,
}

/// Synchronous AI opponent, called off the async runtime
pub trait AiEngine: Send + Sync {
    fn request_move(&self, color: StoneColor, position: &SessionSnapshot) -> AiMove;
}

/// Opaque key-value persistence
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn save(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// Collaborators a node's session layer runs with
#[derive(Clone)]
pub struct Collaborators {
    pub rules: RuleEngineFactory,
    /// `None` disables games against the AI
    pub ai: Option<Arc<dyn AiEngine>>,
    pub storage: Arc<dyn Storage>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            rules: Arc::new(SimpleBoard::factory),
            ai: Some(Arc::new(RandomAi)),
            storage: Arc::new(MemoryStorage::new()),
        }
    }
}

/// Capture-aware board without ko detection
#[derive(Debug, Clone)]
pub struct SimpleBoard {
    size: usize,
    cells: Vec<Option<StoneColor>>,
}

impl SimpleBoard {
    pub fn new(size: u8) -> Self {
        let size = size as usize;
        Self {
            size,
            cells: vec![None; size * size],
        }
    }

    /// Boxed constructor usable inside a [`RuleEngineFactory`]
    pub fn factory(size: u8) -> Box<dyn RuleEngine> {
        Box::new(Self::new(size))
    }

    /// Replay a move log with legality checks turned off
    pub fn replay(size: u8, moves: &[Move]) -> Self {
        let mut board = Self::new(size);
        for mv in moves.iter().filter(|m| !m.is_pass()) {
            board.apply_move(mv.x, mv.y, mv.color, false);
        }
        board
    }

    pub fn stone(&self, x: i32, y: i32) -> Option<StoneColor> {
        self.index(x, y).and_then(|i| self.cells[i])
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.size || y as usize >= self.size {
            return None;
        }
        Some(y as usize * self.size + x as usize)
    }

    fn neighbors(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        let (x, y) = ((i % self.size) as i32, (i / self.size) as i32);
        [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)]
            .into_iter()
            .filter_map(move |(nx, ny)| self.index(nx, ny))
    }

    /// Stones of the group containing `i` and whether it has a liberty
    fn group(&self, i: usize) -> (Vec<usize>, bool) {
        let Some(color) = self.cells[i] else {
            return (Vec::new(), true);
        };
        let mut stack = vec![i];
        let mut seen = vec![false; self.cells.len()];
        seen[i] = true;
        let mut stones = Vec::new();
        let mut free = false;
        while let Some(cur) = stack.pop() {
            stones.push(cur);
            for n in self.neighbors(cur) {
                match self.cells[n] {
                    None => free = true,
                    Some(c) if c == color && !seen[n] => {
                        seen[n] = true;
                        stack.push(n);
                    }
                    _ => {}
                }
            }
        }
        (stones, free)
    }
}

impl RuleEngine for SimpleBoard {
    fn apply_move(&mut self, x: i32, y: i32, color: StoneColor, enforce_legality: bool) -> MoveOutcome {
        let Some(i) = self.index(x, y) else {
            return MoveOutcome::rejected();
        };
        if self.cells[i].is_some() {
            if enforce_legality {
                return MoveOutcome::rejected();
            }
            self.cells[i] = None;
        }
        self.cells[i] = Some(color);

        let mut captures = 0;
        let adjacent: Vec<usize> = self.neighbors(i).collect();
        for n in adjacent {
            if self.cells[n] == Some(color.opponent()) {
                let (stones, free) = self.group(n);
                if !free {
                    captures += stones.len() as u32;
                    for s in stones {
                        self.cells[s] = None;
                    }
                }
            }
        }

        if enforce_legality && captures == 0 && !self.group(i).1 {
            // suicide
            self.cells[i] = None;
            return MoveOutcome::rejected();
        }

        MoveOutcome {
            accepted: true,
            captures,
        }
    }

    fn score(&self, komi: f32) -> ScoreResult {
        let count = |c: StoneColor| self.cells.iter().filter(|cell| **cell == Some(c)).count() as f32;
        let black = count(StoneColor::Black);
        let white = count(StoneColor::White) + komi;
        let winner = if black > white {
            Some(StoneColor::Black)
        } else if white > black {
            Some(StoneColor::White)
        } else {
            None
        };
        ScoreResult { black, white, winner }
    }
}

/// AI that plays a random free intersection and answers a pass with a pass
#[derive(Debug, Default)]
pub struct RandomAi;

impl AiEngine for RandomAi {
    fn request_move(&self, _color: StoneColor, position: &SessionSnapshot) -> AiMove {
        if position.moves.last().is_some_and(Move::is_pass) {
            return AiMove::Pass;
        }
        let board = SimpleBoard::replay(position.board_size, &position.moves);
        let size = position.board_size as i32;
        let free: Vec<(i32, i32)> = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x, y)))
            .filter(|&(x, y)| board.stone(x, y).is_none())
            .collect();
        match free.choose(&mut rand::rng()) {
            Some(&(x, y)) => AiMove::Place(x, y),
            None => AiMove::Pass,
        }
    }
}

/// Process-local storage, used when no storage directory is configured
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ArenaError::Storage("memory storage lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ArenaError::Storage("memory storage lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ArenaError::Storage("memory storage lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) the storage directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ArenaError::Storage(format!("cannot create '{}': {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(file)
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArenaError::Storage(format!("load '{}': {}", key, e))),
        }
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        std::fs::write(self.path(key), value)
            .map_err(|e| ArenaError::Storage(format!("save '{}': {}", key, e)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArenaError::Storage(format!("remove '{}': {}", key, e))),
        }
    }
}
