//! Collaborators consumed by the room host: the puzzle engine that judges
//! guesses and the store that keeps player scores.
//!
//! Both are traits so a deployment can plug in real services; the in-memory
//! implementations here back the daemon and the tests.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque reference to a running puzzle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PuzzleHandle(u64);

/// Result of applying one guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// The guess matched a hidden word not found before
    pub correct: bool,
    /// Every hidden word has now been found
    pub solved: bool,
}

pub trait PuzzleEngine: Send + Sync {
    /// Start a puzzle sized for `participants` players at difficulty `level`.
    fn start_puzzle(&self, participants: usize, level: u32) -> PuzzleHandle;

    /// Judge a guess made by `player`.
    ///
    /// Unknown handles yield an incorrect, unsolved outcome.
    fn apply_guess(&self, handle: PuzzleHandle, guess: &str, player: &str) -> Outcome;

    /// Release a puzzle. No-op for unknown handles.
    fn finish(&self, handle: PuzzleHandle);
}

/// A player's accumulated score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub single_player: i64,
    pub multiplayer: i64,
}

impl Score {
    pub fn total(&self) -> i64 {
        self.single_player + self.multiplayer
    }
}

pub trait ScoreStore: Send + Sync {
    fn update_score(&self, name: &str, delta: i64, multiplayer: bool);
    fn get_score(&self, name: &str) -> Score;
}

struct Puzzle {
    hidden: BTreeSet<String>,
    found: BTreeSet<String>,
}

/// Word-hunt puzzle: a random draw of words from a fixed list must all be
/// guessed. More players and higher levels hide more words.
pub struct WordListPuzzle {
    words: Vec<String>,
    next_handle: AtomicU64,
    puzzles: Mutex<HashMap<PuzzleHandle, Puzzle>>,
}

impl WordListPuzzle {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut words: Vec<String> = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        words.sort();
        words.dedup();
        Self {
            words,
            next_handle: AtomicU64::new(1),
            puzzles: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a newline-separated word list.
    pub fn from_text(text: &str) -> Self {
        Self::new(text.lines())
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Words still hidden in a puzzle.
    pub fn remaining(&self, handle: PuzzleHandle) -> Option<usize> {
        let puzzles = self.puzzles.lock().unwrap_or_else(|e| e.into_inner());
        puzzles
            .get(&handle)
            .map(|p| p.hidden.len() - p.found.len())
    }
}

impl Default for WordListPuzzle {
    fn default() -> Self {
        Self::new([
            "anchor", "bridge", "candle", "dragon", "ember", "falcon", "garden", "harbor",
            "island", "jungle", "kettle", "lantern", "meadow", "nectar", "orchard", "pepper",
        ])
    }
}

impl PuzzleEngine for WordListPuzzle {
    fn start_puzzle(&self, participants: usize, level: u32) -> PuzzleHandle {
        let wanted = (participants + level as usize).clamp(1, self.words.len().max(1));
        let mut pool = self.words.clone();
        pool.shuffle(&mut rand::rng());
        pool.truncate(wanted);

        let handle = PuzzleHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut puzzles = self.puzzles.lock().unwrap_or_else(|e| e.into_inner());
        puzzles.insert(
            handle,
            Puzzle {
                hidden: pool.into_iter().collect(),
                found: BTreeSet::new(),
            },
        );
        handle
    }

    fn apply_guess(&self, handle: PuzzleHandle, guess: &str, _player: &str) -> Outcome {
        let mut puzzles = self.puzzles.lock().unwrap_or_else(|e| e.into_inner());
        let Some(puzzle) = puzzles.get_mut(&handle) else {
            return Outcome {
                correct: false,
                solved: false,
            };
        };
        let guess = guess.trim().to_lowercase();
        let correct = puzzle.hidden.contains(&guess) && puzzle.found.insert(guess);
        Outcome {
            correct,
            solved: !puzzle.hidden.is_empty() && puzzle.found.len() == puzzle.hidden.len(),
        }
    }

    fn finish(&self, handle: PuzzleHandle) {
        let mut puzzles = self.puzzles.lock().unwrap_or_else(|e| e.into_inner());
        puzzles.remove(&handle);
    }
}

/// Process-local score table.
#[derive(Default)]
pub struct InMemoryScores {
    scores: Mutex<HashMap<String, Score>>,
}

impl InMemoryScores {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScoreStore for InMemoryScores {
    fn update_score(&self, name: &str, delta: i64, multiplayer: bool) {
        let mut scores = self.scores.lock().unwrap_or_else(|e| e.into_inner());
        let score = scores.entry(name.to_string()).or_default();
        if multiplayer {
            score.multiplayer += delta;
        } else {
            score.single_player += delta;
        }
    }

    fn get_score(&self, name: &str) -> Score {
        let scores = self.scores.lock().unwrap_or_else(|e| e.into_inner());
        scores.get(name).copied().unwrap_or_default()
    }
}
