//! Proof-of-work: find a nonce such that hex(SHA-256(challenge ++ decimal(nonce))) starts with
//! `difficulty` zero characters.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

/// Nonces tried per worker between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// A SHA-256 digest has 64 hex characters.
pub const MAX_DIFFICULTY: u32 = 64;

/// Server-issued puzzle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puzzle {
    pub challenge: String,
    pub difficulty: u32,
}

impl Puzzle {
    pub fn new(challenge: impl Into<String>, difficulty: u32) -> Self {
        Self {
            challenge: challenge.into(),
            difficulty,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PowError {
    #[error("proof-of-work cancelled")]
    Cancelled,
    #[error("difficulty {0} exceeds the {MAX_DIFFICULTY} hex digits of a SHA-256 digest")]
    Unsatisfiable(u32),
    #[error("nonce space exhausted")]
    Exhausted,
    #[error("solver worker failed: {0}")]
    Worker(String),
}

/// Hash `challenge ++ decimal(nonce)`.
pub fn digest(challenge: &str, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hasher.finalize().into()
}

/// True if the hex form of `hash` starts with `difficulty` '0' characters.
pub fn has_leading_zero_nibbles(hash: &[u8; 32], difficulty: u32) -> bool {
    if difficulty > MAX_DIFFICULTY {
        return false;
    }
    let full = (difficulty / 2) as usize;
    if hash[..full].iter().any(|&b| b != 0) {
        return false;
    }
    difficulty % 2 == 0 || hash[full] >> 4 == 0
}

/// Check a candidate solution.
pub fn verify(puzzle: &Puzzle, nonce: u64) -> bool {
    has_leading_zero_nibbles(&digest(&puzzle.challenge, nonce), puzzle.difficulty)
}

/// Sequential search from nonce 0 upward. Returns the lowest satisfying nonce.
pub fn solve(puzzle: &Puzzle, cancel: &CancellationToken) -> Result<u64, PowError> {
    if puzzle.difficulty > MAX_DIFFICULTY {
        return Err(PowError::Unsatisfiable(puzzle.difficulty));
    }
    let prefix = Sha256::new_with_prefix(puzzle.challenge.as_bytes());
    let mut nonce = 0u64;
    loop {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(PowError::Cancelled);
        }
        if check_with_prefix(&prefix, nonce, puzzle.difficulty) {
            return Ok(nonce);
        }
        nonce = nonce.checked_add(1).ok_or(PowError::Exhausted)?;
    }
}

/// Search with `workers` threads, worker `w` scanning nonces `w, w + workers, ...`.
/// Each worker stops once its next candidate is not below the best found so far, so the result
/// is still the lowest satisfying nonce.
pub fn solve_sharded(
    puzzle: &Puzzle,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<u64, PowError> {
    if workers <= 1 {
        return solve(puzzle, cancel);
    }
    if puzzle.difficulty > MAX_DIFFICULTY {
        return Err(PowError::Unsatisfiable(puzzle.difficulty));
    }
    let best = AtomicU64::new(u64::MAX);
    let prefix = Sha256::new_with_prefix(puzzle.challenge.as_bytes());
    let stride = workers as u64;

    std::thread::scope(|scope| {
        for w in 0..stride {
            let best = &best;
            let prefix = &prefix;
            scope.spawn(move || {
                let mut nonce = w;
                let mut tried = 0u64;
                while nonce < best.load(Ordering::Relaxed) {
                    if tried % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                        return;
                    }
                    if check_with_prefix(prefix, nonce, puzzle.difficulty) {
                        best.fetch_min(nonce, Ordering::Relaxed);
                        return;
                    }
                    tried += 1;
                    match nonce.checked_add(stride) {
                        Some(next) => nonce = next,
                        None => return,
                    }
                }
            });
        }
    });

    if cancel.is_cancelled() {
        return Err(PowError::Cancelled);
    }
    match best.load(Ordering::Relaxed) {
        u64::MAX => Err(PowError::Exhausted),
        nonce => Ok(nonce),
    }
}

/// Run the search on the blocking pool so the async driver stays responsive.
pub async fn solve_off_thread(
    puzzle: Puzzle,
    workers: usize,
    cancel: CancellationToken,
) -> Result<u64, PowError> {
    tokio::task::spawn_blocking(move || solve_sharded(&puzzle, workers, &cancel))
        .await
        .map_err(|e| PowError::Worker(e.to_string()))?
}

/// Number of solver threads to use when none is configured.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn check_with_prefix(prefix: &Sha256, nonce: u64, difficulty: u32) -> bool {
    let mut hasher = prefix.clone();
    hasher.update(nonce.to_string().as_bytes());
    let hash: [u8; 32] = hasher.finalize().into();
    has_leading_zero_nibbles(&hash, difficulty)
}
