//! Vocabulary sentinels
use serde::{Deserialize, Serialize};

/// Special token identifiers and the default decoding length limit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sentinels {
    /// Padding token.
    pub pad: i64,
    /// Unknown word token.
    pub unk: i64,
    /// Beginning of sentence; the first decoder input.
    pub bos: i64,
    /// End of sentence.
    pub eos: i64,
    /// Maximum number of tokens produced by greedy sampling.
    pub max_length: usize,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self {
            pad: 0,
            unk: 1,
            bos: 2,
            eos: 3,
            max_length: 50,
        }
    }
}
