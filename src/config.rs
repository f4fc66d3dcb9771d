//! Model configuration
#![allow(clippy::use_self)] // false positive with serde derives
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Recurrent cell type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    /// Long Short-Term Memory; each layer holds a cell and a hidden state.
    Lstm,
    /// Gated Recurrent Unit; each layer holds a hidden state.
    Gru,
}

impl Default for CellType {
    fn default() -> Self {
        Self::Lstm
    }
}

impl CellType {
    /// Number of state tensors carried by each layer.
    pub const fn states_per_layer(self) -> usize {
        match self {
            Self::Lstm => 2,
            Self::Gru => 1,
        }
    }
}

/// Attention kind selected by configuration when coverage is disabled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttentionKind {
    /// Global attention with a bilinear score.
    #[serde(rename = "global")]
    Global,
    /// Global attention followed by a context gate.
    #[serde(rename = "cgate")]
    ContextGate,
}

impl Default for AttentionKind {
    fn default() -> Self {
        Self::Global
    }
}

impl FromStr for AttentionKind {
    type Err = BuildModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "cgate" => Ok(Self::ContextGate),
            _ => Err(BuildModelError::UnknownAttention(s.into())),
        }
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::ContextGate => write!(f, "cgate"),
        }
    }
}

/// The attention module actually wired into the decoder.
///
/// Coverage attention is mutually exclusive with the other two kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AttentionType {
    Global,
    ContextGate,
    Coverage,
}

/// Error building a model from a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildModelError {
    #[error("{name} must be positive")]
    ZeroSize { name: &'static str },
    #[error("dropout probability {0} is outside [0, 1)")]
    InvalidDropout(f64),
    #[error("unknown attention kind {0:?}; expected \"global\" or \"cgate\"")]
    UnknownAttention(String),
}

/// Encoder-decoder configuration.
///
/// Deserializing a configuration that predates coverage support (no `coverage_size` or
/// `attention` fields) yields no coverage and global attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredModelConfig")]
pub struct ModelConfig {
    pub cell: CellType,
    /// Number of recurrent layers in both the encoder and the decoder.
    pub layers: usize,
    /// Size of the recurrent hidden states and of the attended output.
    pub rnn_size: usize,
    /// Size of the word embeddings.
    pub word_vec_size: usize,
    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
    /// Variational dropout probability.
    pub dropout: f64,
    /// Feed the previous attended output as an additional decoder input.
    pub input_feed: bool,
    /// Size of the per-source-position coverage vector. Zero disables coverage.
    pub coverage_size: usize,
    pub attention: AttentionKind,
    /// Give zero attention weight to source padding.
    pub mask_padding: bool,
}

impl ModelConfig {
    /// Configuration with the given vocabulary sizes and default settings otherwise.
    pub fn new(src_vocab_size: usize, tgt_vocab_size: usize) -> Self {
        Self {
            cell: CellType::default(),
            layers: 2,
            rnn_size: 500,
            word_vec_size: 500,
            src_vocab_size,
            tgt_vocab_size,
            dropout: 0.3,
            input_feed: true,
            coverage_size: 0,
            attention: AttentionKind::default(),
            mask_padding: false,
        }
    }

    /// Check that the configuration describes a buildable model.
    pub fn validate(&self) -> Result<(), BuildModelError> {
        for (name, size) in [
            ("layers", self.layers),
            ("rnn_size", self.rnn_size),
            ("word_vec_size", self.word_vec_size),
            ("src_vocab_size", self.src_vocab_size),
            ("tgt_vocab_size", self.tgt_vocab_size),
        ] {
            if size == 0 {
                return Err(BuildModelError::ZeroSize { name });
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(BuildModelError::InvalidDropout(self.dropout));
        }
        Ok(())
    }

    /// Number of state tensors per timestep across all layers.
    pub const fn num_effective_layers(&self) -> usize {
        self.layers * self.cell.states_per_layer()
    }

    /// Size of the decoder cell input: the word embedding plus the input feed, if any.
    pub const fn decoder_input_size(&self) -> usize {
        if self.input_feed {
            self.word_vec_size + self.rnn_size
        } else {
            self.word_vec_size
        }
    }

    /// The attention module to wire into the decoder.
    ///
    /// Coverage attention is used whenever `coverage_size > 0`, regardless of `attention`.
    pub fn attention_type(&self) -> AttentionType {
        if self.coverage_size > 0 {
            if self.attention != AttentionKind::Global {
                warn!(
                    "coverage_size = {} overrides attention = {}; using coverage attention",
                    self.coverage_size, self.attention
                );
            }
            AttentionType::Coverage
        } else {
            match self.attention {
                AttentionKind::Global => AttentionType::Global,
                AttentionKind::ContextGate => AttentionType::ContextGate,
            }
        }
    }
}

/// Serialized form of [`ModelConfig`] in which later additions are optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct StoredModelConfig {
    #[serde(default)]
    cell: CellType,
    layers: usize,
    rnn_size: usize,
    word_vec_size: usize,
    src_vocab_size: usize,
    tgt_vocab_size: usize,
    dropout: f64,
    input_feed: bool,
    coverage_size: Option<usize>,
    attention: Option<AttentionKind>,
    #[serde(default)]
    mask_padding: bool,
}

impl From<StoredModelConfig> for ModelConfig {
    fn from(stored: StoredModelConfig) -> Self {
        let coverage_size = stored.coverage_size.unwrap_or_else(|| {
            info!("configuration has no coverage_size; coverage disabled");
            0
        });
        let attention = stored.attention.unwrap_or_else(|| {
            info!("configuration has no attention kind; using global attention");
            AttentionKind::Global
        });
        Self {
            cell: stored.cell,
            layers: stored.layers,
            rnn_size: stored.rnn_size,
            word_vec_size: stored.word_vec_size,
            src_vocab_size: stored.src_vocab_size,
            tgt_vocab_size: stored.tgt_vocab_size,
            dropout: stored.dropout,
            input_feed: stored.input_feed,
            coverage_size,
            attention,
            mask_padding: stored.mask_padding,
        }
    }
}
