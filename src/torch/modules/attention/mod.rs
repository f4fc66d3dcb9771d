//! Attention over the source context
mod context_gate;
mod coverage;
mod global;

pub use context_gate::ContextGateAttention;
pub use coverage::CoverageAttention;
pub use global::GlobalAttention;

use super::Attention;
use crate::config::AttentionType;
use tch::{nn::Path, Tensor};

/// Output of [`Attention::attend`].
#[derive(Debug)]
pub struct AttentionOutput {
    /// Attended output. Shape `[BATCH_SIZE, RNN_SIZE]`.
    pub attended: Tensor,
    /// Next coverage, if the attention tracks coverage.
    pub coverage: Option<Tensor>,
}

/// Build the attention module of the given type.
pub fn build_attention(
    vs: &Path,
    attention_type: AttentionType,
    rnn_size: usize,
    coverage_size: usize,
) -> Box<dyn Attention> {
    match attention_type {
        AttentionType::Global => Box::new(GlobalAttention::new(vs, rnn_size)),
        AttentionType::ContextGate => Box::new(ContextGateAttention::new(vs, rnn_size)),
        AttentionType::Coverage => Box::new(CoverageAttention::new(vs, rnn_size, coverage_size)),
    }
}

/// Normalize attention scores over the source positions.
///
/// Positions where `source_mask` is `false` get zero weight.
///
/// # Args
/// * `scores` - Shape `[BATCH_SIZE, SOURCE_LENGTH]`.
/// * `source_mask` - Boolean, shape `[BATCH_SIZE, SOURCE_LENGTH]`.
fn attention_weights(scores: &Tensor, source_mask: Option<&Tensor>) -> Tensor {
    match source_mask {
        Some(mask) => scores
            .masked_fill(&mask.logical_not(), f64::NEG_INFINITY)
            .softmax(-1, scores.kind()),
        None => scores.softmax(-1, scores.kind()),
    }
}

/// Weighted sum of the context rows.
///
/// `[BATCH_SIZE, SOURCE_LENGTH]` weights and `[BATCH_SIZE, SOURCE_LENGTH, RNN_SIZE]` context
/// to `[BATCH_SIZE, RNN_SIZE]`.
fn weighted_context(weights: &Tensor, context: &Tensor) -> Tensor {
    weights.unsqueeze(1).bmm(context).squeeze_dim(1)
}
