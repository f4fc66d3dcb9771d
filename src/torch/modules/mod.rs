//! Torch modules
pub mod attention;
mod embedding;
mod generator;
mod linear;
pub mod rnn;

pub use attention::{
    build_attention, AttentionOutput, ContextGateAttention, CoverageAttention, GlobalAttention,
};
pub use embedding::Embedding;
pub use generator::{LinearGenerator, NllCriterion};
pub use linear::Linear;
pub use rnn::{build_cell, Gru, Lstm, StackedRnn};

use super::dropout::DropoutMasks;
use super::utils;
use smallvec::SmallVec;
use std::fmt::Debug;
use tch::Tensor;

/// Per-layer recurrent state tensors.
///
/// Holds `num_effective_layers` tensors of shape `[BATCH_SIZE, RNN_SIZE]`.
/// LSTM layers contribute a cell state followed by a hidden state; GRU layers a hidden state.
/// The last tensor is the top layer output.
// Hold up to 4 tensors (2 LSTM layers) without allocating
pub type LayerState = SmallVec<[Tensor; 4]>;

/// A stacked recurrent cell evaluated one timestep at a time.
pub trait RecurrentCell: Debug {
    /// Size of the hidden state of each layer.
    fn output_size(&self) -> usize;

    /// Number of stacked layers.
    fn num_layers(&self) -> usize;

    /// Number of state tensors across all layers.
    fn num_effective_layers(&self) -> usize;

    /// Variational dropout probability.
    fn dropout(&self) -> f64;

    /// Apply one timestep.
    ///
    /// # Args
    /// * `input` - Input features. An f32 tensor of shape `[BATCH_SIZE, INPUT_SIZE]`.
    /// * `states` - Previous states; `num_effective_layers` tensors.
    /// * `masks` - Dropout masks applied to the inputs of layers after the first and to the
    ///     previous hidden state of every layer.
    ///
    /// # Returns
    /// The next states in the same layout as `states`.
    fn step(&self, input: &Tensor, states: &[Tensor], masks: &DropoutMasks) -> LayerState;
}

/// Attention over a source context matrix.
pub trait Attention: Debug {
    /// Whether the attention consumes and produces a coverage vector.
    fn uses_coverage(&self) -> bool {
        false
    }

    /// Attend to the source context.
    ///
    /// # Args
    /// * `hidden` - Top layer decoder state. Shape `[BATCH_SIZE, RNN_SIZE]`.
    /// * `context` - Source context. Shape `[BATCH_SIZE, SOURCE_LENGTH, RNN_SIZE]`.
    /// * `coverage` - Previous coverage. Shape `[BATCH_SIZE, SOURCE_LENGTH, COVERAGE_SIZE]`.
    ///     Treated as zero if missing.
    /// * `source_mask` - Boolean `[BATCH_SIZE, SOURCE_LENGTH]`; `false` marks padding that
    ///     receives no attention weight. If `None` every position is attended.
    fn attend(
        &self,
        hidden: &Tensor,
        context: &Tensor,
        coverage: Option<&Tensor>,
        source_mask: Option<&Tensor>,
    ) -> AttentionOutput;
}

/// Maps attended decoder outputs to token log-probabilities.
pub trait Generator: Debug {
    /// Log-probabilities over the target vocabulary.
    ///
    /// Returns a singleton list holding an f32 tensor of shape `[BATCH_SIZE, VOCAB_SIZE]`.
    fn forward(&self, attended: &Tensor) -> Vec<Tensor>;

    /// Gradient with respect to `attended` given gradients with respect to the outputs.
    ///
    /// Accumulates the gradient of the generator parameters.
    fn backward(&self, attended: &Tensor, grad_outputs: &[Tensor]) -> Tensor {
        let grad_outputs: Vec<&Tensor> = grad_outputs.iter().collect();
        utils::vjp(&[attended], &grad_outputs, |x| self.forward(&x[0])).swap_remove(0)
    }
}

/// Training loss on generator predictions.
pub trait Criterion: Debug {
    /// Total loss of the predictions.
    ///
    /// # Args
    /// * `predictions` - Generator output list.
    /// * `targets` - Expected tokens. An `i64` tensor of shape `[BATCH_SIZE]`.
    fn forward(&self, predictions: &[Tensor], targets: &Tensor) -> f64;

    /// Gradient of the loss with respect to each prediction.
    fn backward(&self, predictions: &[Tensor], targets: &Tensor) -> Vec<Tensor>;
}
