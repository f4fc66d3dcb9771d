//! Output generator and training criterion
use super::{Criterion, Generator, Linear};
use tch::{nn::Path, Kind, Tensor};

/// Linear projection to the target vocabulary followed by a log-softmax.
#[derive(Debug)]
pub struct LinearGenerator {
    projection: Linear,
}

impl LinearGenerator {
    pub fn new(vs: &Path, rnn_size: usize, vocab_size: usize) -> Self {
        Self {
            projection: Linear::new(vs, rnn_size, vocab_size, true),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.projection.out_dim()
    }
}

impl Generator for LinearGenerator {
    fn forward(&self, attended: &Tensor) -> Vec<Tensor> {
        vec![self.projection.forward(attended).log_softmax(-1, Kind::Float)]
    }
}

/// Summed negative log-likelihood of the target tokens.
///
/// Targets equal to `ignore_index` (padding) contribute neither loss nor gradient.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NllCriterion {
    pub ignore_index: i64,
}

impl NllCriterion {
    pub const fn new(ignore_index: i64) -> Self {
        Self { ignore_index }
    }

    fn weights(&self, log_probs: &Tensor, targets: &Tensor) -> Tensor {
        targets.ne(self.ignore_index).to_kind(log_probs.kind())
    }
}

impl Criterion for NllCriterion {
    fn forward(&self, predictions: &[Tensor], targets: &Tensor) -> f64 {
        let log_probs = &predictions[0];
        let target_log_probs = log_probs
            .gather(1, &targets.unsqueeze(1), false)
            .squeeze_dim(1);
        let loss = -(target_log_probs * self.weights(log_probs, targets)).sum(Kind::Double);
        f64::from(loss)
    }

    fn backward(&self, predictions: &[Tensor], targets: &Tensor) -> Vec<Tensor> {
        let log_probs = &predictions[0];
        let num_classes = log_probs.size()[1];
        let grad = targets.one_hot(num_classes).to_kind(log_probs.kind())
            * self.weights(log_probs, targets).unsqueeze(1)
            * -1.0;
        vec![grad]
    }
}
