//! Token embeddings
use crate::torch::initializers::{Initializer, VarianceScale};
use tch::{nn::Path, Tensor};

/// Token embedding lookup table.
///
/// The padding row starts at zero and receives no gradient.
#[derive(Debug)]
pub struct Embedding {
    weight: Tensor,
    padding_idx: i64,
}

impl Embedding {
    pub fn new(vs: &Path, vocab_size: usize, dim: usize, padding_idx: i64) -> Self {
        let weight = Initializer::Uniform(VarianceScale::FanIn).add_var(
            vs,
            "weight",
            &[vocab_size as i64, dim as i64],
        );
        if (0..vocab_size as i64).contains(&padding_idx) {
            let _no_grad = tch::no_grad_guard();
            let _ = weight.get(padding_idx).zero_();
        }
        Self {
            weight,
            padding_idx,
        }
    }

    /// Embed a batch of tokens: `[BATCH_SIZE]` of `i64` to `[BATCH_SIZE, DIM]`.
    #[inline]
    pub fn forward(&self, tokens: &Tensor) -> Tensor {
        Tensor::embedding(&self.weight, tokens, self.padding_idx, false, false)
    }
}
