//! Coverage attention
use super::super::{Attention, Linear};
use super::{attention_weights, weighted_context, AttentionOutput};
use tch::{nn::Path, Tensor};

/// Attention that tracks how much each source position has been attended.
///
/// Scores use an additive (MLP) form with the previous coverage as an extra term.
/// The coverage is updated with a recurrent function of the previous coverage,
/// the attention weight, the decoder state and the source context.
///
/// ```text
/// e_s = v . tanh(W_c c_s + W_h h + W_v cov_s)
/// a = softmax(e)
/// attended = tanh(W_out [a context; h])
/// cov'_s = tanh(U_v cov_s + u_a a_s + U_h h + U_c c_s)
/// ```
#[derive(Debug)]
pub struct CoverageAttention {
    coverage_size: i64,
    score_context: Linear,
    score_hidden: Linear,
    score_coverage: Linear,
    score_out: Linear,
    linear_out: Linear,
    update_coverage: Linear,
    update_weight: Linear,
    update_hidden: Linear,
    update_context: Linear,
}

impl CoverageAttention {
    pub fn new(vs: &Path, rnn_size: usize, coverage_size: usize) -> Self {
        Self {
            coverage_size: coverage_size as i64,
            score_context: Linear::new(&(vs / "score_context"), rnn_size, rnn_size, false),
            score_hidden: Linear::new(&(vs / "score_hidden"), rnn_size, rnn_size, true),
            score_coverage: Linear::new(&(vs / "score_coverage"), coverage_size, rnn_size, false),
            score_out: Linear::new(&(vs / "score_out"), rnn_size, 1, false),
            linear_out: Linear::new(&(vs / "linear_out"), 2 * rnn_size, rnn_size, false),
            update_coverage: Linear::new(
                &(vs / "update_coverage"),
                coverage_size,
                coverage_size,
                true,
            ),
            update_weight: Linear::new(&(vs / "update_weight"), 1, coverage_size, false),
            update_hidden: Linear::new(&(vs / "update_hidden"), rnn_size, coverage_size, false),
            update_context: Linear::new(&(vs / "update_context"), rnn_size, coverage_size, false),
        }
    }
}

impl Attention for CoverageAttention {
    fn uses_coverage(&self) -> bool {
        true
    }

    fn attend(
        &self,
        hidden: &Tensor,
        context: &Tensor,
        coverage: Option<&Tensor>,
        source_mask: Option<&Tensor>,
    ) -> AttentionOutput {
        let coverage = match coverage {
            Some(coverage) => coverage.shallow_clone(),
            None => {
                let context_size = context.size();
                Tensor::zeros(
                    &[context_size[0], context_size[1], self.coverage_size],
                    (context.kind(), context.device()),
                )
            }
        };

        let energy = (self.score_context.forward(context)
            + self.score_hidden.forward(hidden).unsqueeze(1)
            + self.score_coverage.forward(&coverage))
        .tanh();
        let scores = self.score_out.forward(&energy).squeeze_dim(2);
        let weights = attention_weights(&scores, source_mask);

        let weighted = weighted_context(&weights, context);
        let attended = self
            .linear_out
            .forward(&Tensor::cat(&[&weighted, hidden], 1))
            .tanh();

        let next_coverage = (self.update_coverage.forward(&coverage)
            + self.update_weight.forward(&weights.unsqueeze(2))
            + self.update_hidden.forward(hidden).unsqueeze(1)
            + self.update_context.forward(context))
        .tanh();

        AttentionOutput {
            attended,
            coverage: Some(next_coverage),
        }
    }
}
