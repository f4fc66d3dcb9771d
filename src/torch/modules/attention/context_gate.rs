//! Global attention with a context gate
use super::super::{Attention, Linear};
use super::global::attend_context;
use super::AttentionOutput;
use tch::{nn::Path, Tensor};

/// Global attention whose output balances source and target information with a gate.
///
/// ```text
/// c = attended source context (as in global attention)
/// z = sigmoid(W_z [c; h])
/// attended = tanh(W_out [z * c; (1 - z) * h])
/// ```
#[derive(Debug)]
pub struct ContextGateAttention {
    linear_in: Linear,
    gate: Linear,
    linear_out: Linear,
}

impl ContextGateAttention {
    pub fn new(vs: &Path, rnn_size: usize) -> Self {
        Self {
            linear_in: Linear::new(&(vs / "linear_in"), rnn_size, rnn_size, false),
            gate: Linear::new(&(vs / "gate"), 2 * rnn_size, rnn_size, true),
            linear_out: Linear::new(&(vs / "linear_out"), 2 * rnn_size, rnn_size, false),
        }
    }
}

impl Attention for ContextGateAttention {
    fn attend(
        &self,
        hidden: &Tensor,
        context: &Tensor,
        _coverage: Option<&Tensor>,
        source_mask: Option<&Tensor>,
    ) -> AttentionOutput {
        let weighted = attend_context(&self.linear_in, hidden, context, source_mask);
        let z = self
            .gate
            .forward(&Tensor::cat(&[&weighted, hidden], 1))
            .sigmoid();
        let source = &z * &weighted;
        let target = (1.0 - &z) * hidden;
        let attended = self
            .linear_out
            .forward(&Tensor::cat(&[source, target], 1))
            .tanh();
        AttentionOutput {
            attended,
            coverage: None,
        }
    }
}
