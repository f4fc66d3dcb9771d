//! Global attention
use super::super::{Attention, Linear};
use super::{attention_weights, weighted_context, AttentionOutput};
use tch::{nn::Path, Tensor};

/// Global attention with a bilinear ("general") score.
///
/// ```text
/// a = softmax(context W h)
/// attended = tanh(W_out [a context; h])
/// ```
#[derive(Debug)]
pub struct GlobalAttention {
    linear_in: Linear,
    linear_out: Linear,
}

impl GlobalAttention {
    pub fn new(vs: &Path, rnn_size: usize) -> Self {
        Self {
            linear_in: Linear::new(&(vs / "linear_in"), rnn_size, rnn_size, false),
            linear_out: Linear::new(&(vs / "linear_out"), 2 * rnn_size, rnn_size, false),
        }
    }
}

/// Source context weighted by bilinear attention scores.
pub(super) fn attend_context(
    linear_in: &Linear,
    hidden: &Tensor,
    context: &Tensor,
    source_mask: Option<&Tensor>,
) -> Tensor {
    let target = linear_in.forward(hidden).unsqueeze(2);
    let scores = context.bmm(&target).squeeze_dim(2);
    weighted_context(&attention_weights(&scores, source_mask), context)
}

impl Attention for GlobalAttention {
    fn attend(
        &self,
        hidden: &Tensor,
        context: &Tensor,
        _coverage: Option<&Tensor>,
        source_mask: Option<&Tensor>,
    ) -> AttentionOutput {
        let weighted = attend_context(&self.linear_in, hidden, context, source_mask);
        let attended = self
            .linear_out
            .forward(&Tensor::cat(&[&weighted, hidden], 1))
            .tanh();
        AttentionOutput {
            attended,
            coverage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device, Kind};

    #[test]
    fn single_position_attends_fully() {
        let vs = VarStore::new(Device::Cpu);
        let attention = GlobalAttention::new(&vs.root(), 3);
        let hidden = Tensor::rand(&[2, 3], (Kind::Float, Device::Cpu));
        let context = Tensor::rand(&[2, 1, 3], (Kind::Float, Device::Cpu));
        let weighted =
            tch::no_grad(|| attend_context(&attention.linear_in, &hidden, &context, None));
        assert!(weighted.allclose(&context.squeeze_dim(1), 1e-6, 1e-6, false));
    }
}
