//! Linear layer
use crate::torch::initializers::Initializer;
use tch::{nn::Path, Tensor};

/// Linear fully-connected layer.
///
/// The kernel is initialized with Glorot uniform and the bias with zeros.
/// Applies to the last dimension of inputs with any number of leading dimensions.
#[derive(Debug)]
pub struct Linear {
    kernel: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(vs: &Path, in_dim: usize, out_dim: usize, with_bias: bool) -> Self {
        let (in_dim, out_dim) = (in_dim as i64, out_dim as i64);
        Self {
            kernel: Initializer::default().add_var(vs, "kernel", &[out_dim, in_dim]),
            bias: if with_bias {
                Some(Initializer::Zeros.add_var(vs, "bias", &[out_dim]))
            } else {
                None
            },
        }
    }

    #[inline]
    pub fn forward(&self, input: &Tensor) -> Tensor {
        input.linear(&self.kernel, self.bias.as_ref())
    }

    pub fn out_dim(&self) -> usize {
        self.kernel.size()[0] as usize
    }
}
