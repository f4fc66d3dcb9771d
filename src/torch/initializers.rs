//! Parameter initializers
#![allow(clippy::use_self)] // false positive with serde derives
use serde::{Deserialize, Serialize};
use tch::{nn::Path, Device, Kind, Tensor};

/// Tensor initializers.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    /// Initialize to all zeros
    Zeros,
    /// Uniform distribution with variance scaled by the tensor dimensions.
    Uniform(VarianceScale),
    /// Initialize as an orthogonal matrix.
    Orthogonal,
}

/// Defaults to `Uniform(FanAvg)` a.k.a. Glorot or Xavier initialization.
impl Default for Initializer {
    fn default() -> Self {
        Self::Uniform(VarianceScale::FanAvg)
    }
}

/// Variance scaling mode.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarianceScale {
    /// The sampling variance is set to the given constant.
    Constant(f64),
    /// The sampling variance is `1 / fan_in`.
    FanIn,
    /// The sampling variance is `2 / (fan_in + fan_out)`.
    FanAvg,
}

impl VarianceScale {
    fn variance(self, shape: &[i64]) -> f64 {
        // Weight matrices are [fan_out, fan_in]; vectors count as a single input feature.
        let fan_out = shape.first().copied().unwrap_or(1) as f64;
        let fan_in = shape.get(1).copied().unwrap_or(1) as f64;
        match self {
            Self::Constant(v) => v,
            Self::FanIn => fan_in.recip(),
            Self::FanAvg => 2.0 / (fan_in + fan_out),
        }
    }
}

impl Initializer {
    /// Build a new tensor without gradient tracking.
    pub fn build(&self, shape: &[i64], options: (Kind, Device)) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        match self {
            Self::Zeros => Tensor::zeros(shape, options),
            Self::Uniform(scaling) => {
                let lim = (3.0 * scaling.variance(shape)).sqrt();
                Tensor::empty(shape, options).uniform_(-lim, lim)
            }
            Self::Orthogonal => init_orthogonal(shape, options),
        }
    }

    /// Add a new trainable variable to a variable store path.
    pub fn add_var(&self, vs: &Path, name: &str, shape: &[i64]) -> Tensor {
        let initial = self.build(shape, (Kind::Float, vs.device()));
        vs.var_copy(name, &initial)
    }
}

/// Orthogonal matrix from the QR decomposition of a Gaussian matrix.
///
/// Reference: <https://pytorch.org/docs/stable/_modules/torch/nn/init.html#orthogonal_>
fn init_orthogonal(shape: &[i64], options: (Kind, Device)) -> Tensor {
    assert!(
        shape.len() >= 2,
        "tensor for orthogonal init must be at least 2D",
    );
    let num_rows = shape[0];
    let num_cols: i64 = shape[1..].iter().product();
    let transpose = num_rows < num_cols;

    let mut gaussian = Tensor::empty(&[num_rows, num_cols], options).normal_(0.0, 1.0);
    if transpose {
        gaussian = gaussian.tr();
    }
    let (q, r) = Tensor::linalg_qr(&gaussian, "reduced");
    // Make the decomposition unique
    let mut q = q * r.diag(0).sign();
    if transpose {
        q = q.tr();
    }

    // Copy to ensure that the data is in C layout
    let mut out = Tensor::empty(shape, options);
    out.copy_(&q.reshape(shape));
    out
}
