//! Torch utilities.
use tch::{TchError, Tensor};

/// Dot product of two flattened tensors.
pub fn f_flat_dot(a: &Tensor, b: &Tensor) -> Result<Tensor, TchError> {
    a.f_flatten(0, -1)?.f_dot(&b.f_flatten(0, -1)?)
}

/// Dot product of two flattened tensors.
///
/// Equivalently, the sum of the elementwise product of two tensors.
/// The shapes may differ so long as the total number of elements are the same.
///
/// # Panics
/// If [`f_flat_dot`] fails.
pub fn flat_dot(a: &Tensor, b: &Tensor) -> Tensor {
    f_flat_dot(a, b).unwrap()
}

/// Vector-Jacobian product of a function at the given inputs.
///
/// Evaluates `f` with gradient tracking enabled on detached copies of `inputs` then
/// back-propagates `grad_outputs` through the result.
/// Gradients of any parameters used by `f` are accumulated into their `grad()` as a side effect,
/// just like a regular backward pass.
///
/// # Args
/// * `inputs` - Floating-point inputs with respect to which the gradient is returned.
/// * `grad_outputs` - Gradient with respect to each output of `f`, in the same order.
/// * `f` - The function. Receives the gradient-tracking copies of `inputs`.
///
/// # Returns
/// The gradient of `sum_i <f(inputs)[i], grad_outputs[i]>` with respect to each input.
/// Inputs that the outputs do not depend on get a zero gradient.
pub fn f_vjp<F>(inputs: &[&Tensor], grad_outputs: &[&Tensor], f: F) -> Result<Vec<Tensor>, TchError>
where
    F: FnOnce(&[Tensor]) -> Vec<Tensor>,
{
    tch::with_grad(|| {
        let leaves: Vec<Tensor> = inputs
            .iter()
            .map(|x| x.detach().set_requires_grad(true))
            .collect();
        let outputs = f(&leaves);
        assert_eq!(
            outputs.len(),
            grad_outputs.len(),
            "one output gradient is required per output"
        );

        let mut surrogate: Option<Tensor> = None;
        for (output, grad_output) in outputs.iter().zip(grad_outputs) {
            if !output.requires_grad() {
                continue;
            }
            let term = f_flat_dot(output, &grad_output.detach())?;
            surrogate = Some(match surrogate {
                Some(total) => total.f_add(&term)?,
                None => term,
            });
        }
        if let Some(surrogate) = surrogate {
            surrogate.backward();
        }

        leaves
            .iter()
            .map(|leaf| {
                let grad = leaf.grad();
                if grad.defined() {
                    Ok(grad.detach())
                } else {
                    leaf.f_zeros_like()
                }
            })
            .collect()
    })
}

/// Vector-Jacobian product of a function at the given inputs.
///
/// # Panics
/// If [`f_vjp`] fails.
pub fn vjp<F>(inputs: &[&Tensor], grad_outputs: &[&Tensor], f: F) -> Vec<Tensor>
where
    F: FnOnce(&[Tensor]) -> Vec<Tensor>,
{
    f_vjp(inputs, grad_outputs, f).unwrap()
}

/// Back-propagate `grad` from `output` into the parameters that produced it.
///
/// Does nothing if `output` is not part of a gradient-tracking graph.
pub fn backward_from(output: &Tensor, grad: &Tensor) {
    if output.requires_grad() {
        tch::with_grad(|| flat_dot(output, &grad.detach()).backward());
    }
}

/// Zero the gradient of a tensor.
pub fn f_zero_grad(x: &Tensor) -> Result<(), TchError> {
    let mut grad = x.f_grad()?;
    if grad.defined() {
        let _ = grad.f_detach_()?;
        let _ = grad.f_zero_()?;
    }
    Ok(())
}

/// Zero the gradient of a tensor.
pub fn zero_grad(x: &Tensor) {
    f_zero_grad(x).unwrap()
}
