//! Encoder sequencer
use super::step::{EncoderStep, EncoderStepInputs};
use crate::batch::Batch;
use crate::config::ModelConfig;
use crate::torch::{BufferKey, BufferPool, BufferRole, DropoutMasks, LayerState};
use log::debug;
use std::rc::Rc;
use tch::{nn::Path, Device, Kind, Tensor};

/// Gradients from [`Encoder::backward`].
#[derive(Debug)]
pub struct EncoderGradients {
    /// Gradient with respect to the initial (zero) states.
    pub states: Vec<Tensor>,
    /// Gradient with respect to the embedded source tokens at each timestep.
    pub inputs: Vec<Tensor>,
}

/// Unrolls the encoder step over the source sequence.
///
/// Owns the buffers for its states, context and gradients.
/// The tensors returned by [`Encoder::forward`] and [`Encoder::backward`] share storage with
/// these buffers and are overwritten by the next call.
#[derive(Debug)]
pub struct Encoder {
    step: EncoderStep,
    pool: BufferPool,
    train: bool,
    recorded: Vec<EncoderStepInputs>,
}

impl Encoder {
    pub fn new(step: EncoderStep, pool: BufferPool) -> Self {
        Self {
            step,
            pool,
            train: false,
            recorded: Vec::new(),
        }
    }

    pub fn build(vs: &Path, config: &ModelConfig, pad: i64) -> Self {
        let step = EncoderStep::build(vs, config, pad);
        Self::new(step, BufferPool::new(Kind::Float, vs.device()))
    }

    pub const fn step(&self) -> &EncoderStep {
        &self.step
    }

    pub const fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Enable or disable training mode (dropout and recording for the backward pass).
    pub fn set_training(&mut self, train: bool) {
        self.train = train;
    }

    pub const fn is_training(&self) -> bool {
        self.train
    }

    /// Step inputs recorded by the last training forward pass.
    #[cfg(test)]
    pub(crate) fn recorded(&self) -> &[EncoderStepInputs] {
        &self.recorded
    }

    /// Encode the source sequences.
    ///
    /// # Returns
    /// * `final_states` - State after the last real token of each sequence.
    ///     For left-padded batches the state of padded positions is held at zero.
    ///     For right-padded batches the state at `t = source_size - 1` is captured.
    /// * `context` - Top layer output at every timestep.
    ///     Shape `[BATCH_SIZE, SOURCE_LENGTH, RNN_SIZE]`.
    pub fn forward(&mut self, batch: &Batch) -> (LayerState, Tensor) {
        let _no_grad = tch::no_grad_guard();
        let cell = self.step.cell();
        let num_states = cell.num_effective_layers();
        let batch_size = batch.size() as i64;
        let rnn_size = cell.output_size() as i64;
        let source_length = batch.source_length();
        debug!(
            "encoder forward: batch size {}, source length {}",
            batch_size, source_length
        );

        let masks = Rc::new(DropoutMasks::sample(
            &mut self.pool,
            cell.num_layers(),
            batch_size,
            rnn_size,
            cell.dropout(),
            self.train,
        ));
        let state_shape = [batch_size, rnn_size];
        let mut states: LayerState = (0..num_states)
            .map(|i| self.pool.zeros(BufferKey::new(BufferRole::State, i), &state_shape))
            .collect();
        let context = self.pool.get(
            BufferKey::new(BufferRole::Context, 0),
            &[batch_size, source_length as i64, rnn_size],
        );
        let pad_left = batch.source_input_pad_left();
        // Right-padded final states are captured row by row
        let final_states: LayerState = if pad_left {
            LayerState::new()
        } else {
            (0..num_states)
                .map(|i| {
                    self.pool
                        .zeros(BufferKey::new(BufferRole::State, num_states + i), &state_shape)
                })
                .collect()
        };

        self.recorded.clear();
        for t in 0..source_length {
            let inputs = EncoderStepInputs {
                states,
                masks: Rc::clone(&masks),
                tokens: batch.source_input(t),
            };
            let mut next = self.step.forward(&inputs);
            if pad_left {
                let valid = token_mask(batch, t, self.pool.kind(), context.device());
                for state in next.iter_mut() {
                    *state = &*state * &valid;
                }
            }
            context.select(1, t as i64).copy_(&next[num_states - 1]);
            if !pad_left {
                for b in rows_ending_at(batch, t) {
                    for (final_state, state) in final_states.iter().zip(&next) {
                        final_state.get(b).copy_(&state.get(b));
                    }
                }
            }
            if self.train {
                self.recorded.push(inputs);
            }
            states = next;
        }

        let final_states = if pad_left { states } else { final_states };
        (final_states, context)
    }

    /// Back-propagate through the most recent training forward pass.
    ///
    /// Accumulates the gradients of the encoder parameters.
    ///
    /// # Args
    /// * `batch` - The batch given to the forward pass.
    /// * `grad_final_states` - Gradient with respect to the returned final states.
    /// * `grad_context` - Gradient with respect to the returned context.
    ///
    /// # Panics
    /// If the forward pass was not run in training mode on a batch of the same length.
    pub fn backward(
        &mut self,
        batch: &Batch,
        grad_final_states: &[Tensor],
        grad_context: &Tensor,
    ) -> EncoderGradients {
        let source_length = batch.source_length();
        assert_eq!(
            self.recorded.len(),
            source_length,
            "encoder backward requires a matching training forward pass"
        );
        let _no_grad = tch::no_grad_guard();
        let cell = self.step.cell();
        let num_states = cell.num_effective_layers();
        let batch_size = batch.size() as i64;
        let rnn_size = cell.output_size() as i64;
        let pad_left = batch.source_input_pad_left();
        debug!(
            "encoder backward: batch size {}, source length {}",
            batch_size, source_length
        );

        let mut grad_states: Vec<Tensor> = (0..num_states)
            .map(|i| {
                self.pool
                    .zeros(BufferKey::new(BufferRole::Gradient, i), &[batch_size, rnn_size])
            })
            .collect();
        let mut grad_inputs = Vec::with_capacity(source_length);
        for t in (0..source_length).rev() {
            if pad_left {
                if t == source_length - 1 {
                    for (grad, grad_final) in grad_states.iter_mut().zip(grad_final_states) {
                        let _ = grad.g_add_(grad_final);
                    }
                }
            } else {
                for b in rows_ending_at(batch, t) {
                    for (grad, grad_final) in grad_states.iter().zip(grad_final_states) {
                        let _ = grad.get(b).g_add_(&grad_final.get(b));
                    }
                }
            }
            let _ = grad_states[num_states - 1].g_add_(&grad_context.select(1, t as i64));
            if pad_left {
                let valid = token_mask(batch, t, self.pool.kind(), grad_context.device());
                for grad in &mut grad_states {
                    let _ = grad.g_mul_(&valid);
                }
            }

            let step_grads = self.step.backward(&self.recorded[t], &grad_states);
            for (grad, step_grad) in grad_states.iter_mut().zip(&step_grads.states) {
                grad.copy_(step_grad);
            }
            grad_inputs.push(step_grads.embedded);
        }
        grad_inputs.reverse();
        self.recorded.clear();

        EncoderGradients {
            states: grad_states,
            inputs: grad_inputs,
        }
    }
}

/// Batch rows whose last real source token is at `t`.
fn rows_ending_at(batch: &Batch, t: usize) -> impl Iterator<Item = i64> + '_ {
    batch
        .source_sizes()
        .iter()
        .enumerate()
        .filter(move |&(_, &size)| size == t + 1)
        .map(|(b, _)| b as i64)
}

/// Column mask that is 1 for rows holding a real token at `t` of a left-padded batch.
///
/// Shape `[BATCH_SIZE, 1]`.
fn token_mask(batch: &Batch, t: usize, kind: Kind, device: Device) -> Tensor {
    let source_length = batch.source_length();
    let valid: Vec<f32> = batch
        .source_sizes()
        .iter()
        .map(|&size| if t + size >= source_length { 1.0 } else { 0.0 })
        .collect();
    Tensor::of_slice(&valid)
        .to_kind(kind)
        .to_device(device)
        .unsqueeze(1)
}
