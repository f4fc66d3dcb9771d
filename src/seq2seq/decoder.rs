//! Decoder sequencer
use super::step::{
    DecoderGradOutputs, DecoderGraph, DecoderStep, DecoderStepInputs, DecoderStepOutputs,
};
use crate::batch::Batch;
use crate::config::ModelConfig;
use crate::torch::{
    BufferKey, BufferPool, BufferRole, Criterion, DropoutMasks, Generator, LayerState,
};
use log::{debug, info};
use std::rc::Rc;
use tch::{nn::Path, Device, Kind, Tensor};

/// Gradients and loss from [`Decoder::backward`].
#[derive(Debug)]
pub struct DecoderGradients {
    /// Gradient with respect to the initial decoder states (the encoder final states).
    pub states: Vec<Tensor>,
    /// Gradient with respect to the source context, summed over all timesteps.
    pub context: Tensor,
    /// Total (unnormalized) criterion loss.
    pub loss: f64,
}

/// Unrolls a decoder step over the target sequence.
///
/// Threads the recurrent states, the input feed and the coverage from each timestep to the next.
/// Owns the buffers for its initial states, zero substitutes, dropout masks and gradients.
/// Tensors returned by [`Decoder::backward`] share storage with these buffers and are
/// overwritten by the next call.
#[derive(Debug)]
pub struct Decoder<G = DecoderStep> {
    graph: G,
    pool: BufferPool,
    pad: i64,
    train: bool,
    mask_padding: bool,
    masks: Option<Rc<DropoutMasks>>,
    source_mask: Option<Tensor>,
    recorded: Vec<DecoderStepInputs>,
}

impl Decoder<DecoderStep> {
    pub fn build(vs: &Path, config: &ModelConfig, pad: i64) -> Self {
        let mut decoder = Self::new(DecoderStep::build(vs, config, pad), pad, vs.device());
        if config.mask_padding {
            decoder.mask_padding();
        }
        decoder
    }
}

impl<G: DecoderGraph> Decoder<G> {
    pub fn new(graph: G, pad: i64, device: Device) -> Self {
        Self {
            graph,
            pool: BufferPool::new(Kind::Float, device),
            pad,
            train: false,
            mask_padding: false,
            masks: None,
            source_mask: None,
            recorded: Vec::new(),
        }
    }

    pub const fn graph(&self) -> &G {
        &self.graph
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
    pub(crate) fn recorded(&self) -> &[DecoderStepInputs] {
        &self.recorded
    }

    /// Give zero attention weight to source padding from now on.
    pub fn mask_padding(&mut self) {
        if !self.mask_padding {
            info!("decoder attention masks source padding");
            self.mask_padding = true;
        }
    }

    pub const fn is_masking_padding(&self) -> bool {
        self.mask_padding
    }

    /// Prepare for decoding a batch: sample the dropout masks and build the source padding mask.
    ///
    /// Called by [`Decoder::forward_and_apply`]; call it directly before driving
    /// [`Decoder::forward_one`] by hand.
    pub fn prepare(&mut self, batch: &Batch) {
        let rnn_size = self.graph.layout().rnn_size as i64;
        self.masks = Some(Rc::new(DropoutMasks::sample(
            &mut self.pool,
            self.graph.num_layers(),
            batch.size() as i64,
            rnn_size,
            self.graph.dropout(),
            self.train,
        )));
        self.source_mask = if self.mask_padding {
            Some(batch.source_padding_mask().to_device(self.pool.device()))
        } else {
            None
        };
        self.recorded.clear();
    }

    /// Copy the encoder final states into the decoder state buffers.
    pub fn initial_states(&mut self, encoder_states: &[Tensor]) -> LayerState {
        encoder_states
            .iter()
            .enumerate()
            .map(|(i, state)| {
                self.pool
                    .copy_of(BufferKey::new(BufferRole::State, i), state)
            })
            .collect()
    }

    /// Apply one decoder timestep.
    ///
    /// # Args
    /// * `tokens` - Input tokens. An `i64` tensor of shape `[BATCH_SIZE]`.
    /// * `prev_states` - Previous states.
    /// * `context` - Source context. Shape `[BATCH_SIZE, SOURCE_LENGTH, RNN_SIZE]`.
    /// * `prev_attended` - Previous attended output. Zero if `None`.
    ///     Ignored unless input feeding is enabled.
    /// * `prev_coverage` - Previous coverage. Zero if `None`. Ignored unless coverage is enabled.
    /// * `t` - Timestep index; in training mode the inputs are recorded for step `t`.
    pub fn forward_one(
        &mut self,
        tokens: &Tensor,
        prev_states: &[Tensor],
        context: &Tensor,
        prev_attended: Option<&Tensor>,
        prev_coverage: Option<&Tensor>,
        t: usize,
    ) -> DecoderStepOutputs {
        let layout = *self.graph.layout();
        let batch_size = tokens.size()[0];
        let rnn_size = layout.rnn_size as i64;

        let input_feed = if layout.input_feed {
            Some(match prev_attended {
                Some(attended) => attended.shallow_clone(),
                None => self.pool.zeros(
                    BufferKey::new(BufferRole::InputFeed, 0),
                    &[batch_size, rnn_size],
                ),
            })
        } else {
            None
        };
        let coverage = if layout.has_coverage() {
            Some(match prev_coverage {
                Some(coverage) => coverage.shallow_clone(),
                None => self.pool.zeros(
                    BufferKey::new(BufferRole::Coverage, 0),
                    &[batch_size, context.size()[1], layout.coverage_size as i64],
                ),
            })
        } else {
            None
        };

        let masks = self.masks_for(batch_size);
        let inputs = DecoderStepInputs {
            states: prev_states.iter().map(Tensor::shallow_clone).collect(),
            tokens: tokens.shallow_clone(),
            context: context.shallow_clone(),
            input_feed,
            coverage,
            masks,
            source_mask: self.source_mask.as_ref().map(Tensor::shallow_clone),
        };
        let outputs = tch::no_grad(|| self.graph.forward(&inputs));
        if self.train {
            self.recorded.truncate(t);
            self.recorded.push(inputs);
        }
        outputs
    }

    /// Dropout masks of the current pass; masks of ones if the batch was not prepared.
    fn masks_for(&mut self, batch_size: i64) -> Rc<DropoutMasks> {
        match &self.masks {
            Some(masks) if masks.batch_size() == batch_size => Rc::clone(masks),
            _ => {
                let masks = Rc::new(DropoutMasks::ones(
                    self.graph.num_layers(),
                    batch_size,
                    self.graph.layout().rnn_size as i64,
                    (self.pool.kind(), self.pool.device()),
                ));
                self.masks = Some(Rc::clone(&masks));
                masks
            }
        }
    }

    /// Run the decoder over the batch targets and apply `f` to each attended output.
    ///
    /// # Args
    /// * `batch` - The batch. Its target inputs are fed to the decoder.
    /// * `encoder_states` - Final encoder states; the initial decoder states.
    /// * `context` - Source context.
    /// * `f` - Called with the attended output and the timestep index.
    pub fn forward_and_apply<F>(
        &mut self,
        batch: &Batch,
        encoder_states: &[Tensor],
        context: &Tensor,
        mut f: F,
    ) where
        F: FnMut(&Tensor, usize),
    {
        debug!(
            "decoder forward: batch size {}, target length {}",
            batch.size(),
            batch.target_length()
        );
        self.prepare(batch);
        let mut states = self.initial_states(encoder_states);
        let mut attended: Option<Tensor> = None;
        let mut coverage: Option<Tensor> = None;
        for t in 0..batch.target_length() {
            let outputs = self.forward_one(
                &batch.target_input(t),
                &states,
                context,
                attended.as_ref(),
                coverage.as_ref(),
                t,
            );
            f(&outputs.attended, t);
            states = outputs.states;
            attended = Some(outputs.attended);
            coverage = outputs.coverage;
        }
    }

    /// Attended outputs at every timestep.
    pub fn forward(
        &mut self,
        batch: &Batch,
        encoder_states: &[Tensor],
        context: &Tensor,
    ) -> Vec<Tensor> {
        let mut outputs = Vec::with_capacity(batch.target_length());
        self.forward_and_apply(batch, encoder_states, context, |attended, _| {
            outputs.push(attended.shallow_clone());
        });
        outputs
    }

    /// Total criterion loss over the batch targets.
    pub fn compute_loss(
        &mut self,
        batch: &Batch,
        encoder_states: &[Tensor],
        context: &Tensor,
        generator: &dyn Generator,
        criterion: &dyn Criterion,
    ) -> f64 {
        let mut loss = 0.0;
        self.forward_and_apply(batch, encoder_states, context, |attended, t| {
            let predictions = tch::no_grad(|| generator.forward(attended));
            loss += criterion.forward(&predictions, &batch.target_output(t));
        });
        loss
    }

    /// Log-likelihood of each gold target sequence.
    ///
    /// Returns an f32 tensor of shape `[BATCH_SIZE]`.
    pub fn compute_score(
        &mut self,
        batch: &Batch,
        encoder_states: &[Tensor],
        context: &Tensor,
        generator: &dyn Generator,
    ) -> Tensor {
        let pad = self.pad;
        let mut score = Tensor::zeros(&[batch.size() as i64], (Kind::Float, self.pool.device()));
        self.forward_and_apply(batch, encoder_states, context, |attended, t| {
            let _no_grad = tch::no_grad_guard();
            let log_probs = &generator.forward(attended)[0];
            let targets = batch.target_output(t);
            let gold = log_probs
                .gather(1, &targets.unsqueeze(1), false)
                .squeeze_dim(1);
            let _ = score.g_add_(&(gold * targets.ne(pad).to_kind(Kind::Float)));
        });
        score
    }

    /// Back-propagate through the most recent training forward pass.
    ///
    /// Accumulates the gradients of the decoder and generator parameters.
    /// The criterion gradient is normalized by `batch.total_size()`.
    ///
    /// # Args
    /// * `batch` - The batch given to the forward pass.
    /// * `outputs` - Attended outputs of the forward pass.
    /// * `generator` - Generator applied to the attended outputs.
    /// * `criterion` - Training criterion.
    ///
    /// # Panics
    /// If the batch has no targets or
    /// if the forward pass was not run in training mode on a batch of the same length.
    pub fn backward(
        &mut self,
        batch: &Batch,
        outputs: &[Tensor],
        generator: &dyn Generator,
        criterion: &dyn Criterion,
    ) -> DecoderGradients {
        let target_length = batch.target_length();
        assert!(target_length > 0, "decoder backward requires a batch with targets");
        assert_eq!(
            self.recorded.len(),
            target_length,
            "decoder backward requires a matching training forward pass"
        );
        assert_eq!(outputs.len(), target_length);
        let _no_grad = tch::no_grad_guard();
        debug!(
            "decoder backward: batch size {}, target length {}",
            batch.size(),
            target_length
        );

        let layout = *self.graph.layout();
        let num_states = layout.num_effective_layers;
        let batch_size = batch.size() as i64;
        let rnn_size = layout.rnn_size as i64;
        let state_shape = [batch_size, rnn_size];
        let context_size = self.recorded[0].context.size();

        let mut grad_states: Vec<Tensor> = (0..num_states)
            .map(|i| {
                self.pool
                    .zeros(BufferKey::new(BufferRole::Gradient, i), &state_shape)
            })
            .collect();
        let mut grad_attended = self
            .pool
            .zeros(BufferKey::new(BufferRole::Gradient, num_states), &state_shape);
        let mut grad_coverage = if layout.has_coverage() {
            Some(self.pool.zeros(
                BufferKey::new(BufferRole::Gradient, num_states + 1),
                &[batch_size, context_size[1], layout.coverage_size as i64],
            ))
        } else {
            None
        };
        let mut grad_context = self.pool.zeros(
            BufferKey::new(BufferRole::Gradient, num_states + 2),
            &context_size,
        );

        let normalizer = batch.total_size() as f64;
        let mut loss = 0.0;
        for t in (0..target_length).rev() {
            let targets = batch.target_output(t);
            let predictions = generator.forward(&outputs[t]);
            loss += criterion.forward(&predictions, &targets);
            let grad_predictions: Vec<Tensor> = criterion
                .backward(&predictions, &targets)
                .into_iter()
                .map(|grad| grad / normalizer)
                .collect();
            let grad_output = generator.backward(&outputs[t], &grad_predictions);
            let _ = grad_attended.g_add_(&grad_output);

            let step_grads = self.graph.backward(
                &self.recorded[t],
                DecoderGradOutputs {
                    states: &grad_states,
                    coverage: grad_coverage.as_ref(),
                    attended: &grad_attended,
                },
            );

            let _ = grad_context.g_add_(&step_grads.context);
            for (grad, step_grad) in grad_states.iter_mut().zip(&step_grads.states) {
                grad.copy_(step_grad);
            }
            let _ = grad_attended.zero_();
            if t > 0 {
                if let Some(grad_input_feed) = &step_grads.input_feed {
                    grad_attended.copy_(grad_input_feed);
                }
            }
            if let (Some(grad), Some(step_grad)) = (&mut grad_coverage, &step_grads.coverage) {
                grad.copy_(step_grad);
            }
        }
        self.recorded.clear();

        DecoderGradients {
            states: grad_states,
            context: grad_context,
            loss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq2seq::testing::{self, IdentityGenerator, LinearDecoderGraph, SumCriterion};
    use crate::seq2seq::Encoder;
    use crate::torch::modules::{LinearGenerator, NllCriterion};
    use rstest::rstest;
    use tch::nn::VarStore;

    const OPTIONS: (Kind, Device) = (Kind::Float, Device::Cpu);

    fn encoded(vs: &VarStore, batch: &Batch) -> (Vec<Tensor>, Tensor) {
        let mut encoder = Encoder::build(&(vs.root() / "encoder"), &testing::tiny_config(), 0);
        let (states, context) = encoder.forward(batch);
        (states.iter().map(Tensor::copy).collect(), context.copy())
    }

    #[rstest]
    fn forward_one_is_deterministic(
        #[values(false, true)] input_feed: bool,
        #[values(0, 3)] coverage_size: usize,
    ) {
        let mut config = testing::tiny_config();
        config.input_feed = input_feed;
        config.coverage_size = coverage_size;
        let vs = VarStore::new(Device::Cpu);
        let batch = testing::batch(&[vec![4, 5, 6], vec![7, 8]], &[vec![9, 10], vec![11]]);
        let (states, context) = encoded(&vs, &batch);
        let mut decoder = Decoder::build(&(vs.root() / "decoder"), &config, 0);
        decoder.prepare(&batch);

        let tokens = batch.target_input(0);
        let a = decoder.forward_one(&tokens, &states, &context, None, None, 0);
        let b = decoder.forward_one(&tokens, &states, &context, None, None, 0);
        assert_eq!(a.attended, b.attended);
        for (x, y) in a.states.iter().zip(&b.states) {
            assert_eq!(x, y);
        }
        assert_eq!(a.coverage, b.coverage);
        assert_eq!(a.coverage.is_some(), coverage_size > 0);
    }

    #[test]
    fn absent_inputs_are_zero() {
        let mut config = testing::tiny_config();
        config.coverage_size = 3;
        let vs = VarStore::new(Device::Cpu);
        let batch = testing::batch(&[vec![4, 5, 6]], &[vec![9, 10]]);
        let (states, context) = encoded(&vs, &batch);
        let mut decoder = Decoder::build(&(vs.root() / "decoder"), &config, 0);
        decoder.prepare(&batch);

        let tokens = batch.target_input(0);
        let attended = Tensor::zeros(&[1, 8], OPTIONS);
        let coverage = Tensor::zeros(&[1, 3, 3], OPTIONS);
        let a = decoder.forward_one(&tokens, &states, &context, None, None, 0);
        let b = decoder.forward_one(
            &tokens,
            &states,
            &context,
            Some(&attended),
            Some(&coverage),
            0,
        );
        assert_eq!(a.attended, b.attended);
        assert_eq!(a.coverage, b.coverage);
    }

    #[test]
    fn grad_context_sums_step_gradients() {
        let layout = testing::toy_layout(false);
        let mut decoder = Decoder::new(LinearDecoderGraph::new(layout), 0, Device::Cpu);
        decoder.set_training(true);
        let batch = testing::batch(&[vec![4, 5, 6], vec![7, 8]], &[vec![9, 10], vec![11]]);
        let states: Vec<Tensor> = (0..layout.num_effective_layers)
            .map(|_| Tensor::rand(&[2, layout.rnn_size as i64], OPTIONS))
            .collect();
        let context = Tensor::rand(&[2, 3, layout.rnn_size as i64], OPTIONS);

        let outputs = decoder.forward(&batch, &states, &context);
        let grads = decoder.backward(&batch, &outputs, &IdentityGenerator, &SumCriterion);

        // Each step contributes 1 / total_size to every context element
        let target_length = batch.target_length() as f64;
        let total_size = batch.total_size() as f64;
        let expected = Tensor::full(&context.size(), target_length / total_size, OPTIONS);
        assert!(grads.context.allclose(&expected, 1e-5, 1e-5, false));

        // Only the top state reaches the output; states pass through unchanged
        let top = &grads.states[layout.num_effective_layers - 1];
        assert!(top.allclose(
            &Tensor::full(&[2, layout.rnn_size as i64], target_length / total_size, OPTIONS),
            1e-5,
            1e-5,
            false
        ));
        assert_eq!(grads.states[0], Tensor::zeros(&[2, layout.rnn_size as i64], OPTIONS));
    }

    #[test]
    fn input_feed_gradient_flows_to_previous_step() {
        let layout = testing::toy_layout(true);
        let mut decoder = Decoder::new(LinearDecoderGraph::new(layout), 0, Device::Cpu);
        decoder.set_training(true);
        let batch = testing::batch(&[vec![4, 5]], &[vec![9]]);
        let states: Vec<Tensor> = (0..layout.num_effective_layers)
            .map(|_| Tensor::zeros(&[1, layout.rnn_size as i64], OPTIONS))
            .collect();
        let context = Tensor::zeros(&[1, 2, layout.rnn_size as i64], OPTIONS);

        let outputs = decoder.forward(&batch, &states, &context);
        let grads = decoder.backward(&batch, &outputs, &IdentityGenerator, &SumCriterion);

        // attended_t = top + context sum + attended_{t-1} over two steps:
        // the first output reaches the loss directly and through the second output.
        let expected = 3.0 / batch.total_size() as f64;
        let top = &grads.states[layout.num_effective_layers - 1];
        assert!(top.allclose(
            &Tensor::full(&[1, layout.rnn_size as i64], expected, OPTIONS),
            1e-5,
            1e-5,
            false
        ));
    }

    #[test]
    fn compute_score_matches_loss() {
        let config = testing::tiny_config();
        let vs = VarStore::new(Device::Cpu);
        let batch = testing::batch(&[vec![4, 5, 6], vec![7, 8]], &[vec![9, 10], vec![11]]);
        let (states, context) = encoded(&vs, &batch);
        let mut decoder = Decoder::build(&(vs.root() / "decoder"), &config, 0);
        let generator = LinearGenerator::new(&(vs.root() / "generator"), 8, 16);
        let criterion = NllCriterion::new(0);

        let loss = decoder.compute_loss(&batch, &states, &context, &generator, &criterion);
        let score = decoder.compute_score(&batch, &states, &context, &generator);
        assert_eq!(score.size(), [2]);
        let total = f64::from(score.sum(Kind::Double));
        assert!((loss + total).abs() < 1e-4, "{loss} vs {total}");
    }

    #[test]
    fn mask_padding_is_idempotent() {
        let vs = VarStore::new(Device::Cpu);
        let mut decoder = Decoder::build(&vs.root(), &testing::tiny_config(), 0);
        assert!(!decoder.is_masking_padding());
        decoder.mask_padding();
        decoder.mask_padding();
        assert!(decoder.is_masking_padding());
    }

    #[test]
    fn masked_padding_ignores_padded_context() {
        let mut config = testing::tiny_config();
        config.mask_padding = true;
        let vs = VarStore::new(Device::Cpu);
        let batch = testing::batch(&[vec![4, 5, 6], vec![7, 8]], &[vec![9, 10], vec![11]]);
        let (states, context) = encoded(&vs, &batch);
        let mut decoder = Decoder::build(&(vs.root() / "decoder"), &config, 0);

        let altered = context.copy();
        let _ = altered.get(1).get(2).fill_(5.0);
        let a = decoder.forward(&batch, &states, &context);
        let a: Vec<Tensor> = a.iter().map(Tensor::copy).collect();
        let b = decoder.forward(&batch, &states, &altered);
        for (x, y) in a.iter().zip(&b) {
            assert!(x.allclose(y, 1e-6, 1e-6, false));
        }
    }

    #[test]
    #[should_panic(expected = "training forward pass")]
    fn backward_without_forward_panics() {
        let layout = testing::toy_layout(false);
        let mut decoder = Decoder::new(LinearDecoderGraph::new(layout), 0, Device::Cpu);
        let batch = testing::batch(&[vec![4]], &[vec![9]]);
        let _ = decoder.backward(&batch, &[], &IdentityGenerator, &SumCriterion);
    }

    #[test]
    #[should_panic(expected = "batch with targets")]
    fn backward_without_targets_panics() {
        let layout = testing::toy_layout(false);
        let mut decoder = Decoder::new(LinearDecoderGraph::new(layout), 0, Device::Cpu);
        decoder.set_training(true);
        let batch = testing::source_batch(&[vec![4, 5], vec![6]], false);
        let (states, context) = testing::toy_encoding(&layout, 2, 2);
        let outputs = decoder.forward(&batch, &states, &context);
        assert!(outputs.is_empty());
        let _ = decoder.backward(&batch, &outputs, &IdentityGenerator, &SumCriterion);
    }
}
