//! Single-timestep encoder and decoder graphs
use crate::config::ModelConfig;
use crate::torch::modules::{build_attention, build_cell, AttentionOutput, Embedding};
use crate::torch::utils;
use crate::torch::{Attention, DropoutMasks, LayerState, RecurrentCell};
use std::fmt::Debug;
use std::rc::Rc;
use tch::{nn::Path, Tensor};

/// Inputs of one encoder timestep.
#[derive(Debug)]
pub struct EncoderStepInputs {
    /// Previous states; `num_effective_layers` tensors.
    pub states: LayerState,
    /// Dropout masks shared by every timestep of the pass.
    pub masks: Rc<DropoutMasks>,
    /// Source tokens. An `i64` tensor of shape `[BATCH_SIZE]`.
    pub tokens: Tensor,
}

/// Gradients with respect to the inputs of one encoder timestep.
#[derive(Debug)]
pub struct EncoderStepGrads {
    pub states: Vec<Tensor>,
    /// Gradient with respect to the embedded source tokens.
    pub embedded: Tensor,
}

/// One encoder timestep: embed the source token and advance the recurrent cell.
#[derive(Debug)]
pub struct EncoderStep {
    embeddings: Embedding,
    cell: Box<dyn RecurrentCell>,
}

impl EncoderStep {
    pub fn new(embeddings: Embedding, cell: Box<dyn RecurrentCell>) -> Self {
        Self { embeddings, cell }
    }

    pub fn build(vs: &Path, config: &ModelConfig, pad: i64) -> Self {
        let embeddings = Embedding::new(
            &(vs / "embeddings"),
            config.src_vocab_size,
            config.word_vec_size,
            pad,
        );
        let cell = build_cell(
            &(vs / "rnn"),
            config.cell,
            config.word_vec_size,
            config.rnn_size,
            config.layers,
            config.dropout,
        );
        Self::new(embeddings, cell)
    }

    pub fn cell(&self) -> &dyn RecurrentCell {
        self.cell.as_ref()
    }

    /// Number of step inputs: the states, the dropout masks and the token.
    ///
    /// The input dropout mask is only present with more than one layer.
    pub fn arity(&self) -> usize {
        let input_mask = usize::from(self.cell.num_layers() > 1);
        self.cell.num_effective_layers() + input_mask + 2
    }

    /// Number of step outputs: the next states.
    pub fn output_arity(&self) -> usize {
        self.cell.num_effective_layers()
    }

    pub fn forward(&self, inputs: &EncoderStepInputs) -> LayerState {
        let embedded = self.embeddings.forward(&inputs.tokens);
        self.cell.step(&embedded, &inputs.states, &inputs.masks)
    }

    /// Back-propagate through one timestep.
    ///
    /// Accumulates the parameter gradients and returns the gradients with respect to the
    /// previous states and the embedded input.
    pub fn backward(&self, inputs: &EncoderStepInputs, grad_states: &[Tensor]) -> EncoderStepGrads {
        let num_states = inputs.states.len();
        let embedded = tch::no_grad(|| self.embeddings.forward(&inputs.tokens));
        let mut leaves: Vec<&Tensor> = inputs.states.iter().collect();
        leaves.push(&embedded);
        let grad_outputs: Vec<&Tensor> = grad_states.iter().collect();

        let mut grads = utils::vjp(&leaves, &grad_outputs, |x| {
            let (states, embedded) = x.split_at(num_states);
            self.cell
                .step(&embedded[0], states, &inputs.masks)
                .into_vec()
        });
        let grad_embedded = grads.remove(num_states);

        let tracked = tch::with_grad(|| self.embeddings.forward(&inputs.tokens));
        utils::backward_from(&tracked, &grad_embedded);
        EncoderStepGrads {
            states: grads,
            embedded: grad_embedded,
        }
    }
}

/// A named decoder step input.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DecoderInput {
    State(usize),
    Tokens,
    Context,
    InputFeed,
    Coverage,
}

/// A named decoder step output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DecoderOutput {
    State(usize),
    Coverage,
    Attended,
}

/// Declared inputs and outputs of a decoder step.
///
/// Inputs, in order: the previous states, the current token, the source context,
/// the input feed (if enabled) and the coverage (if `coverage_size > 0`).
/// Outputs, in order: the next states, the next coverage (if enabled) and the attended output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DecoderLayout {
    pub num_effective_layers: usize,
    pub rnn_size: usize,
    pub input_feed: bool,
    pub coverage_size: usize,
}

impl DecoderLayout {
    pub const fn from_config(config: &ModelConfig) -> Self {
        Self {
            num_effective_layers: config.num_effective_layers(),
            rnn_size: config.rnn_size,
            input_feed: config.input_feed,
            coverage_size: config.coverage_size,
        }
    }

    pub const fn has_coverage(&self) -> bool {
        self.coverage_size > 0
    }

    pub fn inputs(&self) -> Vec<DecoderInput> {
        let mut inputs: Vec<_> = (0..self.num_effective_layers)
            .map(DecoderInput::State)
            .collect();
        inputs.push(DecoderInput::Tokens);
        inputs.push(DecoderInput::Context);
        if self.input_feed {
            inputs.push(DecoderInput::InputFeed);
        }
        if self.has_coverage() {
            inputs.push(DecoderInput::Coverage);
        }
        inputs
    }

    pub fn outputs(&self) -> Vec<DecoderOutput> {
        let mut outputs: Vec<_> = (0..self.num_effective_layers)
            .map(DecoderOutput::State)
            .collect();
        if self.has_coverage() {
            outputs.push(DecoderOutput::Coverage);
        }
        outputs.push(DecoderOutput::Attended);
        outputs
    }

    pub const fn input_arity(&self) -> usize {
        self.num_effective_layers + 2 + count(self.input_feed) + count(self.has_coverage())
    }

    pub const fn output_arity(&self) -> usize {
        self.num_effective_layers + count(self.has_coverage()) + 1
    }

    /// Position of a named input, if the step has it.
    pub fn input_index(&self, input: DecoderInput) -> Option<usize> {
        self.inputs().iter().position(|&i| i == input)
    }

    /// Position of a named output, if the step has it.
    pub fn output_index(&self, output: DecoderOutput) -> Option<usize> {
        self.outputs().iter().position(|&o| o == output)
    }
}

const fn count(present: bool) -> usize {
    if present {
        1
    } else {
        0
    }
}

/// Inputs of one decoder timestep.
#[derive(Debug)]
pub struct DecoderStepInputs {
    /// Previous states; `num_effective_layers` tensors.
    pub states: LayerState,
    /// Decoder input tokens. An `i64` tensor of shape `[BATCH_SIZE]`.
    pub tokens: Tensor,
    /// Source context. Shape `[BATCH_SIZE, SOURCE_LENGTH, RNN_SIZE]`.
    pub context: Tensor,
    /// Previous attended output, if input feeding is enabled.
    pub input_feed: Option<Tensor>,
    /// Previous coverage, if coverage is enabled.
    pub coverage: Option<Tensor>,
    /// Dropout masks shared by every timestep of the pass.
    pub masks: Rc<DropoutMasks>,
    /// Boolean `[BATCH_SIZE, SOURCE_LENGTH]`; `false` at source padding.
    pub source_mask: Option<Tensor>,
}

impl DecoderStepInputs {
    /// Floating-point inputs, in declared order without the tokens.
    pub fn differentiable(&self) -> Vec<&Tensor> {
        let mut inputs: Vec<&Tensor> = self.states.iter().collect();
        inputs.push(&self.context);
        inputs.extend(self.input_feed.as_ref());
        inputs.extend(self.coverage.as_ref());
        inputs
    }

    /// Copy of these inputs with the differentiable inputs replaced.
    ///
    /// `values` are in the order of [`DecoderStepInputs::differentiable`].
    pub fn with_differentiable(&self, values: &[Tensor]) -> Self {
        let num_states = self.states.len();
        let mut optional = values[num_states + 1..].iter().map(Tensor::shallow_clone);
        let input_feed = self.input_feed.as_ref().and_then(|_| optional.next());
        let coverage = self.coverage.as_ref().and_then(|_| optional.next());
        Self {
            states: values[..num_states].iter().map(Tensor::shallow_clone).collect(),
            tokens: self.tokens.shallow_clone(),
            context: values[num_states].shallow_clone(),
            input_feed,
            coverage,
            masks: Rc::clone(&self.masks),
            source_mask: self.source_mask.as_ref().map(Tensor::shallow_clone),
        }
    }
}

/// Outputs of one decoder timestep.
#[derive(Debug)]
pub struct DecoderStepOutputs {
    pub states: LayerState,
    pub coverage: Option<Tensor>,
    /// Attended output. Shape `[BATCH_SIZE, RNN_SIZE]`.
    pub attended: Tensor,
}

impl DecoderStepOutputs {
    /// All outputs in declared order.
    pub fn into_tensors(self) -> Vec<Tensor> {
        let mut outputs = self.states.into_vec();
        outputs.extend(self.coverage);
        outputs.push(self.attended);
        outputs
    }
}

/// Gradients with respect to the outputs of one decoder timestep.
#[derive(Debug, Copy, Clone)]
pub struct DecoderGradOutputs<'a> {
    pub states: &'a [Tensor],
    pub coverage: Option<&'a Tensor>,
    pub attended: &'a Tensor,
}

impl<'a> DecoderGradOutputs<'a> {
    fn tensors(&self) -> Vec<&'a Tensor> {
        let mut grads: Vec<&Tensor> = self.states.iter().collect();
        grads.extend(self.coverage);
        grads.push(self.attended);
        grads
    }
}

/// Gradients with respect to the differentiable inputs of one decoder timestep.
#[derive(Debug)]
pub struct DecoderStepGrads {
    pub states: Vec<Tensor>,
    pub context: Tensor,
    pub input_feed: Option<Tensor>,
    pub coverage: Option<Tensor>,
}

impl DecoderStepGrads {
    /// Split gradients given in the order of [`DecoderStepInputs::differentiable`].
    fn from_tensors(inputs: &DecoderStepInputs, mut grads: Vec<Tensor>) -> Self {
        let num_states = inputs.states.len();
        let mut optional = grads.split_off(num_states + 1).into_iter();
        let context = grads.remove(num_states);
        let states = grads;
        let input_feed = inputs.input_feed.as_ref().and_then(|_| optional.next());
        let coverage = inputs.coverage.as_ref().and_then(|_| optional.next());
        Self {
            states,
            context,
            input_feed,
            coverage,
        }
    }
}

/// A single-timestep decoder graph with shared parameters.
pub trait DecoderGraph: Debug {
    fn layout(&self) -> &DecoderLayout;

    /// Number of recurrent layers receiving dropout masks.
    fn num_layers(&self) -> usize;

    /// Variational dropout probability.
    fn dropout(&self) -> f64;

    fn forward(&self, inputs: &DecoderStepInputs) -> DecoderStepOutputs;

    /// Back-propagate through one timestep.
    ///
    /// Accumulates the parameter gradients and returns the gradients with respect to the
    /// differentiable inputs.
    fn backward(&self, inputs: &DecoderStepInputs, grads: DecoderGradOutputs) -> DecoderStepGrads {
        let input_grads = utils::vjp(&inputs.differentiable(), &grads.tensors(), |x| {
            self.forward(&inputs.with_differentiable(x)).into_tensors()
        });
        DecoderStepGrads::from_tensors(inputs, input_grads)
    }
}

/// One decoder timestep: embed the input token (with the input feed), advance the recurrent
/// cell and attend to the source context with the top layer output.
#[derive(Debug)]
pub struct DecoderStep {
    embeddings: Embedding,
    cell: Box<dyn RecurrentCell>,
    attention: Box<dyn Attention>,
    layout: DecoderLayout,
}

impl DecoderStep {
    pub fn new(
        embeddings: Embedding,
        cell: Box<dyn RecurrentCell>,
        attention: Box<dyn Attention>,
        layout: DecoderLayout,
    ) -> Self {
        assert_eq!(cell.num_effective_layers(), layout.num_effective_layers);
        assert_eq!(attention.uses_coverage(), layout.has_coverage());
        Self {
            embeddings,
            cell,
            attention,
            layout,
        }
    }

    /// Build the step from a configuration.
    ///
    /// Coverage attention is used whenever `coverage_size > 0`; otherwise the configured kind.
    pub fn build(vs: &Path, config: &ModelConfig, pad: i64) -> Self {
        let embeddings = Embedding::new(
            &(vs / "embeddings"),
            config.tgt_vocab_size,
            config.word_vec_size,
            pad,
        );
        let cell = build_cell(
            &(vs / "rnn"),
            config.cell,
            config.decoder_input_size(),
            config.rnn_size,
            config.layers,
            config.dropout,
        );
        let attention = build_attention(
            &(vs / "attention"),
            config.attention_type(),
            config.rnn_size,
            config.coverage_size,
        );
        Self::new(embeddings, cell, attention, DecoderLayout::from_config(config))
    }

    pub fn attention(&self) -> &dyn Attention {
        self.attention.as_ref()
    }
}

impl DecoderGraph for DecoderStep {
    fn layout(&self) -> &DecoderLayout {
        &self.layout
    }

    fn num_layers(&self) -> usize {
        self.cell.num_layers()
    }

    fn dropout(&self) -> f64 {
        self.cell.dropout()
    }

    fn forward(&self, inputs: &DecoderStepInputs) -> DecoderStepOutputs {
        let embedded = self.embeddings.forward(&inputs.tokens);
        let cell_input = match &inputs.input_feed {
            Some(input_feed) => Tensor::cat(&[&embedded, input_feed], 1),
            None => embedded,
        };
        let states = self.cell.step(&cell_input, &inputs.states, &inputs.masks);
        let AttentionOutput { attended, coverage } = self.attention.attend(
            &states[states.len() - 1],
            &inputs.context,
            inputs.coverage.as_ref(),
            inputs.source_mask.as_ref(),
        );
        DecoderStepOutputs {
            states,
            coverage,
            attended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionKind, CellType};
    use crate::seq2seq::testing;
    use rstest::rstest;
    use tch::{nn::VarStore, Device, Kind};

    const OPTIONS: (Kind, Device) = (Kind::Float, Device::Cpu);

    #[rstest]
    #[case::plain(false, 0, 4, 3)]
    #[case::input_feed(true, 0, 5, 3)]
    #[case::coverage(false, 3, 5, 4)]
    #[case::both(true, 3, 6, 4)]
    fn decoder_arity(
        #[case] input_feed: bool,
        #[case] coverage_size: usize,
        #[case] inputs: usize,
        #[case] outputs: usize,
    ) {
        // One LSTM layer: two state tensors
        let mut config = testing::tiny_config();
        config.layers = 1;
        config.input_feed = input_feed;
        config.coverage_size = coverage_size;
        let vs = VarStore::new(Device::Cpu);
        let step = DecoderStep::build(&vs.root(), &config, 0);
        let layout = step.layout();
        assert_eq!(layout.input_arity(), inputs);
        assert_eq!(layout.inputs().len(), inputs);
        assert_eq!(layout.output_arity(), outputs);
        assert_eq!(layout.outputs().len(), outputs);
    }

    #[rstest]
    fn arity_independent_of_attention_kind(
        #[values(AttentionKind::Global, AttentionKind::ContextGate)] attention: AttentionKind,
    ) {
        let mut config = testing::tiny_config();
        config.attention = attention;
        let vs = VarStore::new(Device::Cpu);
        let step = DecoderStep::build(&vs.root(), &config, 0);
        let expected = DecoderLayout::from_config(&testing::tiny_config());
        assert_eq!(step.layout().input_arity(), expected.input_arity());
        assert_eq!(step.layout().output_arity(), expected.output_arity());
        assert!(!step.attention().uses_coverage());
    }

    #[test]
    fn coverage_forces_coverage_attention() {
        let mut config = testing::tiny_config();
        config.attention = AttentionKind::ContextGate;
        config.coverage_size = 2;
        let vs = VarStore::new(Device::Cpu);
        let step = DecoderStep::build(&vs.root(), &config, 0);
        assert!(step.attention().uses_coverage());
    }

    #[test]
    fn optional_inputs_shift_positions() {
        let layout = DecoderLayout {
            num_effective_layers: 4,
            rnn_size: 8,
            input_feed: true,
            coverage_size: 2,
        };
        assert_eq!(layout.input_index(DecoderInput::Tokens), Some(4));
        assert_eq!(layout.input_index(DecoderInput::Context), Some(5));
        assert_eq!(layout.input_index(DecoderInput::InputFeed), Some(6));
        assert_eq!(layout.input_index(DecoderInput::Coverage), Some(7));
        assert_eq!(layout.output_index(DecoderOutput::Coverage), Some(4));
        assert_eq!(layout.output_index(DecoderOutput::Attended), Some(5));

        let plain = DecoderLayout {
            input_feed: false,
            coverage_size: 0,
            ..layout
        };
        assert_eq!(plain.input_index(DecoderInput::InputFeed), None);
        assert_eq!(plain.input_index(DecoderInput::Coverage), None);
        assert_eq!(plain.output_index(DecoderOutput::Attended), Some(4));
    }

    #[rstest]
    #[case::lstm_1(CellType::Lstm, 1, 4)]
    #[case::lstm_2(CellType::Lstm, 2, 7)]
    #[case::gru_2(CellType::Gru, 2, 5)]
    fn encoder_arity(#[case] cell: CellType, #[case] layers: usize, #[case] expected: usize) {
        let mut config = testing::tiny_config();
        config.cell = cell;
        config.layers = layers;
        let vs = VarStore::new(Device::Cpu);
        let step = EncoderStep::build(&vs.root(), &config, 0);
        assert_eq!(step.arity(), expected);
        assert_eq!(step.output_arity(), config.num_effective_layers());
    }

    #[test]
    fn encoder_backward_matches_autograd() {
        let config = testing::tiny_config();
        let vs = VarStore::new(Device::Cpu);
        let step = EncoderStep::build(&vs.root(), &config, 0);
        let batch_size = 2;
        let rnn_size = config.rnn_size as i64;
        let inputs = EncoderStepInputs {
            states: (0..config.num_effective_layers())
                .map(|_| Tensor::rand(&[batch_size, rnn_size], OPTIONS))
                .collect(),
            masks: Rc::new(DropoutMasks::ones(config.layers, batch_size, rnn_size, OPTIONS)),
            tokens: Tensor::of_slice(&[4_i64, 5]),
        };
        let grad_states: Vec<Tensor> = (0..config.num_effective_layers())
            .map(|_| Tensor::rand(&[batch_size, rnn_size], OPTIONS))
            .collect();
        let grads = step.backward(&inputs, &grad_states);
        assert_eq!(grads.embedded.size(), [batch_size, config.word_vec_size as i64]);

        let manual_params: Vec<Tensor> = vs
            .trainable_variables()
            .iter()
            .map(|v| v.grad().copy())
            .collect();
        vs.trainable_variables().iter().for_each(utils::zero_grad);

        let leaves: Vec<Tensor> = inputs
            .states
            .iter()
            .map(|s| s.detach().set_requires_grad(true))
            .collect();
        tch::with_grad(|| {
            let reference = EncoderStepInputs {
                states: leaves.iter().map(Tensor::shallow_clone).collect(),
                masks: Rc::clone(&inputs.masks),
                tokens: inputs.tokens.shallow_clone(),
            };
            let outputs = step.forward(&reference);
            let loss = outputs
                .iter()
                .zip(&grad_states)
                .map(|(o, g)| utils::flat_dot(o, g))
                .fold(Tensor::zeros(&[], OPTIONS), |a, b| a + b);
            loss.backward();
        });
        for (leaf, grad) in leaves.iter().zip(&grads.states) {
            assert!(leaf.grad().allclose(grad, 1e-5, 1e-5, false));
        }
        for (var, manual) in vs.trainable_variables().iter().zip(&manual_params) {
            assert!(var.grad().allclose(manual, 1e-5, 1e-5, false));
        }
    }
}
