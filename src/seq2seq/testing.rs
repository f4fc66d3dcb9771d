//! Sequencer test utilities.
use super::step::{DecoderGraph, DecoderLayout, DecoderStepInputs, DecoderStepOutputs};
use crate::batch::Batch;
use crate::config::{AttentionKind, CellType, ModelConfig};
use crate::constants::Sentinels;
use crate::torch::{Criterion, Generator};
use std::cell::Cell;
use tch::{Device, Kind, Tensor};

/// Small model configuration without dropout.
///
/// Two LSTM layers of size 8, embeddings of size 6 and vocabularies of 16 tokens.
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        cell: CellType::Lstm,
        layers: 2,
        rnn_size: 8,
        word_vec_size: 6,
        src_vocab_size: 16,
        tgt_vocab_size: 16,
        dropout: 0.0,
        input_feed: true,
        coverage_size: 0,
        attention: AttentionKind::Global,
        mask_padding: false,
    }
}

/// Batch of source sequences without targets.
pub fn source_batch(sources: &[Vec<i64>], pad_left: bool) -> Batch {
    Batch::from_sequences(sources, None, &Sentinels::default(), pad_left).unwrap()
}

/// Right-padded batch of source and target sequences.
pub fn batch(sources: &[Vec<i64>], targets: &[Vec<i64>]) -> Batch {
    padded_batch(sources, targets, false)
}

/// Batch of source and target sequences with the sources padded on the given side.
pub fn padded_batch(sources: &[Vec<i64>], targets: &[Vec<i64>], pad_left: bool) -> Batch {
    Batch::from_sequences(sources, Some(targets), &Sentinels::default(), pad_left).unwrap()
}

/// Layout of a [`LinearDecoderGraph`] with two states of size 4 and no coverage.
pub const fn toy_layout(input_feed: bool) -> DecoderLayout {
    DecoderLayout {
        num_effective_layers: 2,
        rnn_size: 4,
        input_feed,
        coverage_size: 0,
    }
}

/// Parameter-free linear decoder step.
///
/// The states pass through unchanged and
/// `attended = top_state + context.sum(1) [+ input_feed]`.
#[derive(Debug)]
pub struct LinearDecoderGraph {
    layout: DecoderLayout,
}

impl LinearDecoderGraph {
    pub const fn new(layout: DecoderLayout) -> Self {
        Self { layout }
    }
}

impl DecoderGraph for LinearDecoderGraph {
    fn layout(&self) -> &DecoderLayout {
        &self.layout
    }

    fn num_layers(&self) -> usize {
        1
    }

    fn dropout(&self) -> f64 {
        0.0
    }

    fn forward(&self, inputs: &DecoderStepInputs) -> DecoderStepOutputs {
        let top = &inputs.states[inputs.states.len() - 1];
        let mut attended = top + inputs.context.sum_dim_intlist(&[1], false, Kind::Float);
        if let Some(input_feed) = &inputs.input_feed {
            attended = attended + input_feed;
        }
        DecoderStepOutputs {
            states: inputs.states.iter().map(|s| s * 1.0).collect(),
            coverage: None,
            attended,
        }
    }
}

/// Generator that returns its input.
#[derive(Debug)]
pub struct IdentityGenerator;

impl Generator for IdentityGenerator {
    fn forward(&self, attended: &Tensor) -> Vec<Tensor> {
        vec![attended * 1.0]
    }
}

/// Criterion equal to the sum of all prediction elements.
#[derive(Debug)]
pub struct SumCriterion;

impl Criterion for SumCriterion {
    fn forward(&self, predictions: &[Tensor], _targets: &Tensor) -> f64 {
        predictions[0].sum(Kind::Double).double_value(&[])
    }

    fn backward(&self, predictions: &[Tensor], _targets: &Tensor) -> Vec<Tensor> {
        vec![predictions[0].ones_like()]
    }
}

/// Generator that emits a fixed token sequence for each batch element.
///
/// Call `t` puts almost all probability on `script[b][t]` for element `b`,
/// repeating the last token once the script runs out.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Vec<Vec<i64>>,
    vocab_size: i64,
    calls: Cell<usize>,
}

impl ScriptedGenerator {
    pub const fn new(script: Vec<Vec<i64>>, vocab_size: i64) -> Self {
        Self {
            script,
            vocab_size,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Generator for ScriptedGenerator {
    fn forward(&self, attended: &Tensor) -> Vec<Tensor> {
        let t = self.calls.get();
        self.calls.set(t + 1);
        let tokens: Vec<i64> = self
            .script
            .iter()
            .map(|tokens| tokens[t.min(tokens.len() - 1)])
            .collect();
        let logits = Tensor::of_slice(&tokens)
            .to_device(attended.device())
            .one_hot(self.vocab_size)
            .to_kind(Kind::Float)
            * 10.0;
        vec![logits.log_softmax(-1, Kind::Float)]
    }
}

/// Zero encoder states and context for a toy decoder.
pub fn toy_encoding(
    layout: &DecoderLayout,
    batch_size: i64,
    source_length: i64,
) -> (Vec<Tensor>, Tensor) {
    let options = (Kind::Float, Device::Cpu);
    let rnn_size = layout.rnn_size as i64;
    let states = (0..layout.num_effective_layers)
        .map(|_| Tensor::zeros(&[batch_size, rnn_size], options))
        .collect();
    let context = Tensor::zeros(&[batch_size, source_length, rnn_size], options);
    (states, context)
}
