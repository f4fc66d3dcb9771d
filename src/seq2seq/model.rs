//! Encoder-decoder model
use super::decoder::Decoder;
use super::encoder::Encoder;
use super::sampler::GreedySampler;
use crate::batch::Batch;
use crate::config::{BuildModelError, ModelConfig};
use crate::constants::Sentinels;
use crate::error::NmtError;
use crate::torch::modules::{LinearGenerator, NllCriterion};
use log::info;
use tch::{nn::Path, Device, Tensor};

/// Sequence-to-sequence model with an attentional decoder.
///
/// Ties the encoder and decoder sequencers to a generator and criterion for training
/// and to a greedy sampler for translation.
#[derive(Debug)]
pub struct Seq2Seq {
    encoder: Encoder,
    decoder: Decoder,
    generator: LinearGenerator,
    criterion: NllCriterion,
    sampler: GreedySampler,
    config: ModelConfig,
    sentinels: Sentinels,
    device: Device,
}

impl Seq2Seq {
    /// Build a model with its parameters in the given variable store path.
    pub fn build(
        vs: &Path,
        config: &ModelConfig,
        sentinels: Sentinels,
    ) -> Result<Self, BuildModelError> {
        config.validate()?;
        info!(
            "building {:?} model: {} layers of size {}, {:?} attention",
            config.cell,
            config.layers,
            config.rnn_size,
            config.attention_type()
        );
        let device = vs.device();
        Ok(Self {
            encoder: Encoder::build(&(vs / "encoder"), config, sentinels.pad),
            decoder: Decoder::build(&(vs / "decoder"), config, sentinels.pad),
            generator: LinearGenerator::new(
                &(vs / "generator"),
                config.rnn_size,
                config.tgt_vocab_size,
            ),
            criterion: NllCriterion::new(sentinels.pad),
            sampler: GreedySampler::new(sentinels, device),
            config: config.clone(),
            sentinels,
            device,
        })
    }

    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub const fn sentinels(&self) -> &Sentinels {
        &self.sentinels
    }

    pub const fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub const fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub const fn generator(&self) -> &LinearGenerator {
        &self.generator
    }

    fn set_training(&mut self, train: bool) {
        self.encoder.set_training(train);
        self.decoder.set_training(train);
    }

    /// Run a forward and backward pass on a batch with targets.
    ///
    /// Accumulates the gradient of the mean loss per target token into the parameters.
    /// Does not zero gradients or update parameters.
    ///
    /// # Returns
    /// The total loss on the batch.
    pub fn train_step(&mut self, batch: &Batch) -> f64 {
        self.set_training(true);
        let (states, context) = self.encoder.forward(batch);
        let outputs = self.decoder.forward(batch, &states, &context);
        let grads = self
            .decoder
            .backward(batch, &outputs, &self.generator, &self.criterion);
        let _ = self.encoder.backward(batch, &grads.states, &grads.context);
        grads.loss
    }

    /// Total loss on a batch with targets, without dropout.
    pub fn evaluate_loss(&mut self, batch: &Batch) -> f64 {
        self.set_training(false);
        let (states, context) = self.encoder.forward(batch);
        self.decoder
            .compute_loss(batch, &states, &context, &self.generator, &self.criterion)
    }

    /// Log-likelihood of each gold target sequence, without dropout.
    pub fn score(&mut self, batch: &Batch) -> Tensor {
        self.set_training(false);
        let (states, context) = self.encoder.forward(batch);
        self.decoder
            .compute_score(batch, &states, &context, &self.generator)
    }

    /// Greedily translate the batch sources.
    ///
    /// Returns an `i64` tensor of shape `[LENGTH, BATCH_SIZE]`; see [`GreedySampler::sample`].
    pub fn translate(&mut self, batch: &Batch) -> Tensor {
        self.set_training(false);
        let (states, context) = self.encoder.forward(batch);
        self.sampler.sample(
            &mut self.decoder,
            &self.generator,
            batch,
            &states,
            &context,
        )
    }

    /// Greedily translate token sequences.
    ///
    /// Each translation stops before its first EOS.
    pub fn translate_sequences(
        &mut self,
        sources: &[Vec<i64>],
    ) -> Result<Vec<Vec<i64>>, NmtError> {
        let batch = Batch::from_sequences(sources, None, &self.sentinels, false)?
            .to_device(self.device);
        let output = self.translate(&batch).f_to_device(Device::Cpu)?;
        let eos = self.sentinels.eos;
        (0..sources.len() as i64)
            .map(|b| -> Result<Vec<i64>, NmtError> {
                let tokens = Vec::<i64>::from(&output.f_select(1, b)?.f_contiguous()?);
                Ok(tokens.into_iter().take_while(|&token| token != eos).collect())
            })
            .collect()
    }
}
