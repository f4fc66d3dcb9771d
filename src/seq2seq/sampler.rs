//! Greedy decoding
use super::decoder::Decoder;
use super::step::DecoderGraph;
use crate::batch::Batch;
use crate::constants::Sentinels;
use crate::torch::{BufferKey, BufferPool, BufferRole, Generator};
use log::debug;
use tch::{Device, Kind, Tensor};

/// Autoregressive greedy decoder.
///
/// Feeds the most likely token of each step back as the next input until every sequence
/// has emitted EOS or `max_length` tokens have been produced.
#[derive(Debug)]
pub struct GreedySampler {
    sentinels: Sentinels,
    max_length: usize,
    pool: BufferPool,
}

impl GreedySampler {
    /// Sampler producing at most `sentinels.max_length` tokens.
    pub fn new(sentinels: Sentinels, device: Device) -> Self {
        Self::with_max_length(sentinels, sentinels.max_length, device)
    }

    pub fn with_max_length(sentinels: Sentinels, max_length: usize, device: Device) -> Self {
        Self {
            sentinels,
            max_length,
            pool: BufferPool::new(Kind::Float, device),
        }
    }

    pub const fn max_length(&self) -> usize {
        self.max_length
    }

    /// Greedily decode the batch.
    ///
    /// Once a sequence has consumed EOS (or PAD) as input, the rest of it is filled with PAD.
    ///
    /// # Args
    /// * `decoder` - Decoder used one step at a time.
    /// * `generator` - Maps attended outputs to token log-probabilities.
    /// * `batch` - Source batch; its targets are not used.
    /// * `encoder_states` - Final encoder states.
    /// * `context` - Source context.
    ///
    /// # Returns
    /// Sampled tokens without the initial BOS. An `i64` tensor of shape
    /// `[LENGTH, BATCH_SIZE]` where `LENGTH <= max_length`.
    pub fn sample<G: DecoderGraph>(
        &mut self,
        decoder: &mut Decoder<G>,
        generator: &dyn Generator,
        batch: &Batch,
        encoder_states: &[Tensor],
        context: &Tensor,
    ) -> Tensor {
        let _no_grad = tch::no_grad_guard();
        let Sentinels { pad, bos, eos, .. } = self.sentinels;
        let batch_size = batch.size() as i64;
        let device = self.pool.device();

        let mut output = self.pool.get_with_kind(
            BufferKey::new(BufferRole::Sampling, 0),
            &[self.max_length as i64 + 1, batch_size],
            Kind::Int64,
        );
        let _ = output.fill_(pad);
        let _ = output.get(0).fill_(bos);

        decoder.prepare(batch);
        let mut states = decoder.initial_states(encoder_states);
        let mut attended: Option<Tensor> = None;
        let mut coverage: Option<Tensor> = None;
        let mut eos_emitted = Tensor::zeros(&[batch_size], (Kind::Bool, device));
        let mut length = self.max_length;
        for t in 0..self.max_length {
            let input = output.get(t as i64);
            let outputs = decoder.forward_one(
                &input,
                &states,
                context,
                attended.as_ref(),
                coverage.as_ref(),
                t,
            );
            let log_probs = &generator.forward(&outputs.attended)[0];
            let finished = input.eq(eos).logical_or(&input.eq(pad));
            let sampled = log_probs.argmax(-1, false).masked_fill(&finished, pad);
            output.get(t as i64 + 1).copy_(&sampled);

            eos_emitted = eos_emitted.logical_or(&sampled.eq(eos));
            if i64::from(eos_emitted.all()) != 0 {
                length = t + 1;
                break;
            }
            states = outputs.states;
            attended = Some(outputs.attended);
            coverage = outputs.coverage;
        }
        debug!(
            "greedy sampling: batch size {}, length {}",
            batch_size, length
        );
        output.narrow(0, 1, length as i64).copy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq2seq::testing::{self, LinearDecoderGraph, ScriptedGenerator};

    const SENTINELS: Sentinels = Sentinels {
        pad: 0,
        unk: 1,
        bos: 3,
        eos: 2,
        max_length: 5,
    };

    fn run(script: Vec<Vec<i64>>) -> (Tensor, usize) {
        let layout = testing::toy_layout(true);
        let mut decoder = Decoder::new(LinearDecoderGraph::new(layout), SENTINELS.pad, Device::Cpu);
        let batch = testing::source_batch(&[vec![4, 5], vec![6, 7]], false);
        let (states, context) = testing::toy_encoding(&layout, 2, 2);
        let generator = ScriptedGenerator::new(script, 10);
        let mut sampler = GreedySampler::new(SENTINELS, Device::Cpu);
        let output = sampler.sample(&mut decoder, &generator, &batch, &states, &context);
        (output, generator.calls())
    }

    fn column(output: &Tensor, b: i64) -> Vec<i64> {
        Vec::<i64>::from(&output.select(1, b).contiguous())
    }

    #[test]
    fn pads_after_eos_and_runs_to_max_length() {
        let (output, calls) = run(vec![vec![5, 7, 2, 9, 9], vec![5, 5, 5, 5, 5]]);
        assert_eq!(output.size(), [5, 2]);
        assert_eq!(column(&output, 0), [5, 7, 2, 0, 0]);
        assert_eq!(column(&output, 1), [5, 5, 5, 5, 5]);
        assert_eq!(calls, 5);
    }

    #[test]
    fn stops_when_all_emit_eos() {
        let (output, calls) = run(vec![vec![5, 2, 9], vec![6, 2, 9]]);
        assert_eq!(output.size(), [2, 2]);
        assert_eq!(column(&output, 0), [5, 2]);
        assert_eq!(column(&output, 1), [6, 2]);
        assert_eq!(calls, 2);
    }

    #[test]
    fn eos_at_different_steps() {
        let (output, _) = run(vec![vec![2, 9, 9], vec![5, 6, 2]]);
        assert_eq!(output.size(), [3, 2]);
        assert_eq!(column(&output, 0), [2, 0, 0]);
        assert_eq!(column(&output, 1), [5, 6, 2]);
    }

    #[test]
    fn output_buffer_is_reused() {
        let layout = testing::toy_layout(false);
        let mut decoder = Decoder::new(LinearDecoderGraph::new(layout), SENTINELS.pad, Device::Cpu);
        let batch = testing::source_batch(&[vec![4]], false);
        let (states, context) = testing::toy_encoding(&layout, 1, 1);
        let mut sampler = GreedySampler::new(SENTINELS, Device::Cpu);
        for _ in 0..2 {
            let generator = ScriptedGenerator::new(vec![vec![4, 2]], 10);
            let output = sampler.sample(&mut decoder, &generator, &batch, &states, &context);
            assert_eq!(column(&output, 0), [4, 2]);
        }
        assert_eq!(sampler.pool.allocations(BufferRole::Sampling), 1);
    }
}
