//! Sequence-to-sequence sequencers
//!
//! An [`Encoder`] unrolls its step over the source sequence to produce the final states and
//! the context matrix. A [`Decoder`] unrolls its step over the target sequence, attending to the
//! context at every step, or is driven one step at a time by the [`GreedySampler`].
//! Both run their backward pass by replaying the recorded step inputs in reverse.
mod decoder;
mod encoder;
mod model;
mod sampler;
pub mod step;
#[cfg(test)]
pub mod testing;

pub use decoder::{Decoder, DecoderGradients};
pub use encoder::{Encoder, EncoderGradients};
pub use model::Seq2Seq;
pub use sampler::GreedySampler;
pub use step::{
    DecoderGraph, DecoderInput, DecoderLayout, DecoderOutput, DecoderStep, DecoderStepInputs,
    DecoderStepOutputs, EncoderStep, EncoderStepInputs,
};
