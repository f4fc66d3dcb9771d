//! Torch components
pub mod buffers;
pub mod dropout;
pub mod initializers;
pub mod modules;
pub mod utils;

pub use buffers::{BufferKey, BufferPool, BufferRole};
pub use dropout::DropoutMasks;
pub use initializers::{Initializer, VarianceScale};
pub use modules::{Attention, Criterion, Generator, LayerState, RecurrentCell};
