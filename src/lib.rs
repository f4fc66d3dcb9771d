//! Recurrent encoder-decoder core for sequence-to-sequence models with attention.
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::for_kv_map)]
#![warn(clippy::missing_const_for_fn)] // has some false positives
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::redundant_closure_for_method_calls)]
#![warn(clippy::use_self)] // also triggered by macro expansions
pub mod batch;
pub mod config;
pub mod constants;
mod error;
pub mod seq2seq;
pub mod torch;

pub use batch::{Batch, BatchError};
pub use config::{AttentionKind, AttentionType, BuildModelError, CellType, ModelConfig};
pub use constants::Sentinels;
pub use error::NmtError;
pub use seq2seq::{Decoder, Encoder, GreedySampler, Seq2Seq};
