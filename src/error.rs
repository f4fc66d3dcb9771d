//! Error type
use crate::batch::BatchError;
use crate::config::BuildModelError;
use tch::TchError;
use thiserror::Error;

/// Error from the sequence-to-sequence crate.
#[derive(Error, Debug)]
pub enum NmtError {
    #[error("error building model")]
    BuildModel(#[from] BuildModelError),
    #[error("invalid batch")]
    Batch(#[from] BatchError),
    #[error("tensor operation failed")]
    Tensor(#[from] TchError),
}
