//! Padded batches of token sequences
use crate::constants::Sentinels;
use tch::{Device, Tensor};
use thiserror::Error;

/// Error building a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum BatchError {
    #[error("batch has no sequences")]
    Empty,
    #[error("source sequence {index} is empty")]
    EmptySource { index: usize },
    #[error("{sources} source sequences but {targets} target sequences")]
    SizeMismatch { sources: usize, targets: usize },
}

/// A batch of source sequences with optional target sequences, padded to a common length.
///
/// Token tensors are time-major: `[LENGTH, BATCH_SIZE]` of `i64`.
///
/// Targets are framed for teacher forcing. The decoder input at step `t` is the gold token at
/// `t - 1` (with BOS at `t = 0`) and the expected output is the gold token at `t`
/// (with EOS after the last token). Targets are always right-padded.
#[derive(Debug)]
pub struct Batch {
    source: Tensor,
    target_input: Tensor,
    target_output: Tensor,
    source_sizes: Vec<usize>,
    target_sizes: Vec<usize>,
    source_input_pad_left: bool,
}

impl Batch {
    /// Build a batch from token sequences.
    ///
    /// # Args
    /// * `sources` - Source token sequences. Each must be non-empty.
    /// * `targets` - Target token sequences without BOS / EOS, one per source, if any.
    /// * `sentinels` - Special token identifiers.
    /// * `pad_left` - Whether to pad source sequences on the left instead of the right.
    pub fn from_sequences(
        sources: &[Vec<i64>],
        targets: Option<&[Vec<i64>]>,
        sentinels: &Sentinels,
        pad_left: bool,
    ) -> Result<Self, BatchError> {
        if sources.is_empty() {
            return Err(BatchError::Empty);
        }
        if let Some(index) = sources.iter().position(Vec::is_empty) {
            return Err(BatchError::EmptySource { index });
        }
        let batch_size = sources.len();
        let source_sizes: Vec<usize> = sources.iter().map(Vec::len).collect();
        let source_length = source_sizes.iter().copied().max().unwrap_or(0);

        let mut source_data = vec![sentinels.pad; source_length * batch_size];
        for (b, seq) in sources.iter().enumerate() {
            let offset = if pad_left { source_length - seq.len() } else { 0 };
            for (i, &token) in seq.iter().enumerate() {
                source_data[(offset + i) * batch_size + b] = token;
            }
        }

        let (input_data, output_data, target_sizes) = match targets {
            Some(targets) if targets.len() != batch_size => {
                return Err(BatchError::SizeMismatch {
                    sources: batch_size,
                    targets: targets.len(),
                })
            }
            Some(targets) => frame_targets(targets, sentinels),
            None => (Vec::new(), Vec::new(), vec![0; batch_size]),
        };
        let target_length = input_data.len() / batch_size;

        let shape = |length: usize| [length as i64, batch_size as i64];
        Ok(Self {
            source: Tensor::of_slice(&source_data).reshape(&shape(source_length)),
            target_input: Tensor::of_slice(&input_data).reshape(&shape(target_length)),
            target_output: Tensor::of_slice(&output_data).reshape(&shape(target_length)),
            source_sizes,
            target_sizes,
            source_input_pad_left: pad_left,
        })
    }

    /// Copy the batch tensors to a device.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            source: self.source.to_device(device),
            target_input: self.target_input.to_device(device),
            target_output: self.target_output.to_device(device),
            source_sizes: self.source_sizes.clone(),
            target_sizes: self.target_sizes.clone(),
            source_input_pad_left: self.source_input_pad_left,
        }
    }

    /// Number of sequences in the batch.
    pub fn size(&self) -> usize {
        self.source_sizes.len()
    }

    /// Padded source length.
    pub fn source_length(&self) -> usize {
        self.source.size()[0] as usize
    }

    /// Padded target length (including the BOS / EOS step). Zero if there are no targets.
    pub fn target_length(&self) -> usize {
        self.target_input.size()[0] as usize
    }

    /// Number of non-padding target output tokens across the batch.
    pub fn total_size(&self) -> usize {
        self.target_sizes.iter().sum()
    }

    /// True length of each source sequence.
    pub fn source_sizes(&self) -> &[usize] {
        &self.source_sizes
    }

    /// True length of each target sequence, including the EOS output.
    pub fn target_sizes(&self) -> &[usize] {
        &self.target_sizes
    }

    /// Whether the source sequences are padded on the left.
    pub const fn source_input_pad_left(&self) -> bool {
        self.source_input_pad_left
    }

    /// Source tokens at step `t`. An `i64` tensor of shape `[BATCH_SIZE]`.
    pub fn source_input(&self, t: usize) -> Tensor {
        self.source.get(t as i64)
    }

    /// Decoder input tokens at step `t`. An `i64` tensor of shape `[BATCH_SIZE]`.
    pub fn target_input(&self, t: usize) -> Tensor {
        self.target_input.get(t as i64)
    }

    /// Expected decoder output tokens at step `t`. An `i64` tensor of shape `[BATCH_SIZE]`.
    pub fn target_output(&self, t: usize) -> Tensor {
        self.target_output.get(t as i64)
    }

    /// Whether each source position holds a real token.
    ///
    /// A boolean tensor of shape `[BATCH_SIZE, SOURCE_LENGTH]` on the batch device.
    pub fn source_padding_mask(&self) -> Tensor {
        let source_length = self.source_length();
        let flags: Vec<i64> = self
            .source_sizes
            .iter()
            .flat_map(|&size| {
                let pad = source_length - size;
                (0..source_length).map(move |t| {
                    let is_token = if self.source_input_pad_left {
                        t >= pad
                    } else {
                        t < size
                    };
                    i64::from(is_token)
                })
            })
            .collect();
        Tensor::of_slice(&flags)
            .reshape(&[self.size() as i64, source_length as i64])
            .to_device(self.source.device())
            .ne(0)
    }
}

/// Frame target sequences as time-major decoder inputs and outputs.
///
/// Returns `(inputs, outputs, sizes)` where each size counts the EOS output.
fn frame_targets(
    targets: &[Vec<i64>],
    sentinels: &Sentinels,
) -> (Vec<i64>, Vec<i64>, Vec<usize>) {
    let batch_size = targets.len();
    // One extra step for the BOS input / EOS output
    let sizes: Vec<usize> = targets.iter().map(|t| t.len() + 1).collect();
    let length = sizes.iter().copied().max().unwrap_or(0);

    let mut inputs = vec![sentinels.pad; length * batch_size];
    let mut outputs = vec![sentinels.pad; length * batch_size];
    for (b, seq) in targets.iter().enumerate() {
        inputs[b] = sentinels.bos;
        for (i, &token) in seq.iter().enumerate() {
            inputs[(i + 1) * batch_size + b] = token;
            outputs[i * batch_size + b] = token;
        }
        outputs[seq.len() * batch_size + b] = sentinels.eos;
    }
    (inputs, outputs, sizes)
}
