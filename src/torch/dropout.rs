//! Variational dropout masks
use super::buffers::{BufferKey, BufferPool, BufferRole};
use super::modules::LayerState;
use tch::{Device, Kind, Tensor};

/// Variational dropout masks shared by every timestep of a sequence.
///
/// Each mask has shape `[BATCH_SIZE, RNN_SIZE]` and holds either `0` or `1 / (1 - p)`.
/// * `input` - Applied to the input of layers `2..=L` (one mask per layer after the first).
/// * `recurrent` - Applied to the previous hidden state of every layer.
#[derive(Debug)]
pub struct DropoutMasks {
    pub input: LayerState,
    pub recurrent: LayerState,
}

impl DropoutMasks {
    /// Masks that leave their inputs unchanged.
    pub fn ones(
        num_layers: usize,
        batch_size: i64,
        rnn_size: i64,
        options: (Kind, Device),
    ) -> Self {
        let shape = [batch_size, rnn_size];
        Self {
            input: (1..num_layers).map(|_| Tensor::ones(&shape, options)).collect(),
            recurrent: (0..num_layers).map(|_| Tensor::ones(&shape, options)).collect(),
        }
    }

    /// Sample a new set of masks into pooled buffers.
    ///
    /// The masks are filled with 1 when not training or when `p` is zero.
    ///
    /// # Args
    /// * `pool` - Buffer pool holding the masks. Masks from a previous call are overwritten.
    /// * `num_layers` - Number of recurrent layers.
    /// * `batch_size` - Batch size.
    /// * `rnn_size` - Hidden state size.
    /// * `p` - Probability of dropping each unit.
    /// * `train` - Whether to sample the masks.
    pub fn sample(
        pool: &mut BufferPool,
        num_layers: usize,
        batch_size: i64,
        rnn_size: i64,
        p: f64,
        train: bool,
    ) -> Self {
        let _no_grad = tch::no_grad_guard();
        let shape = [batch_size, rnn_size];
        let mut sample = |slot: usize| {
            let mut mask = pool.filled(BufferKey::new(BufferRole::Mask, slot), &shape, 1.0);
            if train && p > 0.0 {
                let keep = Tensor::rand(&shape, (mask.kind(), mask.device()))
                    .ge(p)
                    .to_kind(mask.kind());
                mask.copy_(&(keep / (1.0 - p)));
            }
            mask
        };
        let recurrent = (0..num_layers).map(&mut sample).collect();
        let input = (num_layers..2 * num_layers - 1).map(&mut sample).collect();
        Self { input, recurrent }
    }

    /// Number of recurrent layers the masks apply to.
    pub fn num_layers(&self) -> usize {
        self.recurrent.len()
    }

    /// Batch size the masks apply to.
    pub fn batch_size(&self) -> i64 {
        self.recurrent.first().map_or(0, |mask| mask.size()[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn pool() -> BufferPool {
        BufferPool::new(Kind::Float, Device::Cpu)
    }

    #[rstest]
    fn mask_counts(mut pool: BufferPool) {
        let masks = DropoutMasks::sample(&mut pool, 3, 2, 4, 0.5, true);
        assert_eq!(masks.num_layers(), 3);
        assert_eq!(masks.recurrent.len(), 3);
        assert_eq!(masks.input.len(), 2);
        assert_eq!(masks.input[0].size(), [2, 4]);
    }

    #[rstest]
    fn single_layer_has_no_input_mask(mut pool: BufferPool) {
        let masks = DropoutMasks::sample(&mut pool, 1, 2, 4, 0.5, true);
        assert!(masks.input.is_empty());
        assert_eq!(masks.recurrent.len(), 1);
    }

    #[rstest]
    fn zero_rate_is_all_ones(mut pool: BufferPool) {
        let masks = DropoutMasks::sample(&mut pool, 2, 3, 4, 0.0, true);
        let ones = Tensor::ones(&[3, 4], (Kind::Float, Device::Cpu));
        for mask in masks.input.iter().chain(&masks.recurrent) {
            assert_eq!(mask, &ones);
        }
    }

    #[rstest]
    fn evaluation_is_all_ones(mut pool: BufferPool) {
        let masks = DropoutMasks::sample(&mut pool, 2, 3, 4, 0.5, false);
        let ones = Tensor::ones(&[3, 4], (Kind::Float, Device::Cpu));
        for mask in masks.input.iter().chain(&masks.recurrent) {
            assert_eq!(mask, &ones);
        }
    }

    #[rstest]
    fn training_values_are_inverse_scaled(mut pool: BufferPool) {
        let masks = DropoutMasks::sample(&mut pool, 1, 20, 50, 0.5, true);
        let mask = &masks.recurrent[0];
        let is_zero = mask.eq(0.0);
        let is_two = mask.eq(2.0);
        assert_eq!(is_zero.logical_or(&is_two).all().int64_value(&[]), 1);
        // 1000 samples with p = 0.5 should almost certainly contain both values
        assert_eq!(is_zero.any().int64_value(&[]), 1);
        assert_eq!(is_two.any().int64_value(&[]), 1);
    }

    #[rstest]
    fn resampling_reuses_buffers(mut pool: BufferPool) {
        let _ = DropoutMasks::sample(&mut pool, 2, 3, 4, 0.5, true);
        let _ = DropoutMasks::sample(&mut pool, 2, 3, 4, 0.5, true);
        assert_eq!(pool.allocations(BufferRole::Mask), 3);
    }

    #[test]
    fn ones_counts() {
        let masks = DropoutMasks::ones(2, 3, 4, (Kind::Float, Device::Cpu));
        assert_eq!(masks.input.len(), 1);
        assert_eq!(masks.recurrent.len(), 2);
    }
}
