//! Stacked recurrent cells
mod gru;
mod lstm;

pub use gru::{Gru, GruImpl};
pub use lstm::{Lstm, LstmImpl};

use super::{LayerState, RecurrentCell};
use crate::config::CellType;
use crate::torch::dropout::DropoutMasks;
use crate::torch::initializers::Initializer;
use std::marker::PhantomData;
use tch::{nn::Path, Tensor};

/// A specific recurrent cell implementation.
pub trait RnnImpl {
    const TYPE: CellType;
    /// Gate weights are `GATES_MULTIPLE` times the hidden size.
    const GATES_MULTIPLE: i64;

    /// Apply one layer for one timestep.
    ///
    /// # Args
    /// * `weights` - Weights of this layer.
    /// * `input` - Layer input, with dropout already applied.
    /// * `state` - Previous state of this layer (`TYPE.states_per_layer()` tensors).
    /// * `recurrent_mask` - Dropout mask for the previous hidden state.
    fn cell_step(
        weights: &RnnLayerWeights,
        input: &Tensor,
        state: &[Tensor],
        recurrent_mask: &Tensor,
    ) -> LayerState;
}

/// Multi-layer recurrent cell with variational dropout between layers and timesteps.
#[derive(Debug)]
pub struct StackedRnn<T> {
    weights: RnnWeights,
    hidden_size: usize,
    dropout: f64,
    type_: PhantomData<fn() -> T>,
}

impl<T: RnnImpl> StackedRnn<T> {
    pub fn new(
        vs: &Path,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout: f64,
    ) -> Self {
        Self {
            weights: RnnWeights::init(vs, T::GATES_MULTIPLE, input_size, hidden_size, num_layers),
            hidden_size,
            dropout,
            type_: PhantomData,
        }
    }
}

impl<T: RnnImpl> RecurrentCell for StackedRnn<T> {
    fn output_size(&self) -> usize {
        self.hidden_size
    }

    fn num_layers(&self) -> usize {
        self.weights.num_layers()
    }

    fn num_effective_layers(&self) -> usize {
        self.num_layers() * T::TYPE.states_per_layer()
    }

    fn dropout(&self) -> f64 {
        self.dropout
    }

    fn step(&self, input: &Tensor, states: &[Tensor], masks: &DropoutMasks) -> LayerState {
        let states_per_layer = T::TYPE.states_per_layer();
        assert_eq!(
            states.len(),
            self.num_effective_layers(),
            "state arity does not match the cell"
        );
        let mut next_states = LayerState::new();
        let mut layer_input = input.shallow_clone();
        for (i, (layer_weights, layer_state)) in self
            .weights
            .layers()
            .zip(states.chunks_exact(states_per_layer))
            .enumerate()
        {
            if i > 0 {
                layer_input = layer_input * &masks.input[i - 1];
            }
            let layer_next =
                T::cell_step(&layer_weights, &layer_input, layer_state, &masks.recurrent[i]);
            layer_input = layer_next[states_per_layer - 1].shallow_clone();
            next_states.extend(layer_next);
        }
        next_states
    }
}

/// Build a boxed recurrent cell of the given type.
pub fn build_cell(
    vs: &Path,
    cell: CellType,
    input_size: usize,
    hidden_size: usize,
    num_layers: usize,
    dropout: f64,
) -> Box<dyn RecurrentCell> {
    match cell {
        CellType::Lstm => Box::new(Lstm::new(vs, input_size, hidden_size, num_layers, dropout)),
        CellType::Gru => Box::new(Gru::new(vs, input_size, hidden_size, num_layers, dropout)),
    }
}

#[derive(Debug)]
struct RnnWeights {
    flat_weights: Vec<Tensor>,
}

impl RnnWeights {
    const WEIGHTS_PER_LAYER: usize = 4;

    fn num_layers(&self) -> usize {
        self.flat_weights.len() / Self::WEIGHTS_PER_LAYER
    }

    fn layers(&self) -> impl Iterator<Item = RnnLayerWeights<'_>> {
        self.flat_weights
            .chunks_exact(Self::WEIGHTS_PER_LAYER)
            .map(|weights| RnnLayerWeights { weights })
    }

    /// Initialize [`RnnWeights`].
    ///
    /// Follows the Tensorflow (Keras) defaults:
    /// * Input-to-hidden weights: Glorot Uniform (aka Xavier)
    /// * Hidden-to-hidden weights: Orthogonal
    /// * Biases: Zero
    ///
    /// The weight matrices for the separate gates are initialized as a single matrix with
    /// output dimension `K * hidden_size`.
    fn init(
        vs: &Path,
        gates_multiple: i64,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
    ) -> Self {
        let input_size = input_size as i64;
        let hidden_size = hidden_size as i64;
        let gates_size = gates_multiple * hidden_size;

        let input_weights_init = Initializer::default();
        let hidden_weights_init = Initializer::Orthogonal;
        let biases_init = Initializer::Zeros;

        let mut flat_weights = Vec::with_capacity(num_layers * Self::WEIGHTS_PER_LAYER);
        for i in 0..num_layers {
            let layer_input_size = if i == 0 { input_size } else { hidden_size };
            flat_weights.push(input_weights_init.add_var(
                vs,
                &format!("weight_ih_l{}", i),
                &[gates_size, layer_input_size],
            ));
            flat_weights.push(hidden_weights_init.add_var(
                vs,
                &format!("weight_hh_l{}", i),
                &[gates_size, hidden_size],
            ));
            flat_weights.push(biases_init.add_var(vs, &format!("bias_ih_l{}", i), &[gates_size]));
            flat_weights.push(biases_init.add_var(vs, &format!("bias_hh_l{}", i), &[gates_size]));
        }
        Self { flat_weights }
    }
}

pub struct RnnLayerWeights<'a> {
    weights: &'a [Tensor],
}

impl<'a> RnnLayerWeights<'a> {
    pub const fn w_ih(&self) -> &Tensor {
        &self.weights[0]
    }

    pub const fn w_hh(&self) -> &Tensor {
        &self.weights[1]
    }

    pub const fn b_ih(&self) -> &Tensor {
        &self.weights[2]
    }

    pub const fn b_hh(&self) -> &Tensor {
        &self.weights[3]
    }
}
