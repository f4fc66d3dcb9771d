//! Long Short-Term Memory
use super::{RnnImpl, RnnLayerWeights, StackedRnn};
use crate::config::CellType;
use crate::torch::modules::LayerState;
use smallvec::smallvec;
use tch::Tensor;

/// Stacked Long Short-Term Memory cell.
///
/// Each layer state is `[cell, hidden]`.
pub type Lstm = StackedRnn<LstmImpl>;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LstmImpl;
impl RnnImpl for LstmImpl {
    const TYPE: CellType = CellType::Lstm;
    const GATES_MULTIPLE: i64 = 4;

    fn cell_step(
        w: &RnnLayerWeights,
        input: &Tensor,
        state: &[Tensor],
        recurrent_mask: &Tensor,
    ) -> LayerState {
        let cell_state = &state[0];
        let hidden_state = &state[1] * recurrent_mask;
        let (new_hidden_state, new_cell_state) = input.lstm_cell(
            &[&hidden_state, cell_state],
            w.w_ih(),
            w.w_hh(),
            Some(w.b_ih()),
            Some(w.b_hh()),
        );
        smallvec![new_cell_state, new_hidden_state]
    }
}
