//! Gated Recurrent Unit
use super::{RnnImpl, RnnLayerWeights, StackedRnn};
use crate::config::CellType;
use crate::torch::modules::LayerState;
use smallvec::smallvec;
use tch::Tensor;

/// Stacked gated recurrent unit cell.
pub type Gru = StackedRnn<GruImpl>;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GruImpl;
impl RnnImpl for GruImpl {
    const TYPE: CellType = CellType::Gru;
    const GATES_MULTIPLE: i64 = 3;

    fn cell_step(
        w: &RnnLayerWeights,
        input: &Tensor,
        state: &[Tensor],
        recurrent_mask: &Tensor,
    ) -> LayerState {
        let hidden_state = &state[0] * recurrent_mask;
        smallvec![input.gru_cell(
            &hidden_state,
            w.w_ih(),
            w.w_hh(),
            Some(w.b_ih()),
            Some(w.b_hh()),
        )]
    }
}
