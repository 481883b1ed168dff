use tch::{nn, Tensor};

/// How the stacked cell exposes its state.
///
/// Beam search forks hypotheses by selecting rows of the state, which is a
/// single `index_select` on the flattened layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLayout {
    Tuple,
    Flat,
}

/// Shape of the recurrent cell shared by the encoder and the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSpec {
    pub hidden_size: i64,
    pub num_layers: i64,
    pub layout: StateLayout,
}

/// `(c, h)` of one layer, each [batch, hidden].
#[derive(Debug)]
pub struct LayerState {
    pub c: Tensor,
    pub h: Tensor,
}

#[derive(Debug)]
pub enum CellState {
    Tuple(Vec<LayerState>),
    /// [batch, num_layers * 2 * hidden], `c` then `h` for every layer.
    Flat(Tensor),
}

impl CellState {
    /// The whole state as one [batch, num_layers * 2 * hidden] tensor.
    pub fn flatten(&self) -> Tensor {
        match self {
            CellState::Flat(t) => t.shallow_clone(),
            CellState::Tuple(layers) => {
                let parts: Vec<&Tensor> = layers.iter().flat_map(|l| [&l.c, &l.h]).collect();
                Tensor::cat(&parts, 1)
            }
        }
    }

    /// Keeps the rows listed in `index`, in that order.
    pub fn select_rows(&self, index: &Tensor) -> CellState {
        match self {
            CellState::Flat(t) => CellState::Flat(t.index_select(0, index)),
            CellState::Tuple(layers) => CellState::Tuple(
                layers
                    .iter()
                    .map(|l| LayerState {
                        c: l.c.index_select(0, index),
                        h: l.h.index_select(0, index),
                    })
                    .collect(),
            ),
        }
    }

    fn into_layers(self, hidden_size: i64) -> Vec<LayerState> {
        match self {
            CellState::Tuple(layers) => layers,
            CellState::Flat(t) => t
                .split(hidden_size, 1)
                .chunks(2)
                .map(|pair| LayerState {
                    c: pair[0].shallow_clone(),
                    h: pair[1].shallow_clone(),
                })
                .collect(),
        }
    }

    fn from_layers(layers: Vec<LayerState>, layout: StateLayout) -> CellState {
        let state = CellState::Tuple(layers);
        match layout {
            StateLayout::Tuple => state,
            StateLayout::Flat => CellState::Flat(state.flatten()),
        }
    }
}

/// Basic LSTM cell: one affine map over `[x, h]` producing the four gates,
/// with a forget bias of 1.0 added before the sigmoid.
#[derive(Debug)]
pub struct LstmCell {
    gates: nn::Linear,
    hidden_size: i64,
    forget_bias: f64,
}

impl LstmCell {
    pub fn new(vs: &nn::Path, input_size: i64, hidden_size: i64) -> Self {
        let gates = nn::linear(vs / "gates", input_size + hidden_size, 4 * hidden_size, Default::default());
        Self {
            gates,
            hidden_size,
            forget_bias: 1.0,
        }
    }

    pub fn step(&self, x: &Tensor, state: &LayerState) -> LayerState {
        let gates = Tensor::cat(&[x, &state.h], 1).apply(&self.gates);
        let chunks = gates.split(self.hidden_size, 1);
        let (i, j, f, o) = (&chunks[0], &chunks[1], &chunks[2], &chunks[3]);

        let c = &state.c * (f + self.forget_bias).sigmoid() + i.sigmoid() * j.tanh();
        let h = c.tanh() * o.sigmoid();
        LayerState { c, h }
    }
}

/// `num_layers` identical LSTM layers, each feeding its output to the next.
#[derive(Debug)]
pub struct StackedLstm {
    layers: Vec<LstmCell>,
    spec: CellSpec,
}

impl StackedLstm {
    pub fn new(vs: &nn::Path, spec: CellSpec, input_size: i64) -> Self {
        let layers = (0..spec.num_layers)
            .map(|i| {
                let in_dim = if i == 0 { input_size } else { spec.hidden_size };
                LstmCell::new(&(vs / "cell" / i), in_dim, spec.hidden_size)
            })
            .collect();
        Self { layers, spec }
    }

    /// Size of the flattened state.
    pub fn state_size(&self) -> i64 {
        2 * self.spec.hidden_size * self.spec.num_layers
    }

    pub fn zero_state(&self, batch: i64, like: &Tensor) -> CellState {
        let layers = (0..self.spec.num_layers)
            .map(|_| {
                let zeros = Tensor::zeros(&[batch, self.spec.hidden_size], (like.kind(), like.device()));
                LayerState {
                    c: zeros.shallow_clone(),
                    h: zeros,
                }
            })
            .collect();
        CellState::from_layers(layers, self.spec.layout)
    }

    /// One time step. Returns the top layer output and the new state.
    pub fn step(&self, x: &Tensor, state: CellState) -> (Tensor, CellState) {
        let previous = state.into_layers(self.spec.hidden_size);
        let mut input = x.shallow_clone();
        let mut next = Vec::with_capacity(self.layers.len());

        for (layer, prev) in self.layers.iter().zip(previous.iter()) {
            let new_state = layer.step(&input, prev);
            input = new_state.h.shallow_clone();
            next.push(new_state);
        }

        (input, CellState::from_layers(next, self.spec.layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn spec(layout: StateLayout) -> CellSpec {
        CellSpec {
            hidden_size: 6,
            num_layers: 3,
            layout,
        }
    }

    #[test]
    fn step_outputs_top_layer() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = StackedLstm::new(&vs.root(), spec(StateLayout::Tuple), 4);
        let x = Tensor::randn(&[2, 4], (Kind::Float, Device::Cpu));

        let state = cell.zero_state(2, &x);
        let (out, state) = cell.step(&x, state);

        assert_eq!(out.size(), vec![2, 6]);
        match state {
            CellState::Tuple(layers) => {
                assert_eq!(layers.len(), 3);
                assert_eq!(layers[2].h.size(), vec![2, 6]);
            }
            CellState::Flat(_) => panic!("expected a tuple state"),
        }
    }

    #[test]
    fn flat_state_packs_every_layer() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = StackedLstm::new(&vs.root(), spec(StateLayout::Flat), 4);
        let x = Tensor::randn(&[2, 4], (Kind::Float, Device::Cpu));

        let (_, state) = cell.step(&x, cell.zero_state(2, &x));
        assert_eq!(state.flatten().size(), vec![2, cell.state_size()]);
        assert!(matches!(state, CellState::Flat(_)));
    }

    #[test]
    fn flat_round_trip_keeps_layer_order() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = StackedLstm::new(&vs.root(), spec(StateLayout::Tuple), 4);
        let x = Tensor::randn(&[2, 4], (Kind::Float, Device::Cpu));

        let (out, state) = cell.step(&x, cell.zero_state(2, &x));
        let packed = CellState::from_layers(state.into_layers(6), StateLayout::Flat);
        let unpacked = packed.into_layers(6);

        assert_eq!(unpacked.len(), 3);
        assert!(unpacked[2].h.allclose(&out, 1e-6, 1e-6, false));
    }

    #[test]
    fn select_rows_forks_hypotheses() {
        let state = CellState::Flat(Tensor::arange(6, (Kind::Float, Device::Cpu)).view([3, 2]));
        let index = Tensor::from_slice(&[2i64, 2, 0]);
        let forked = state.select_rows(&index).flatten();
        let rows: Vec<f32> = Vec::<f32>::try_from(&forked.view([-1])).unwrap();
        assert_eq!(rows, vec![4.0, 5.0, 4.0, 5.0, 0.0, 1.0]);
    }
}
