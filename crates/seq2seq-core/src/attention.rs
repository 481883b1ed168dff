use tch::{nn, Kind, Tensor};

/// Additive attention over the encoder outputs:
/// `score_t = v · tanh(W1 e_t + W2 q)`, `context = Σ softmax(score)_t e_t`.
#[derive(Debug)]
pub struct Attention {
    keys: nn::Linear,
    query: nn::Linear,
    v: Tensor,
}

impl Attention {
    /// `attn_size` is the width of the encoder outputs, `query_size` the
    /// width of the decoder state used as query.
    pub fn new(vs: &nn::Path, attn_size: i64, query_size: i64) -> Self {
        let keys = nn::linear(vs / "keys", attn_size, attn_size, nn::LinearConfig {
            bias: false,
            ..Default::default()
        });
        let query = nn::linear(vs / "query", query_size, attn_size, Default::default());
        let v = vs.var("v", &[attn_size], nn::Init::Randn { mean: 0.0, stdev: (1.0 / attn_size as f64).sqrt() });

        Self { keys, query, v }
    }

    /// Precomputes `W1 e_t` once per sequence.
    /// states: [batch, enc_len, attn_size]
    pub fn keys(&self, states: &Tensor) -> Tensor {
        states.apply(&self.keys)
    }

    /// query: [batch, query_size], keys/states: [batch, enc_len, attn_size]
    /// Returns the attention read: [batch, attn_size]
    pub fn forward(&self, query: &Tensor, keys: &Tensor, states: &Tensor) -> Tensor {
        let y = query.apply(&self.query).unsqueeze(1);
        let scores = (keys + y)
            .tanh()
            .matmul(&self.v.unsqueeze(-1))
            .squeeze_dim(-1);
        let weights = scores.softmax(-1, Kind::Float);

        weights.unsqueeze(1).matmul(states).squeeze_dim(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn reads_one_vector_per_example() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attention = Attention::new(&vs.root(), 8, 12);

        let states = Tensor::randn(&[3, 5, 8], (Kind::Float, Device::Cpu));
        let query = Tensor::randn(&[3, 12], (Kind::Float, Device::Cpu));
        let keys = attention.keys(&states);

        assert_eq!(attention.forward(&query, &keys, &states).size(), vec![3, 8]);
    }

    #[test]
    fn identical_states_are_read_back() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attention = Attention::new(&vs.root(), 4, 4);

        let row = Tensor::from_slice(&[1.0f32, -2.0, 3.0, 0.5]);
        let states = row.view([1, 1, 4]).repeat(&[1, 6, 1]);
        let query = Tensor::randn(&[1, 4], (Kind::Float, Device::Cpu));
        let read = attention.forward(&query, &attention.keys(&states), &states);

        assert!(read.view([4]).allclose(&row, 1e-5, 1e-5, false));
    }
}
