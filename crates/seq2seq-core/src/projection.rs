use tch::{nn, Tensor};

/// Single layer perceptron projecting decoder outputs on the vocabulary.
///
/// Shared by every decoding step and by the sampled softmax loss.
#[derive(Debug)]
pub struct OutputProjection {
    w: Tensor,
    b: Tensor,
}

impl OutputProjection {
    /// `shape` is `(input dim, output dim)`. Any other arity is a bug in the
    /// caller and panics.
    pub fn new(vs: &nn::Path, shape: &[i64]) -> Self {
        assert!(
            shape.len() == 2,
            "output projection shape must be (input, output), got {:?}",
            shape
        );
        let (input_dim, output_dim) = (shape[0], shape[1]);

        // Glorot uniform
        let limit = (6.0 / (input_dim + output_dim) as f64).sqrt();
        let w = vs.var(
            "weights",
            &[input_dim, output_dim],
            nn::Init::Uniform { lo: -limit, up: limit },
        );
        let b = vs.var("bias", &[output_dim], nn::Init::Const(0.0));

        Self { w, b }
    }

    /// `(W, b)`, the arguments of the sampled softmax loss.
    pub fn weights(&self) -> (&Tensor, &Tensor) {
        (&self.w, &self.b)
    }

    /// x: [batch, input_dim] -> [batch, output_dim]
    pub fn apply(&self, x: &Tensor) -> Tensor {
        x.matmul(&self.w) + &self.b
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            w: self.w.shallow_clone(),
            b: self.b.shallow_clone(),
        }
    }
}
