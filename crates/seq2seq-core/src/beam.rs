use tch::{kind::Element, Kind, TchError, Tensor};

/// Running beam: `size` hypotheses with their cumulative log-probabilities,
/// plus the choices made at every position so far.
#[derive(Debug)]
pub struct BeamSearch {
    size: i64,
    scores: Tensor,
    path: Vec<Tensor>,
    symbols: Vec<Tensor>,
    probs: Vec<Tensor>,
}

/// Choices recorded at every position, each [positions, beam].
#[derive(Debug)]
pub struct BeamTrace {
    pub path: Tensor,
    pub symbols: Tensor,
    pub probs: Tensor,
}

impl BeamSearch {
    /// Every hypothesis starts from the same decoder input, so only the first
    /// row may be expanded at the first position.
    pub fn new(size: i64, like: &Tensor) -> Self {
        let mut init = vec![-1e9f32; size as usize];
        init[0] = 0.0;
        let scores = Tensor::from_slice(&init).to_device(like.device());

        Self {
            size,
            scores,
            path: Vec::new(),
            symbols: Vec::new(),
            probs: Vec::new(),
        }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Expands every hypothesis with every token and keeps the best `size`.
    /// logits: [size, vocab]. Returns `(parents, symbols)`, both [size].
    pub fn advance(&mut self, logits: &Tensor) -> (Tensor, Tensor) {
        let vocab = logits.size()[1];
        let log_probs = logits.log_softmax(-1, Kind::Float) + self.scores.unsqueeze(1);

        let k = self.size.min(log_probs.numel() as i64);
        let (top, index) = log_probs.view([-1]).topk(k, 0, true, true);
        let parents = index.g_div_scalar_mode(vocab, "floor");
        let symbols = index.remainder(vocab);

        self.path.push(parents.shallow_clone());
        self.symbols.push(symbols.shallow_clone());
        self.probs.push(top.shallow_clone());
        self.scores = top;

        (parents, symbols)
    }

    pub fn finish(self) -> BeamTrace {
        BeamTrace {
            path: Tensor::stack(&self.path, 0),
            symbols: Tensor::stack(&self.symbols, 0),
            probs: Tensor::stack(&self.probs, 0),
        }
    }
}

/// Splits a [rows, cols] tensor into one vector per row.
pub fn rows<T: Element + Copy>(t: &Tensor) -> Result<Vec<Vec<T>>, TchError> {
    (0..t.size()[0]).map(|i| Vec::<T>::try_from(&t.get(i))).collect()
}

/// Rebuilds the best hypothesis from the recorded beam choices, stopping at
/// the first `eos`.
///
/// `path[t][k]` is the hypothesis at position `t - 1` that entry `k` extends,
/// `symbols[t][k]` the token it chose and `probs[t][k]` its cumulative
/// log-probability.
pub fn backtrack(path: &[Vec<i64>], symbols: &[Vec<i64>], probs: &[Vec<f32>], eos: i64) -> Vec<i64> {
    let Some(last) = probs.last() else {
        return Vec::new();
    };

    let mut best = last
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map_or(0, |(k, _)| k);

    let mut tokens = Vec::with_capacity(symbols.len());
    for t in (0..symbols.len()).rev() {
        tokens.push(symbols[t][best]);
        best = path[t][best] as usize;
    }
    tokens.reverse();

    if let Some(end) = tokens.iter().position(|&tok| tok == eos) {
        tokens.truncate(end);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn first_step_expands_the_first_row_only() {
        let logits = Tensor::from_slice(&[0.0f32, 5.0, 1.0, 9.0, 9.0, 9.0]).view([2, 3]);
        let mut beam = BeamSearch::new(2, &logits);

        let (parents, symbols) = beam.advance(&logits);
        assert_eq!(Vec::<i64>::try_from(&parents).unwrap(), vec![0, 0]);
        assert_eq!(Vec::<i64>::try_from(&symbols).unwrap(), vec![1, 2]);
    }

    #[test]
    fn trace_has_one_row_per_step() {
        let like = Tensor::zeros(&[1], (Kind::Float, Device::Cpu));
        let mut beam = BeamSearch::new(3, &like);
        for _ in 0..4 {
            let logits = Tensor::randn(&[3, 10], (Kind::Float, Device::Cpu));
            beam.advance(&logits);
        }
        let trace = beam.finish();
        assert_eq!(trace.path.size(), vec![4, 3]);
        assert_eq!(trace.symbols.size(), vec![4, 3]);
        assert_eq!(trace.probs.size(), vec![4, 3]);
    }

    #[test]
    fn scores_never_increase() {
        let like = Tensor::zeros(&[1], (Kind::Float, Device::Cpu));
        let mut beam = BeamSearch::new(2, &like);
        for _ in 0..3 {
            beam.advance(&Tensor::randn(&[2, 6], (Kind::Float, Device::Cpu)));
        }
        let probs: Vec<Vec<f32>> = rows(&beam.finish().probs).unwrap();
        for t in 1..probs.len() {
            assert!(probs[t][0] <= probs[t - 1][0] + 1e-6);
        }
    }

    #[test]
    fn backtrack_follows_parents() {
        // Position 0: both entries come from the start.
        // Position 1: entry 0 extends entry 1, entry 1 extends entry 0.
        // Position 2: entry 1 (the best) extends entry 0.
        let path = vec![vec![0, 0], vec![1, 0], vec![1, 0]];
        let symbols = vec![vec![10, 11], vec![20, 21], vec![30, 31]];
        let probs = vec![vec![-0.1, -0.2], vec![-0.5, -0.6], vec![-1.5, -0.9]];

        assert_eq!(backtrack(&path, &symbols, &probs, 2), vec![11, 20, 31]);
    }

    #[test]
    fn backtrack_stops_at_eos() {
        let path = vec![vec![0], vec![0], vec![0]];
        let symbols = vec![vec![7], vec![2], vec![9]];
        let probs = vec![vec![-0.1], vec![-0.2], vec![-0.3]];
        assert_eq!(backtrack(&path, &symbols, &probs, 2), vec![7]);
    }

    #[test]
    fn backtrack_of_nothing_is_empty() {
        assert!(backtrack(&[], &[], &[], 2).is_empty());
    }
}
