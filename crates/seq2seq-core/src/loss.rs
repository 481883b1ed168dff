use rand::Rng;
use std::collections::HashSet;
use tch::{Kind, Tensor};

use crate::projection::OutputProjection;

/// Per-example cross-entropy of full-vocabulary logits.
/// logits: [batch, vocab], targets: [batch] -> [batch]
pub fn softmax_cross_entropy(logits: &Tensor, targets: &Tensor) -> Tensor {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    -log_probs
        .gather(1, &targets.unsqueeze(1), false)
        .squeeze_dim(1)
}

/// Weighted cross-entropy over a sequence of positions.
///
/// Each example's loss is `Σ_t w_t · ce_t / (Σ_t w_t + 1e-12)`; the result is
/// the sum over the batch divided by the batch size.
pub fn sequence_loss<F>(inputs: &[Tensor], targets: &[Tensor], weights: &[Tensor], loss_fn: F) -> Tensor
where
    F: Fn(&Tensor, &Tensor) -> Tensor,
{
    let mut log_perps: Option<Tensor> = None;
    let mut total_size: Option<Tensor> = None;

    for ((input, target), weight) in inputs.iter().zip(targets).zip(weights) {
        let crossent = loss_fn(input, target) * weight;
        log_perps = Some(match log_perps {
            Some(acc) => acc + crossent,
            None => crossent,
        });
        total_size = Some(match total_size {
            Some(acc) => acc + weight,
            None => weight.shallow_clone(),
        });
    }

    match (log_perps, total_size) {
        (Some(log_perps), Some(total_size)) => {
            let batch_size = log_perps.size()[0] as f64;
            let per_example = log_perps / (total_size + 1e-12);
            per_example.sum(Kind::Float) / batch_size
        }
        _ => Tensor::from(0.0f32),
    }
}

/// Draws candidate classes with `P(k) = log((k + 2) / (k + 1)) / log(V + 1)`,
/// which favours low ids (the most frequent words).
#[derive(Debug, Clone, Copy)]
pub struct LogUniformSampler {
    num_classes: i64,
    log_range: f64,
}

impl LogUniformSampler {
    pub fn new(num_classes: i64) -> Self {
        Self {
            num_classes,
            log_range: ((num_classes + 1) as f64).ln(),
        }
    }

    pub fn probability(&self, class: i64) -> f64 {
        (((class + 2) as f64) / ((class + 1) as f64)).ln() / self.log_range
    }

    /// Draws `count` distinct classes. Also returns the number of draws it
    /// took, needed to turn probabilities into expected counts.
    pub fn sample_unique<R: Rng>(&self, count: i64, rng: &mut R) -> (Vec<i64>, usize) {
        let count = count.min(self.num_classes) as usize;
        let mut seen = HashSet::with_capacity(count);
        let mut sampled = Vec::with_capacity(count);
        let mut tries = 0;

        while sampled.len() < count {
            tries += 1;
            let u: f64 = rng.gen();
            let class = ((u * self.log_range).exp() as i64 - 1).clamp(0, self.num_classes - 1);
            if seen.insert(class) {
                sampled.push(class);
            }
        }
        (sampled, tries)
    }
}

/// Expected number of times a class of probability `p` shows up in
/// `tries` draws, the correction subtracted from sampled logits.
fn expected_count(p: &Tensor, tries: usize) -> Tensor {
    -((-p).log1p() * tries as f64).expm1()
}

/// Softmax cross-entropy restricted to the true class and `num_sampled`
/// random negatives out of `num_classes`.
#[derive(Debug)]
pub struct SampledSoftmax {
    projection: OutputProjection,
    num_sampled: i64,
    sampler: LogUniformSampler,
}

impl SampledSoftmax {
    pub fn new(projection: OutputProjection, num_sampled: i64, num_classes: i64) -> Self {
        Self {
            projection,
            num_sampled,
            sampler: LogUniformSampler::new(num_classes),
        }
    }

    /// labels: [batch] class ids, inputs: [batch, hidden] -> [batch]
    pub fn loss(&self, labels: &Tensor, inputs: &Tensor) -> Tensor {
        let (w, b) = self.projection.weights();
        let device = inputs.device();

        // Computed in 32 bit floats to avoid numerical instabilities.
        let local_wt = w.tr().to_kind(Kind::Float);
        let local_b = b.to_kind(Kind::Float);
        let local_inputs = inputs.to_kind(Kind::Float);
        let labels = labels.reshape(&[-1, 1]);

        let (sampled, tries) = self.sampler.sample_unique(self.num_sampled, &mut rand::thread_rng());
        let sampled_probs: Vec<f32> = sampled.iter().map(|&k| self.sampler.probability(k) as f32).collect();
        let sampled = Tensor::from_slice(&sampled).to_device(device);
        let sampled_expected = expected_count(&Tensor::from_slice(&sampled_probs).to_device(device), tries);

        let flat_labels = labels.view([-1]);
        let true_probs = ((&flat_labels + 2).to_kind(Kind::Float) / (&flat_labels + 1).to_kind(Kind::Float)).log()
            / self.sampler.log_range;
        let true_expected = expected_count(&true_probs, tries);

        let true_w = local_wt.index_select(0, &flat_labels);
        let true_b = local_b.index_select(0, &flat_labels);
        let true_logits = (&local_inputs * true_w).sum_dim_intlist([-1i64].as_slice(), false, Kind::Float) + true_b
            - true_expected.log();

        let sampled_w = local_wt.index_select(0, &sampled);
        let sampled_b = local_b.index_select(0, &sampled);
        let sampled_logits = local_inputs.matmul(&sampled_w.tr()) + sampled_b.unsqueeze(0)
            - sampled_expected.log().unsqueeze(0);

        // A sampled negative equal to the true class is not a negative.
        let hits = labels.eq_tensor(&sampled.unsqueeze(0));
        let sampled_logits = sampled_logits.masked_fill(&hits, -1e9);

        let logits = Tensor::cat(&[true_logits.unsqueeze(1), sampled_logits], 1);
        let zeros = Tensor::zeros(&[logits.size()[0]], (Kind::Int64, device));
        softmax_cross_entropy(&logits, &zeros).to_kind(inputs.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::{nn, Device};

    #[test]
    fn cross_entropy_of_confident_logits_is_small() {
        let logits = Tensor::from_slice(&[10.0f32, -10.0, -10.0, -10.0, 10.0, -10.0]).view([2, 3]);
        let targets = Tensor::from_slice(&[0i64, 1]);
        let ce = softmax_cross_entropy(&logits, &targets);
        assert_eq!(ce.size(), vec![2]);
        assert!(ce.max().double_value(&[]) < 1e-3);
    }

    #[test]
    fn sequence_loss_ignores_zero_weights() {
        let vocab = 4;
        let logits: Vec<Tensor> = (0..3).map(|_| Tensor::zeros(&[2, vocab], (Kind::Float, Device::Cpu))).collect();
        let targets: Vec<Tensor> = (0..3).map(|_| Tensor::from_slice(&[1i64, 2])).collect();
        let full: Vec<Tensor> = (0..3).map(|_| Tensor::from_slice(&[1.0f32, 1.0])).collect();
        let partial = vec![
            Tensor::from_slice(&[1.0f32, 1.0]),
            Tensor::from_slice(&[0.0f32, 1.0]),
            Tensor::from_slice(&[0.0f32, 0.0]),
        ];

        // Uniform logits: every position costs ln(vocab) whatever the weights.
        let expected = (vocab as f64).ln();
        let a = sequence_loss(&logits, &targets, &full, softmax_cross_entropy).double_value(&[]);
        let b = sequence_loss(&logits, &targets, &partial, softmax_cross_entropy).double_value(&[]);
        assert!((a - expected).abs() < 1e-5);
        assert!((b - expected).abs() < 1e-5);
    }

    #[test]
    fn sampler_returns_distinct_classes() {
        let sampler = LogUniformSampler::new(50);
        let mut rng = StdRng::seed_from_u64(7);
        let (sampled, tries) = sampler.sample_unique(20, &mut rng);

        let unique: HashSet<_> = sampled.iter().collect();
        assert_eq!(unique.len(), 20);
        assert!(tries >= 20);
        assert!(sampled.iter().all(|&k| (0..50).contains(&k)));
    }

    #[test]
    fn sampler_probabilities_sum_to_one() {
        let sampler = LogUniformSampler::new(100);
        let total: f64 = (0..100).map(|k| sampler.probability(k)).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(sampler.probability(0) > sampler.probability(99));
    }

    #[test]
    fn sampled_loss_has_one_value_per_example() {
        let vs = nn::VarStore::new(Device::Cpu);
        let projection = OutputProjection::new(&vs.root(), &[8, 100]);
        let sampled = SampledSoftmax::new(projection, 10, 100);

        let inputs = Tensor::randn(&[5, 8], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[3i64, 17, 0, 99, 42]);
        let loss = sampled.loss(&labels, &inputs);

        assert_eq!(loss.size(), vec![5]);
        assert!(loss.min().double_value(&[]) >= 0.0);
    }
}
