//! Synthetic linear-regression task used by `epochal train`.

use epochal_core::collaborators::Batch;
use epochal_core::reference::{Features, InMemorySupply};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub type RegressionBatch = Batch<Features, Vec<f32>>;

/// `y = x·w + b + noise` with features drawn from `[-1, 1)`.
#[derive(Debug, Clone)]
pub struct RegressionTask {
    pub weights: Vec<f32>,
    pub bias: f32,
    pub train: Vec<RegressionBatch>,
    pub eval: Vec<RegressionBatch>,
}

impl RegressionTask {
    /// Generate `samples` samples with `dim` features, holding out a fifth for
    /// evaluation, batched by `batch_size`.
    pub fn generate(samples: usize, dim: usize, batch_size: usize, noise: f32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights: Vec<f32> = (0..dim).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let bias: f32 = rng.gen_range(-1.0..1.0);

        let rows: Vec<(Vec<f32>, f32)> = (0..samples)
            .map(|_| {
                let x: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let y = x.iter().zip(&weights).map(|(a, b)| a * b).sum::<f32>()
                    + bias
                    + noise * rng.gen_range(-1.0f32..1.0);
                (x, y)
            })
            .collect();

        let held_out = (samples / 5).max(1).min(samples);
        let (eval_rows, train_rows) = rows.split_at(held_out);
        Self {
            weights,
            bias,
            train: batch(train_rows, batch_size),
            eval: batch(eval_rows, batch_size),
        }
    }

    pub fn dim(&self) -> usize {
        self.weights.len()
    }

    pub fn supplies(
        &self,
        shuffle_seed: u64,
    ) -> (
        InMemorySupply<Features, Vec<f32>>,
        InMemorySupply<Features, Vec<f32>>,
    ) {
        (
            InMemorySupply::new(self.train.clone()).shuffled(shuffle_seed),
            InMemorySupply::new(self.eval.clone()),
        )
    }
}

fn batch(rows: &[(Vec<f32>, f32)], batch_size: usize) -> Vec<RegressionBatch> {
    rows.chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| {
            let (xs, ys): (Vec<_>, Vec<_>) = chunk.iter().cloned().unzip();
            Batch::new(xs, ys).with_meta("batch", serde_json::json!(i))
        })
        .collect()
}
