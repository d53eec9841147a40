//! Fake training model.
//!
//! Simulates a two-layer network so workers produce a plausible loss per step
//! without any numerics dependency. The worker treats the snapshot as an
//! opaque JSON value; only this module interprets it.

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

const INPUT_SIZE: usize = 10;
const HIDDEN_SIZE: usize = 64;
const OUTPUT_SIZE: usize = 1;

pub struct FakeModel {
    weights_1: Vec<Vec<f64>>,
    bias_1: Vec<f64>,
    weights_2: Vec<Vec<f64>>,
    bias_2: Vec<f64>,
    loss_history: Vec<f64>,
}

/// SGD-ish optimizer with a decaying learning rate.
pub struct FakeOptimizer {
    learning_rate: f64,
    step_count: u64,
}

/// Serialized form of the model, carried inside checkpoints.
#[derive(Debug, Serialize, Deserialize)]
struct ModelSnapshot {
    weights_1: Vec<Vec<f64>>,
    bias_1: Vec<f64>,
    weights_2: Vec<Vec<f64>>,
    bias_2: Vec<f64>,
    #[serde(default)]
    loss_history: Vec<f64>,
    #[serde(default)]
    optimizer_steps: u64,
}

impl FakeModel {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let mut mat = |rows: usize, cols: usize| -> Vec<Vec<f64>> {
            (0..rows)
                .map(|_| (0..cols).map(|_| rng.random_range(-0.1..0.1)).collect())
                .collect()
        };
        let weights_1 = mat(INPUT_SIZE, HIDDEN_SIZE);
        let weights_2 = mat(HIDDEN_SIZE, OUTPUT_SIZE);
        let mut vec1 = |n: usize| -> Vec<f64> {
            (0..n).map(|_| rng.random_range(-0.1..0.1)).collect()
        };
        let bias_1 = vec1(HIDDEN_SIZE);
        let bias_2 = vec1(OUTPUT_SIZE);
        FakeModel {
            weights_1,
            bias_1,
            weights_2,
            bias_2,
            loss_history: Vec::new(),
        }
    }

    /// Mean output of the fake network over a batch.
    fn forward(&self, batch: &[Vec<f64>]) -> f64 {
        let mut total = 0.0;
        for sample in batch {
            let mut output = self.bias_2[0];
            for (j, b1) in self.bias_1.iter().enumerate() {
                let mut hidden = *b1;
                for (i, x) in sample.iter().enumerate() {
                    hidden += self.weights_1[i][j] * x;
                }
                let hidden = hidden.max(0.0); // ReLU
                output += self.weights_2[j][0] * hidden;
            }
            total += output;
        }
        total / batch.len() as f64
    }

    /// Simulate a gradient update by nudging every weight.
    fn backward(&mut self, learning_rate: f64) {
        let mut rng = rand::rng();
        let perturbation = learning_rate * rng.random_range(-0.01..0.01);
        for row in &mut self.weights_1 {
            for w in row {
                *w += perturbation;
            }
        }
        for b in &mut self.bias_1 {
            *b += perturbation * 0.1;
        }
        for row in &mut self.weights_2 {
            for w in row {
                *w += perturbation;
            }
        }
        for b in &mut self.bias_2 {
            *b += perturbation * 0.1;
        }
    }

    pub fn loss_history_len(&self) -> usize {
        self.loss_history.len()
    }

    /// Opaque snapshot of the model + optimizer, for checkpointing.
    pub fn snapshot(&self, optimizer: &FakeOptimizer) -> Result<serde_json::Value> {
        serde_json::to_value(ModelSnapshot {
            weights_1: self.weights_1.clone(),
            bias_1: self.bias_1.clone(),
            weights_2: self.weights_2.clone(),
            bias_2: self.bias_2.clone(),
            loss_history: self.loss_history.clone(),
            optimizer_steps: optimizer.step_count,
        })
        .context("serialize model snapshot")
    }

    /// Restore model + optimizer from a checkpoint snapshot.
    pub fn restore(&mut self, optimizer: &mut FakeOptimizer, value: &serde_json::Value) -> Result<()> {
        let snap: ModelSnapshot =
            serde_json::from_value(value.clone()).context("parse model snapshot")?;
        self.weights_1 = snap.weights_1;
        self.bias_1 = snap.bias_1;
        self.weights_2 = snap.weights_2;
        self.bias_2 = snap.bias_2;
        self.loss_history = snap.loss_history;
        optimizer.step_count = snap.optimizer_steps;
        Ok(())
    }
}

impl FakeOptimizer {
    pub fn new(learning_rate: f64) -> Self {
        FakeOptimizer {
            learning_rate,
            step_count: 0,
        }
    }

    /// Learning rate decays with the global step count.
    fn step(&mut self, model: &mut FakeModel) {
        self.step_count += 1;
        let lr = self.learning_rate / (1.0 + 0.0001 * self.step_count as f64);
        model.backward(lr);
    }
}

fn fake_batch(batch_size: usize) -> Vec<Vec<f64>> {
    let mut rng = rand::rng();
    (0..batch_size)
        .map(|_| (0..INPUT_SIZE).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect()
}

/// One training step: forward, fake MSE loss against a fixed target,
/// backward, history append. Returns the loss.
pub fn train_step(model: &mut FakeModel, optimizer: &mut FakeOptimizer, batch_size: usize) -> f64 {
    let batch = fake_batch(batch_size);
    let output = model.forward(&batch);
    let error = output - 0.5;
    let loss = error * error;
    optimizer.step(model);
    model.loss_history.push(loss);
    loss
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_step_returns_finite_loss_and_tracks_history() {
        let mut model = FakeModel::new();
        let mut opt = FakeOptimizer::new(0.001);
        for i in 1..=3 {
            let loss = train_step(&mut model, &mut opt, 8);
            assert!(loss.is_finite());
            assert!(loss >= 0.0);
            assert_eq!(model.loss_history_len(), i);
        }
        assert_eq!(opt.step_count, 3);
    }

    #[test]
    fn snapshot_restore_roundtrips() {
        let mut model = FakeModel::new();
        let mut opt = FakeOptimizer::new(0.001);
        train_step(&mut model, &mut opt, 4);
        train_step(&mut model, &mut opt, 4);

        let snap = model.snapshot(&opt).unwrap();

        let mut restored = FakeModel::new();
        let mut restored_opt = FakeOptimizer::new(0.001);
        restored.restore(&mut restored_opt, &snap).unwrap();

        assert_eq!(restored.loss_history, model.loss_history);
        assert_eq!(restored.weights_1, model.weights_1);
        assert_eq!(restored.bias_2, model.bias_2);
        assert_eq!(restored_opt.step_count, 2);
    }

    #[test]
    fn restore_rejects_garbage() {
        let mut model = FakeModel::new();
        let mut opt = FakeOptimizer::new(0.001);
        let bad = serde_json::json!({"weights_1": "nope"});
        assert!(model.restore(&mut opt, &bad).is_err());
    }
}
