//! Probabilistic identity classifier over face embeddings.
//!
//! Multinomial logistic regression fitted in-process by full-batch gradient
//! descent (the objective is convex, so zero initialization is fine and
//! training is deterministic). A fitted state is an immutable snapshot of
//! (weights, bias, ordered label list); retraining produces a whole new
//! snapshot, never a partial update.

use crate::types::{Embedding, Prediction};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const FIT_EPOCHS: usize = 500;
const FIT_LEARNING_RATE: f32 = 0.5;
const FIT_L2: f32 = 1e-4;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier fit failed: {0}")]
    FitFailed(String),
    #[error("embedding has {got} dimensions, classifier was trained on {expected}")]
    DimensionMismatch { got: usize, expected: usize },
    #[error("classifier artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("corrupt classifier artifact: {0}")]
    CorruptArtifact(String),
    #[error("artifact serialization: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable snapshot of one training run.
///
/// Invariant: `labels[i]` is the class whose probability sits at index `i`
/// of the vector produced by [`predict_proba`](Self::predict_proba).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierState {
    labels: Vec<String>,
    dim: usize,
    /// Row-major (num_classes, dim) weight matrix.
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl ClassifierState {
    /// Fit a fresh classifier over (embeddings, class indices).
    ///
    /// `labels` gives the class names in index order; every entry of
    /// `classes` must index into it.
    pub fn fit(
        embeddings: &[Embedding],
        classes: &[usize],
        labels: Vec<String>,
    ) -> Result<Self, ClassifierError> {
        if embeddings.is_empty() {
            return Err(ClassifierError::FitFailed("no training embeddings".into()));
        }
        if embeddings.len() != classes.len() {
            return Err(ClassifierError::FitFailed(format!(
                "{} embeddings but {} class indices",
                embeddings.len(),
                classes.len()
            )));
        }
        if labels.len() < 2 {
            return Err(ClassifierError::FitFailed(format!(
                "need at least 2 classes, got {}",
                labels.len()
            )));
        }
        let dim = embeddings[0].values.len();
        if embeddings.iter().any(|e| e.values.len() != dim) {
            return Err(ClassifierError::FitFailed(
                "embeddings have inconsistent dimensions".into(),
            ));
        }
        if let Some(&bad) = classes.iter().find(|&&c| c >= labels.len()) {
            return Err(ClassifierError::FitFailed(format!(
                "class index {bad} out of range for {} labels",
                labels.len()
            )));
        }

        let n = embeddings.len();
        let num_classes = labels.len();

        let mut x = Array2::<f32>::zeros((n, dim));
        for (i, e) in embeddings.iter().enumerate() {
            for (j, &v) in e.values.iter().enumerate() {
                x[[i, j]] = v;
            }
        }
        let mut onehot = Array2::<f32>::zeros((n, num_classes));
        for (i, &c) in classes.iter().enumerate() {
            onehot[[i, c]] = 1.0;
        }

        let mut weights = Array2::<f32>::zeros((num_classes, dim));
        let mut bias = Array1::<f32>::zeros(num_classes);

        for _ in 0..FIT_EPOCHS {
            // logits: (n, classes)
            let logits = x.dot(&weights.t()) + &bias;
            let probs = softmax_rows(&logits);

            let diff = &probs - &onehot; // (n, classes)
            let grad_w = diff.t().dot(&x).mapv(|v| v / n as f32) + weights.mapv(|w| FIT_L2 * w);
            let grad_b = diff.sum_axis(Axis(0)).mapv(|v| v / n as f32);

            weights -= &grad_w.mapv(|v| FIT_LEARNING_RATE * v);
            bias -= &grad_b.mapv(|v| FIT_LEARNING_RATE * v);
        }

        Ok(Self {
            labels,
            dim,
            weights: weights.into_raw_vec_and_offset().0,
            bias: bias.into_raw_vec_and_offset().0,
        })
    }

    /// Class probability vector for one embedding, index-aligned with
    /// [`labels`](Self::labels).
    pub fn predict_proba(&self, embedding: &Embedding) -> Result<Vec<f32>, ClassifierError> {
        if embedding.values.len() != self.dim {
            return Err(ClassifierError::DimensionMismatch {
                got: embedding.values.len(),
                expected: self.dim,
            });
        }

        let num_classes = self.labels.len();
        let mut logits = vec![0.0f32; num_classes];
        for (c, logit) in logits.iter_mut().enumerate() {
            let row = &self.weights[c * self.dim..(c + 1) * self.dim];
            *logit = self.bias[c]
                + row
                    .iter()
                    .zip(embedding.values.iter())
                    .map(|(w, v)| w * v)
                    .sum::<f32>();
        }

        Ok(softmax(&logits))
    }

    /// Predict the most probable identity for one embedding.
    ///
    /// No confidence gating happens here; callers decide what probability is
    /// good enough.
    pub fn predict(&self, embedding: &Embedding) -> Result<Prediction, ClassifierError> {
        let probs = self.predict_proba(embedding)?;
        let (best, prob) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, &p)| (i, p))
            .unwrap_or((0, 0.0));

        Ok(Prediction {
            label: self.labels[best].clone(),
            confidence: prob,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Serialize to `path` atomically: write `<path>.tmp`, then rename into
    /// place so a partially written artifact is never visible.
    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bincode::serialize(self)?)?;
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), classes = self.labels.len(), "classifier persisted");
        Ok(())
    }

    /// Load a previously persisted snapshot.
    ///
    /// The decoded shape is validated before use, so a truncated or
    /// hand-edited artifact fails here rather than at prediction time.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        if !path.exists() {
            return Err(ClassifierError::ArtifactNotFound(
                path.display().to_string(),
            ));
        }
        let bytes = std::fs::read(path)?;
        let state: Self = bincode::deserialize(&bytes)?;
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        if self.labels.len() < 2 || self.dim == 0 {
            return Err(ClassifierError::CorruptArtifact(format!(
                "{} labels with embedding dim {}",
                self.labels.len(),
                self.dim
            )));
        }
        if self.weights.len() != self.labels.len() * self.dim
            || self.bias.len() != self.labels.len()
        {
            return Err(ClassifierError::CorruptArtifact(format!(
                "weight/bias shape does not fit {} classes of dim {}",
                self.labels.len(),
                self.dim
            )));
        }
        Ok(())
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|l| (l - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|e| e / sum);
    }
    out
}
