use serde::{Deserialize, Serialize};

/// Bounding box for a detected face in frame coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }
}

/// Face embedding vector (512-dimensional for FaceNet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity between two embeddings, in [-1, 1].
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// Identity prediction from the classifier: label plus argmax probability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_box_dimensions() {
        let b = FaceBox {
            x1: 10.0,
            y1: 20.0,
            x2: 50.0,
            y2: 100.0,
            confidence: 0.9,
        };
        assert_eq!(b.width(), 40.0);
        assert_eq!(b.height(), 80.0);
        assert_eq!(b.area(), 3200.0);
    }

    #[test]
    fn test_similarity_identical() {
        let a = Embedding { values: vec![1.0, 0.0, 0.0] };
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = Embedding { values: vec![1.0, 0.0] };
        let b = Embedding { values: vec![0.0, 1.0] };
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Embedding { values: vec![0.0, 0.0] };
        let b = Embedding { values: vec![1.0, 0.0] };
        assert_eq!(a.similarity(&b), 0.0);
    }
}
