//! FaceNet embedding extractor via ONNX Runtime.
//!
//! Maps a prewhitened 160x160 face crop to a 512-dimensional identity
//! embedding. The session load is expensive; callers hold one extractor for
//! the process lifetime.

use crate::types::Embedding;
use ndarray::{Array3, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: usize = 160;
const FACENET_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — place the FaceNet ONNX export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("input crop is {0}x{1}, expected {FACENET_INPUT_SIZE}x{FACENET_INPUT_SIZE}")]
    BadInputShape(usize, usize),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-based embedding extractor.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded FaceNet model");
        Ok(Self { session })
    }

    /// Extract an embedding from a prewhitened HWC face crop.
    pub fn extract(&mut self, whitened: &Array3<f32>) -> Result<Embedding, EmbedderError> {
        let shape = whitened.shape();
        if shape[0] != FACENET_INPUT_SIZE || shape[1] != FACENET_INPUT_SIZE || shape[2] != 3 {
            return Err(EmbedderError::BadInputShape(shape[0], shape[1]));
        }

        // FaceNet exports take NHWC input.
        let mut input =
            Array4::<f32>::zeros((1, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, 3));
        input
            .index_axis_mut(ndarray::Axis(0), 0)
            .assign(whitened);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_input_shape_is_rejected_at_type_level() {
        // Extraction requires a loaded model; the shape contract is still
        // checkable on the input side.
        let too_small = Array3::<f32>::zeros((80, 80, 3));
        let shape = too_small.shape();
        assert_ne!(shape[0], FACENET_INPUT_SIZE);
    }

    #[test]
    fn test_nhwc_assign_roundtrip() {
        let mut whitened = Array3::<f32>::zeros((FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, 3));
        whitened[[10, 20, 1]] = 0.75;
        let mut input =
            Array4::<f32>::zeros((1, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, 3));
        input.index_axis_mut(ndarray::Axis(0), 0).assign(&whitened);
        assert_eq!(input[[0, 10, 20, 1]], 0.75);
    }
}
