//! rollcall-core — Face recognition pipeline for attendance check-ins.
//!
//! Decodes submitted stills, finds faces with an MTCNN cascade, aligns and
//! prewhitens the best crop, extracts FaceNet embeddings via ONNX Runtime,
//! and classifies embeddings against the trained identity classifier.

pub mod alignment;
pub mod classifier;
pub mod decode;
pub mod detector;
pub mod embedder;
pub mod types;

pub use alignment::{align_crop, prewhiten, AlignmentError};
pub use classifier::{ClassifierError, ClassifierState};
pub use decode::{decode_base64_image, DecodeError};
pub use detector::{DetectorError, FaceDetector};
pub use embedder::{EmbedderError, FaceEmbedder};
pub use types::{Embedding, FaceBox, Prediction};
