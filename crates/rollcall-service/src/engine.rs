//! Recognition engine.
//!
//! A dedicated OS thread owns the ONNX sessions and the live classifier
//! snapshot; async callers talk to it over an mpsc channel with oneshot
//! replies. Because the thread processes requests serially, the expensive
//! model load is naturally single-flight: the first recognition triggers it,
//! concurrent callers queue behind it, and a failed load is simply retried
//! by the next request. The classifier is swapped as one `Arc` snapshot, so
//! a recognition never sees labels from one training run and weights from
//! another.

use rollcall_core::{
    align_crop, decode_base64_image, prewhiten, AlignmentError, ClassifierError, ClassifierState,
    DecodeError, DetectorError, EmbedderError, FaceBox, FaceDetector, FaceEmbedder, Prediction,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] DecodeError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("alignment error: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("no trained classifier is available — run training first")]
    ClassifierNotTrained,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Paths to the ONNX models and the classifier artifact.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub pnet: String,
    pub rnet: String,
    pub onet: String,
    pub facenet: String,
    pub classifier: PathBuf,
}

/// Result of one recognition call.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub prediction: Prediction,
    pub face: FaceBox,
}

/// Engine health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub models_loaded: bool,
    pub classifier_loaded: bool,
    pub num_classes: Option<usize>,
}

enum EngineRequest {
    Recognize {
        image_base64: String,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    ReloadClassifier {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the full pipeline on one base64 still: decode, detect, align,
    /// embed, classify.
    pub async fn recognize(&self, image_base64: String) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                image_base64,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Reload the classifier snapshot from disk (after a training run) and
    /// return the number of classes in the new snapshot.
    pub async fn reload_classifier(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ReloadClassifier { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

struct LoadedModels {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

struct EngineState {
    paths: EnginePaths,
    /// Loaded lazily on the first recognition; a failed load leaves this
    /// `None` so the next call retries.
    models: Option<LoadedModels>,
    classifier: Option<Arc<ClassifierState>>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Nothing is loaded up front; model files only need to exist by the time
/// the first recognition arrives.
pub fn spawn_engine(paths: EnginePaths) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut state = EngineState {
                paths,
                models: None,
                classifier: None,
            };

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize {
                        image_base64,
                        reply,
                    } => {
                        let _ = reply.send(run_recognize(&mut state, &image_base64));
                    }
                    EngineRequest::ReloadClassifier { reply } => {
                        let _ = reply.send(reload_classifier(&mut state));
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(EngineStatus {
                            models_loaded: state.models.is_some(),
                            classifier_loaded: state.classifier.is_some(),
                            num_classes: state.classifier.as_ref().map(|c| c.num_classes()),
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

/// Load the ONNX sessions if they are not resident yet.
fn ensure_models(state: &mut EngineState) -> Result<&mut LoadedModels, EngineError> {
    if state.models.is_none() {
        let detector =
            FaceDetector::load(&state.paths.pnet, &state.paths.rnet, &state.paths.onet)
                .map_err(|e| EngineError::ModelLoad(e.to_string()))?;
        let embedder = FaceEmbedder::load(&state.paths.facenet)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;
        tracing::info!("recognition models loaded");
        state.models = Some(LoadedModels { detector, embedder });
    }
    Ok(state.models.as_mut().expect("models just ensured"))
}

/// Load (or reload) the classifier snapshot from the artifact path and swap
/// it in as one unit.
fn reload_classifier(state: &mut EngineState) -> Result<usize, EngineError> {
    match ClassifierState::load(&state.paths.classifier) {
        Ok(loaded) => {
            let classes = loaded.num_classes();
            state.classifier = Some(Arc::new(loaded));
            tracing::info!(classes, "classifier snapshot swapped in");
            Ok(classes)
        }
        Err(ClassifierError::ArtifactNotFound(_)) => Err(EngineError::ClassifierNotTrained),
        Err(e) => Err(e.into()),
    }
}

fn run_recognize(state: &mut EngineState, image_base64: &str) -> Result<Recognition, EngineError> {
    // Decode before touching any model: bad payloads should fail cheaply.
    let frame = decode_base64_image(image_base64)?;

    if state.classifier.is_none() {
        // First call after startup: pick up an artifact from a previous run.
        reload_classifier(state)?;
    }
    let classifier = state
        .classifier
        .clone()
        .ok_or(EngineError::ClassifierNotTrained)?;

    let models = ensure_models(state)?;

    let boxes = models.detector.detect(&frame)?;
    // Highest-confidence face wins on multi-face frames; detect() returns
    // boxes sorted by confidence.
    let face = boxes.into_iter().next().ok_or(EngineError::NoFaceDetected)?;

    let crop = align_crop(&frame, &face)?;
    let whitened = prewhiten(&crop);
    let embedding = models.embedder.extract(&whitened)?;

    let prediction = classifier.predict(&embedding)?;
    tracing::debug!(
        label = %prediction.label,
        confidence = prediction.confidence,
        face_confidence = face.confidence,
        "recognition completed"
    );

    Ok(Recognition { prediction, face })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::Embedding;

    fn temp_paths(tag: &str) -> (EnginePaths, PathBuf) {
        let dir = std::env::temp_dir().join(format!("rollcall-engine-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = EnginePaths {
            pnet: dir.join("pnet.onnx").to_string_lossy().into_owned(),
            rnet: dir.join("rnet.onnx").to_string_lossy().into_owned(),
            onet: dir.join("onet.onnx").to_string_lossy().into_owned(),
            facenet: dir.join("facenet.onnx").to_string_lossy().into_owned(),
            classifier: dir.join("classifier.bin"),
        };
        (paths, dir)
    }

    fn fitted_state(labels: &[&str]) -> ClassifierState {
        let mut embeddings = Vec::new();
        let mut classes = Vec::new();
        for (c, _) in labels.iter().enumerate() {
            let mut v = vec![0.0f32; labels.len()];
            v[c] = 1.0;
            embeddings.push(Embedding { values: v.clone() });
            embeddings.push(Embedding { values: v });
            classes.push(c);
            classes.push(c);
        }
        ClassifierState::fit(
            &embeddings,
            &classes,
            labels.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_recognize_bad_payload_fails_before_model_load() {
        let (paths, dir) = temp_paths("decode");
        let engine = spawn_engine(paths);

        let err = engine.recognize("!!garbage!!".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));

        // Nothing was loaded along the way
        let status = engine.status().await.unwrap();
        assert!(!status.models_loaded);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_reload_without_artifact() {
        let (paths, dir) = temp_paths("no-artifact");
        let engine = spawn_engine(paths);

        let err = engine.reload_classifier().await.unwrap_err();
        assert!(matches!(err, EngineError::ClassifierNotTrained));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_classifier_hot_swap() {
        let (paths, dir) = temp_paths("hot-swap");
        let engine = spawn_engine(paths.clone());

        fitted_state(&["an", "binh"]).save(&paths.classifier).unwrap();
        assert_eq!(engine.reload_classifier().await.unwrap(), 2);

        let status = engine.status().await.unwrap();
        assert!(status.classifier_loaded);
        assert_eq!(status.num_classes, Some(2));

        // Retrain with an extra identity, swap, and observe the new snapshot
        fitted_state(&["an", "binh", "chi"]).save(&paths.classifier).unwrap();
        assert_eq!(engine.reload_classifier().await.unwrap(), 3);
        let status = engine.status().await.unwrap();
        assert_eq!(status.num_classes, Some(3));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
