//! In-process training pipeline.
//!
//! Validate → Align → FitClassifier → Persist, over the same detection,
//! alignment and embedding primitives the live recognition path uses. Each
//! stage runs on the blocking pool under its own timeout; any stage error
//! aborts the run and leaves the previous classifier artifact untouched
//! (persist is a tmp-write plus atomic rename).

use crate::engine::EnginePaths;
use rollcall_core::{
    align_crop, prewhiten, ClassifierState, Embedding, FaceDetector, FaceEmbedder,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const MIN_IDENTITIES: usize = 2;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("need at least {MIN_IDENTITIES} identities with reference images to train, found {0}")]
    InsufficientData(usize),
    #[error("training stage '{0}' timed out")]
    Timeout(&'static str),
    #[error("training failed: {0}")]
    Failed(String),
}

/// Outcome of a successful training run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub identities: usize,
    pub images_aligned: usize,
    pub images_skipped: usize,
}

/// One training run over the raw image corpus.
pub struct TrainingPipeline {
    raw_dir: PathBuf,
    processed_dir: PathBuf,
    paths: EnginePaths,
    stage_timeout: Duration,
}

impl TrainingPipeline {
    pub fn new(
        raw_dir: PathBuf,
        processed_dir: PathBuf,
        paths: EnginePaths,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            raw_dir,
            processed_dir,
            paths,
            stage_timeout,
        }
    }

    /// Run the whole pipeline. The caller is responsible for mutual
    /// exclusion; the pipeline itself assumes it is the only writer of the
    /// processed tree and the classifier artifact.
    pub async fn run(&self) -> Result<TrainReport, TrainError> {
        // Validating
        let raw_dir = self.raw_dir.clone();
        let corpus = self
            .stage("validating", move || scan_raw_corpus(&raw_dir))
            .await??;
        if corpus.len() < MIN_IDENTITIES {
            return Err(TrainError::InsufficientData(corpus.len()));
        }
        tracing::info!(identities = corpus.len(), "training corpus validated");

        // Aligning
        let processed_dir = self.processed_dir.clone();
        let paths = self.paths.clone();
        let align_corpus = corpus.clone();
        let align_result = self
            .stage("aligning", move || {
                align_stage(&align_corpus, &processed_dir, &paths)
            })
            .await??;
        tracing::info!(
            aligned = align_result.aligned,
            skipped = align_result.skipped,
            "corpus aligned"
        );

        // FittingClassifier
        let processed_dir = self.processed_dir.clone();
        let paths = self.paths.clone();
        let state = self
            .stage("fitting", move || fit_stage(&processed_dir, &paths))
            .await??;

        // Persisting
        let classifier_path = self.paths.classifier.clone();
        self.stage("persisting", move || {
            state
                .save(&classifier_path)
                .map_err(|e| TrainError::Failed(e.to_string()))
        })
        .await??;

        Ok(TrainReport {
            identities: corpus.len(),
            images_aligned: align_result.aligned,
            images_skipped: align_result.skipped,
        })
    }

    async fn stage<T, F>(&self, name: &'static str, f: F) -> Result<Result<T, TrainError>, TrainError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TrainError> + Send + 'static,
    {
        tracing::info!(stage = name, "training stage started");
        match tokio::time::timeout(self.stage_timeout, task::spawn_blocking(f)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_err)) => Err(TrainError::Failed(format!("stage '{name}': {join_err}"))),
            Err(_elapsed) => Err(TrainError::Timeout(name)),
        }
    }
}

/// One identity's slice of the raw corpus.
#[derive(Debug, Clone)]
pub struct IdentityImages {
    pub label: String,
    pub images: Vec<PathBuf>,
}

struct AlignResult {
    aligned: usize,
    skipped: usize,
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Scan the raw corpus: one subdirectory per identity, keeping only
/// identities that own at least one image. Sorted by label for a stable
/// class ordering.
pub fn scan_raw_corpus(raw_dir: &Path) -> Result<Vec<IdentityImages>, TrainError> {
    let mut corpus = Vec::new();

    let entries = match std::fs::read_dir(raw_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(corpus), // missing corpus directory = zero identities
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(label) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };

        let mut images: Vec<PathBuf> = std::fs::read_dir(&path)
            .map_err(|e| TrainError::Failed(format!("reading {}: {e}", path.display())))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image_file(p))
            .collect();
        images.sort();

        if !images.is_empty() {
            corpus.push(IdentityImages { label, images });
        }
    }

    corpus.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(corpus)
}

/// Detect and align every raw image, writing 160x160 crops to the processed
/// tree grouped by identity. Images with no detectable face are logged and
/// skipped, never fatal.
fn align_stage(
    corpus: &[IdentityImages],
    processed_dir: &Path,
    paths: &EnginePaths,
) -> Result<AlignResult, TrainError> {
    let mut detector = FaceDetector::load(&paths.pnet, &paths.rnet, &paths.onet)
        .map_err(|e| TrainError::Failed(e.to_string()))?;

    // The processed tree is a derived artifact; rebuild it from scratch so
    // stale crops from removed identities cannot leak into the fit.
    if processed_dir.exists() {
        std::fs::remove_dir_all(processed_dir)
            .map_err(|e| TrainError::Failed(format!("clearing processed dir: {e}")))?;
    }

    let mut aligned = 0usize;
    let mut skipped = 0usize;

    for identity in corpus {
        let out_dir = processed_dir.join(&identity.label);
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| TrainError::Failed(format!("creating {}: {e}", out_dir.display())))?;

        for image_path in &identity.images {
            let frame = match image::open(image_path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %image_path.display(), error = %e, "unreadable image skipped");
                    skipped += 1;
                    continue;
                }
            };

            let boxes = detector
                .detect(&frame)
                .map_err(|e| TrainError::Failed(e.to_string()))?;
            let Some(face) = boxes.first() else {
                tracing::warn!(path = %image_path.display(), "no face detected, image skipped");
                skipped += 1;
                continue;
            };

            let crop = match align_crop(&frame, face) {
                Ok(crop) => crop,
                Err(e) => {
                    tracing::warn!(path = %image_path.display(), error = %e, "alignment failed, image skipped");
                    skipped += 1;
                    continue;
                }
            };

            let stem = image_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("crop");
            let out_path = out_dir.join(format!("{stem}.png"));
            crop.save(&out_path)
                .map_err(|e| TrainError::Failed(format!("writing {}: {e}", out_path.display())))?;
            aligned += 1;
        }
    }

    Ok(AlignResult { aligned, skipped })
}

/// Embed every aligned crop and fit a fresh classifier snapshot.
fn fit_stage(processed_dir: &Path, paths: &EnginePaths) -> Result<ClassifierState, TrainError> {
    let mut embedder =
        FaceEmbedder::load(&paths.facenet).map_err(|e| TrainError::Failed(e.to_string()))?;

    let corpus = scan_processed_corpus(processed_dir)?;
    if corpus.len() < MIN_IDENTITIES {
        return Err(TrainError::Failed(format!(
            "only {} identities survived alignment, need {MIN_IDENTITIES}",
            corpus.len()
        )));
    }

    let mut embeddings: Vec<Embedding> = Vec::new();
    let mut classes: Vec<usize> = Vec::new();
    let labels: Vec<String> = corpus.iter().map(|i| i.label.clone()).collect();

    for (class_idx, identity) in corpus.iter().enumerate() {
        for crop_path in &identity.images {
            let crop = image::open(crop_path)
                .map_err(|e| TrainError::Failed(format!("reading {}: {e}", crop_path.display())))?
                .to_rgb8();
            let whitened = prewhiten(&crop);
            let embedding = embedder
                .extract(&whitened)
                .map_err(|e| TrainError::Failed(e.to_string()))?;
            embeddings.push(embedding);
            classes.push(class_idx);
        }
    }

    ClassifierState::fit(&embeddings, &classes, labels)
        .map_err(|e| TrainError::Failed(e.to_string()))
}

/// Scan the processed tree the same way as the raw corpus.
pub fn scan_processed_corpus(processed_dir: &Path) -> Result<Vec<IdentityImages>, TrainError> {
    scan_raw_corpus(processed_dir)
}
