//! Attendance service facade.
//!
//! Ties the recognition engine, the attendance store and the training
//! pipeline together behind the two operations external callers use:
//! `recognize_and_mark` and `train`. Per-call recognition failures never
//! escape as errors; they come back as a structured response with
//! `success = false` and a human-readable reason, so the transport layer can
//! always answer with a well-formed envelope.

use crate::attendance::{mark_attendance, MarkOutcome};
use crate::config::Config;
use crate::engine::{spawn_engine, EngineError, EngineHandle, EnginePaths, EngineStatus};
use crate::shifts::{default_shifts, Shift};
use crate::training::{TrainError, TrainingPipeline};
use chrono::{Duration, NaiveDateTime};
use rollcall_store::{AttendanceStatus, Store, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("engine unavailable: {0}")]
    Engine(#[from] EngineError),
    #[error("blocking store task failed: {0}")]
    Task(#[from] task::JoinError),
}

/// Response envelope for one recognition call.
#[derive(Debug, Clone, Serialize)]
pub struct RecognizeResponse {
    pub success: bool,
    pub student_name: Option<String>,
    pub student_code: Option<String>,
    pub confidence: Option<f32>,
    pub status: Option<AttendanceStatus>,
    pub message: String,
}

impl RecognizeResponse {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            student_name: None,
            student_code: None,
            confidence: None,
            status: None,
            message: message.into(),
        }
    }
}

/// Response envelope for a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainResponse {
    pub success: bool,
    pub message: String,
}

/// The attendance service. One instance per process.
pub struct AttendanceService {
    engine: EngineHandle,
    /// Synchronous store; shared with the blocking-pool tasks that run the
    /// reconciliation queries.
    store: Arc<Mutex<Store>>,
    pipeline: TrainingPipeline,
    /// Mutual exclusion for training runs; `try_lock` keeps a second
    /// request from interleaving with an active run.
    training_active: Mutex<()>,
    shifts: Vec<Shift>,
    grace: Duration,
    min_confidence: f32,
}

impl AttendanceService {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let store = Store::open(&config.db_path)?;

        let paths = EnginePaths {
            pnet: config.pnet_model_path(),
            rnet: config.rnet_model_path(),
            onet: config.onet_model_path(),
            facenet: config.facenet_model_path(),
            classifier: config.classifier_path(),
        };
        let engine = spawn_engine(paths.clone());

        let pipeline = TrainingPipeline::new(
            config.raw_image_dir(),
            config.processed_image_dir(),
            paths,
            StdDuration::from_secs(config.train_stage_timeout_secs),
        );

        Ok(Self {
            engine,
            store: Arc::new(Mutex::new(store)),
            pipeline,
            training_active: Mutex::new(()),
            shifts: default_shifts(),
            grace: Duration::minutes(config.grace_minutes),
            min_confidence: config.min_confidence,
        })
    }

    /// Recognize the face in a base64 still and reconcile the result into
    /// the attendance tables. `class_id = None` falls back to the first
    /// class on record.
    pub async fn recognize_and_mark(
        &self,
        image_base64: String,
        class_id: Option<i64>,
        now: NaiveDateTime,
    ) -> Result<RecognizeResponse, ServiceError> {
        let recognition = match self.engine.recognize(image_base64).await {
            Ok(r) => r,
            Err(EngineError::ChannelClosed) => return Err(EngineError::ChannelClosed.into()),
            Err(e) => return Ok(RecognizeResponse::failure(recognize_failure_message(&e))),
        };

        let label = recognition.prediction.label;
        let confidence = recognition.prediction.confidence;

        if self.min_confidence > 0.0 && confidence < self.min_confidence {
            tracing::info!(
                label,
                confidence,
                gate = self.min_confidence,
                "recognition below confidence gate"
            );
            return Ok(RecognizeResponse::failure(format!(
                "Recognition confidence {confidence:.2} below required {:.2}",
                self.min_confidence
            )));
        }

        self.reconcile(label, confidence, class_id, now).await
    }

    /// Reconcile a recognized identity into the attendance tables.
    ///
    /// The store is synchronous rusqlite, so the whole query chain runs on
    /// the blocking pool, never on a runtime worker thread.
    async fn reconcile(
        &self,
        label: String,
        confidence: f32,
        class_id: Option<i64>,
        now: NaiveDateTime,
    ) -> Result<RecognizeResponse, ServiceError> {
        let store = Arc::clone(&self.store);
        let shifts = self.shifts.clone();
        let grace = self.grace;

        let outcome = task::spawn_blocking(move || {
            let store = store.blocking_lock();

            let class_id = match class_id {
                Some(id) => Some(id),
                None => store.first_class()?.map(|c| c.id),
            };
            let Some(class_id) = class_id else {
                return Ok(None);
            };

            mark_attendance(&store, &shifts, grace, class_id, &label, confidence, now)
                .map(Some)
                .map_err(|e| match e {
                    crate::attendance::AttendanceError::Store(s) => ServiceError::Store(s),
                })
        })
        .await??;

        let Some(outcome) = outcome else {
            return Ok(RecognizeResponse::failure("No class configured"));
        };

        Ok(match outcome {
            MarkOutcome::Marked { student, record } => RecognizeResponse {
                success: true,
                student_name: Some(student.full_name),
                student_code: Some(student.student_code),
                confidence: Some(confidence),
                status: Some(record.status),
                message: "Attendance marked successfully".into(),
            },
            MarkOutcome::AlreadyMarked { student } => RecognizeResponse {
                success: false,
                student_name: Some(student.full_name),
                student_code: Some(student.student_code),
                confidence: Some(confidence),
                status: None,
                message: "Already marked".into(),
            },
            MarkOutcome::NoActiveWindow { student } => RecognizeResponse {
                success: true,
                student_name: Some(student.full_name),
                student_code: Some(student.student_code),
                confidence: Some(confidence),
                status: None,
                message: "Student recognized (no active session)".into(),
            },
            MarkOutcome::IdentityNotFound { label } => RecognizeResponse::failure(format!(
                "Student '{label}' not found in roster"
            )),
        })
    }

    /// Run the training pipeline. Long-running; callers keep it off the
    /// request path. A concurrent call is rejected, not queued.
    pub async fn train(&self) -> TrainResponse {
        let Ok(_guard) = self.training_active.try_lock() else {
            return TrainResponse {
                success: false,
                message: "Training already in progress".into(),
            };
        };

        match self.pipeline.run().await {
            Ok(report) => {
                // Required side effect: swap the live classifier so the next
                // recognition uses the new snapshot.
                match self.engine.reload_classifier().await {
                    Ok(classes) => TrainResponse {
                        success: true,
                        message: format!(
                            "Model trained successfully: {} identities, {} images aligned ({} skipped), {classes} classes live",
                            report.identities, report.images_aligned, report.images_skipped
                        ),
                    },
                    Err(e) => TrainResponse {
                        success: false,
                        message: format!("Training persisted but classifier reload failed: {e}"),
                    },
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "training run failed");
                TrainResponse {
                    success: false,
                    message: train_failure_message(&e),
                }
            }
        }
    }

    /// Engine and classifier health, for diagnostics.
    pub async fn status(&self) -> Result<EngineStatus, ServiceError> {
        Ok(self.engine.status().await?)
    }
}

fn recognize_failure_message(err: &EngineError) -> String {
    match err {
        EngineError::Decode(_) => "Failed to decode image".into(),
        EngineError::NoFaceDetected => "No face detected".into(),
        EngineError::ClassifierNotTrained => {
            "No trained classifier is available — run training first".into()
        }
        other => format!("Recognition error: {other}"),
    }
}

fn train_failure_message(err: &TrainError) -> String {
    match err {
        TrainError::InsufficientData(_) | TrainError::Timeout(_) => err.to_string(),
        TrainError::Failed(msg) => format!("Training failed: {msg}"),
    }
}
