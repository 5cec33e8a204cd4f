//! rollcall-service — service layer for face-recognition attendance.
//!
//! Hosts the recognition engine thread, the in-process training pipeline
//! and the attendance reconciliation logic, behind a facade the transport
//! layer (or the CLI) drives.

pub mod attendance;
pub mod config;
pub mod engine;
pub mod service;
pub mod shifts;
pub mod training;

pub use attendance::{mark_attendance, AttendanceError, MarkOutcome};
pub use config::Config;
pub use engine::{spawn_engine, EngineError, EngineHandle, EnginePaths, EngineStatus};
pub use service::{AttendanceService, RecognizeResponse, ServiceError, TrainResponse};
pub use shifts::{current_shift, default_shifts, Shift};
pub use training::{TrainError, TrainReport, TrainingPipeline};
