use std::path::PathBuf;

/// Service configuration, loaded from `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding training data and the classifier artifact.
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minutes after a session's start time before a check-in counts as late.
    pub grace_minutes: i64,
    /// Minimum classifier probability required to mark attendance.
    /// 0.0 disables the gate (legacy behavior).
    pub min_confidence: f32,
    /// Timeout in seconds applied to each training pipeline stage.
    pub train_stage_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share/rollcall")
            });

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        Self {
            model_dir,
            db_path,
            grace_minutes: env_i64("ROLLCALL_GRACE_MINUTES", 15),
            min_confidence: env_f32("ROLLCALL_MIN_CONFIDENCE", 0.0),
            train_stage_timeout_secs: env_u64("ROLLCALL_TRAIN_STAGE_TIMEOUT_SECS", 300),
            data_dir,
        }
    }

    /// Path to the MTCNN proposal network.
    pub fn pnet_model_path(&self) -> String {
        self.model_dir.join("pnet.onnx").to_string_lossy().into_owned()
    }

    /// Path to the MTCNN refinement network.
    pub fn rnet_model_path(&self) -> String {
        self.model_dir.join("rnet.onnx").to_string_lossy().into_owned()
    }

    /// Path to the MTCNN output network.
    pub fn onet_model_path(&self) -> String {
        self.model_dir.join("onet.onnx").to_string_lossy().into_owned()
    }

    /// Path to the FaceNet embedding network.
    pub fn facenet_model_path(&self) -> String {
        self.model_dir.join("facenet.onnx").to_string_lossy().into_owned()
    }

    /// Raw training corpus: one directory of reference images per identity.
    pub fn raw_image_dir(&self) -> PathBuf {
        self.data_dir.join("faces/raw")
    }

    /// Aligned crops derived from the raw corpus by the training pipeline.
    pub fn processed_image_dir(&self) -> PathBuf {
        self.data_dir.join("faces/processed")
    }

    /// Serialized classifier artifact.
    pub fn classifier_path(&self) -> PathBuf {
        self.data_dir.join("classifier.bin")
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
