use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub caption: CaptionConfig,
    pub translate: TranslateConfig,
    pub judge: JudgeConfig,
    pub media: MediaConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub session: SessionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device index ("0") or stream URL ("rtsp://...").
    pub source: String,
    /// Fallback when the stream does not report a frame rate.
    pub fallback_fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub model_path: String,
    pub num_classes: usize,
    pub weapon_class_id: usize,
    /// Confidence floor applied inside the detector (pre-tracking).
    pub model_confidence: f32,
    /// High threshold a tracked box must meet before it can alert.
    pub min_confidence: f32,
    /// Run the tracker only every Nth frame.
    pub sample_interval: u64,
    pub nms_iou_threshold: f32,
    pub use_cuda: bool,
    pub num_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionConfig {
    pub server_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateConfig {
    pub server_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub model: String,
    /// Fallback keys when GEMINI_API_KEYS is not set in the environment.
    pub api_keys: Vec<String>,
    pub timeout_secs: u64,
    /// Judge confidence (0-100) at or above which a clip is captured.
    pub escalation_threshold: u32,
    /// Look-back window for prior alerts of the same track.
    pub history_window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Ring buffer capacity; ~2s of footage at capture rate.
    pub buffer_frames: usize,
    pub frames_dir: String,
    pub videos_dir: String,
    pub clip_fps: f64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
    pub upload_url: String,
    pub upload_api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Venue metadata supplied when a detection session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub latitud: f64,
    pub longitud: f64,
    pub nombre_local: String,
    pub ip_camara: String,
}

/// A raw RGB frame as read from the camera.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}
