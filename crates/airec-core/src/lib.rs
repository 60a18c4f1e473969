pub mod archive;
pub mod audio;
pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod recording;
pub mod transcriber;

pub use audio::{AudioCapture, DeviceInfo};
pub use capture::{CaptureSession, FinishedRecording};
pub use config::{ArchiveConfig, Config, TranscriptionConfig};
pub use db::RecordStore;
pub use error::{ArchiveError, CaptureError, ModelError, StoreError, TranscriptionError};
pub use models::{
    detect_tier, get_variant, variant_for_tier, DeviceTier, HubModelProvider, ModelProvider,
    ModelVariant, MODEL_VARIANTS,
};
pub use orchestrator::TranscriptionOrchestrator;
pub use recording::Recording;
pub use transcriber::{CancelToken, ModelState, Transcriber, WhisperEngine};
