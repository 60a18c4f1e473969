use std::path::PathBuf;

/// Errors from the audio capture session.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Recording file I/O failed: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("Failed to encode recording: {0}")]
    Encode(#[from] hound::Error),
}

/// Errors from the model download/load lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model download failed: {0}")]
    DownloadFailed(String),

    #[error("Model load timed out after {0} seconds")]
    LoadTimeout(u64),

    #[error("Model load failed: {0}")]
    LoadFailed(String),
}

/// Errors from a transcription request.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Speech model is not loaded")]
    NotInitialized,

    #[error("Could not decode audio file: {0}")]
    InvalidAudioFormat(String),

    #[error("Transcription was cancelled")]
    Cancelled,

    #[error("Inference failed: {0}")]
    Failed(String),
}

/// Errors from the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open record store: {0}")]
    Open(#[source] rusqlite::Error),

    #[error("Failed to create store directory: {0}")]
    OpenDir(#[source] std::io::Error),

    #[error("Record store write failed: {0}")]
    Write(#[source] rusqlite::Error),
}

/// Errors from the best-effort archival export.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive target unavailable: {}", .0.display())]
    TargetUnavailable(PathBuf),

    #[error("Source recording not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Source recording not readable: {}", .0.display())]
    SourceUnreadable(PathBuf),

    #[error("Archive copy failed: {0}")]
    Io(#[from] std::io::Error),
}
