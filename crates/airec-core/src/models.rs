use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ModelError;

const HUGGINGFACE_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// A coarse device-performance bucket used to pick a model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTier {
    Lite,
    Standard,
    Performance,
}

/// Static classifier data: upper cpu-count bound (inclusive) per tier.
const TIER_TABLE: &[(usize, DeviceTier)] = &[
    (2, DeviceTier::Lite),
    (6, DeviceTier::Standard),
    (usize::MAX, DeviceTier::Performance),
];

/// Classify the host into a capability tier from its logical cpu count.
pub fn tier_for_cpu_count(cpus: usize) -> DeviceTier {
    TIER_TABLE
        .iter()
        .find(|(max, _)| cpus <= *max)
        .map(|(_, tier)| *tier)
        .unwrap_or(DeviceTier::Performance)
}

/// Classify the machine this process is running on.
pub fn detect_tier() -> DeviceTier {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    tier_for_cpu_count(cpus)
}

/// A speech model variant materialized under `models/<name>/`.
#[derive(Debug, Clone)]
pub struct ModelVariant {
    pub name: &'static str,
    pub filename: &'static str,
    pub size_mb: u32,
    pub description: &'static str,
}

/// Model variants, smallest first.
pub const MODEL_VARIANTS: &[ModelVariant] = &[
    ModelVariant {
        name: "whisper-tiny",
        filename: "ggml-tiny.bin",
        size_mb: 75,
        description: "Fastest, lowest accuracy",
    },
    ModelVariant {
        name: "whisper-base",
        filename: "ggml-base.bin",
        size_mb: 142,
        description: "Good balance of speed and accuracy",
    },
    ModelVariant {
        name: "whisper-small",
        filename: "ggml-small.bin",
        size_mb: 466,
        description: "More accurate, slower",
    },
];

/// Pick the model variant for a capability tier.
pub fn variant_for_tier(tier: DeviceTier) -> &'static ModelVariant {
    match tier {
        DeviceTier::Lite => &MODEL_VARIANTS[0],
        DeviceTier::Standard => &MODEL_VARIANTS[1],
        DeviceTier::Performance => &MODEL_VARIANTS[2],
    }
}

/// Get a variant by name.
pub fn get_variant(name: &str) -> Option<&'static ModelVariant> {
    MODEL_VARIANTS.iter().find(|v| v.name == name)
}

/// Directory a variant is materialized into.
pub fn variant_dir(models_dir: &Path, variant: &ModelVariant) -> PathBuf {
    models_dir.join(variant.name)
}

/// Path of the variant's weights file; its presence is the readiness
/// marker used to skip re-download.
pub fn weights_path(models_dir: &Path, variant: &ModelVariant) -> PathBuf {
    variant_dir(models_dir, variant).join(variant.filename)
}

/// Check whether a variant has been downloaded.
pub fn is_downloaded(models_dir: &Path, variant: &ModelVariant) -> bool {
    weights_path(models_dir, variant).exists()
}

/// Progress callback for model downloads, called with (bytes_downloaded, total_bytes).
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Source of model weights for the transcriber lifecycle.
///
/// The hub implementation downloads from Hugging Face; tests substitute
/// a stub to exercise the state machine without the network.
pub trait ModelProvider: Send + Sync {
    fn variant(&self) -> &ModelVariant;

    /// Absolute path the weights live at once fetched.
    fn weights_path(&self) -> PathBuf;

    /// Readiness check used to skip re-download.
    fn is_downloaded(&self) -> bool;

    /// Fetch the weights, reporting progress as (downloaded, total).
    fn fetch(&self, on_progress: ProgressCallback) -> BoxFuture<'_, Result<PathBuf, ModelError>>;
}

/// Downloads variant weights from the whisper.cpp Hugging Face repo.
pub struct HubModelProvider {
    models_dir: PathBuf,
    variant: &'static ModelVariant,
}

impl HubModelProvider {
    pub fn new(models_dir: PathBuf, variant: &'static ModelVariant) -> Self {
        Self {
            models_dir,
            variant,
        }
    }
}

impl ModelProvider for HubModelProvider {
    fn variant(&self) -> &ModelVariant {
        self.variant
    }

    fn weights_path(&self) -> PathBuf {
        weights_path(&self.models_dir, self.variant)
    }

    fn is_downloaded(&self) -> bool {
        is_downloaded(&self.models_dir, self.variant)
    }

    fn fetch(&self, on_progress: ProgressCallback) -> BoxFuture<'_, Result<PathBuf, ModelError>> {
        Box::pin(async move {
            download_variant(&self.models_dir, self.variant, on_progress).await
        })
    }
}

/// Download a variant's weights with progress reporting.
///
/// Streams to a `.downloading` temp file and renames into place so a
/// torn download never passes the readiness check.
pub async fn download_variant(
    models_dir: &Path,
    variant: &ModelVariant,
    on_progress: ProgressCallback,
) -> Result<PathBuf, ModelError> {
    let dir = variant_dir(models_dir, variant);
    fs::create_dir_all(&dir).map_err(|e| ModelError::DownloadFailed(e.to_string()))?;

    let final_path = dir.join(variant.filename);
    if final_path.exists() {
        return Ok(final_path);
    }

    let url = format!("{}/{}", HUGGINGFACE_BASE_URL, variant.filename);
    info!(variant = variant.name, %url, "downloading model");

    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ModelError::DownloadFailed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ModelError::DownloadFailed(format!(
            "HTTP {}",
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    let temp_path = dir.join(format!("{}.downloading", variant.filename));

    let mut file =
        File::create(&temp_path).map_err(|e| ModelError::DownloadFailed(e.to_string()))?;
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ModelError::DownloadFailed(e.to_string()))?;
        file.write_all(&chunk)
            .map_err(|e| ModelError::DownloadFailed(e.to_string()))?;
        downloaded += chunk.len() as u64;
        on_progress(downloaded, total_size);
    }

    drop(file);
    fs::rename(&temp_path, &final_path).map_err(|e| ModelError::DownloadFailed(e.to_string()))?;

    info!(variant = variant.name, path = %final_path.display(), "model downloaded");
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_table_covers_all_counts() {
        assert_eq!(tier_for_cpu_count(1), DeviceTier::Lite);
        assert_eq!(tier_for_cpu_count(2), DeviceTier::Lite);
        assert_eq!(tier_for_cpu_count(4), DeviceTier::Standard);
        assert_eq!(tier_for_cpu_count(6), DeviceTier::Standard);
        assert_eq!(tier_for_cpu_count(8), DeviceTier::Performance);
        assert_eq!(tier_for_cpu_count(128), DeviceTier::Performance);
    }

    #[test]
    fn test_variant_for_tier() {
        assert_eq!(variant_for_tier(DeviceTier::Lite).name, "whisper-tiny");
        assert_eq!(variant_for_tier(DeviceTier::Standard).name, "whisper-base");
        assert_eq!(
            variant_for_tier(DeviceTier::Performance).name,
            "whisper-small"
        );
    }

    #[test]
    fn test_get_variant() {
        assert!(get_variant("whisper-base").is_some());
        assert!(get_variant("whisper-huge").is_none());
    }

    #[test]
    fn test_readiness_marker() {
        let dir = tempfile::tempdir().unwrap();
        let variant = &MODEL_VARIANTS[0];

        assert!(!is_downloaded(dir.path(), variant));

        let weights = weights_path(dir.path(), variant);
        fs::create_dir_all(weights.parent().unwrap()).unwrap();
        fs::write(&weights, b"weights").unwrap();

        assert!(is_downloaded(dir.path(), variant));
    }

    #[test]
    fn test_partial_download_does_not_pass_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let variant = &MODEL_VARIANTS[0];

        let temp = variant_dir(dir.path(), variant).join(format!("{}.downloading", variant.filename));
        fs::create_dir_all(temp.parent().unwrap()).unwrap();
        fs::write(&temp, b"partial").unwrap();

        assert!(!is_downloaded(dir.path(), variant));
    }
}
