use regex::Regex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ModelError, TranscriptionError};
use crate::models::{DeviceTier, ModelProvider};

/// Seconds the model load may take before the lifecycle fails.
pub const LOAD_TIMEOUT_SECS: u64 = 30;

/// Process-wide state of the speech model session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Downloading,
    Loading,
    Loaded,
    /// Sticky until [`Transcriber::reset`] is called.
    Failed,
}

/// A time-bounded span of transcribed text, as produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Start offset in seconds.
    pub start: f64,
    pub text: String,
}

/// A loaded speech model ready for inference.
pub trait SpeechModel: Send + Sync {
    /// Run inference over a mono 16 kHz waveform with deterministic decoding.
    fn transcribe(&self, samples: &[f32], language: &str)
        -> Result<Vec<Segment>, TranscriptionError>;
}

/// Constructs a loaded model from weights on disk.
pub trait SpeechEngine: Send + Sync {
    fn load(&self, weights: &Path) -> Result<Box<dyn SpeechModel>, ModelError>;
}

/// Cooperative cancellation token for a transcription request.
///
/// Checked only at the defined checkpoints (after waveform decode and
/// after inference); a cancelled run resolves to an empty result.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether two handles refer to the same token.
    pub fn ptr_eq(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Owns the speech model download/load/ready lifecycle and inference.
///
/// One instance exists per process, constructed by the composition root.
/// `ensure_ready` is single-flight: concurrent callers share one
/// download/load rather than starting a second.
pub struct Transcriber {
    provider: Arc<dyn ModelProvider>,
    engine: Arc<dyn SpeechEngine>,
    state: Mutex<ModelState>,
    /// Download fraction in [0, 1], bits of an f32; monotonic per download.
    progress: Arc<AtomicU32>,
    model: RwLock<Option<Arc<dyn SpeechModel>>>,
    flight: tokio::sync::Mutex<()>,
    load_timeout: Duration,
}

impl Transcriber {
    pub fn new(provider: Arc<dyn ModelProvider>, engine: Arc<dyn SpeechEngine>) -> Self {
        Self::with_load_timeout(provider, engine, Duration::from_secs(LOAD_TIMEOUT_SECS))
    }

    pub fn with_load_timeout(
        provider: Arc<dyn ModelProvider>,
        engine: Arc<dyn SpeechEngine>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            engine,
            state: Mutex::new(ModelState::Unloaded),
            progress: Arc::new(AtomicU32::new(0f32.to_bits())),
            model: RwLock::new(None),
            flight: tokio::sync::Mutex::new(()),
            load_timeout,
        }
    }

    pub fn state(&self) -> ModelState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ModelState) {
        *self.state.lock().unwrap() = state;
    }

    /// Download fraction in [0, 1]; meaningful while downloading.
    pub fn download_progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    /// Clear a failed session so `ensure_ready` can be retried.
    pub fn reset(&self) {
        *self.model.write().unwrap() = None;
        self.progress.store(0f32.to_bits(), Ordering::Relaxed);
        self.set_state(ModelState::Unloaded);
    }

    /// Bring the model to `Loaded`, downloading and loading as needed.
    ///
    /// Safe to call from concurrent requests; only one download/load runs
    /// at a time and later callers observe its outcome. A `Failed` session
    /// stays failed until `reset` is called.
    pub async fn ensure_ready(&self) -> Result<(), ModelError> {
        let _flight = self.flight.lock().await;

        match self.state() {
            ModelState::Loaded => return Ok(()),
            ModelState::Failed => {
                return Err(ModelError::LoadFailed(
                    "model session failed; reset before retrying".to_string(),
                ))
            }
            _ => {}
        }

        if !self.provider.is_downloaded() {
            self.set_state(ModelState::Downloading);
            self.progress.store(0f32.to_bits(), Ordering::Relaxed);

            let progress = self.progress.clone();
            let result = self
                .provider
                .fetch(Box::new(move |downloaded, total| {
                    let fraction = if total > 0 {
                        (downloaded as f32 / total as f32).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    // Never report a regression.
                    let _ = progress.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                        let current = f32::from_bits(bits);
                        (fraction > current).then(|| fraction.to_bits())
                    });
                }))
                .await;

            if let Err(e) = result {
                self.set_state(ModelState::Failed);
                return Err(e);
            }
        }

        self.set_state(ModelState::Loading);
        info!(variant = self.provider.variant().name, "loading model");

        let engine = self.engine.clone();
        let weights = self.provider.weights_path();
        let load = tokio::task::spawn_blocking(move || engine.load(&weights));

        let model = match tokio::time::timeout(self.load_timeout, load).await {
            Err(_) => {
                self.set_state(ModelState::Failed);
                return Err(ModelError::LoadTimeout(self.load_timeout.as_secs()));
            }
            Ok(Err(join_err)) => {
                self.set_state(ModelState::Failed);
                return Err(ModelError::LoadFailed(join_err.to_string()));
            }
            Ok(Ok(Err(e))) => {
                self.set_state(ModelState::Failed);
                return Err(e);
            }
            Ok(Ok(Ok(model))) => model,
        };

        *self.model.write().unwrap() = Some(Arc::from(model));
        self.set_state(ModelState::Loaded);
        Ok(())
    }

    /// Transcribe an audio file into formatted `MM:SS  text` lines.
    ///
    /// Fails with `NotInitialized` unless the model is loaded. A token
    /// cancelled at either checkpoint resolves to `Ok("")`, never a
    /// partial result.
    pub async fn transcribe(
        &self,
        audio_path: &Path,
        language: &str,
        cancel: &CancelToken,
    ) -> Result<String, TranscriptionError> {
        let model = self
            .model
            .read()
            .unwrap()
            .clone()
            .ok_or(TranscriptionError::NotInitialized)?;

        match self
            .run_transcription(model, audio_path, language, cancel)
            .await
        {
            Err(TranscriptionError::Cancelled) => {
                info!(path = %audio_path.display(), "transcription cancelled");
                Ok(String::new())
            }
            other => other,
        }
    }

    async fn run_transcription(
        &self,
        model: Arc<dyn SpeechModel>,
        audio_path: &Path,
        language: &str,
        cancel: &CancelToken,
    ) -> Result<String, TranscriptionError> {
        let path = audio_path.to_path_buf();
        let samples = tokio::task::spawn_blocking(move || crate::audio::load_wav(&path))
            .await
            .map_err(|e| TranscriptionError::Failed(e.to_string()))??;

        if cancel.is_cancelled() {
            return Err(TranscriptionError::Cancelled);
        }

        let lang = language.to_string();
        let segments = tokio::task::spawn_blocking(move || model.transcribe(&samples, &lang))
            .await
            .map_err(|e| TranscriptionError::Failed(e.to_string()))??;

        if cancel.is_cancelled() {
            return Err(TranscriptionError::Cancelled);
        }

        Ok(format_segments(&segments))
    }
}

fn tag_pattern() -> &'static Regex {
    static TAG_PATTERN: OnceLock<Regex> = OnceLock::new();
    TAG_PATTERN.get_or_init(|| Regex::new(r"<\|[^>]+\|>").expect("token tag pattern"))
}

/// Render engine segments as blank-line-separated `MM:SS  text` lines.
///
/// Control tokens (`<|...|>`) are stripped and the text trimmed; segments
/// are emitted in the order the engine returned them.
pub fn format_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| {
            let minutes = segment.start as u64 / 60;
            let seconds = segment.start as u64 % 60;
            let clean = tag_pattern().replace_all(&segment.text, "");
            format!("{:02}:{:02}  {}", minutes, seconds, clean.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Execute a closure with stderr suppressed (redirected to /dev/null)
fn with_stderr_suppressed<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let devnull = match std::fs::File::open("/dev/null") {
        Ok(f) => f,
        Err(_) => return f(),
    };
    use std::os::unix::io::AsRawFd;
    let stderr_fd = 2;
    let saved_fd = unsafe { libc::dup(stderr_fd) };
    unsafe { libc::dup2(devnull.as_raw_fd(), stderr_fd) };

    let result = f();

    unsafe { libc::dup2(saved_fd, stderr_fd) };
    unsafe { libc::close(saved_fd) };
    result
}

/// Whether a capability tier gets GPU offload for inference.
///
/// Lower tiers stay on CPU; a small model on a weak GPU is slower than
/// the CPU path.
pub fn gpu_enabled(tier: DeviceTier) -> bool {
    matches!(tier, DeviceTier::Performance)
}

/// Whisper-backed speech engine. The compute backend follows the
/// device tier the engine was built for.
///
/// whisper.cpp is chatty on stderr; output is suppressed unless verbose.
pub struct WhisperEngine {
    pub verbose: bool,
    pub tier: DeviceTier,
}

impl SpeechEngine for WhisperEngine {
    fn load(&self, weights: &Path) -> Result<Box<dyn SpeechModel>, ModelError> {
        use whisper_rs::{WhisperContext, WhisperContextParameters};

        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu = gpu_enabled(self.tier);

        let path = weights.to_string_lossy();
        let build = || WhisperContext::new_with_params(&path, ctx_params);

        let ctx = if self.verbose {
            build()
        } else {
            with_stderr_suppressed(build)
        }
        .map_err(|e| ModelError::LoadFailed(e.to_string()))?;

        Ok(Box::new(WhisperModel {
            ctx: Arc::new(ctx),
            verbose: self.verbose,
        }))
    }
}

struct WhisperModel {
    ctx: Arc<whisper_rs::WhisperContext>,
    verbose: bool,
}

impl SpeechModel for WhisperModel {
    fn transcribe(
        &self,
        samples: &[f32],
        language: &str,
    ) -> Result<Vec<Segment>, TranscriptionError> {
        use whisper_rs::{FullParams, SamplingStrategy};

        // Deterministic decoding: greedy, temperature 0, fixed segment
        // length, word timestamps on, blank suppression off.
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_temperature(0.0);
        params.set_max_len(224);
        params.set_token_timestamps(true);
        params.set_suppress_blank(false);
        params.set_language(Some(language));

        let state_result = if self.verbose {
            self.ctx.create_state()
        } else {
            with_stderr_suppressed(|| self.ctx.create_state())
        };

        let mut state = state_result.map_err(|e| TranscriptionError::Failed(e.to_string()))?;

        state
            .full(params, samples)
            .map_err(|e| TranscriptionError::Failed(e.to_string()))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| TranscriptionError::Failed(e.to_string()))?;

        let mut segments = Vec::with_capacity(num_segments as usize);
        for i in 0..num_segments {
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| TranscriptionError::Failed(e.to_string()))?;
            // Timestamps come back in centiseconds.
            let t0 = state
                .full_get_segment_t0(i)
                .map_err(|e| TranscriptionError::Failed(e.to_string()))?;
            segments.push(Segment {
                start: t0 as f64 / 100.0,
                text,
            });
        }

        if segments.is_empty() {
            warn!("inference produced no segments");
        }

        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelVariant, ProgressCallback, MODEL_VARIANTS};
    use futures_util::future::BoxFuture;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct StubProvider {
        dir: PathBuf,
        downloaded: AtomicBool,
        fetch_count: AtomicUsize,
        fetch_delay: Duration,
    }

    impl StubProvider {
        fn new(dir: PathBuf, downloaded: bool) -> Self {
            Self {
                dir,
                downloaded: AtomicBool::new(downloaded),
                fetch_count: AtomicUsize::new(0),
                fetch_delay: Duration::from_millis(20),
            }
        }
    }

    impl ModelProvider for StubProvider {
        fn variant(&self) -> &ModelVariant {
            &MODEL_VARIANTS[0]
        }

        fn weights_path(&self) -> PathBuf {
            self.dir.join("stub.bin")
        }

        fn is_downloaded(&self) -> bool {
            self.downloaded.load(Ordering::SeqCst)
        }

        fn fetch(
            &self,
            on_progress: ProgressCallback,
        ) -> BoxFuture<'_, Result<PathBuf, ModelError>> {
            Box::pin(async move {
                self.fetch_count.fetch_add(1, Ordering::SeqCst);
                on_progress(1, 4);
                tokio::time::sleep(self.fetch_delay).await;
                on_progress(4, 4);
                self.downloaded.store(true, Ordering::SeqCst);
                Ok(self.weights_path())
            })
        }
    }

    struct StubEngine {
        load_delay: Duration,
        fail: bool,
        segments: Vec<Segment>,
        transcribe_count: Arc<AtomicUsize>,
    }

    impl StubEngine {
        fn instant(segments: Vec<Segment>) -> Self {
            Self {
                load_delay: Duration::ZERO,
                fail: false,
                segments,
                transcribe_count: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct StubModel {
        segments: Vec<Segment>,
        transcribe_count: Arc<AtomicUsize>,
    }

    impl SpeechEngine for StubEngine {
        fn load(&self, _weights: &Path) -> Result<Box<dyn SpeechModel>, ModelError> {
            if !self.load_delay.is_zero() {
                std::thread::sleep(self.load_delay);
            }
            if self.fail {
                return Err(ModelError::LoadFailed("stub load failure".to_string()));
            }
            Ok(Box::new(StubModel {
                segments: self.segments.clone(),
                transcribe_count: self.transcribe_count.clone(),
            }))
        }
    }

    impl SpeechModel for StubModel {
        fn transcribe(
            &self,
            _samples: &[f32],
            _language: &str,
        ) -> Result<Vec<Segment>, TranscriptionError> {
            self.transcribe_count.fetch_add(1, Ordering::SeqCst);
            Ok(self.segments.clone())
        }
    }

    fn write_test_wav(dir: &Path) -> PathBuf {
        let path = dir.join("test.wav");
        let samples = vec![0.01f32; 1600];
        crate::audio::write_wav(&path, &samples).unwrap();
        path
    }

    #[tokio::test]
    async fn test_ensure_ready_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), false));
        let engine = Arc::new(StubEngine::instant(vec![]));
        let transcriber = Arc::new(Transcriber::new(provider.clone(), engine));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = transcriber.clone();
            handles.push(tokio::spawn(async move { t.ensure_ready().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(provider.fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(transcriber.state(), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_ensure_ready_skips_download_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), true));
        let engine = Arc::new(StubEngine::instant(vec![]));
        let transcriber = Transcriber::new(provider.clone(), engine);

        transcriber.ensure_ready().await.unwrap();
        assert_eq!(provider.fetch_count.load(Ordering::SeqCst), 0);
        assert_eq!(transcriber.state(), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_download_progress_is_monotonic_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), false));
        let engine = Arc::new(StubEngine::instant(vec![]));
        let transcriber = Transcriber::new(provider, engine);

        transcriber.ensure_ready().await.unwrap();
        assert!((transcriber.download_progress() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_load_timeout_leaves_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), true));
        let engine = Arc::new(StubEngine {
            load_delay: Duration::from_millis(500),
            fail: false,
            segments: vec![],
            transcribe_count: Arc::new(AtomicUsize::new(0)),
        });
        let transcriber =
            Transcriber::with_load_timeout(provider, engine, Duration::from_millis(20));

        let err = transcriber.ensure_ready().await.unwrap_err();
        assert!(matches!(err, ModelError::LoadTimeout(_)));
        assert_eq!(transcriber.state(), ModelState::Failed);

        // Failed is sticky until reset.
        assert!(transcriber.ensure_ready().await.is_err());
        transcriber.reset();
        assert_eq!(transcriber.state(), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_load_failure_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), true));
        let engine = Arc::new(StubEngine {
            load_delay: Duration::ZERO,
            fail: true,
            segments: vec![],
            transcribe_count: Arc::new(AtomicUsize::new(0)),
        });
        let transcriber = Transcriber::new(provider, engine);

        assert!(transcriber.ensure_ready().await.is_err());
        assert_eq!(transcriber.state(), ModelState::Failed);
        assert!(transcriber.ensure_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_transcribe_unloaded_fails_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), true));
        let engine = Arc::new(StubEngine::instant(vec![]));
        let transcriber = Transcriber::new(provider, engine);

        let wav = write_test_wav(dir.path());
        let err = transcriber
            .transcribe(&wav, "en", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::NotInitialized));
    }

    #[tokio::test]
    async fn test_transcribe_formats_segments() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), true));
        let engine = Arc::new(StubEngine::instant(vec![
            Segment {
                start: 0.0,
                text: "<|en|> Hello ".to_string(),
            },
            Segment {
                start: 65.0,
                text: "world".to_string(),
            },
        ]));
        let transcriber = Transcriber::new(provider, engine);
        transcriber.ensure_ready().await.unwrap();

        let wav = write_test_wav(dir.path());
        let text = transcriber
            .transcribe(&wav, "en", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(text, "00:00  Hello\n\n01:05  world");
    }

    #[tokio::test]
    async fn test_cancel_before_inference_yields_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), true));
        let engine = Arc::new(StubEngine::instant(vec![Segment {
            start: 0.0,
            text: "should never appear".to_string(),
        }]));
        let invocations = engine.transcribe_count.clone();
        let transcriber = Transcriber::new(provider, engine);
        transcriber.ensure_ready().await.unwrap();

        let wav = write_test_wav(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();

        // The decode checkpoint observes the token; inference never runs.
        let text = transcriber.transcribe(&wav, "en", &cancel).await.unwrap();
        assert_eq!(text, "");
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transcribe_bad_audio_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StubProvider::new(dir.path().to_path_buf(), true));
        let engine = Arc::new(StubEngine::instant(vec![]));
        let transcriber = Transcriber::new(provider, engine);
        transcriber.ensure_ready().await.unwrap();

        let bad = dir.path().join("bad.wav");
        std::fs::write(&bad, b"not audio").unwrap();

        let err = transcriber
            .transcribe(&bad, "en", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::InvalidAudioFormat(_)));
    }

    #[test]
    fn test_format_segments_spec_example() {
        let segments = vec![
            Segment {
                start: 0.0,
                text: "<|en|> Hello ".to_string(),
            },
            Segment {
                start: 65.0,
                text: "world".to_string(),
            },
        ];
        assert_eq!(format_segments(&segments), "00:00  Hello\n\n01:05  world");
    }

    #[test]
    fn test_gpu_offload_reserved_for_performance_tier() {
        assert!(!gpu_enabled(DeviceTier::Lite));
        assert!(!gpu_enabled(DeviceTier::Standard));
        assert!(gpu_enabled(DeviceTier::Performance));
    }

    #[test]
    fn test_format_segments_empty() {
        assert_eq!(format_segments(&[]), "");
    }

    #[test]
    fn test_format_strips_multiple_tags() {
        let segments = vec![Segment {
            start: 125.0,
            text: " <|startoftranscript|><|ko|> 안녕하세요 <|endoftext|> ".to_string(),
        }];
        assert_eq!(format_segments(&segments), "02:05  안녕하세요");
    }
}
