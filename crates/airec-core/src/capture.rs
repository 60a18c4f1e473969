use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audio::{self, AudioCapture, DeviceInfo};
use crate::error::CaptureError;

/// Period of the elapsed-time tick (1 Hz).
pub const ELAPSED_TICK: Duration = Duration::from_secs(1);
/// Period of the meter tick (10 Hz).
pub const METER_TICK: Duration = Duration::from_millis(100);

/// Result of a successfully finished capture.
///
/// The caller is responsible for persisting this into the record store;
/// the session itself never touches persistence.
#[derive(Debug, Clone)]
pub struct FinishedRecording {
    /// Display name (file name without extension).
    pub name: String,
    /// Path relative to the documents root.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    /// Seconds since epoch at capture start.
    pub created_at: f64,
    /// Non-paused capture duration in whole seconds.
    pub duration_secs: u64,
}

/// File name and epoch timestamp for a capture, both derived from the
/// same instant so they can't straddle a second boundary.
fn capture_metadata(now: DateTime<Local>) -> (String, f64) {
    let file_name = format!("{}.wav", now.format("%Y-%m-%d_%H-%M-%S"));
    let created_at = now.timestamp_millis() as f64 / 1000.0;
    (file_name, created_at)
}

/// Periodic observers of a live capture: a 1 Hz elapsed-time tick and a
/// 10 Hz meter tick that normalizes instantaneous power onto [0, 1].
///
/// Tickers must be fully stopped (aborted), not merely ignored, on every
/// exit path so no periodic work outlives the session.
struct Tickers {
    handles: Vec<JoinHandle<()>>,
}

impl Tickers {
    fn start(power: Arc<AtomicU32>, elapsed: Arc<AtomicU64>, level: Arc<AtomicU32>) -> Self {
        let elapsed_handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ELAPSED_TICK);
            tick.tick().await;
            loop {
                tick.tick().await;
                elapsed.fetch_add(1, Ordering::SeqCst);
            }
        });

        let meter_handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(METER_TICK);
            tick.tick().await;
            loop {
                tick.tick().await;
                let amp = f32::from_bits(power.load(Ordering::Relaxed));
                let normalized = audio::normalize_power(audio::amp_to_dbfs(amp));
                level.store(normalized.to_bits(), Ordering::Relaxed);
            }
        });

        Self {
            handles: vec![elapsed_handle, meter_handle],
        }
    }

    fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Tickers {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A live recording session: start, pause/resume, stop.
///
/// Exists only between `start` and `stop`; stopping consumes the session
/// and finalizes the audio file.
pub struct CaptureSession {
    active: Arc<AtomicBool>,
    paused: bool,
    elapsed: Arc<AtomicU64>,
    level: Arc<AtomicU32>,
    capture: AudioCapture,
    device: DeviceInfo,
    tickers: Option<Tickers>,
    output_path: PathBuf,
    relative_path: String,
    name: String,
    created_at: f64,
}

impl CaptureSession {
    /// Begin capturing from the default input device.
    ///
    /// Allocates `<root>/recordings/<yyyy-MM-dd_HH-mm-ss>.wav` up front so
    /// file-creation failures surface here, then starts the stream and
    /// both tickers.
    pub fn start(documents_root: &Path) -> Result<Self, CaptureError> {
        let recordings_dir = documents_root.join("recordings");
        fs::create_dir_all(&recordings_dir)?;

        let (file_name, created_at) = capture_metadata(Local::now());
        let output_path = recordings_dir.join(&file_name);
        File::create(&output_path)?;

        let name = file_name.trim_end_matches(".wav").to_string();
        let relative_path = format!("recordings/{}", file_name);

        let active = Arc::new(AtomicBool::new(true));
        let (capture, device) = AudioCapture::new(active.clone())?;

        let elapsed = Arc::new(AtomicU64::new(0));
        let level = Arc::new(AtomicU32::new(0f32.to_bits()));
        let tickers = Tickers::start(capture.power_handle(), elapsed.clone(), level.clone());

        info!(device = %device.display(), file = %file_name, "capture started");

        Ok(Self {
            active,
            paused: false,
            elapsed,
            level,
            capture,
            device,
            tickers: Some(tickers),
            output_path,
            relative_path,
            name,
            created_at,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Elapsed non-paused capture time in whole seconds.
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    /// Latest meter level, normalized onto [0, 1].
    pub fn meter_level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Suspend capture and both tickers. No-op when already paused.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.active.store(false, Ordering::SeqCst);
        if let Some(mut tickers) = self.tickers.take() {
            tickers.stop();
        }
        info!("capture paused");
    }

    /// Resume capture and both tickers. No-op when not paused.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.active.store(true, Ordering::SeqCst);
        self.tickers = Some(Tickers::start(
            self.capture.power_handle(),
            self.elapsed.clone(),
            self.level.clone(),
        ));
        info!("capture resumed");
    }

    /// Halt capture, stop all tickers, and finalize the audio file.
    ///
    /// On success returns the finished recording for the caller to persist.
    /// On failure no recording should be persisted; the placeholder file is
    /// removed.
    pub fn stop(mut self) -> Result<FinishedRecording, CaptureError> {
        if let Some(mut tickers) = self.tickers.take() {
            tickers.stop();
        }
        self.active.store(false, Ordering::SeqCst);

        let samples = self.capture.take_audio();
        let samples_16k = audio::resample(&samples, self.capture.sample_rate, audio::TARGET_SAMPLE_RATE);

        if let Err(e) = audio::write_wav(&self.output_path, &samples_16k) {
            let _ = fs::remove_file(&self.output_path);
            return Err(e);
        }

        let duration_secs = self.elapsed.load(Ordering::SeqCst);
        info!(
            file = %self.output_path.display(),
            duration_secs,
            "capture finished"
        );

        Ok(FinishedRecording {
            name: self.name,
            relative_path: self.relative_path,
            absolute_path: self.output_path,
            created_at: self.created_at,
            duration_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level_atoms() -> (Arc<AtomicU32>, Arc<AtomicU64>, Arc<AtomicU32>) {
        (
            Arc::new(AtomicU32::new(0f32.to_bits())),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU32::new(0f32.to_bits())),
        )
    }

    #[test]
    fn test_capture_metadata_uses_one_instant() {
        use chrono::TimeZone;
        let now = Local.with_ymd_and_hms(2026, 8, 29, 10, 4, 5).unwrap();
        let (file_name, created_at) = capture_metadata(now);
        assert_eq!(file_name, "2026-08-29_10-04-05.wav");
        assert_eq!(created_at as i64, now.timestamp());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_ticks_once_per_second() {
        let (power, elapsed, level) = level_atoms();
        let mut tickers = Tickers::start(power, elapsed.clone(), level);

        tokio::time::sleep(Duration::from_millis(3_050)).await;
        assert_eq!(elapsed.load(Ordering::SeqCst), 3);

        tickers.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_tickers_fire_no_further_callbacks() {
        let (power, elapsed, level) = level_atoms();
        let mut tickers = Tickers::start(power.clone(), elapsed.clone(), level.clone());

        tokio::time::sleep(Duration::from_millis(2_050)).await;
        tickers.stop();
        let frozen_elapsed = elapsed.load(Ordering::SeqCst);
        let frozen_level = level.load(Ordering::Relaxed);

        // Level input changes after stop; nothing may pick it up.
        power.store(1.0f32.to_bits(), Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(elapsed.load(Ordering::SeqCst), frozen_elapsed);
        assert_eq!(level.load(Ordering::Relaxed), frozen_level);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_counts_only_running_time() {
        let (power, elapsed, level) = level_atoms();

        // start -> 2s -> pause -> 3s gap -> resume -> 1s -> stop
        let mut tickers = Tickers::start(power.clone(), elapsed.clone(), level.clone());
        tokio::time::sleep(Duration::from_millis(2_050)).await;
        tickers.stop();

        tokio::time::sleep(Duration::from_secs(3)).await;

        let mut tickers = Tickers::start(power, elapsed.clone(), level);
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        tickers.stop();

        assert_eq!(elapsed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_tick_normalizes_power() {
        let (power, elapsed, level) = level_atoms();
        // Full-scale amplitude is 0 dBFS, which normalizes to 1.0.
        power.store(1.0f32.to_bits(), Ordering::Relaxed);

        let mut tickers = Tickers::start(power, elapsed, level.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        tickers.stop();

        let reading = f32::from_bits(level.load(Ordering::Relaxed));
        assert!((reading - 1.0).abs() < 1e-6);
    }
}
