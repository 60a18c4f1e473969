use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::{CaptureError, TranscriptionError};

/// Sample rate recordings are stored at (and Whisper expects).
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Metering floor in dBFS; average power below this reads as silence.
pub const METER_FLOOR_DB: f32 = -160.0;

/// Information about the audio device
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
}

impl DeviceInfo {
    /// Format for display
    pub fn display(&self) -> String {
        format!("{} ({}kHz)", self.name, self.sample_rate / 1000)
    }
}

/// Audio capture from the default input device.
///
/// Samples are buffered while `active` is set; the most recent callback
/// chunk's RMS power is published through `power` for the meter tick.
pub struct AudioCapture {
    pub buffer: Arc<Mutex<Vec<f32>>>,
    pub sample_rate: u32,
    power: Arc<AtomicU32>,
    _stream: Stream,
}

impl AudioCapture {
    /// Set up audio capture from the default input device
    pub fn new(active: Arc<AtomicBool>) -> Result<(Self, DeviceInfo), CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no input device".to_string()))?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported_config = device
            .default_input_config()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let sample_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels();
        let sample_format = supported_config.sample_format();

        let device_info = DeviceInfo {
            name: device_name,
            sample_rate,
        };

        let buffer: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let power = Arc::new(AtomicU32::new(0f32.to_bits()));

        let buffer_capture = buffer.clone();
        let power_capture = power.clone();
        let active_capture = active;

        let stream = match sample_format {
            SampleFormat::F32 => device
                .build_input_stream(
                    &supported_config.into(),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if active_capture.load(Ordering::SeqCst) {
                            let mut chunk = Vec::with_capacity(data.len() / channels as usize);
                            if channels == 1 {
                                chunk.extend_from_slice(data);
                            } else {
                                for frame in data.chunks_exact(channels as usize) {
                                    let sum: f32 = frame.iter().sum();
                                    chunk.push(sum / channels as f32);
                                }
                            }
                            power_capture.store(rms(&chunk).to_bits(), Ordering::Relaxed);
                            buffer_capture.lock().unwrap().append(&mut chunk);
                        }
                    },
                    |err| warn!("input stream error: {}", err),
                    None,
                )
                .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?,
            SampleFormat::I16 => device
                .build_input_stream(
                    &supported_config.into(),
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if active_capture.load(Ordering::SeqCst) {
                            let mut chunk = Vec::with_capacity(data.len() / channels as usize);
                            if channels == 1 {
                                chunk.extend(data.iter().map(|&s| s as f32 / 32768.0));
                            } else {
                                for frame in data.chunks_exact(channels as usize) {
                                    let sum: f32 =
                                        frame.iter().map(|&s| s as f32 / 32768.0).sum();
                                    chunk.push(sum / channels as f32);
                                }
                            }
                            power_capture.store(rms(&chunk).to_bits(), Ordering::Relaxed);
                            buffer_capture.lock().unwrap().append(&mut chunk);
                        }
                    },
                    |err| warn!("input stream error: {}", err),
                    None,
                )
                .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?,
            other => {
                return Err(CaptureError::DeviceUnavailable(format!(
                    "unsupported sample format: {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        Ok((
            Self {
                buffer,
                sample_rate,
                power,
                _stream: stream,
            },
            device_info,
        ))
    }

    /// Take the recorded audio from the buffer
    pub fn take_audio(&self) -> Vec<f32> {
        let mut buffer = self.buffer.lock().unwrap();
        std::mem::take(&mut *buffer)
    }

    /// Shared handle to the most recent callback chunk's RMS power, as
    /// linear amplitude bits, for the meter ticker.
    pub fn power_handle(&self) -> Arc<AtomicU32> {
        self.power.clone()
    }
}

/// Root-mean-square amplitude of a sample chunk.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Convert linear amplitude to dBFS, clamped to the metering floor.
pub fn amp_to_dbfs(amp: f32) -> f32 {
    if amp <= 0.0 {
        return METER_FLOOR_DB;
    }
    (20.0 * amp.log10()).max(METER_FLOOR_DB)
}

/// Normalize average power in dBFS from [-160, 0] onto [0, 1], clamped.
pub fn normalize_power(db: f32) -> f32 {
    ((db - METER_FLOOR_DB) / -METER_FLOOR_DB).clamp(0.0, 1.0)
}

/// Resample audio to a different sample rate using linear interpolation
pub fn resample(audio: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || audio.is_empty() {
        return audio.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let output_len = (audio.len() as f32 * ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_index = i as f32 / ratio;
        let src_index_floor = src_index.floor() as usize;
        let src_index_ceil = (src_index_floor + 1).min(audio.len() - 1);
        let frac = src_index - src_index_floor as f32;

        let sample = audio[src_index_floor] * (1.0 - frac) + audio[src_index_ceil] * frac;
        output.push(sample);
    }

    output
}

/// Write mono samples as a 16 kHz 16-bit PCM WAV file.
pub fn write_wav(path: &Path, samples: &[f32]) -> Result<(), CaptureError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(clamped)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Load a WAV file as a mono 16 kHz f32 waveform.
///
/// Decoding failures surface as [`TranscriptionError::InvalidAudioFormat`].
pub fn load_wav(path: &Path) -> Result<Vec<f32>, TranscriptionError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| TranscriptionError::InvalidAudioFormat(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TranscriptionError::InvalidAudioFormat(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TranscriptionError::InvalidAudioFormat(e.to_string()))?
        }
    };

    let mono: Vec<f32> = if spec.channels <= 1 {
        samples
    } else {
        samples
            .chunks_exact(spec.channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / spec.channels as f32)
            .collect()
    };

    Ok(resample(&mono, spec.sample_rate, TARGET_SAMPLE_RATE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_silence_is_zero() {
        assert_eq!(rms(&[0.0; 64]), 0.0);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_rms_of_full_scale_square() {
        let square = [1.0f32, -1.0, 1.0, -1.0];
        assert!((rms(&square) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_amp_to_dbfs_floors_silence() {
        assert_eq!(amp_to_dbfs(0.0), METER_FLOOR_DB);
        assert_eq!(amp_to_dbfs(-1.0), METER_FLOOR_DB);
        assert!((amp_to_dbfs(1.0) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_power_clamps() {
        assert_eq!(normalize_power(0.0), 1.0);
        assert_eq!(normalize_power(-160.0), 0.0);
        assert_eq!(normalize_power(-320.0), 0.0);
        assert_eq!(normalize_power(20.0), 1.0);
        assert!((normalize_power(-80.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_identity() {
        let audio = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&audio, 16_000, 16_000), audio);
    }

    #[test]
    fn test_resample_halves_length() {
        let audio: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let out = resample(&audio, 32_000, 16_000);
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn test_wav_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        let samples: Vec<f32> = (0..TARGET_SAMPLE_RATE as usize / 10)
            .map(|i| (i as f32 * 0.01).sin() * 0.5)
            .collect();
        write_wav(&path, &samples).unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.len(), samples.len());
        for (a, b) in samples.iter().zip(loaded.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_load_wav_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_audio.wav");
        std::fs::write(&path, b"definitely not a wav file").unwrap();

        let err = load_wav(&path).unwrap_err();
        assert!(matches!(err, TranscriptionError::InvalidAudioFormat(_)));
    }

    #[test]
    fn test_load_wav_missing_file() {
        let err = load_wav(Path::new("/nonexistent/missing.wav")).unwrap_err();
        assert!(matches!(err, TranscriptionError::InvalidAudioFormat(_)));
    }
}
