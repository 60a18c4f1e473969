use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::db::RecordStore;
use crate::transcriber::{CancelToken, Transcriber};

/// Drives a recording through model readiness, inference, and persistence.
///
/// At most one transcription runs at a time: a new request cancels the
/// active one and takes its place. Persistence happens only for a
/// non-empty transcript, so a cancelled or failed run leaves the stored
/// recording exactly as it was.
pub struct TranscriptionOrchestrator {
    transcriber: Arc<Transcriber>,
    store: RecordStore,
    language: String,
    active: Mutex<Option<CancelToken>>,
}

impl TranscriptionOrchestrator {
    pub fn new(transcriber: Arc<Transcriber>, store: RecordStore, language: String) -> Self {
        Self {
            transcriber,
            store,
            language,
            active: Mutex::new(None),
        }
    }

    pub fn is_transcribing(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Cancel the active transcription, if any.
    pub fn cancel_active(&self) {
        if let Some(token) = self.active.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Transcribe the recording with the given id and persist the result.
    ///
    /// Returns the formatted transcript, or an empty string when the run
    /// was cancelled. Only a non-empty transcript is written back; the
    /// recording's name is then replaced with a title derived from the
    /// first transcript line.
    pub async fn transcribe_recording(&self, id: i64) -> Result<String> {
        let recording = self
            .store
            .get(id)
            .context("looking up recording")?
            .ok_or_else(|| anyhow!("no recording with id {}", id))?;

        // A newer request supersedes whatever is running.
        let token = CancelToken::new();
        {
            let mut active = self.active.lock().unwrap();
            if let Some(previous) = active.take() {
                warn!(id, "cancelling active transcription for new request");
                previous.cancel();
            }
            *active = Some(token.clone());
        }

        let result = self.run(&recording, &token).await;

        // Clear the slot unless a newer request already replaced our token.
        {
            let mut active = self.active.lock().unwrap();
            if matches!(active.as_ref(), Some(current) if current.ptr_eq(&token)) {
                *active = None;
            }
        }

        result
    }

    async fn run(
        &self,
        recording: &crate::recording::Recording,
        token: &CancelToken,
    ) -> Result<String> {
        self.transcriber
            .ensure_ready()
            .await
            .context("preparing model")?;

        let audio_path = recording.resolve(self.store.root());
        let transcript = self
            .transcriber
            .transcribe(&audio_path, &self.language, token)
            .await
            .context("transcribing audio")?;

        if transcript.is_empty() {
            info!(id = recording.id, "transcription yielded no text; store untouched");
            return Ok(transcript);
        }

        let title = derive_title(&transcript).unwrap_or_else(|| recording.name.clone());
        self.store
            .update_content_and_name(recording.id, &transcript, &title)
            .context("persisting transcript")?;

        info!(id = recording.id, title = %title, "transcript saved");
        Ok(transcript)
    }
}

/// Title for a recording: its first transcript line with the leading
/// timestamp removed.
fn derive_title(transcript: &str) -> Option<String> {
    let first_line = transcript.lines().next()?;
    let text = match first_line.split_once("  ") {
        Some((_, rest)) => rest,
        None => first_line,
    }
    .trim();
    (!text.is_empty()).then(|| text.to_string())
}
