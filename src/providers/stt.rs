//! OpenAI-compatible speech-to-text client.
//!
//! `POST {base}/audio/transcriptions` as multipart with the audio file,
//! model, and optional language; the JSON response carries `text` plus
//! optional `segments`/`words` detail.

use super::ProviderEndpoint;
use crate::audio::codec::{AudioBuffer, AudioFormat, encode};
use crate::error::{Result, VoiceError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Parsed transcription response.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionOutcome {
    /// The transcribed text.
    pub text: String,
    /// Optional per-segment detail, passed through untyped.
    #[serde(default)]
    pub segments: Option<serde_json::Value>,
    /// Optional per-word detail, passed through untyped.
    #[serde(default)]
    pub words: Option<serde_json::Value>,
}

/// Upload captured audio for transcription.
///
/// # Errors
///
/// Returns a provider-level error (recoverable via failover) on connect
/// failure, non-success status, or an unparseable body.
pub async fn transcribe(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    audio: Vec<u8>,
    format: AudioFormat,
    model: &str,
    language: Option<&str>,
) -> Result<TranscriptionOutcome> {
    let url = format!("{}/audio/transcriptions", endpoint.base_url);
    debug!(url = %url, bytes = audio.len(), "stt request");

    let file_name = format!("audio.{}", file_extension(format));
    let part = reqwest::multipart::Part::bytes(audio)
        .file_name(file_name)
        .mime_str(format.mime_type())
        .map_err(|e| VoiceError::Internal(format!("mime: {e}")))?;

    let mut form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("model", model.to_owned())
        .text("response_format", "json");
    if let Some(lang) = language {
        form = form.text("language", lang.to_owned());
    }

    let mut builder = client.post(&url).multipart(form);
    if let Some(token) = &endpoint.auth_token {
        builder = builder.bearer_auth(token);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| VoiceError::Provider(format!("stt connect to {}: {e}", endpoint.id)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(VoiceError::Provider(format!(
            "stt {} returned {status}: {}",
            endpoint.id,
            body.chars().take(200).collect::<String>()
        )));
    }

    response
        .json::<TranscriptionOutcome>()
        .await
        .map_err(|e| VoiceError::Provider(format!("stt {} malformed response: {e}", endpoint.id)))
}

fn file_extension(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Opus => "ogg",
        AudioFormat::Mp3 => "mp3",
        AudioFormat::Wav => "wav",
    }
}

/// Cheap health probe: upload a near-empty wav. An endpoint that rejects
/// it with a well-formed JSON error is still alive.
///
/// # Errors
///
/// Returns an error when the endpoint does not answer within the timeout
/// or answers with something that is neither success nor a JSON error.
pub async fn probe(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    timeout: Duration,
) -> Result<()> {
    // 100ms of silence keeps the upload tiny but well-formed.
    let silence = AudioBuffer::canonical(vec![0i16; 1_600]);
    let audio = encode(&silence, AudioFormat::Wav)?;

    let attempt = async {
        let url = format!("{}/audio/transcriptions", endpoint.base_url);
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("probe.wav")
            .mime_str(AudioFormat::Wav.mime_type())
            .map_err(|e| VoiceError::Internal(format!("mime: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", "whisper-1")
            .text("response_format", "json");

        let mut builder = client.post(&url).multipart(form);
        if let Some(token) = &endpoint.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| VoiceError::Provider(format!("stt probe connect: {e}")))?;

        if response.status().is_success() {
            return Ok(());
        }
        // A structured rejection within the timeout is a liveness signal.
        let body = response.text().await.unwrap_or_default();
        if serde_json::from_str::<serde_json::Value>(&body).is_ok() {
            Ok(())
        } else {
            Err(VoiceError::Provider(format!(
                "stt probe of {} got malformed error body",
                endpoint.id
            )))
        }
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| VoiceError::Provider(format!("stt probe of {} timed out", endpoint.id)))?
}
