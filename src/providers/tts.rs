//! OpenAI-compatible text-to-speech client.
//!
//! `POST {base}/audio/speech` with `{model, voice, input, response_format}`;
//! the response body is the audio bytes, streamed so playback can begin
//! before synthesis finishes.

use super::ProviderEndpoint;
use crate::audio::codec::AudioFormat;
use crate::error::{Result, VoiceError};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Request body for `/audio/speech`.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub model: String,
    pub voice: String,
    pub input: String,
    pub response_format: String,
}

impl SynthesisRequest {
    pub fn new(model: &str, voice: &str, input: &str, format: AudioFormat) -> Self {
        Self {
            model: model.to_owned(),
            voice: voice.to_owned(),
            input: input.to_owned(),
            response_format: format.as_str().to_owned(),
        }
    }
}

/// Start a synthesis request and return the streaming response.
///
/// The returned [`reqwest::Response`] has already passed the status check;
/// callers consume `bytes_stream()` for chunked audio.
///
/// # Errors
///
/// Returns a provider-level error (recoverable via failover) on connect
/// failure or a non-success status.
pub async fn synthesize(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    request: &SynthesisRequest,
) -> Result<reqwest::Response> {
    let url = format!("{}/audio/speech", endpoint.base_url);
    debug!(url = %url, voice = %request.voice, "tts request");

    let mut builder = client.post(&url).json(request);
    if let Some(token) = &endpoint.auth_token {
        builder = builder.bearer_auth(token);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| VoiceError::Provider(format!("tts connect to {}: {e}", endpoint.id)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(VoiceError::Provider(format!(
            "tts {} returned {status}: {}",
            endpoint.id,
            body.chars().take(200).collect::<String>()
        )));
    }

    Ok(response)
}

/// Cheap health probe: synthesize a single character into memory.
///
/// # Errors
///
/// Returns an error when the endpoint does not answer successfully within
/// the timeout.
pub async fn probe(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    timeout: Duration,
) -> Result<()> {
    let voice = endpoint
        .capabilities
        .voices
        .first()
        .cloned()
        .unwrap_or_else(|| "alloy".to_owned());
    let model = endpoint
        .capabilities
        .models
        .first()
        .cloned()
        .unwrap_or_else(|| "tts-1".to_owned());
    let request = SynthesisRequest::new(&model, &voice, ".", AudioFormat::Wav);

    let response = tokio::time::timeout(timeout, synthesize(client, endpoint, &request))
        .await
        .map_err(|_| VoiceError::Provider(format!("tts probe of {} timed out", endpoint.id)))??;

    // Drain into memory; the probe discards the audio.
    let _bytes = response
        .bytes()
        .await
        .map_err(|e| VoiceError::Provider(format!("tts probe body: {e}")))?;
    Ok(())
}
