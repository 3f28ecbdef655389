//! The converse state machine.
//!
//! Sequences speak → listen → transcribe for one session: applies
//! pronunciation, walks the registry's candidates with failover, overlaps
//! TTS streaming with playback, runs the VAD-driven recording loop, and
//! emits the event-log record for every transition.
//!
//! Cancellation is context-style: each session owns a token, observed at
//! suspension points; child tokens cover playback and capture so
//! cancelling a session stops both and aborts in-flight provider calls.

use super::{ConverseRequest, ConverseResponse, EngineStatus, ErrorBody, ProvidersUsed, Timing};
use crate::audio::codec::{self, AudioBuffer, AudioFormat, StreamingDecoder};
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use crate::events::{Clock, EventSink, EventType, SessionIdGenerator};
use crate::pronounce::PronounceManager;
use crate::providers::registry::ProviderRegistry;
use crate::providers::{CandidateFilter, ProviderKind, stt, tts};
use crate::transport::{Transport, TransportKind};
use crate::vad::{ListenOutcome, ListenSession};
use crate::voice_dirs;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frame channel depth between the decoder and playback.
const FRAME_CHANNEL_SIZE: usize = 64;

/// Adapter exposing the event sink's clock to the id generator.
struct SinkClock(Arc<dyn EventSink>);

impl Clock for SinkClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.now()
    }
}

struct ActiveSession {
    cancel: CancellationToken,
}

/// Mutable per-session bookkeeping threaded through the phases.
#[derive(Default)]
struct SessionCtx {
    timing: Timing,
    used: ProvidersUsed,
    transcript: String,
}

/// The conversation engine.
pub struct ConversationEngine {
    config: VoiceConfig,
    registry: Arc<ProviderRegistry>,
    events: Arc<dyn EventSink>,
    ids: SessionIdGenerator,
    pronounce: Arc<RwLock<PronounceManager>>,
    local: Arc<dyn Transport>,
    room: Option<Arc<dyn Transport>>,
    room_joined: Arc<AtomicBool>,
    client: reqwest::Client,
    active: Mutex<HashMap<String, ActiveSession>>,
    active_callers: Mutex<HashSet<String>>,
    session_permits: Arc<Semaphore>,
    last_request_end: Mutex<Option<DateTime<Utc>>>,
    last_event: Mutex<Option<String>>,
}

impl ConversationEngine {
    pub fn new(
        config: VoiceConfig,
        registry: Arc<ProviderRegistry>,
        events: Arc<dyn EventSink>,
        pronounce: Arc<RwLock<PronounceManager>>,
        local: Arc<dyn Transport>,
        room: Option<Arc<dyn Transport>>,
        room_joined: Arc<AtomicBool>,
    ) -> Self {
        let permits = config.converse.max_concurrent_sessions.max(1);
        let ids = SessionIdGenerator::new(Arc::new(SinkClock(Arc::clone(&events))));
        Self {
            config,
            registry,
            events,
            ids,
            pronounce,
            local,
            room,
            room_joined,
            client: reqwest::Client::new(),
            active: Mutex::new(HashMap::new()),
            active_callers: Mutex::new(HashSet::new()),
            session_permits: Arc::new(Semaphore::new(permits)),
            last_request_end: Mutex::new(None),
            last_event: Mutex::new(None),
        }
    }

    /// Run one converse cycle. Errors are embedded in the response; this
    /// never panics the caller.
    pub async fn converse(&self, request: ConverseRequest) -> ConverseResponse {
        let session_id = self.ids.next_id();
        let mut ctx = SessionCtx::default();

        if let Err(e) = request.validate() {
            return self.failure(&session_id, ctx, &e);
        }

        // One converse per caller.
        let caller = request
            .caller_id
            .clone()
            .unwrap_or_else(|| "default".to_owned());
        {
            let mut callers = self.active_callers.lock().unwrap_or_else(|e| e.into_inner());
            if !callers.insert(caller.clone()) {
                return self.failure(
                    &session_id,
                    ctx,
                    &VoiceError::Busy(format!("caller '{caller}' has a converse in flight")),
                );
            }
        }

        // Global concurrency cap.
        let permit = match Arc::clone(&self.session_permits).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                self.release_caller(&caller);
                return self.failure(
                    &session_id,
                    ctx,
                    &VoiceError::Busy("session concurrency cap reached".into()),
                );
            }
        };

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                session_id.clone(),
                ActiveSession {
                    cancel: cancel.clone(),
                },
            );

        let time_since_last = self
            .last_request_end
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| (self.events.now() - t).num_milliseconds() as f64 / 1_000.0);
        self.emit(
            &session_id,
            EventType::ToolRequestStart,
            json!({
                "transport": format!("{:?}", request.transport).to_lowercase(),
                "wait_for_response": request.wait_for_response,
                "time_since_last_session_s": time_since_last,
            }),
        );

        let listen_budget = if request.wait_for_response {
            request.listen_duration_s as f64
        } else {
            0.0
        };
        let deadline = Duration::from_secs_f64(
            listen_budget + self.config.converse.ttfa_budget_s as f64 + 10.0,
        );
        let outcome = match tokio::time::timeout(
            deadline,
            self.run_session(&session_id, &request, &cancel, &mut ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(VoiceError::DeadlineExceeded(format!(
                "session exceeded {deadline:?}"
            ))),
        };

        let response = match outcome {
            Ok(()) => {
                self.emit(&session_id, EventType::ToolRequestEnd, json!({"success": true}));
                ConverseResponse {
                    session_id: session_id.clone(),
                    transcript: std::mem::take(&mut ctx.transcript),
                    timing: ctx.timing,
                    provider_used: ctx.used,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                match &e {
                    VoiceError::Cancelled => {
                        self.emit(&session_id, EventType::Cancel, json!({}));
                    }
                    other => {
                        self.emit(
                            &session_id,
                            EventType::Error,
                            json!({"kind": other.kind().as_str(), "detail": other.to_string()}),
                        );
                    }
                }
                self.emit(&session_id, EventType::ToolRequestEnd, json!({"success": false}));
                ConverseResponse {
                    session_id: session_id.clone(),
                    transcript: std::mem::take(&mut ctx.transcript),
                    timing: ctx.timing,
                    provider_used: ctx.used,
                    success: false,
                    error: Some(ErrorBody {
                        kind: e.kind().as_str().to_owned(),
                        detail: e.to_string(),
                    }),
                }
            }
        };

        *self
            .last_request_end
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(self.events.now());
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id);
        self.release_caller(&caller);
        drop(permit);
        response
    }

    /// Cancel a session. Idempotent; unknown ids are a no-op.
    pub fn cancel(&self, session_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(session_id) {
            Some(session) => {
                info!("cancelling session {session_id}");
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Engine status: active sessions and the last emitted event type.
    pub fn status(&self) -> EngineStatus {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        EngineStatus {
            active_sessions: active.keys().cloned().collect(),
            last_event: self
                .last_event
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    fn release_caller(&self, caller: &str) {
        self.active_callers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(caller);
    }

    fn emit(&self, session_id: &str, ty: EventType, data: serde_json::Value) {
        *self.last_event.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(format!("{ty:?}"));
        self.events.emit(session_id, ty, data);
    }

    /// Build the failure response for errors raised before the session
    /// started emitting events.
    fn failure(&self, session_id: &str, ctx: SessionCtx, error: &VoiceError) -> ConverseResponse {
        ConverseResponse {
            session_id: session_id.to_owned(),
            transcript: String::new(),
            timing: ctx.timing,
            provider_used: ctx.used,
            success: false,
            error: Some(ErrorBody {
                kind: error.kind().as_str().to_owned(),
                detail: error.to_string(),
            }),
        }
    }

    fn resolve_transport(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        match kind {
            TransportKind::Local => Ok(Arc::clone(&self.local)),
            TransportKind::Room => self.room.clone().ok_or_else(|| {
                VoiceError::ServiceUnavailable("room transport not configured".into())
            }),
            TransportKind::Auto => {
                if self.room_joined.load(Ordering::Relaxed) {
                    if let Some(room) = self.room.clone() {
                        return Ok(room);
                    }
                }
                Ok(Arc::clone(&self.local))
            }
        }
    }

    async fn run_session(
        &self,
        session_id: &str,
        request: &ConverseRequest,
        cancel: &CancellationToken,
        ctx: &mut SessionCtx,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        let transport = self.resolve_transport(request.transport)?;

        if !request.message.is_empty() {
            self.speak(session_id, request, Arc::clone(&transport), cancel, ctx)
                .await?;
        }

        if !request.wait_for_response {
            return Ok(());
        }

        let samples = self.listen(session_id, request, transport, cancel, ctx).await?;
        self.transcribe(session_id, request, samples, cancel, ctx).await
    }

    // ── Speaking ──────────────────────────────────────────────

    async fn speak(
        &self,
        session_id: &str,
        request: &ConverseRequest,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
        ctx: &mut SessionCtx,
    ) -> Result<()> {
        let text = {
            let pronounce = self.pronounce.read().unwrap_or_else(|e| e.into_inner());
            pronounce.process_tts(&request.message)
        };
        let format: AudioFormat = self.config.tts.format.parse()?;
        let voice = request
            .voice
            .clone()
            .unwrap_or_else(|| self.config.tts.voice.clone());
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.tts.model.clone());

        let filter = CandidateFilter {
            provider_id: request.tts_provider.clone(),
            voice: request.voice.clone(),
            model: request.model.clone(),
            format: Some(format.as_str().to_owned()),
        };
        let candidates = self.registry.pick(ProviderKind::Tts, &filter)?;

        if cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        self.emit(
            session_id,
            EventType::TtsStart,
            json!({"voice": voice, "provider": candidates[0].id, "message": text}),
        );
        let tts_start = Instant::now();
        let synthesis = tts::SynthesisRequest::new(&model, &voice, &text, format);

        let mut last_failure = String::new();
        for endpoint in candidates {
            if cancel.is_cancelled() {
                return Err(VoiceError::Cancelled);
            }
            match self
                .attempt_tts(
                    session_id,
                    &endpoint,
                    &synthesis,
                    format,
                    Arc::clone(&transport),
                    cancel,
                    ctx,
                    tts_start,
                )
                .await
            {
                Ok(()) => {
                    self.registry.report_success(&endpoint.id, tts_start.elapsed());
                    ctx.used.tts = Some(endpoint.id);
                    return Ok(());
                }
                Err(VoiceError::Provider(detail)) => {
                    warn!("tts attempt via {} failed: {detail}", endpoint.id);
                    self.registry.report_failure(&endpoint.id, &detail);
                    last_failure = detail;
                }
                Err(other) => return Err(other),
            }
        }
        Err(VoiceError::ProviderExhausted(format!(
            "all TTS candidates failed; last: {last_failure}"
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_tts(
        &self,
        session_id: &str,
        endpoint: &crate::providers::ProviderEndpoint,
        synthesis: &tts::SynthesisRequest,
        format: AudioFormat,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
        ctx: &mut SessionCtx,
        tts_start: Instant,
    ) -> Result<()> {
        let first_byte_budget =
            Duration::from_secs_f32(self.config.converse.tts_first_byte_timeout_s);
        let attempt_budget = Duration::from_secs_f32(self.config.converse.per_attempt_timeout_s);

        let connect = tokio::time::timeout(
            first_byte_budget,
            tts::synthesize(&self.client, endpoint, synthesis),
        );
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(VoiceError::Cancelled),
            result = connect => result
                .map_err(|_| VoiceError::Provider(format!("tts first byte from {} timed out", endpoint.id)))??,
        };

        let mut stream = response.bytes_stream();
        let mut decoder = StreamingDecoder::new(format)?;
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(FRAME_CHANNEL_SIZE);
        let play_cancel = cancel.child_token();
        let mut playback = {
            let transport = Arc::clone(&transport);
            let play_cancel = play_cancel.clone();
            tokio::spawn(async move {
                transport
                    .play(frame_rx, AudioBuffer::CANONICAL_RATE, &play_cancel)
                    .await
            })
        };

        let prebuffer_target = (AudioBuffer::CANONICAL_RATE as u64
            * self.config.converse.min_prebuffer_ms as u64
            / 1_000) as usize;
        let attempt_deadline = Instant::now() + attempt_budget;

        // Inner loop in a closure-like async block so every early error
        // tears down the playback task exactly once.
        let streamed: Result<(Instant, Vec<u8>)> = async {
            let mut first_audio_at: Option<Instant> = None;
            let mut playback_started_at: Option<Instant> = None;
            let mut prebuffer: Vec<f32> = Vec::new();
            let mut wire_bytes: Vec<u8> = Vec::new();
            let save_audio = self.config.save_audio;

            loop {
                let remaining = attempt_deadline.saturating_duration_since(Instant::now());
                let chunk = tokio::select! {
                    () = cancel.cancelled() => return Err(VoiceError::Cancelled),
                    () = tokio::time::sleep(remaining) => {
                        return Err(VoiceError::Provider(format!(
                            "tts stream from {} exceeded attempt budget", endpoint.id
                        )));
                    }
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let bytes = chunk.map_err(|e| {
                    VoiceError::Provider(format!("tts stream from {}: {e}", endpoint.id))
                })?;
                if bytes.is_empty() {
                    continue;
                }
                if first_audio_at.is_none() {
                    first_audio_at = Some(Instant::now());
                    self.emit(
                        session_id,
                        EventType::TtsFirstAudio,
                        json!({"provider": endpoint.id}),
                    );
                }
                if save_audio {
                    wire_bytes.extend_from_slice(&bytes);
                }

                let samples = decoder
                    .push(&bytes)
                    .map_err(|e| VoiceError::Provider(format!("tts decode: {e}")))?;
                self.feed_frames(
                    session_id,
                    samples,
                    &mut prebuffer,
                    prebuffer_target,
                    &mut playback_started_at,
                    &frame_tx,
                )
                .await?;
            }

            let tail = decoder
                .finish()
                .map_err(|e| VoiceError::Provider(format!("tts decode: {e}")))?;
            self.feed_frames(
                session_id,
                tail,
                &mut prebuffer,
                0, // stream is over; whatever is buffered plays now
                &mut playback_started_at,
                &frame_tx,
            )
            .await?;

            let Some(first) = first_audio_at else {
                return Err(VoiceError::Provider(format!(
                    "tts {} returned no audio bytes",
                    endpoint.id
                )));
            };
            ctx.timing.ttfa = Some((first - tts_start).as_secs_f64());
            let started = playback_started_at.ok_or_else(|| {
                VoiceError::Provider(format!("tts {} produced no playable audio", endpoint.id))
            })?;
            Ok((started, wire_bytes))
        }
        .await;

        // Close the frame channel so playback can drain, then reap it.
        drop(frame_tx);
        let (playback_started_at, wire_bytes) = match streamed {
            Ok(v) => v,
            Err(e) => {
                play_cancel.cancel();
                let _ = playback.await;
                return Err(e);
            }
        };

        let drained = tokio::select! {
            () = cancel.cancelled() => {
                play_cancel.cancel();
                let _ = (&mut playback).await;
                return Err(VoiceError::Cancelled);
            }
            joined = &mut playback => joined,
        };
        drained
            .map_err(|e| VoiceError::Internal(format!("playback task: {e}")))?
            .map_err(|e| match e {
                VoiceError::Audio(detail) => VoiceError::DeviceChanged(detail),
                other => other,
            })?;

        self.emit(session_id, EventType::TtsPlaybackEnd, json!({"provider": endpoint.id}));
        ctx.timing.tts_play = Some(playback_started_at.elapsed().as_secs_f64());
        ctx.timing.tts_gen = Some(tts_start.elapsed().as_secs_f64());

        if self.config.save_audio && !wire_bytes.is_empty() {
            if let Err(e) = save_debug_audio(session_id, "tts", format.as_str(), &wire_bytes) {
                warn!("could not save tts debug audio: {e}");
            }
        }
        Ok(())
    }

    /// Buffer decoded samples until the prebuffer target is met, then
    /// stream 20 ms frames to playback. Emits TTS_PLAYBACK_START on the
    /// first frame out.
    async fn feed_frames(
        &self,
        session_id: &str,
        samples: Vec<i16>,
        prebuffer: &mut Vec<f32>,
        prebuffer_target: usize,
        playback_started_at: &mut Option<Instant>,
        frame_tx: &mpsc::Sender<Vec<f32>>,
    ) -> Result<()> {
        prebuffer.extend(samples.iter().map(|s| *s as f32 / i16::MAX as f32));
        if prebuffer.is_empty() {
            return Ok(());
        }
        // Only the initial prebuffer gates on the target; once playback is
        // running, everything flushes straight through.
        if playback_started_at.is_none() {
            if prebuffer.len() < prebuffer_target {
                return Ok(());
            }
            *playback_started_at = Some(Instant::now());
            self.emit(session_id, EventType::TtsPlaybackStart, json!({}));
        }
        let frames = std::mem::take(prebuffer);
        frame_tx
            .send(frames)
            .await
            .map_err(|_| VoiceError::Internal("playback channel closed early".into()))
    }

    // ── Listening / Recording ─────────────────────────────────

    async fn listen(
        &self,
        session_id: &str,
        request: &ConverseRequest,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
        ctx: &mut SessionCtx,
    ) -> Result<Vec<f32>> {
        let rate = self.config.audio.sample_rate;
        self.emit(
            session_id,
            EventType::RecordingStart,
            json!({"transport": transport.name()}),
        );
        let record_start = Instant::now();

        let capture_cancel = cancel.child_token();
        let mut rx = transport.start_capture(capture_cancel.clone()).await?;
        let mut listen = ListenSession::new(&self.config.vad, rate, request.listen_duration_s);

        let outcome = loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => {
                    capture_cancel.cancel();
                    return Err(VoiceError::Cancelled);
                }
                chunk = rx.recv() => chunk,
            };
            match chunk {
                Some(chunk) => match listen.push_frame(&chunk.samples) {
                    ListenOutcome::Continue => continue,
                    other => break other,
                },
                None => {
                    capture_cancel.cancel();
                    return Err(VoiceError::DeviceChanged(
                        "capture stream ended unexpectedly".into(),
                    ));
                }
            }
        };
        capture_cancel.cancel();

        ctx.timing.record = Some(record_start.elapsed().as_secs_f64());
        self.emit(
            session_id,
            EventType::RecordingEnd,
            json!({"duration_s": listen.captured_duration_s()}),
        );

        match outcome {
            ListenOutcome::Complete => Ok(listen.take_samples()),
            ListenOutcome::NoSpeech | ListenOutcome::Continue => Err(VoiceError::NoSpeechDetected),
        }
    }

    // ── Transcribing ──────────────────────────────────────────

    async fn transcribe(
        &self,
        session_id: &str,
        request: &ConverseRequest,
        samples: Vec<f32>,
        cancel: &CancellationToken,
        ctx: &mut SessionCtx,
    ) -> Result<()> {
        let rate = self.config.audio.sample_rate;
        let buffer = AudioBuffer::from_f32(&samples, rate, 1);
        let upload_format: AudioFormat = self.config.stt.upload_format.parse()?;
        let audio = codec::encode(&buffer, upload_format)?;

        if self.config.save_audio {
            if let Err(e) =
                save_debug_audio(session_id, "stt", upload_format.as_str(), &audio)
            {
                warn!("could not save stt debug audio: {e}");
            }
        }

        let filter = CandidateFilter {
            provider_id: request.stt_provider.clone(),
            ..CandidateFilter::default()
        };
        let candidates = self.registry.pick(ProviderKind::Stt, &filter)?;

        self.emit(
            session_id,
            EventType::SttStart,
            json!({"provider": candidates[0].id, "duration_s": buffer.duration_s()}),
        );
        let stt_start = Instant::now();
        let budget = Duration::from_secs_f32(self.config.converse.stt_total_timeout_s);

        let mut last_failure = String::new();
        for endpoint in candidates {
            if cancel.is_cancelled() {
                return Err(VoiceError::Cancelled);
            }
            let attempt = tokio::time::timeout(
                budget,
                stt::transcribe(
                    &self.client,
                    &endpoint,
                    audio.clone(),
                    upload_format,
                    &self.config.stt.model,
                    self.config.stt.language.as_deref(),
                ),
            );
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(VoiceError::Cancelled),
                result = attempt => result
                    .map_err(|_| VoiceError::Provider(format!("stt via {} timed out", endpoint.id)))
                    .and_then(|inner| inner),
            };
            match result {
                Ok(outcome) => {
                    self.registry.report_success(&endpoint.id, stt_start.elapsed());
                    let transcript = {
                        let pronounce =
                            self.pronounce.read().unwrap_or_else(|e| e.into_inner());
                        pronounce.process_stt(&outcome.text)
                    };
                    ctx.timing.stt = Some(stt_start.elapsed().as_secs_f64());
                    self.emit(
                        session_id,
                        EventType::SttComplete,
                        json!({"provider": endpoint.id, "length": transcript.len()}),
                    );
                    ctx.transcript = transcript;
                    ctx.used.stt = Some(endpoint.id);
                    return Ok(());
                }
                Err(VoiceError::Provider(detail)) => {
                    warn!("stt attempt via {} failed: {detail}", endpoint.id);
                    self.registry.report_failure(&endpoint.id, &detail);
                    last_failure = detail;
                }
                Err(other) => return Err(other),
            }
        }
        Err(VoiceError::ProviderExhausted(format!(
            "all STT candidates failed; last: {last_failure}"
        )))
    }
}

/// Write a session's wire audio under `~/.voicemode/audio/`.
fn save_debug_audio(session_id: &str, phase: &str, ext: &str, bytes: &[u8]) -> Result<()> {
    let dir = voice_dirs::audio_dir();
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{session_id}-{phase}.{ext}"));
    std::fs::write(&path, bytes)?;
    debug!("saved {phase} audio to {}", path.display());
    Ok(())
}
