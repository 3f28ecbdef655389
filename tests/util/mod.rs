//! Shared fixtures for the integration tests: an in-memory event sink, a
//! deterministic clock, a scripted mock transport, and home-dir isolation.

// Each test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use voicemode::audio::AudioChunk;
use voicemode::error::Result;
use voicemode::events::{Clock, Event, EventSink, EventType};
use voicemode::transport::Transport;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Points `VOICEMODE_HOME` at a fresh temp dir for the duration of a test.
pub struct HomeGuard {
    _lock: MutexGuard<'static, ()>,
    previous: Option<OsString>,
    dir: tempfile::TempDir,
}

impl HomeGuard {
    pub fn new() -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = tempfile::tempdir().expect("create temp home");
        let previous = std::env::var_os("VOICEMODE_HOME");
        // SAFETY: ENV_LOCK serializes all VOICEMODE_HOME mutations.
        unsafe { std::env::set_var("VOICEMODE_HOME", dir.path()) };
        Self {
            _lock: lock,
            previous,
            dir,
        }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

impl Drop for HomeGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(val) => unsafe { std::env::set_var("VOICEMODE_HOME", val) },
            None => unsafe { std::env::remove_var("VOICEMODE_HOME") },
        }
    }
}

/// Clock advancing 250 ms per reading, so event timestamps are strictly
/// increasing and deterministic.
pub struct SteppingClock {
    base: Mutex<DateTime<Utc>>,
}

impl SteppingClock {
    pub fn new() -> Self {
        Self {
            base: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut guard = self.base.lock().expect("clock lock");
        let now = *guard;
        *guard += chrono::Duration::milliseconds(250);
        now
    }
}

/// Collects emitted events in memory.
pub struct MemorySink {
    clock: SteppingClock,
    pub events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            clock: SteppingClock::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .expect("sink lock")
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    pub fn contains(&self, ty: EventType) -> bool {
        self.types().contains(&ty)
    }
}

impl EventSink for MemorySink {
    fn emit(&self, session_id: &str, event_type: EventType, data: serde_json::Value) {
        self.events.lock().expect("sink lock").push(Event {
            timestamp: self.clock.now(),
            session_id: session_id.to_owned(),
            event_type,
            data,
        });
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// 20 ms frame of pseudo-speech (alternating polarity survives the
/// engine's high-pass filter).
pub fn speech_frame() -> Vec<f32> {
    (0..320)
        .map(|i| if i % 2 == 0 { 0.3 } else { -0.3 })
        .collect()
}

/// 20 ms frame of silence.
pub fn silence_frame() -> Vec<f32> {
    vec![0.0; 320]
}

/// Capture script: enough speech to clear `min_speech_ms`, then enough
/// silence to trip the 800 ms tail.
pub fn reply_script() -> Vec<Vec<f32>> {
    let mut script: Vec<Vec<f32>> = Vec::new();
    for _ in 0..25 {
        script.push(speech_frame());
    }
    for _ in 0..45 {
        script.push(silence_frame());
    }
    script
}

/// Scripted transport: playback consumes frames (optionally slowly), and
/// capture emits a fixed chunk sequence followed by silence until
/// cancelled.
pub struct MockTransport {
    pub capture_script: Vec<Vec<f32>>,
    pub play_delay: Duration,
    pub played_samples: AtomicUsize,
}

impl MockTransport {
    pub fn new(capture_script: Vec<Vec<f32>>) -> Self {
        Self {
            capture_script,
            play_delay: Duration::ZERO,
            played_samples: AtomicUsize::new(0),
        }
    }

    pub fn with_play_delay(mut self, delay: Duration) -> Self {
        self.play_delay = delay;
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn play(
        &self,
        mut rx: mpsc::Receiver<Vec<f32>>,
        _sample_rate: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else { return Ok(()) };
            self.played_samples.fetch_add(frame.len(), Ordering::Relaxed);
            if !self.play_delay.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(self.play_delay) => {}
                }
            }
        }
    }

    async fn start_capture(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AudioChunk>> {
        let (tx, rx) = mpsc::channel(100);
        let script = self.capture_script.clone();
        tokio::spawn(async move {
            for samples in script {
                if cancel.is_cancelled() {
                    return;
                }
                let chunk = AudioChunk {
                    samples,
                    sample_rate: 16_000,
                    captured_at: Instant::now(),
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            // Keep the device "open" with silence until cancelled, so the
            // engine never mistakes script exhaustion for device loss.
            loop {
                let chunk = AudioChunk {
                    samples: vec![0.0; 320],
                    sample_rate: 16_000,
                    captured_at: Instant::now(),
                };
                tokio::select! {
                    () = cancel.cancelled() => return,
                    result = tx.send(chunk) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}
