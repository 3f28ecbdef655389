//! Append-only JSONL event log.
//!
//! Every state transition in a converse session is recorded as one line in
//! `~/.voicemode/logs/events-YYYYMMDD.jsonl`. A single writer task owns the
//! file handle; everyone else enqueues structured events through
//! [`EventSink`]. The writer flushes after each record so a crash loses at
//! most the record being written.
//!
//! Statistics are never stored; they are derived from these files by
//! [`stats`].

pub mod stats;

use crate::error::{Result, VoiceError};
use crate::voice_dirs;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Wall-clock source, narrow so tests can pin time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Event types emitted by the conversation engine.
///
/// The wire names are part of the on-disk format; do not rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ToolRequestStart,
    ToolRequestEnd,
    TtsStart,
    TtsFirstAudio,
    TtsPlaybackStart,
    TtsPlaybackEnd,
    RecordingStart,
    RecordingEnd,
    SttStart,
    SttComplete,
    Error,
    Cancel,
}

/// One event log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// RFC 3339 timestamp with millisecond precision.
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    /// Owning session.
    pub session_id: String,
    /// Transition type.
    pub event_type: EventType,
    /// Free-form payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

fn serialize_timestamp<S: serde::Serializer>(
    ts: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    // "+00:00" rather than "Z", matching the historical on-disk format.
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, false))
}

fn deserialize_timestamp<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

/// Session identifier generator: wall-clock plus a process-wide counter,
/// e.g. `20240115_100000_1`.
pub struct SessionIdGenerator {
    clock: Arc<dyn Clock>,
    counter: AtomicU64,
}

impl SessionIdGenerator {
    /// Create a generator starting at counter 1.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counter: AtomicU64::new(1),
        }
    }

    /// Mint the next session id.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}_{n}", self.clock.now().format("%Y%m%d_%H%M%S"))
    }
}

/// Anything that accepts events. The engine depends on this, not on the
/// logger, so tests can capture the emitted sequence in memory.
pub trait EventSink: Send + Sync {
    /// Record one event; must not block the caller.
    fn emit(&self, session_id: &str, event_type: EventType, data: serde_json::Value);

    /// Current time as seen by the sink's clock.
    fn now(&self) -> DateTime<Utc>;
}

/// The JSONL event logger.
///
/// Cloneable handle; the writer task exits when every handle is dropped.
#[derive(Clone)]
pub struct EventLogger {
    tx: mpsc::UnboundedSender<Event>,
    clock: Arc<dyn Clock>,
}

impl EventLogger {
    /// Spawn the writer task and return a handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be created.
    pub fn spawn(clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = voice_dirs::logs_dir();
        std::fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(writer_loop(dir, rx));

        Ok(Self { tx, clock })
    }

    /// Path of the event file for a given date.
    pub fn file_for(date: NaiveDate) -> PathBuf {
        voice_dirs::logs_dir().join(format!("events-{}.jsonl", date.format("%Y%m%d")))
    }
}

impl EventSink for EventLogger {
    fn emit(&self, session_id: &str, event_type: EventType, data: serde_json::Value) {
        let event = Event {
            timestamp: self.clock.now(),
            session_id: session_id.to_owned(),
            event_type,
            data,
        };
        if self.tx.send(event).is_err() {
            warn!("event log writer stopped; dropping event");
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Single-writer loop: serialize each record, append to the daily file,
/// flush. Rotation is date-based; the file is reopened when the event's
/// date differs from the currently open one.
async fn writer_loop(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut current: Option<(NaiveDate, std::fs::File)> = None;

    while let Some(event) = rx.recv().await {
        let date = event.timestamp.date_naive();

        let needs_open = match &current {
            Some((open_date, _)) => *open_date != date,
            None => true,
        };
        if needs_open {
            let path = dir.join(format!("events-{}.jsonl", date.format("%Y%m%d")));
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(file) => {
                    debug!("event log opened: {}", path.display());
                    current = Some((date, file));
                }
                Err(e) => {
                    error!("cannot open event log {}: {e}", path.display());
                    continue;
                }
            }
        }

        let Some((_, file)) = current.as_mut() else {
            continue;
        };
        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                    error!("event log write failed: {e}");
                }
            }
            Err(e) => error!("event serialization failed: {e}"),
        }
    }
    debug!("event log writer stopped");
}

/// Read every event recorded for a given date, in file order.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read. A missing file
/// yields an empty list.
pub fn read_events(date: NaiveDate) -> Result<Vec<Event>> {
    let path = EventLogger::file_for(date);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(&path)?;
    let reader = std::io::BufReader::new(file);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .map_err(|e| VoiceError::Internal(format!("corrupt event record: {e}")))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic clock for event-log tests.

    use super::*;
    use std::sync::Mutex;

    /// Clock advancing a fixed step on every call, so timestamps are
    /// strictly increasing and reproducible.
    pub struct SteppingClock {
        base: Mutex<DateTime<Utc>>,
        step_ms: i64,
    }

    impl SteppingClock {
        pub fn new(base: DateTime<Utc>, step_ms: i64) -> Self {
            Self {
                base: Mutex::new(base),
                step_ms,
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut guard = self.base.lock().expect("clock lock");
            let now = *guard;
            *guard += chrono::Duration::milliseconds(self.step_ms);
            now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_round_trips_through_json() {
        let event = Event {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
                + chrono::Duration::milliseconds(123),
            session_id: "20240115_100000_1".to_owned(),
            event_type: EventType::TtsStart,
            data: serde_json::json!({"voice": "nova", "provider": "openai"}),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"TTS_START\""));
        assert!(line.contains("2024-01-15T10:00:00.123+00:00"));

        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.session_id, event.session_id);
        assert_eq!(back.event_type, EventType::TtsStart);
        assert_eq!(back.timestamp, event.timestamp);
    }

    #[test]
    fn event_type_wire_names() {
        let json = serde_json::to_string(&EventType::ToolRequestStart).unwrap();
        assert_eq!(json, "\"TOOL_REQUEST_START\"");
        let json = serde_json::to_string(&EventType::SttComplete).unwrap();
        assert_eq!(json, "\"STT_COMPLETE\"");
    }

    #[test]
    fn session_ids_are_unique_and_ordered() {
        let clock = Arc::new(SystemClock);
        let generator = SessionIdGenerator::new(clock);
        let a = generator.next_id();
        let b = generator.next_id();
        assert_ne!(a, b);
        assert!(a.ends_with("_1"));
        assert!(b.ends_with("_2"));
    }

    #[tokio::test]
    async fn logger_appends_and_survives_reload() {
        let _home = crate::test_utils::HomeGuard::new();

        let clock: Arc<dyn Clock> = Arc::new(testing::SteppingClock::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
            250,
        ));
        let logger = EventLogger::spawn(Arc::clone(&clock)).unwrap();
        logger.emit(
            "20240115_100000_1",
            EventType::ToolRequestStart,
            serde_json::json!({}),
        );
        logger.emit(
            "20240115_100000_1",
            EventType::ToolRequestEnd,
            serde_json::json!({}),
        );

        // Give the writer task a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let events = read_events(date).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::ToolRequestStart);
        assert!(events[0].timestamp <= events[1].timestamp);
    }
}
