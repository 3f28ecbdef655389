//! Derived statistics over the JSONL event log.
//!
//! Nothing here is stored; every figure is recomputed from a day's events.
//! Metric definitions:
//!
//! - TTFA             = TTS_FIRST_AUDIO − TTS_START
//! - TTS generation   = TTS_PLAYBACK_END − TTS_START
//! - TTS playback     = TTS_PLAYBACK_END − TTS_PLAYBACK_START
//! - Recording        = RECORDING_END − RECORDING_START
//! - STT processing   = STT_COMPLETE − STT_START
//! - Response time    = next TTS_PLAYBACK_START after RECORDING_END
//!                      (crosses session boundaries)
//! - AI thinking time = gap between TOOL_REQUEST_END and the following
//!                      TOOL_REQUEST_START, across sessions

use super::{Event, EventType};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Timing metrics for one session. Absent phases stay `None`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfa_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_generation_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_playback_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_processing_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_s: Option<f64>,
}

/// Mean/min/max/median over a sample set.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub count: usize,
}

impl MetricSummary {
    fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = samples.len();
        let sum: f64 = samples.iter().sum();
        let median = if count % 2 == 1 {
            samples[count / 2]
        } else {
            (samples[count / 2 - 1] + samples[count / 2]) / 2.0
        };
        Some(Self {
            mean: sum / count as f64,
            min: samples[0],
            max: samples[count - 1],
            median,
            count,
        })
    }
}

/// Aggregate view over a window of events.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub sessions: Vec<SessionMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfa: Option<MetricSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_generation: Option<MetricSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<MetricSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_processing: Option<MetricSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<MetricSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_thinking: Option<MetricSummary>,
}

/// Compute per-session metrics and window summaries from raw events.
pub fn summarize(events: &[Event]) -> StatsSummary {
    // Group by session, preserving first-seen order.
    let mut sessions: Vec<(String, Vec<&Event>)> = Vec::new();
    for event in events {
        match sessions.iter_mut().find(|(id, _)| *id == event.session_id) {
            Some((_, list)) => list.push(event),
            None => sessions.push((event.session_id.clone(), vec![event])),
        }
    }

    // Globally ordered playback starts, for cross-session response time.
    let mut playback_starts: Vec<DateTime<Utc>> = events
        .iter()
        .filter(|e| e.event_type == EventType::TtsPlaybackStart)
        .map(|e| e.timestamp)
        .collect();
    playback_starts.sort_unstable();

    let mut metrics = Vec::with_capacity(sessions.len());
    for (session_id, session_events) in &sessions {
        let first = |ty: EventType| -> Option<DateTime<Utc>> {
            session_events
                .iter()
                .filter(|e| e.event_type == ty)
                .map(|e| e.timestamp)
                .min()
        };

        let tts_start = first(EventType::TtsStart);
        let tts_first_audio = first(EventType::TtsFirstAudio);
        let tts_play_start = first(EventType::TtsPlaybackStart);
        let tts_play_end = first(EventType::TtsPlaybackEnd);
        let rec_start = first(EventType::RecordingStart);
        let rec_end = first(EventType::RecordingEnd);
        let stt_start = first(EventType::SttStart);
        let stt_complete = first(EventType::SttComplete);

        let response_time_s = rec_end.and_then(|end| {
            playback_starts
                .iter()
                .find(|ts| **ts > end)
                .map(|ts| seconds(end, *ts))
        });

        let total_duration_s = match (
            session_events.iter().map(|e| e.timestamp).min(),
            session_events.iter().map(|e| e.timestamp).max(),
        ) {
            (Some(a), Some(b)) => Some(seconds(a, b)),
            _ => None,
        };

        metrics.push(SessionMetrics {
            session_id: session_id.clone(),
            ttfa_s: span(tts_start, tts_first_audio),
            tts_generation_s: span(tts_start, tts_play_end),
            tts_playback_s: span(tts_play_start, tts_play_end),
            recording_s: span(rec_start, rec_end),
            stt_processing_s: span(stt_start, stt_complete),
            response_time_s,
            total_duration_s,
        });
    }

    let collect = |f: fn(&SessionMetrics) -> Option<f64>| -> Vec<f64> {
        metrics.iter().filter_map(f).collect()
    };

    StatsSummary {
        ttfa: MetricSummary::from_samples(collect(|m| m.ttfa_s)),
        tts_generation: MetricSummary::from_samples(collect(|m| m.tts_generation_s)),
        recording: MetricSummary::from_samples(collect(|m| m.recording_s)),
        stt_processing: MetricSummary::from_samples(collect(|m| m.stt_processing_s)),
        response_time: MetricSummary::from_samples(collect(|m| m.response_time_s)),
        ai_thinking: MetricSummary::from_samples(thinking_gaps(events)),
        sessions: metrics,
    }
}

fn span(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    match (start, end) {
        (Some(a), Some(b)) => Some(seconds(a, b)),
        _ => None,
    }
}

fn seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1_000.0
}

/// Gaps between each TOOL_REQUEST_END and the next TOOL_REQUEST_START,
/// across all sessions in the window.
fn thinking_gaps(events: &[Event]) -> Vec<f64> {
    let mut ends: Vec<DateTime<Utc>> = events
        .iter()
        .filter(|e| e.event_type == EventType::ToolRequestEnd)
        .map(|e| e.timestamp)
        .collect();
    let mut starts: Vec<DateTime<Utc>> = events
        .iter()
        .filter(|e| e.event_type == EventType::ToolRequestStart)
        .map(|e| e.timestamp)
        .collect();
    ends.sort_unstable();
    starts.sort_unstable();

    let mut gaps = Vec::new();
    for end in ends {
        if let Some(start) = starts.iter().find(|s| **s > end) {
            gaps.push(seconds(end, *start));
        }
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(session: &str, ty: EventType, ms: i64) -> Event {
        Event {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
                + chrono::Duration::milliseconds(ms),
            session_id: session.to_owned(),
            event_type: ty,
            data: serde_json::Value::Null,
        }
    }

    fn full_session(session: &str, base_ms: i64) -> Vec<Event> {
        vec![
            event(session, EventType::ToolRequestStart, base_ms),
            event(session, EventType::TtsStart, base_ms + 100),
            event(session, EventType::TtsFirstAudio, base_ms + 400),
            event(session, EventType::TtsPlaybackStart, base_ms + 500),
            event(session, EventType::TtsPlaybackEnd, base_ms + 2_500),
            event(session, EventType::RecordingStart, base_ms + 2_600),
            event(session, EventType::RecordingEnd, base_ms + 5_600),
            event(session, EventType::SttStart, base_ms + 5_700),
            event(session, EventType::SttComplete, base_ms + 6_200),
            event(session, EventType::ToolRequestEnd, base_ms + 6_300),
        ]
    }

    #[test]
    fn single_session_metrics() {
        let events = full_session("s1", 0);
        let summary = summarize(&events);
        assert_eq!(summary.sessions.len(), 1);
        let m = &summary.sessions[0];
        assert_eq!(m.ttfa_s, Some(0.3));
        assert_eq!(m.tts_generation_s, Some(2.4));
        assert_eq!(m.tts_playback_s, Some(2.0));
        assert_eq!(m.recording_s, Some(3.0));
        assert_eq!(m.stt_processing_s, Some(0.5));
        assert_eq!(m.total_duration_s, Some(6.3));
        // Only one playback start and it precedes recording end.
        assert_eq!(m.response_time_s, None);
    }

    #[test]
    fn response_time_crosses_sessions() {
        let mut events = full_session("s1", 0);
        events.extend(full_session("s2", 10_000));
        let summary = summarize(&events);
        // s1's recording ends at 5.6s; s2's playback starts at 10.5s.
        let s1 = &summary.sessions[0];
        assert_eq!(s1.response_time_s, Some(4.9));
    }

    #[test]
    fn thinking_gap_between_sessions() {
        let mut events = full_session("s1", 0);
        events.extend(full_session("s2", 10_000));
        let summary = summarize(&events);
        let thinking = summary.ai_thinking.expect("one gap");
        assert_eq!(thinking.count, 1);
        // s1 ends at 6.3s, s2 starts at 10.0s.
        assert!((thinking.mean - 3.7).abs() < 1e-9);
    }

    #[test]
    fn empty_window_has_no_summaries() {
        let summary = summarize(&[]);
        assert!(summary.sessions.is_empty());
        assert!(summary.ttfa.is_none());
        assert!(summary.ai_thinking.is_none());
    }

    #[test]
    fn median_of_even_sample_count() {
        let s = MetricSummary::from_samples(vec![4.0, 1.0, 3.0, 2.0]).expect("samples");
        assert_eq!(s.median, 2.5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.mean, 2.5);
    }

    #[test]
    fn speak_only_session_has_no_recording_metrics() {
        let events = vec![
            event("s1", EventType::ToolRequestStart, 0),
            event("s1", EventType::TtsStart, 100),
            event("s1", EventType::TtsFirstAudio, 300),
            event("s1", EventType::TtsPlaybackStart, 400),
            event("s1", EventType::TtsPlaybackEnd, 1_400),
            event("s1", EventType::ToolRequestEnd, 1_500),
        ];
        let summary = summarize(&events);
        let m = &summary.sessions[0];
        assert!(m.recording_s.is_none());
        assert!(m.stt_processing_s.is_none());
        assert_eq!(m.ttfa_s, Some(0.2));
    }
}
