//! Voice activity detection using energy analysis.
//!
//! Short-term RMS energy over 20 ms frames, after a first-order high-pass
//! at 80 Hz to reject rumble and DC offset. [`ListenSession`] layers the
//! recording-end policy on top: a recording ends at the earliest of the
//! requested listen duration, a silence tail following enough speech, or
//! the hard cap. Silence before any speech at all gives up after the
//! initial grace window.

use crate::config::VadConfig;
use tracing::debug;

/// First-order high-pass filter.
struct HighPass {
    alpha: f32,
    prev_input: f32,
    prev_output: f32,
}

impl HighPass {
    fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz.max(1.0));
        let dt = 1.0 / sample_rate as f32;
        Self {
            alpha: rc / (rc + dt),
            prev_input: 0.0,
            prev_output: 0.0,
        }
    }

    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        output.clear();
        output.reserve(input.len());
        for &x in input {
            let y = self.alpha * (self.prev_output + x - self.prev_input);
            self.prev_input = x;
            self.prev_output = y;
            output.push(y);
        }
    }
}

/// Frame classification result.
#[derive(Debug, Clone, Copy)]
pub struct VadFrame {
    /// Whether the frame's filtered energy is above the speech threshold.
    pub is_speech: bool,
    /// RMS energy of the filtered frame.
    pub rms: f32,
}

/// Energy-based voice activity detector.
pub struct EnergyVad {
    highpass: HighPass,
    threshold: f32,
    scratch: Vec<f32>,
}

impl EnergyVad {
    /// Create a detector for the given sample rate.
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        Self {
            highpass: HighPass::new(config.highpass_hz, sample_rate),
            threshold: config.threshold,
            scratch: Vec::new(),
        }
    }

    /// Classify one frame of mono samples.
    pub fn process_frame(&mut self, samples: &[f32]) -> VadFrame {
        self.highpass.process(samples, &mut self.scratch);
        let rms = compute_rms(&self.scratch);
        VadFrame {
            is_speech: rms > self.threshold,
            rms,
        }
    }
}

/// Compute RMS energy of audio samples.
fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Why a listen ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// Keep recording.
    Continue,
    /// Recording complete with speech captured.
    Complete,
    /// Gave up without detecting speech.
    NoSpeech,
}

/// One recording's worth of VAD state plus the end policy.
pub struct ListenSession {
    vad: EnergyVad,
    captured: Vec<f32>,
    elapsed_ms: f64,
    speech_ms: f64,
    silence_run_ms: f64,
    listen_limit_ms: f64,
    hard_cap_ms: f64,
    giveup_ms: f64,
    silence_tail_ms: f64,
    min_speech_ms: f64,
    sample_rate: u32,
}

impl ListenSession {
    /// Start a listen bounded by `listen_duration_s`.
    pub fn new(config: &VadConfig, sample_rate: u32, listen_duration_s: f32) -> Self {
        let giveup_ms = (config.initial_grace_s as f64 * 1_000.0)
            .max(config.silence_tail_ms as f64);
        Self {
            vad: EnergyVad::new(config, sample_rate),
            captured: Vec::new(),
            elapsed_ms: 0.0,
            speech_ms: 0.0,
            silence_run_ms: 0.0,
            listen_limit_ms: listen_duration_s as f64 * 1_000.0,
            hard_cap_ms: config.max_listen_s as f64 * 1_000.0,
            giveup_ms,
            silence_tail_ms: config.silence_tail_ms as f64,
            min_speech_ms: config.min_speech_ms as f64,
            sample_rate,
        }
    }

    /// Feed one captured frame and decide whether recording continues.
    pub fn push_frame(&mut self, samples: &[f32]) -> ListenOutcome {
        let frame_ms = samples.len() as f64 * 1_000.0 / self.sample_rate as f64;
        self.captured.extend_from_slice(samples);
        self.elapsed_ms += frame_ms;

        let frame = self.vad.process_frame(samples);
        if frame.is_speech {
            self.speech_ms += frame_ms;
            self.silence_run_ms = 0.0;
        } else {
            self.silence_run_ms += frame_ms;
        }

        let had_speech = self.speech_ms >= self.min_speech_ms;

        // Silence tail after enough speech ends the recording.
        if had_speech && self.silence_run_ms >= self.silence_tail_ms {
            debug!(
                elapsed_ms = self.elapsed_ms,
                speech_ms = self.speech_ms,
                "listen complete: silence tail"
            );
            return ListenOutcome::Complete;
        }

        // No speech at all within the grace window.
        if self.speech_ms == 0.0 && self.elapsed_ms >= self.giveup_ms {
            debug!(elapsed_ms = self.elapsed_ms, "listen gave up: no speech");
            return ListenOutcome::NoSpeech;
        }

        // Requested duration or hard cap elapsed.
        let limit = self.listen_limit_ms.min(self.hard_cap_ms);
        if self.elapsed_ms >= limit {
            return if had_speech {
                debug!(elapsed_ms = self.elapsed_ms, "listen complete: duration");
                ListenOutcome::Complete
            } else {
                debug!(elapsed_ms = self.elapsed_ms, "listen gave up: duration, no speech");
                ListenOutcome::NoSpeech
            };
        }

        ListenOutcome::Continue
    }

    /// Seconds of audio captured so far.
    pub fn captured_duration_s(&self) -> f32 {
        self.captured.len() as f32 / self.sample_rate as f32
    }

    /// Take ownership of everything captured.
    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME: usize = 320; // 20ms

    fn config() -> VadConfig {
        VadConfig::default()
    }

    /// A frame of pseudo-speech: alternating samples at the given level,
    /// which survives the high-pass filter.
    fn loud_frame(level: f32) -> Vec<f32> {
        (0..FRAME)
            .map(|i| if i % 2 == 0 { level } else { -level })
            .collect()
    }

    fn silent_frame() -> Vec<f32> {
        vec![0.0; FRAME]
    }

    fn push_frames(session: &mut ListenSession, frame: &[f32], n: usize) -> ListenOutcome {
        let mut outcome = ListenOutcome::Continue;
        for _ in 0..n {
            outcome = session.push_frame(frame);
            if outcome != ListenOutcome::Continue {
                break;
            }
        }
        outcome
    }

    #[test]
    fn speech_then_silence_tail_completes() {
        let mut session = ListenSession::new(&config(), RATE, 30.0);
        // 400ms of speech (> min_speech 300ms)
        assert_eq!(
            push_frames(&mut session, &loud_frame(0.3), 20),
            ListenOutcome::Continue
        );
        // 800ms silence tail (40 frames) ends it
        let outcome = push_frames(&mut session, &silent_frame(), 41);
        assert_eq!(outcome, ListenOutcome::Complete);
    }

    #[test]
    fn pure_silence_gives_up_after_grace() {
        let mut session = ListenSession::new(&config(), RATE, 30.0);
        // grace default is 3s = 150 frames
        let outcome = push_frames(&mut session, &silent_frame(), 200);
        assert_eq!(outcome, ListenOutcome::NoSpeech);
        assert!(session.captured_duration_s() <= 3.1);
    }

    #[test]
    fn short_blip_does_not_count_as_speech() {
        let mut session = ListenSession::new(&config(), RATE, 30.0);
        // 100ms of sound < min_speech 300ms
        assert_eq!(
            push_frames(&mut session, &loud_frame(0.3), 5),
            ListenOutcome::Continue
        );
        // silence tail alone must not complete; eventually gives up or
        // keeps going until the limit. 800ms in: still continuing because
        // speech_ms > 0 blocks the no-speech exit.
        let outcome = push_frames(&mut session, &silent_frame(), 45);
        assert_eq!(outcome, ListenOutcome::Continue);
    }

    #[test]
    fn listen_duration_bounds_recording() {
        let mut session = ListenSession::new(&config(), RATE, 1.0);
        // Continuous speech: duration limit ends it as Complete.
        let outcome = push_frames(&mut session, &loud_frame(0.3), 60);
        assert_eq!(outcome, ListenOutcome::Complete);
        assert!(session.captured_duration_s() <= 1.05);
    }

    #[test]
    fn hard_cap_applies_when_duration_longer() {
        let vad = VadConfig {
            max_listen_s: 0.5,
            ..VadConfig::default()
        };
        let mut session = ListenSession::new(&vad, RATE, 10.0);
        let outcome = push_frames(&mut session, &loud_frame(0.3), 60);
        assert_eq!(outcome, ListenOutcome::Complete);
        assert!(session.captured_duration_s() <= 0.55);
    }

    #[test]
    fn highpass_rejects_dc_offset() {
        let mut vad = EnergyVad::new(&config(), RATE);
        // Pure DC at 0.5 would trip a naive energy gate.
        let dc = vec![0.5; FRAME];
        // Run a few frames so the filter settles.
        let mut frame = vad.process_frame(&dc);
        for _ in 0..5 {
            frame = vad.process_frame(&dc);
        }
        assert!(!frame.is_speech, "DC offset classified as speech");
    }

    #[test]
    fn captured_audio_is_everything_heard() {
        let mut session = ListenSession::new(&config(), RATE, 30.0);
        push_frames(&mut session, &loud_frame(0.3), 20);
        push_frames(&mut session, &silent_frame(), 41);
        let samples = session.take_samples();
        assert_eq!(samples.len(), (20 + 41) * FRAME);
    }
}
