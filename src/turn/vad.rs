//! Energy-based voice activity detection.
//!
//! RMS thresholding plus a small state machine with start/stop hysteresis.
//! All durations are measured in audio time (sample counts), so results do
//! not depend on how fast chunks arrive.

use crate::defaults;
use crate::frame::samples_to_ms;

/// Configuration for voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadParams {
    /// RMS threshold for detecting speech (0.0 to 1.0).
    pub threshold: f32,
    /// Continuous speech required before speech is reported (seconds).
    pub start_secs: f32,
    /// Continuous non-speech required before speech is considered ended (seconds).
    pub stop_secs: f32,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            start_secs: defaults::VAD_START_SECS,
            stop_secs: defaults::VAD_STOP_SECS,
        }
    }
}

impl VadParams {
    pub fn start_ms(&self) -> u32 {
        secs_to_ms(self.start_secs)
    }

    pub fn stop_ms(&self) -> u32 {
        secs_to_ms(self.stop_secs)
    }

    /// Start window as a sample count at `sample_rate`.
    pub fn start_samples(&self, sample_rate: u32) -> u64 {
        secs_to_samples(self.start_secs, sample_rate)
    }

    /// Stop window as a sample count at `sample_rate`.
    pub fn stop_samples(&self, sample_rate: u32) -> u64 {
        secs_to_samples(self.stop_secs, sample_rate)
    }
}

pub(crate) fn secs_to_ms(secs: f32) -> u32 {
    (secs.max(0.0) * 1000.0).round() as u32
}

pub(crate) fn secs_to_samples(secs: f32, sample_rate: u32) -> u64 {
    (secs.max(0.0) as f64 * sample_rate as f64).round() as u64
}

/// Re-expresses a sample count taken at `from` Hz as a count at `to` Hz.
pub(crate) fn rescale_samples(samples: u64, from: u32, to: u32) -> u64 {
    if from == 0 || from == to {
        return samples;
    }
    samples * to as u64 / from as u64
}

/// Current state of voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected.
    Idle,
    /// Speech energy seen, waiting for it to last `start_secs`.
    Starting,
    /// Speech confirmed.
    Speaking,
    /// Silence during speech, waiting for it to last `stop_secs`.
    MaybeSilence,
}

/// Events emitted by the VAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Speech has started.
    SpeechStart,
    /// Ongoing speech (including short pauses within it).
    Speech,
    /// No speech.
    Silence,
    /// Speech has ended.
    SpeechEnd,
}

/// Detailed VAD processing result with level information.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadResult {
    pub event: VadEvent,
    /// RMS level of the chunk (0.0 to 1.0).
    pub level: f32,
    /// Whether this chunk alone is above the threshold.
    pub is_speech: bool,
    /// Continuous silence since speech stopped, in samples at `sample_rate`.
    pub silence_samples: u64,
    pub sample_rate: u32,
    /// `silence_samples` in milliseconds.
    pub silence_ms: u32,
}

/// Voice activity detector state machine.
#[derive(Debug, Clone)]
pub struct Vad {
    params: VadParams,
    state: VadState,
    sample_rate: u32,
    speech_samples: u64,
    silence_samples: u64,
}

impl Vad {
    pub fn new(params: VadParams) -> Self {
        Self {
            params,
            state: VadState::Idle,
            sample_rate: defaults::AUDIO_IN_SAMPLE_RATE,
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    /// Processes one chunk of 16-bit PCM.
    ///
    /// Windows are counted in samples, so chunk size does not affect when
    /// speech starts or ends.
    pub fn process(&mut self, samples: &[i16], sample_rate: u32) -> VadResult {
        if sample_rate != self.sample_rate {
            self.speech_samples = rescale_samples(self.speech_samples, self.sample_rate, sample_rate);
            self.silence_samples =
                rescale_samples(self.silence_samples, self.sample_rate, sample_rate);
            self.sample_rate = sample_rate;
        }
        let level = calculate_rms(samples);
        let is_speech = level > self.params.threshold;
        let chunk_samples = samples.len() as u64;

        let event = match (self.state, is_speech) {
            (VadState::Idle, false) => VadEvent::Silence,
            (VadState::Idle, true) | (VadState::Starting, true) => {
                self.speech_samples += chunk_samples;
                if self.speech_samples >= self.params.start_samples(sample_rate) {
                    self.state = VadState::Speaking;
                    self.speech_samples = 0;
                    VadEvent::SpeechStart
                } else {
                    self.state = VadState::Starting;
                    VadEvent::Silence
                }
            }
            (VadState::Starting, false) => {
                self.state = VadState::Idle;
                self.speech_samples = 0;
                VadEvent::Silence
            }
            (VadState::Speaking, true) | (VadState::MaybeSilence, true) => {
                self.state = VadState::Speaking;
                self.silence_samples = 0;
                VadEvent::Speech
            }
            (VadState::Speaking, false) | (VadState::MaybeSilence, false) => {
                self.silence_samples += chunk_samples;
                if self.silence_samples >= self.params.stop_samples(sample_rate) {
                    self.state = VadState::Idle;
                    VadEvent::SpeechEnd
                } else {
                    self.state = VadState::MaybeSilence;
                    VadEvent::Speech
                }
            }
        };

        let silence_samples = self.silence_samples;
        if event == VadEvent::SpeechEnd {
            self.silence_samples = 0;
        }

        VadResult {
            event,
            level,
            is_speech,
            silence_samples,
            sample_rate,
            silence_ms: samples_to_ms(silence_samples as usize, sample_rate),
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn params(&self) -> &VadParams {
        &self.params
    }

    /// Resets the VAD to idle state.
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.speech_samples = 0;
        self.silence_samples = 0;
    }
}

/// Calculates the normalized Root Mean Square (RMS) of audio samples.
///
/// 0.0 is silence, ~0.707 a full-scale sine wave and 1.0 maximum amplitude.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16000;
    // 20ms at 16kHz
    const CHUNK: usize = 320;

    fn silence() -> Vec<i16> {
        vec![0i16; CHUNK]
    }

    fn speech() -> Vec<i16> {
        vec![8000i16; CHUNK]
    }

    fn feed(vad: &mut Vad, chunk: &[i16], times: usize) -> Vec<VadEvent> {
        (0..times).map(|_| vad.process(chunk, RATE).event).collect()
    }

    #[test]
    fn test_rms_silence_is_zero() {
        assert_eq!(calculate_rms(&silence()), 0.0);
        assert_eq!(calculate_rms(&[]), 0.0);
    }

    #[test]
    fn test_rms_max_amplitude() {
        let rms = calculate_rms(&vec![i16::MAX; 1000]);
        assert!((rms - 1.0).abs() < 0.001, "RMS should be ~1.0, got {}", rms);
    }

    #[test]
    fn test_rms_symmetric_for_negative_samples() {
        let mut mixed = vec![1000i16; 500];
        mixed.extend(vec![-1000i16; 500]);
        let expected = 1000.0 / i16::MAX as f32;
        assert!((calculate_rms(&mixed) - expected).abs() < 0.001);
    }

    #[test]
    fn test_speech_start_requires_start_window() {
        let mut vad = Vad::new(VadParams::default());
        // 200ms start window = 10 chunks of 20ms
        let events = feed(&mut vad, &speech(), 10);
        assert_eq!(events[..9], [VadEvent::Silence; 9]);
        assert_eq!(events[9], VadEvent::SpeechStart);
        assert_eq!(vad.state(), VadState::Speaking);
    }

    #[test]
    fn test_short_blip_is_not_speech() {
        let mut vad = Vad::new(VadParams::default());
        feed(&mut vad, &speech(), 3);
        assert_eq!(vad.state(), VadState::Starting);
        vad.process(&silence(), RATE);
        assert_eq!(vad.state(), VadState::Idle);
        let events = feed(&mut vad, &speech(), 9);
        assert!(!events.contains(&VadEvent::SpeechStart));
    }

    #[test]
    fn test_speech_end_after_stop_window() {
        let mut vad = Vad::new(VadParams::default());
        feed(&mut vad, &speech(), 10);
        let events = feed(&mut vad, &silence(), 10);
        assert_eq!(events[..9], [VadEvent::Speech; 9]);
        assert_eq!(events[9], VadEvent::SpeechEnd);
        assert_eq!(vad.state(), VadState::Idle);
    }

    #[test]
    fn test_pause_shorter_than_stop_window_keeps_speaking() {
        let mut vad = Vad::new(VadParams::default());
        feed(&mut vad, &speech(), 10);
        feed(&mut vad, &silence(), 5);
        assert_eq!(vad.state(), VadState::MaybeSilence);
        assert_eq!(vad.process(&speech(), RATE).event, VadEvent::Speech);
        assert_eq!(vad.state(), VadState::Speaking);
        // Silence counter restarted
        let events = feed(&mut vad, &silence(), 9);
        assert!(!events.contains(&VadEvent::SpeechEnd));
    }

    #[test]
    fn test_silence_ms_reported_in_audio_time() {
        let mut vad = Vad::new(VadParams::default());
        feed(&mut vad, &speech(), 10);
        let result = vad.process(&vec![0i16; 1600], RATE);
        assert_eq!(result.silence_ms, 100);
    }

    #[test]
    fn test_tiny_chunks_still_start_and_end_speech() {
        let mut vad = Vad::new(VadParams::default());
        // 15 samples is under a millisecond at 16kHz
        let loud = vec![8000i16; 15];
        let quiet = vec![0i16; 15];
        let mut events = Vec::new();
        for _ in 0..(2 * RATE as usize / 15) {
            events.push(vad.process(&loud, RATE).event);
        }
        assert!(events.contains(&VadEvent::SpeechStart));

        let mut ended = None;
        for i in 0..(2 * RATE as usize / 15) {
            let result = vad.process(&quiet, RATE);
            if result.event == VadEvent::SpeechEnd {
                ended = Some((i, result));
                break;
            }
        }
        let (i, result) = ended.expect("speech never ended");
        // 200ms = 3200 samples = 214 chunks of 15 (3210 samples)
        assert_eq!(i, 213);
        assert_eq!(result.silence_samples, 3210);
        assert_eq!(result.silence_ms, 200);
    }

    #[test]
    fn test_odd_chunk_lengths_do_not_undercount() {
        let mut vad = Vad::new(VadParams::default());
        feed(&mut vad, &speech(), 10);
        // 31 samples is 1.9375ms; 3200 samples are reached on chunk 104
        let quiet = vec![0i16; 31];
        let events: Vec<_> = (0..104).map(|_| vad.process(&quiet, RATE).event).collect();
        assert!(!events[..103].contains(&VadEvent::SpeechEnd));
        assert_eq!(events[103], VadEvent::SpeechEnd);
    }

    #[test]
    fn test_sample_rate_change_rescales_counters() {
        let mut vad = Vad::new(VadParams::default());
        feed(&mut vad, &speech(), 10);
        // 100ms at 16kHz, then 100ms at 8kHz
        vad.process(&vec![0i16; 1600], RATE);
        let result = vad.process(&vec![0i16; 800], 8000);
        assert_eq!(result.event, VadEvent::SpeechEnd);
        assert_eq!(result.silence_ms, 200);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut vad = Vad::new(VadParams::default());
        feed(&mut vad, &speech(), 12);
        vad.reset();
        assert_eq!(vad.state(), VadState::Idle);
    }

    #[test]
    fn test_zero_start_window_starts_immediately() {
        let mut vad = Vad::new(VadParams {
            start_secs: 0.0,
            ..VadParams::default()
        });
        assert_eq!(vad.process(&speech(), RATE).event, VadEvent::SpeechStart);
    }
}
