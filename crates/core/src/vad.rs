//! Voice activity detection.
//!
//! The detector only decides whether the user is speaking; what happens to the
//! audio is up to the voice-activity gate stage.

use crate::audio;
use crate::frame::{AudioChunk, SpeechBoundary};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// What the gate does with audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadMode {
    /// Forward audio only while the user is speaking.
    #[default]
    Gate,
    /// Forward all audio, tagging speech boundaries.
    PassThrough,
}

impl FromStr for VadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gate" => Ok(VadMode::Gate),
            "passthrough" | "pass_through" => Ok(VadMode::PassThrough),
            other => Err(format!("unknown VAD mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS level (0.0..=1.0) at or above which a chunk counts as speech.
    pub threshold: f32,
    /// Continuous speech needed before `Started`.
    pub start_after: Duration,
    /// Continuous silence needed before `Stopped`.
    pub stop_after: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            start_after: Duration::from_millis(200),
            stop_after: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadDecision {
    pub speaking: bool,
    /// Set on the chunk where `speaking` changed.
    pub boundary: Option<SpeechBoundary>,
}

pub trait VoiceActivityDetector: Send {
    fn analyze(&mut self, chunk: &AudioChunk) -> VadDecision;

    fn reset(&mut self);
}

/// RMS energy detector with start/stop hysteresis.
#[derive(Debug)]
pub struct EnergyVad {
    config: VadConfig,
    speaking: bool,
    voiced: Duration,
    silent: Duration,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speaking: false,
            voiced: Duration::ZERO,
            silent: Duration::ZERO,
        }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn analyze(&mut self, chunk: &AudioChunk) -> VadDecision {
        let loud = audio::rms(&chunk.samples) >= self.config.threshold;
        let span = chunk.duration();
        if loud {
            self.voiced += span;
            self.silent = Duration::ZERO;
        } else {
            self.silent += span;
            self.voiced = Duration::ZERO;
        }

        let boundary = if !self.speaking && loud && self.voiced >= self.config.start_after {
            self.speaking = true;
            Some(SpeechBoundary::Started)
        } else if self.speaking && !loud && self.silent >= self.config.stop_after {
            self.speaking = false;
            Some(SpeechBoundary::Stopped)
        } else {
            None
        };

        VadDecision {
            speaking: self.speaking,
            boundary,
        }
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.voiced = Duration::ZERO;
        self.silent = Duration::ZERO;
    }
}
