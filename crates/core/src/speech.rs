//! Speech service clients: transcription and synthesis against a Speaches server.

use crate::audio;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use serde_json::json;
use std::pin::Pin;
use tracing::debug;

/// A stream of raw PCM16 little-endian mono audio. Every item has an even length.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Converts one finished utterance into text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// `pcm` is PCM16 little-endian mono at `sample_rate`.
    async fn transcribe(&self, pcm: Bytes, sample_rate: u32) -> Result<String>;
}

/// Converts text into streamed audio.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: String) -> Result<AudioStream>;

    /// Sample rate of the produced audio.
    fn sample_rate(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisConfigError {
    #[error("TTS model must not be empty")]
    EmptyModel,
    #[error("invalid voice id '{0}'")]
    InvalidVoice(String),
    #[error("speed {0} is outside 0.25..=4.0")]
    SpeedOutOfRange(f32),
    #[error("sample rate must be positive")]
    ZeroSampleRate,
}

/// Settings of the synthesis service.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisConfig {
    pub model: String,
    pub voice: String,
    pub speed: f32,
    /// Sample rate the service produces for `response_format: "pcm"`.
    pub sample_rate: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model: "speaches-ai/Kokoro-82M-v1.0-ONNX".to_string(),
            voice: "af_heart".to_string(),
            speed: 1.0,
            sample_rate: 24000,
        }
    }
}

impl SynthesisConfig {
    /// Checks the settings locally. The voice is any identifier the service knows;
    /// only its shape is validated here.
    pub fn validate(&self) -> Result<(), SynthesisConfigError> {
        if self.model.trim().is_empty() {
            return Err(SynthesisConfigError::EmptyModel);
        }
        let voice_ok = !self.voice.is_empty()
            && self
                .voice
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !voice_ok {
            return Err(SynthesisConfigError::InvalidVoice(self.voice.clone()));
        }
        if !(0.25..=4.0).contains(&self.speed) {
            return Err(SynthesisConfigError::SpeedOutOfRange(self.speed));
        }
        if self.sample_rate == 0 {
            return Err(SynthesisConfigError::ZeroSampleRate);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// `POST /v1/audio/transcriptions` with a WAV upload.
pub struct SpeachesStt {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl SpeachesStt {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl SpeechToText for SpeachesStt {
    async fn transcribe(&self, pcm: Bytes, sample_rate: u32) -> Result<String> {
        let wav = audio::encode_wav(&pcm, sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("transcription request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("transcription returned {status}: {body}");
        }
        let transcription: TranscriptionResponse = response
            .json()
            .await
            .context("malformed transcription response")?;
        debug!(chars = transcription.text.len(), "transcription received");
        Ok(transcription.text.trim().to_string())
    }
}

/// `POST /v1/audio/speech`, streaming raw PCM back.
pub struct SpeachesTts {
    base_url: String,
    config: SynthesisConfig,
    client: reqwest::Client,
}

impl SpeachesTts {
    pub fn new(base_url: impl Into<String>, config: SynthesisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
            client: reqwest::Client::new(),
        })
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }
}

#[async_trait]
impl TextToSpeech for SpeachesTts {
    async fn synthesize(&self, text: String) -> Result<AudioStream> {
        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&json!({
                "model": self.config.model,
                "input": text,
                "voice": self.config.voice,
                "response_format": "pcm",
                "speed": self.config.speed,
            }))
            .send()
            .await
            .context("speech request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("speech synthesis returned {status}: {body}");
        }
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from));
        Ok(align_pcm16(chunks))
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

/// Re-chunks a byte stream so no sample is split across items.
pub fn align_pcm16<S>(chunks: S) -> AudioStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let chunks = Box::pin(chunks);
    Box::pin(stream::unfold(
        (chunks, None::<u8>),
        |(mut chunks, mut carry)| async move {
            loop {
                match chunks.next().await? {
                    Ok(bytes) => {
                        let mut buf = Vec::with_capacity(bytes.len() + 1);
                        buf.extend(carry.take());
                        buf.extend_from_slice(&bytes);
                        if buf.len() % 2 == 1 {
                            carry = buf.pop();
                        }
                        if buf.is_empty() {
                            continue;
                        }
                        return Some((Ok(Bytes::from(buf)), (chunks, carry)));
                    }
                    Err(e) => return Some((Err(e), (chunks, carry))),
                }
            }
        },
    ))
}
