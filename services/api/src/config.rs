use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;
use voxline_core::lifecycle::SessionSettings;
use voxline_core::provisioner::DEFAULT_PROVISION_TIMEOUT;
use voxline_core::speech::SynthesisConfig;
use voxline_core::vad::VadMode;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly voice assistant. Your answers are \
    spoken aloud, so keep them short and conversational and avoid lists or markdown.";
const DEFAULT_GREETING_INSTRUCTION: &str =
    "Greet the user in one short sentence and ask how you can help.";

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub speaches_base_url: String,
    pub stt_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub system_instruction: String,
    /// `None` when `GREETING_INSTRUCTION` is set to an empty string.
    pub greeting_instruction: Option<String>,
    pub provision_timeout: Duration,
    pub allow_interruptions: bool,
    pub vad_mode: VadMode,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Like [`var_or`], but an explicitly empty value is an error.
fn required_or(name: &str, default: &str) -> Result<String, ConfigError> {
    let value = var_or(name, default);
    if value.trim().is_empty() {
        return Err(ConfigError::MissingVar(format!("{name} must not be empty")));
    }
    Ok(value.trim().to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var_or(name, default)
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let host = var_or("SERVER_HOST", "0.0.0.0");
        let port: u16 = parse_var("SERVER_PORT", "7860")?;
        if port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT".to_string(),
                "must be between 1 and 65535".to_string(),
            ));
        }
        let bind_address = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("SERVER_HOST".to_string(), e.to_string()))?;

        let ollama_base_url = required_or("OLLAMA_BASE_URL", "http://ollama:11434")?;
        let ollama_model = required_or("OLLAMA_MODEL", "llama3.2:3b")?;
        let speaches_base_url = required_or("SPEACHES_BASE_URL", "http://speaches:8000")?;
        let stt_model = required_or("STT_MODEL", "Systran/faster-distil-whisper-small.en")?;
        let tts_model = required_or("TTS_MODEL", "speaches-ai/Kokoro-82M-v1.0-ONNX")?;
        let tts_voice = required_or("TTS_VOICE", "af_heart")?;

        let system_instruction = required_or("SYSTEM_INSTRUCTION", DEFAULT_SYSTEM_INSTRUCTION)?;
        let greeting_instruction =
            Some(var_or("GREETING_INSTRUCTION", DEFAULT_GREETING_INSTRUCTION))
                .filter(|g| !g.trim().is_empty());

        let provision_timeout = Duration::from_secs(parse_var(
            "PROVISION_TIMEOUT_SECS",
            &DEFAULT_PROVISION_TIMEOUT.as_secs().to_string(),
        )?);
        if provision_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PROVISION_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let allow_interruptions: bool = parse_var("ALLOW_INTERRUPTIONS", "true")?;
        let vad_mode: VadMode = parse_var("VAD_MODE", "gate")?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            ollama_base_url,
            ollama_model,
            speaches_base_url,
            stt_model,
            tts_model,
            tts_voice,
            system_instruction,
            greeting_instruction,
            provision_timeout,
            allow_interruptions,
            vad_mode,
            log_level,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            system_instruction: self.system_instruction.clone(),
            greeting: self.greeting_instruction.clone(),
            provision_timeout: self.provision_timeout,
            vad_mode: self.vad_mode,
            allow_interruptions: self.allow_interruptions,
            ..SessionSettings::default()
        }
    }

    pub fn synthesis_config(&self) -> SynthesisConfig {
        SynthesisConfig {
            model: self.tts_model.clone(),
            voice: self.tts_voice.clone(),
            ..SynthesisConfig::default()
        }
    }
}
