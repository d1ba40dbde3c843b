//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix (`APP_LIVE__MODEL=...`)
//! - `HOST` / `PORT` / `GEMINI_API_KEY` for deployment platforms
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (`HOST`, `PORT`, `GEMINI_API_KEY`)
//! 2. `APP_` environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default persona for the consultation assistant.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly veterinary intake assistant. \
Greet the pet owner, call checkAuthStatus, and if they are signed in call getMyPets so you can \
refer to their pets by name. Ask what is wrong with the pet, how long it has been going on, and \
whether they prefer a particular doctor, date or time; use getDoctors to look doctors up. \
Never diagnose or prescribe. When you know the pet's name, species and the reason for the visit, \
call completeConsultation with a short clinical summary.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioSettings,
    pub performance: PerformanceConfig,
    pub records: RecordsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settings for the bidirectional speech/LLM endpoint.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the streaming service
/// - `model`: model identifier sent in the `setup` message
/// - `api_key`: credential appended as `?key=`; never logged or echoed by the API
/// - `voice`: prebuilt voice used for the assistant's speech
/// - `system_instruction`: persona and booking-intake rules for the assistant
/// - `handshake_timeout_ms`: how long `start()` waits for `setupComplete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    pub voice: String,
    pub system_instruction: String,
    pub handshake_timeout_ms: u64,
}

/// Audio format settings.
///
/// Outbound microphone audio is 16 kHz, inbound assistant speech is 24 kHz;
/// both are mono 16-bit PCM on the wire. `frame_size` is the number of
/// samples per outbound network message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsConfig {
    /// TOML file with `[[users]]`, `[[pets]]` and `[[doctors]]` tables.
    #[serde(default)]
    pub seed_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: crate::live::DEFAULT_ENDPOINT.to_string(),
                model: crate::live::DEFAULT_MODEL.to_string(),
                api_key: String::new(),
                voice: "Puck".to_string(),
                system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
                handshake_timeout_ms: 10_000,
            },
            audio: AudioSettings {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                frame_size: 4096,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            records: RecordsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Live endpoint cannot be empty"));
        }

        if !self.live.endpoint.starts_with("ws://") && !self.live.endpoint.starts_with("wss://") {
            return Err(anyhow::anyhow!("Live endpoint must be a ws:// or wss:// URL"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"live": {"voice": "Kore"}}`.
    ///
    /// Only runtime-tunable fields are honoured; audio formats and the API key
    /// are fixed for the lifetime of the process.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
            if let Some(timeout) = live.get("handshake_timeout_ms").and_then(|v| v.as_u64()) {
                self.live.handshake_timeout_ms = timeout;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Settings handed to each consultation session.
    pub fn session_settings(&self) -> crate::consultation::SessionSettings {
        crate::consultation::SessionSettings {
            model: self.live.model.clone(),
            voice: self.live.voice.clone(),
            system_instruction: self.live.system_instruction.clone(),
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            frame_size: self.audio.frame_size,
            handshake_timeout: std::time::Duration::from_millis(self.live.handshake_timeout_ms),
        }
    }
}
