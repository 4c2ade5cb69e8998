use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::audio::device::{FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::session::config::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_VOICE,
};
use crate::session::SessionConfig;

/// Environment variables consulted when no key is configured
const API_KEY_VARS: &[&str] = &["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub live: LiveSettings,
    pub audio: AudioSettings,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveSettings {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Config {
    /// Load defaults, then `path` (any supported extension, optional), then
    /// `LOQA_LIVE_*` environment variables such as `LOQA_LIVE_LIVE__VOICE`
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("live.model", DEFAULT_MODEL)?
            .set_default("live.voice", DEFAULT_VOICE)?
            .set_default("live.system_instruction", DEFAULT_SYSTEM_INSTRUCTION)?
            .set_default("live.endpoint", DEFAULT_ENDPOINT)?
            .set_default("live.connect_timeout_secs", 15i64)?
            .set_default("audio.input_sample_rate", INPUT_SAMPLE_RATE as i64)?
            .set_default("audio.output_sample_rate", OUTPUT_SAMPLE_RATE as i64)?
            .set_default("audio.frame_size", FRAME_SIZE as i64)?
            .set_default("http.bind", "127.0.0.1")?
            .set_default("http.port", 3030i64)?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("LOQA_LIVE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", path))?;

        let mut config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        config.live.api_key = resolve_api_key(config.live.api_key.take(), |name| {
            std::env::var(name).ok()
        });

        Ok(config)
    }

    /// Session parameters handed to the controller on every connect
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.live.model.clone(),
            voice: self.live.voice.clone(),
            system_instruction: self.live.system_instruction.clone(),
            endpoint: self.live.endpoint.clone(),
            api_key: self.live.api_key.clone(),
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            frame_size: self.audio.frame_size,
            connect_timeout: Duration::from_secs(self.live.connect_timeout_secs),
            input_device: self.audio.input_device.clone(),
            output_device: self.audio.output_device.clone(),
            ..SessionConfig::default()
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http.bind, self.http.port)
    }
}

/// Configured key if non-empty, otherwise the first non-empty fallback var
pub fn resolve_api_key<F>(configured: Option<String>, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    configured
        .filter(|key| !key.trim().is_empty())
        .or_else(|| {
            API_KEY_VARS
                .iter()
                .filter_map(|name| lookup(name))
                .find(|key| !key.trim().is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_key_wins() {
        let key = resolve_api_key(Some("from-file".into()), |_| Some("from-env".into()));
        assert_eq!(key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_fallback_order() {
        let key = resolve_api_key(None, |name| match name {
            "API_KEY" => Some("generic".into()),
            _ => None,
        });
        assert_eq!(key.as_deref(), Some("generic"));

        let key = resolve_api_key(Some("  ".into()), |name| match name {
            "GEMINI_API_KEY" => Some("gemini".into()),
            "API_KEY" => Some("generic".into()),
            _ => None,
        });
        assert_eq!(key.as_deref(), Some("gemini"));
    }

    #[test]
    fn test_no_key_anywhere() {
        assert_eq!(resolve_api_key(None, |_| None), None);
        assert_eq!(resolve_api_key(None, |_| Some(String::new())), None);
    }
}
