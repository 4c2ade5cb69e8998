use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::device::{CaptureConfig, OutputConfig, FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::error::{LiveError, Result};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful, quick-witted, and conversational voice assistant. Keep answers concise.";
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Response modality requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    #[default]
    Audio,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Audio => "AUDIO",
        }
    }
}

/// Configuration for a live voice session
///
/// model, modality, voice and system instruction are forwarded to the
/// endpoint untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Unique session identifier, regenerated on every connect
    pub session_id: String,

    /// Target model identifier
    pub model: String,

    pub modality: Modality,

    /// Prebuilt voice name
    pub voice: String,

    pub system_instruction: String,

    /// Live API websocket endpoint
    pub endpoint: String,

    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,

    /// Rate of outbound frames (Live API expects 16kHz)
    pub input_sample_rate: u32,

    /// Rate of inbound chunks unless the payload states otherwise
    pub output_sample_rate: u32,

    /// Samples per outbound frame
    pub frame_size: usize,

    /// Upper bound on waiting for the session to open
    pub connect_timeout: Duration,

    pub input_device: Option<String>,

    pub output_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: new_session_id(),
            model: DEFAULT_MODEL.to_string(),
            modality: Modality::Audio,
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            connect_timeout: Duration::from_secs(15),
            input_device: None,
            output_device: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(LiveError::config("model must not be empty"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(LiveError::config("endpoint must not be empty"));
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(LiveError::config("sample rates must be positive"));
        }
        if self.frame_size == 0 {
            return Err(LiveError::config("frame_size must be positive"));
        }
        Ok(())
    }

    /// Copy of this config for a new connection attempt
    pub fn for_new_session(&self) -> Self {
        Self {
            session_id: new_session_id(),
            ..self.clone()
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            frame_size: self.frame_size,
            device_name: self.input_device.clone(),
        }
    }

    pub fn output_config(&self) -> OutputConfig {
        OutputConfig {
            device_name: self.output_device.clone(),
        }
    }
}

fn new_session_id() -> String {
    format!("live-{}", uuid::Uuid::new_v4())
}
