use base64::Engine;
use serde::{Deserialize, Serialize};

use super::events::{AudioChunk, ServerPayload};
use crate::error::{LiveError, Result};
use crate::session::SessionConfig;

/// First client message: selects the model and configures the session
#[derive(Debug, Serialize, Deserialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64 payload with its mime type
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl SetupMessage {
    pub fn from_config(config: &SessionConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        let system_instruction = if config.system_instruction.is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                    inline_data: None,
                }],
            })
        };

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec![config.modality.as_str().to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction,
            },
        }
    }
}

/// Streaming microphone input
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

impl RealtimeInputMessage {
    pub fn pcm(pcm: &[u8], sample_rate: u32) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: pcm_mime_type(sample_rate),
                    data: base64::engine::general_purpose::STANDARD.encode(pcm),
                }],
            },
        }
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Sample rate declared in a mime type such as `audio/pcm;rate=24000`
pub fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Any message sent by the server; unknown fields are ignored
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| LiveError::transport(format!("malformed server message: {}", e)))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

impl ServerContent {
    /// Concatenate every audio part of the model turn into one chunk
    ///
    /// Fails with a decode error if any audio part is not valid base64.
    pub fn audio_chunk(&self, default_rate: u32) -> Result<Option<AudioChunk>> {
        let Some(turn) = &self.model_turn else {
            return Ok(None);
        };

        let mut data = Vec::new();
        let mut sample_rate = None;

        for blob in turn.parts.iter().filter_map(|part| part.inline_data.as_ref()) {
            if !blob.mime_type.starts_with("audio/") {
                continue;
            }
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&blob.data)
                .map_err(|e| LiveError::decode(format!("invalid base64 audio: {}", e)))?;
            sample_rate.get_or_insert(mime_sample_rate(&blob.mime_type).unwrap_or(default_rate));
            data.extend_from_slice(&bytes);
        }

        Ok(sample_rate.map(|sample_rate| AudioChunk { data, sample_rate }))
    }

    /// Build the payload, dropping undecodable audio but keeping the flags
    pub fn into_payload(self, default_rate: u32) -> (ServerPayload, Option<LiveError>) {
        let (audio, error) = match self.audio_chunk(default_rate) {
            Ok(audio) => (audio, None),
            Err(e) => (None, Some(e)),
        };

        (
            ServerPayload {
                audio,
                interrupted: self.interrupted,
                turn_complete: self.turn_complete,
            },
            error,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let config = SessionConfig {
            voice: "Puck".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(SetupMessage::from_config(&config)).unwrap();

        assert_eq!(
            json["setup"]["model"],
            format!("models/{}", crate::session::config::DEFAULT_MODEL)
        );
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            crate::session::config::DEFAULT_SYSTEM_INSTRUCTION
        );
    }

    #[test]
    fn test_setup_keeps_qualified_model_name() {
        let config = SessionConfig {
            model: "models/custom".to_string(),
            system_instruction: String::new(),
            ..Default::default()
        };
        let json = serde_json::to_value(SetupMessage::from_config(&config)).unwrap();

        assert_eq!(json["setup"]["model"], "models/custom");
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_realtime_input_encoding() {
        let msg = RealtimeInputMessage::pcm(&[1, 0, 255, 255], 16000);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"realtimeInput\""));
        assert!(json.contains("\"mimeType\":\"audio/pcm;rate=16000\""));
        assert!(json.contains("\"data\":\"AQD//w==\""));
    }

    #[test]
    fn test_mime_sample_rate() {
        assert_eq!(mime_sample_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(mime_sample_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(mime_sample_rate("audio/pcm"), None);
        assert_eq!(mime_sample_rate("audio/pcm;rate=abc"), None);
    }

    #[test]
    fn test_parse_setup_complete() {
        let msg = ServerMessage::parse(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.server_content.is_none());
    }

    #[test]
    fn test_parse_audio_parts_are_concatenated() {
        let json = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQA="}},
                        {"text": "ignored"},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AgA="}}
                    ]
                }
            }
        }"#;

        let content = ServerMessage::parse(json).unwrap().server_content.unwrap();
        let (payload, error) = content.into_payload(16000);

        assert!(error.is_none());
        let audio = payload.audio.unwrap();
        assert_eq!(audio.data, vec![1, 0, 2, 0]);
        assert_eq!(audio.sample_rate, 24000);
        assert!(!payload.interrupted);
    }

    #[test]
    fn test_parse_interrupted_without_audio() {
        let json = r#"{"serverContent": {"interrupted": true}}"#;
        let content = ServerMessage::parse(json).unwrap().server_content.unwrap();
        let (payload, error) = content.into_payload(24000);

        assert!(error.is_none());
        assert!(payload.audio.is_none());
        assert!(payload.interrupted);
    }

    #[test]
    fn test_bad_base64_keeps_interrupt_flag() {
        let json = r#"{
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm", "data": "***"}}]},
                "interrupted": true
            }
        }"#;
        let content = ServerMessage::parse(json).unwrap().server_content.unwrap();
        let (payload, error) = content.into_payload(24000);

        assert!(matches!(error, Some(LiveError::Decode { .. })));
        assert!(payload.audio.is_none());
        assert!(payload.interrupted);
    }

    #[test]
    fn test_default_rate_when_mime_has_none() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm", "data": "AAA="}}]}}}"#;
        let content = ServerMessage::parse(json).unwrap().server_content.unwrap();

        let audio = content.audio_chunk(24000).unwrap().unwrap();
        assert_eq!(audio.sample_rate, 24000);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let msg = ServerMessage::parse(r#"{"usageMetadata": {"totalTokenCount": 12}}"#).unwrap();
        assert!(!msg.is_setup_complete());
        assert!(msg.server_content.is_none());
    }
}
