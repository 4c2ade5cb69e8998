/// One inbound audio chunk (little-endian 16-bit mono PCM)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub sample_rate: u32,
}

/// Content of one inbound message
///
/// Either field may be absent; a payload with neither is a control
/// message and is ignored by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPayload {
    pub audio: Option<AudioChunk>,
    /// The user started speaking over synthesized output
    pub interrupted: bool,
    /// The model finished its turn
    pub turn_complete: bool,
}

impl ServerPayload {
    pub fn audio(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            audio: Some(AudioChunk { data, sample_rate }),
            ..Default::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && !self.interrupted
    }
}

/// Lifecycle of a transport session, delivered in order on one channel
///
/// `Opened` fires at most once and before any `Message`. `Closed` and
/// `Error` are terminal: at most one of them is delivered, last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(ServerPayload),
    Closed,
    Error(String),
}
