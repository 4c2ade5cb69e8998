//! Duplex transport to the remote Live endpoint

pub mod connector;
pub mod events;
pub mod gemini;
pub mod messages;

pub use connector::{LiveConnector, LiveTransport, SendStatus};
pub use events::{AudioChunk, ServerPayload, TransportEvent};
pub use gemini::{GeminiLiveConnector, GeminiLiveTransport};
