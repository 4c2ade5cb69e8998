pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use audio::{
    CaptureConfig, CapturePipeline, CapturedFrame, DeviceFactory, InputDevice, OutputConfig,
    OutputDevice, PlayableBuffer, PlaybackClock, PlaybackEvent, PlaybackScheduler,
    SimulatedDeviceFactory,
};
pub use config::Config;
pub use error::{LiveError, Result};
pub use http::{create_router, AppState};
pub use session::{
    Phase, SessionConfig, SessionController, SessionSnapshot, SessionState, SessionStats, Toggle,
};
pub use transport::{
    GeminiLiveConnector, LiveConnector, LiveTransport, SendStatus, ServerPayload, TransportEvent,
};

#[cfg(feature = "cpal-audio")]
pub use audio::CpalDeviceFactory;
