pub mod capture;
pub mod codec;
pub mod device;
pub mod playback;
pub mod resample;
pub mod simulated;

#[cfg(feature = "cpal-audio")]
pub mod cpal_backend;

pub use capture::{CapturePipeline, FrameAccumulator};
pub use codec::{decode_chunk, encode_frame, ChunkDecoder, PlayableBuffer};
pub use device::{
    CaptureConfig, CapturedFrame, DeviceFactory, InputDevice, OnEnded, OutputConfig,
    OutputDevice, PlaybackClock, VoiceId,
};
pub use playback::{PlaybackEvent, PlaybackScheduler, ScheduledPlayback};
pub use resample::StreamResampler;
pub use simulated::{SimulatedDeviceFactory, SimulatedInput, SimulatedMicrophone, SimulatedOutput};

#[cfg(feature = "cpal-audio")]
pub use cpal_backend::{CpalDeviceFactory, CpalInput, CpalOutput};
