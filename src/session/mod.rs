//! Live session management
//!
//! This module provides the `SessionController` that manages:
//! - Device acquisition before every connect
//! - Capture → transport and transport → playback wiring
//! - The connected/speaking state observed by the UI
//! - Session statistics

pub mod config;
mod controller;
mod stats;

pub use config::{Modality, SessionConfig};
pub use controller::{Phase, SessionController, SessionSnapshot, SessionState, Toggle};
pub use stats::{CounterSnapshot, SessionCounters, SessionStats};
