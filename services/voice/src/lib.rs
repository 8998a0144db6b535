//! OCTN Voice Client Library Crate
//!
//! The audio half of a voice session with a Gemini Live agent: PCM coding,
//! microphone capture, gapless playback, host device binding and the session
//! controller that wires them to the live channel. The `octn-voice` binary is
//! a thin terminal front end around this library.

pub mod capture;
pub mod codec;
pub mod commands;
pub mod config;
pub mod consent;
pub mod device;
pub mod playback;
pub mod session;
