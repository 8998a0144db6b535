//! Gemini Live Client Crate
//!
//! A minimal client for the Gemini Live `BidiGenerateContent` WebSocket API,
//! shaped for a voice session:
//!
//! - `types`: the JSON wire messages.
//! - `protocol`: setup/audio/tool-response construction and inbound parsing.
//! - `transport`: the channel state machine and its I/O task.

pub mod protocol;
pub mod transport;
pub mod types;

pub use protocol::{AudioChunk, InboundEvent, SessionSetup};
pub use transport::{ConnectionError, Endpoint, Transport, TransportState};
