//! Per-call session record.

use serde::Serialize;
use tracing::info;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Closed)
    }
}

/// Mutable state of the single active call.
///
/// Only the session controller and its inbound handlers write to this record.
#[derive(Serialize, Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Human-readable status line shown to the candidate.
    pub status_message: String,
    pub muted: bool,
    /// Latest loudness estimate of the microphone, `0..=ceiling`.
    pub volume: f32,
    /// Set once the transcript e-mail tool call has been answered.
    pub transcript_sent: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            status_message: "Initializing connection...".to_string(),
            muted: false,
            volume: 0.0,
            transcript_sent: false,
        }
    }

    pub fn transition(&mut self, status: SessionStatus, message: impl Into<String>) {
        let message = message.into();
        info!(from = ?self.status, to = ?status, %message, "Session status changed");
        self.status = status;
        self.status_message = message;
    }

    /// Marks the session as failed. The first failure message wins.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status != SessionStatus::Error {
            self.transition(SessionStatus::Error, message);
        }
    }

    /// Moves to `Closed` unless the session already failed.
    pub fn close(&mut self, message: impl Into<String>) {
        if self.status != SessionStatus::Error {
            self.transition(SessionStatus::Closed, message);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
