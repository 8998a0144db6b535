pub mod agent;
pub mod session_state;
pub mod tools;

/// Represents commands the user issues to a running voice session.
///
/// This enum is the primary API for decoupling the session's event loop from
/// whatever surface collects user input (a terminal, a hotkey, a signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Flip the microphone mute flag. Takes effect on the next captured frame.
    ToggleMute,
    /// End the session and release every audio and network resource.
    End,
}
