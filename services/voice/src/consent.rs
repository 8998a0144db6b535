//! Recording consent gate.
//!
//! A session cannot be started without a [`Consent`], and the only ways to get
//! one are answering the terminal prompt or passing `--accept-recording`.

use anyhow::Context;
use std::io::{BufRead, Write};
use tracing::info;

/// Proof that the candidate agreed to be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consent {
    _private: (),
}

impl Consent {
    /// Consent given up front on the command line.
    pub fn pre_accepted() -> Self {
        info!("Recording consent given on the command line");
        Self { _private: () }
    }
}

pub fn consent_notice(recipient: &str) -> String {
    format!(
        "This conversation is recorded. Your microphone audio is streamed to an AI \
         agent, and a transcript with the agent's analysis is e-mailed to {recipient} \
         when the session ends.\nDo you agree to be recorded? [y/N] "
    )
}

/// Shows the notice on `output` and reads one answer from `input`.
///
/// Returns `None` unless the answer is `y` or `yes`.
pub fn request_consent<R: BufRead, W: Write>(
    mut input: R,
    mut output: W,
    recipient: &str,
) -> anyhow::Result<Option<Consent>> {
    output
        .write_all(consent_notice(recipient).as_bytes())
        .context("Failed to write consent prompt")?;
    output.flush().context("Failed to flush consent prompt")?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("Failed to read consent answer")?;

    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => {
            info!("Recording consent accepted");
            Ok(Some(Consent { _private: () }))
        }
        _ => {
            info!("Recording consent declined");
            Ok(None)
        }
    }
}
