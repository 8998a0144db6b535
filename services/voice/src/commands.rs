//! Terminal commands for a running session.
//!
//! Lines are read on a plain OS thread, outside the runtime's blocking pool. A
//! read parked on stdin cannot be cancelled, and the process must still be able
//! to exit while one is pending.

use octn_core::Control;
use std::io::BufRead;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Control(Control),
    Blank,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    match line.trim().to_ascii_lowercase().as_str() {
        "m" | "mute" => Command::Control(Control::ToggleMute),
        "q" | "quit" | "end" => Command::Control(Control::End),
        "" => Command::Blank,
        other => Command::Unknown(other.to_string()),
    }
}

/// Forwards commands read from `input` to `controls` until the input ends or
/// the session stops listening. The thread never needs to be joined.
pub fn spawn_reader<R>(input: R, controls: mpsc::Sender<Control>) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else {
                    break;
                };
                let control = match parse_command(&line) {
                    Command::Control(control) => control,
                    Command::Blank => continue,
                    Command::Unknown(other) => {
                        println!(
                            "Unknown command '{other}'. Use 'm' to toggle mute or 'q' to end."
                        );
                        continue;
                    }
                };
                if controls.blocking_send(control).is_err() {
                    break;
                }
            }
            debug!("Command reader stopped");
        })
}
