use std::io;
use thiserror::Error;

/// A command that cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("dialogue: command has no name")]
    NoName,
    #[error("dialogue: {0} has no exec function")]
    NoExec(String),
    #[error("dialogue: {parent} has more than one sub-command named {name}")]
    DuplicateSubcommand { parent: String, name: String },
}

/// Sentinel a handler returns to end the session the same way [`crate::Dialogue::close`] does.
///
/// ```
/// use line_dialogue::{Closed, Command};
/// let quit = Command::new("bye").exec(|_, _| Err(Closed.into()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dialogue: dialogue closed")]
pub struct Closed;

/// Why [`crate::Dialogue::open`] stopped without being closed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dialogue: no commands")]
    NoCommands,
    #[error("dialogue: already running")]
    AlreadyRunning,
    #[error("dialogue: i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("dialogue: end of input")]
    EndOfInput,
    #[error("dialogue: handler failed: {0:#}")]
    Handler(anyhow::Error),
}
