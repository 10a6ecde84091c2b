//! An embeddable, line-oriented command dialogue.
//!
//! A [`Dialogue`] reads lines from any byte source, resolves the first token
//! against a set of registered command trees and runs the matched commands leaf
//! first through a [`CallChain`]. Reads go through a [`CancellableReader`], so a
//! blocked read can be abandoned by [`Dialogue::close`] without losing the bytes
//! it eventually produces, while [`Dialogue::shutdown`] lets the current
//! transaction finish unless its deadline runs out first.
//!
//! Commands are plain values built with [`Command`]; their flags are parsed by a
//! [`Flags`] collaborator, usually [`ArghFlags`] around an [`argh`] struct.

mod builtin;
pub mod cancel;
pub mod chain;
pub mod command;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod flags;
pub mod io_adapters;
pub mod reader;
mod registry;

pub use cancel::{CancelToken, Cancelled, Reason};
pub use chain::{CallChain, Link};
pub use command::Command;
pub use config::Config;
pub use dialogue::{Dialogue, DialogueBuilder, Phase, default_format_help};
pub use error::{Closed, RegistrationError, SessionError};
pub use flags::{ArghArgs, ArghFlags, FlagError, FlagValue, Flags};
pub use io_adapters::{MemWriter, Output};
pub use reader::{CancellableReader, ReadError};
pub use registry::Commands;
