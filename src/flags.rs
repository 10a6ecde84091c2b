//! Flag parsing for commands.
//!
//! A command's flags are handled by a [`Flags`] collaborator. The crate ships
//! [`ArghFlags`], which parses with [`argh`] and hands the parsed value to the
//! command's handler through a [`FlagValue`].

use argh::{EarlyExit, FromArgs};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Why flag parsing stopped. Either way the dispatch is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlagError {
    /// Help was requested; carries the rendered usage text.
    #[error("{0}")]
    Help(String),
    /// The arguments were malformed; carries a message for the user.
    #[error("{0}")]
    Invalid(String),
}

/// Flag-parsing collaborator attached to a command.
pub trait Flags: Send {
    /// Parse `args` for the command named `command`.
    ///
    /// Positional tokens must be kept for [`Flags::positionals`].
    fn parse(&mut self, command: &str, args: &[String]) -> Result<(), FlagError>;

    /// Positional tokens left over by the last successful [`Flags::parse`].
    fn positionals(&self) -> &[String];

    /// Put every flag set by the last parse back to its declared default.
    fn reset(&mut self);

    /// Usage text listing the flags, used by the default help formatter.
    fn usage(&self, _command: &str) -> Option<String> {
        None
    }
}

/// An [`argh`] argument struct usable with [`ArghFlags`].
///
/// The struct must collect its positional tokens, typically with
/// `#[argh(positional, greedy)]`, so that sub-command names can be found in them.
pub trait ArghArgs: FromArgs + Send + 'static {
    fn positionals(&self) -> &[String];
}

/// Shared view of the flags parsed for the current dispatch.
///
/// Holds `None` outside of a dispatch, which is the declared default.
pub struct FlagValue<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for FlagValue<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> FlagValue<T> {
    /// Run `f` against the parsed flags, if a dispatch is in progress.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.slot.lock().as_ref())
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> FlagValue<T> {
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

/// [`Flags`] implementation backed by an [`argh`] struct.
pub struct ArghFlags<T> {
    value: FlagValue<T>,
    positionals: Vec<String>,
}

impl<T: ArghArgs> ArghFlags<T> {
    /// Create the collaborator together with the handle its handler reads from.
    pub fn new() -> (Self, FlagValue<T>) {
        let value = FlagValue {
            slot: Arc::new(Mutex::new(None)),
        };
        let flags = Self {
            value: value.clone(),
            positionals: Vec::new(),
        };
        (flags, value)
    }
}

impl<T: ArghArgs> Flags for ArghFlags<T> {
    fn parse(&mut self, command: &str, args: &[String]) -> Result<(), FlagError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match T::from_args(&[command], &args) {
            Ok(parsed) => {
                self.positionals = parsed.positionals().to_vec();
                *self.value.slot.lock() = Some(parsed);
                Ok(())
            }
            Err(EarlyExit { output, status }) => Err(match status {
                Ok(()) => FlagError::Help(output),
                Err(()) => FlagError::Invalid(output),
            }),
        }
    }

    fn positionals(&self) -> &[String] {
        &self.positionals
    }

    fn reset(&mut self) {
        self.value.slot.lock().take();
        self.positionals.clear();
    }

    fn usage(&self, command: &str) -> Option<String> {
        match T::from_args(&[command], &["--help"]) {
            Err(EarlyExit {
                output,
                status: Ok(()),
            }) => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(FromArgs, Debug, Clone, PartialEq)]
    /// repeat the arguments.
    struct Repeat {
        #[argh(option, short = 'n', default = "1")]
        /// number of repetitions.
        times: u32,

        #[argh(switch, short = 'q')]
        /// suppress the trailing newline.
        quiet: bool,

        #[argh(positional, greedy)]
        /// values to repeat.
        rest: Vec<String>,
    }

    impl ArghArgs for Repeat {
        fn positionals(&self) -> &[String] {
            &self.rest
        }
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_sets_value_and_positionals() {
        let (mut flags, value) = ArghFlags::<Repeat>::new();
        assert!(!value.is_set());

        flags
            .parse("repeat", &strings(&["-n", "3", "hello", "world"]))
            .unwrap();

        assert_eq!(flags.positionals(), ["hello", "world"]);
        assert_eq!(value.with(|v| v.map(|r| r.times)), Some(3));
        assert!(!value.get().unwrap().quiet);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let (mut flags, value) = ArghFlags::<Repeat>::new();
        flags
            .parse("repeat", &strings(&["-q", "-n", "7", "x"]))
            .unwrap();
        assert!(value.is_set());

        flags.reset();
        assert_eq!(value.get(), None);
        assert!(flags.positionals().is_empty());

        flags.parse("repeat", &strings(&["y"])).unwrap();
        assert_eq!(
            value.get(),
            Some(Repeat {
                times: 1,
                quiet: false,
                rest: strings(&["y"]),
            })
        );
    }

    #[test]
    fn test_malformed_flag_is_invalid() {
        let (mut flags, value) = ArghFlags::<Repeat>::new();
        let err = flags
            .parse("repeat", &strings(&["-n", "many"]))
            .unwrap_err();
        assert!(matches!(err, FlagError::Invalid(_)));
        assert!(!value.is_set());
    }

    #[test]
    fn test_help_flag_and_usage() {
        let (mut flags, _value) = ArghFlags::<Repeat>::new();
        let err = flags.parse("repeat", &strings(&["--help"])).unwrap_err();
        let FlagError::Help(text) = err else {
            panic!("expected help, got {err:?}");
        };
        assert!(text.contains("Usage: repeat"));
        assert_eq!(flags.usage("repeat"), Some(text));
    }
}
