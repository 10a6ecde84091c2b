use crate::builtin;
use crate::cancel::{CancelToken, Cancelled, Reason};
use crate::command::Command;
use crate::config::Config;
use crate::error::{Closed, RegistrationError, SessionError};
use crate::io_adapters::Output;
use crate::reader::CancellableReader;
use crate::registry::{Commands, Registry};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handles input whose first token names no registered command.
///
/// Receives a child of the dialogue's token and every token of the line, command
/// name included.
pub type NotFound = Arc<dyn Fn(&CancelToken, &[String]) -> anyhow::Result<()> + Send + Sync>;

/// Renders help for one command name, or for all commands when the name is empty.
pub type HelpFormatter = Arc<dyn Fn(&str, &Commands) -> String + Send + Sync>;

/// Derives the token handed to a command from the dialogue's token and the command name.
pub type CommandContext = Arc<dyn Fn(&CancelToken, &str) -> CancelToken + Send + Sync>;

/// Lifecycle of a [`Dialogue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Closing,
    Closed,
}

impl Phase {
    fn is_active(self) -> bool {
        matches!(self, Phase::Running | Phase::Closing)
    }
}

struct State {
    registry: Registry,
    phase: Phase,
    token: CancelToken,
    reader: Arc<CancellableReader>,
    // One-shot acknowledgement per pending close or shutdown request.
    acks: Vec<Sender<()>>,
}

struct Inner {
    config: Config,
    output: Output,
    not_found: Option<NotFound>,
    format_help: HelpFormatter,
    command_context: Option<CommandContext>,
    state: Mutex<State>,
}

/// An interactive, line-oriented command session.
///
/// [`Dialogue::open`] prompts, reads a line, resolves it against the registered
/// command trees and runs the matched chain, over and over until the session is
/// closed or fails. The handle is cheap to clone so that [`Dialogue::close`] and
/// [`Dialogue::shutdown`] can be called from other threads.
///
/// # Examples
/// ```
/// use line_dialogue::{Command, Dialogue, MemWriter};
/// use std::io::Write;
///
/// let out = MemWriter::new();
/// let dialogue = Dialogue::builder("hello world\nquit\n".as_bytes(), out.clone())
///     .quit_command("quit")
///     .build()
///     .unwrap();
///
/// let sink = dialogue.output();
/// dialogue
///     .register_commands([Command::new("hello").exec(move |_, args| {
///         writeln!(sink.clone(), "hi {}", args.join(" "))?;
///         Ok(())
///     })])
///     .unwrap();
///
/// assert!(dialogue.open().is_ok());
/// assert_eq!(out.contents(), "hi world\n");
/// ```
#[derive(Clone)]
pub struct Dialogue {
    inner: Arc<Inner>,
}

enum Source {
    Raw(Box<dyn Read + Send>),
    Reader(Arc<CancellableReader>),
}

/// Configures and creates a [`Dialogue`].
pub struct DialogueBuilder {
    source: Source,
    output: Output,
    config: Config,
    not_found: Option<NotFound>,
    format_help: Option<HelpFormatter>,
    command_context: Option<CommandContext>,
}

impl DialogueBuilder {
    fn new(source: Source, output: Output) -> Self {
        Self {
            source,
            output,
            config: Config::default(),
            not_found: None,
            format_help: None,
            command_context: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn help_command(mut self, name: impl Into<String>) -> Self {
        self.config.help_command = Some(name.into());
        self
    }

    pub fn quit_command(mut self, name: impl Into<String>) -> Self {
        self.config.quit_command = Some(name.into());
        self
    }

    pub fn command_not_found<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CancelToken, &[String]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.not_found = Some(Arc::new(handler));
        self
    }

    pub fn format_help<F>(mut self, format: F) -> Self
    where
        F: Fn(&str, &Commands) -> String + Send + Sync + 'static,
    {
        self.format_help = Some(Arc::new(format));
        self
    }

    pub fn command_context<F>(mut self, derive: F) -> Self
    where
        F: Fn(&CancelToken, &str) -> CancelToken + Send + Sync + 'static,
    {
        self.command_context = Some(Arc::new(derive));
        self
    }

    /// Create the dialogue, starting the reader's background worker if needed.
    pub fn build(self) -> io::Result<Dialogue> {
        let (token, reader) = match self.source {
            Source::Raw(source) => {
                let token = CancelToken::new();
                let reader = CancellableReader::new(token.clone(), source)?;
                (token, Arc::new(reader))
            }
            Source::Reader(reader) => (reader.token(), reader),
        };

        Ok(Dialogue {
            inner: Arc::new(Inner {
                config: self.config,
                output: self.output,
                not_found: self.not_found,
                format_help: self
                    .format_help
                    .unwrap_or_else(|| Arc::new(default_format_help) as HelpFormatter),
                command_context: self.command_context,
                state: Mutex::new(State {
                    registry: Registry::default(),
                    phase: Phase::Idle,
                    token,
                    reader,
                    acks: Vec::new(),
                }),
            }),
        })
    }
}

/// Default session help: every command's short help in name order, or one
/// command's detailed help.
pub fn default_format_help(name: &str, commands: &Commands) -> String {
    if name.is_empty() {
        return commands.values().map(|c| c.format_help(false)).collect();
    }
    match commands.get(name) {
        Some(command) => command.format_help(true),
        None => "command not found\n".to_string(),
    }
}

/// Finalizes the session if `open` unwinds out of a panicking handler, so that
/// waiting `close` callers are released.
struct PanicGuard<'a>(&'a Dialogue);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.0.inner.state.lock();
            state.acks.clear();
            state.token.cancel();
            state.phase = Phase::Closed;
        }
    }
}

impl Dialogue {
    /// Start building a dialogue reading from `source` and writing to `sink`.
    pub fn builder<R, W>(source: R, sink: W) -> DialogueBuilder
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        DialogueBuilder::new(Source::Raw(Box::new(source)), Output::new(sink))
    }

    /// Start building a dialogue on top of an existing reader, e.g. one taken from
    /// a previous dialogue with [`Dialogue::reader`]. Its leftover bytes are read first.
    pub fn with_reader<W>(reader: Arc<CancellableReader>, sink: W) -> DialogueBuilder
    where
        W: Write + Send + 'static,
    {
        DialogueBuilder::new(Source::Reader(reader), Output::new(sink))
    }

    /// Register root commands, replacing any with the same name.
    ///
    /// Every command is validated first; nothing is registered if one fails. While
    /// the dialogue is running the call does nothing and returns `Ok(())`.
    pub fn register_commands<I>(&self, commands: I) -> Result<(), RegistrationError>
    where
        I: IntoIterator,
        I::Item: Into<Arc<Command>>,
    {
        let mut state = self.inner.state.lock();
        if state.phase.is_active() {
            debug!("dialogue is running, registration ignored");
            return Ok(());
        }

        let commands: Vec<Arc<Command>> = commands.into_iter().map(Into::into).collect();
        commands.iter().try_for_each(|c| c.validate())?;
        for command in commands {
            debug!(command = command.name(), "registered command");
            state.registry.insert(command);
        }
        Ok(())
    }

    /// Run the prompt / read / dispatch loop until the dialogue ends.
    ///
    /// Returns `Ok(())` when the dialogue was closed: by [`Dialogue::close`],
    /// [`Dialogue::shutdown`], or a handler returning [`Closed`]. Any other end is
    /// an error.
    ///
    /// A dialogue can be opened again after it ends. The reader is reused, so bytes
    /// buffered during the previous run (for instance the rest of a line read just
    /// before closing) are read first.
    pub fn open(&self) -> Result<(), SessionError> {
        let (token, reader) = self.start()?;
        let _guard = PanicGuard(self);
        info!(prefix = %self.inner.config.prefix, "dialogue opened");

        let mut output = self.inner.output.clone();
        loop {
            // Close requests are serviced between lines, never mid-read.
            if self.acknowledge_close() {
                info!("dialogue closed");
                return Ok(());
            }

            if let Err(err) = self.turn(&token, &reader, &mut output) {
                return self.finish(err);
            }
        }
    }

    /// Close the dialogue right away: cancel any in-flight read and wait for the
    /// loop to stop. A running handler is not interrupted unless it watches its token.
    pub fn close(&self) {
        let Some((ack, token)) = self.request_close() else {
            return;
        };
        token.cancel();
        let _ = ack.recv();
    }

    /// Stop the dialogue after the current read or command finishes.
    ///
    /// If `deadline` is cancelled first, the dialogue is closed as with
    /// [`Dialogue::close`] and the deadline's error is returned.
    pub fn shutdown(&self, deadline: &CancelToken) -> Result<(), Cancelled> {
        let Some((ack, token)) = self.request_close() else {
            return Ok(());
        };

        select! {
            recv(ack) -> _ => {
                token.cancel();
                Ok(())
            }
            recv(deadline.done()) -> _ => {
                warn!("shutdown deadline reached, cancelling the dialogue");
                token.cancel();
                let _ = ack.recv();
                Err(deadline.err().unwrap_or(Cancelled {
                    reason: Reason::Cancelled,
                }))
            }
        }
    }

    /// The underlying reader, or `None` while the dialogue is running.
    ///
    /// After a close it can be drained of buffered bytes or handed to
    /// [`Dialogue::with_reader`]. Only one read may be in progress at a time, so do
    /// not keep reading from it once the dialogue is opened again.
    pub fn reader(&self) -> Option<Arc<CancellableReader>> {
        let state = self.inner.state.lock();
        if state.phase.is_active() {
            return None;
        }
        Some(Arc::clone(&state.reader))
    }

    /// Visit every registered command in name order.
    pub fn visit(&self, mut f: impl FnMut(&Command)) {
        let commands = self.inner.state.lock().registry.snapshot();
        for command in commands.values() {
            f(command);
        }
    }

    /// Handle on the dialogue's output, for handlers to write to.
    pub fn output(&self) -> Output {
        self.inner.output.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    fn start(&self) -> Result<(CancelToken, Arc<CancellableReader>), SessionError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if state.phase.is_active() {
            return Err(SessionError::AlreadyRunning);
        }
        if state.registry.is_empty() {
            return Err(SessionError::NoCommands);
        }
        self.synthesize_commands(&mut state.registry);

        // A cancelled token means the dialogue is being reopened.
        if state.token.is_cancelled() {
            state.token = CancelToken::new();
        }
        state.reader.rebind(state.token.clone());
        state.phase = Phase::Running;

        Ok((state.token.clone(), Arc::clone(&state.reader)))
    }

    fn synthesize_commands(&self, registry: &mut Registry) {
        let config = &self.inner.config;

        if let Some(name) = config.quit_command.as_deref().filter(|n| !n.is_empty()) {
            if !registry.contains(name) {
                registry.insert(Arc::new(builtin::quit(name)));
            }
        }

        if let Some(name) = config.help_command.as_deref().filter(|n| !n.is_empty()) {
            if !registry.contains(name) {
                let inner = Arc::downgrade(&self.inner);
                let render = move |target: &str| match inner.upgrade() {
                    Some(inner) => {
                        let commands = inner.state.lock().registry.snapshot();
                        (inner.format_help)(target, &commands)
                    }
                    None => String::new(),
                };
                registry.insert(Arc::new(builtin::help(name, render, self.inner.output.clone())));
            }
        }
    }

    /// One prompt, one line, one dispatch.
    fn turn(
        &self,
        token: &CancelToken,
        reader: &CancellableReader,
        output: &mut Output,
    ) -> Result<(), SessionError> {
        output.write_all(self.inner.config.prefix.as_bytes())?;
        output.flush()?;

        let line = reader.read_line()?.ok_or(SessionError::EndOfInput)?;
        let line = String::from_utf8_lossy(&line);
        let fields: Vec<String> = line.split_whitespace().map(str::to_owned).collect();

        match fields.split_first() {
            Some((name, args)) => self
                .dispatch(token, name, args, &fields)
                .map_err(SessionError::Handler),
            None => Ok(()),
        }
    }

    fn dispatch(
        &self,
        token: &CancelToken,
        name: &str,
        args: &[String],
        fields: &[String],
    ) -> anyhow::Result<()> {
        let command = self.inner.state.lock().registry.get(name);
        let Some(command) = command else {
            debug!(command = name, "command not found");
            return match &self.inner.not_found {
                Some(not_found) => not_found(&token.child(), fields),
                None => self.default_not_found(name),
            };
        };

        // Handlers get a child so they can never cancel the dialogue itself.
        let token = match &self.inner.command_context {
            Some(derive) => derive(token, name),
            None => token.child(),
        };

        let mut chain = match command.parse(args) {
            Ok(chain) => chain,
            Err(err) => {
                // Malformed flags never end the dialogue.
                debug!(command = name, error = %err, "flag parsing failed, dispatch skipped");
                let mut output = self.inner.output.clone();
                output.write_all(err.to_string().as_bytes())?;
                return Ok(());
            }
        };

        debug!(command = name, depth = chain.len(), "dispatching");
        chain.advance_exec(0, Some(token))
    }

    fn default_not_found(&self, name: &str) -> anyhow::Result<()> {
        let commands = self.inner.state.lock().registry.snapshot();
        let mut output = self.inner.output.clone();
        writeln!(output, "Command: {name} not found")?;
        output.write_all((self.inner.format_help)("", &commands).as_bytes())?;
        Ok(())
    }

    fn request_close(&self) -> Option<(Receiver<()>, CancelToken)> {
        let mut state = self.inner.state.lock();
        if !state.phase.is_active() {
            return None;
        }

        let (ack, acked) = bounded(1);
        state.acks.push(ack);
        state.phase = Phase::Closing;
        Some((acked, state.token.clone()))
    }

    /// Acknowledge every pending close request and end the run, if there are any.
    fn acknowledge_close(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.acks.is_empty() {
            return false;
        }
        Self::end_locked(&mut state);
        true
    }

    /// End the run after `err`. Pending close requests take precedence over the
    /// error, as does a handler returning [`Closed`].
    fn finish(&self, err: SessionError) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        let requested = !state.acks.is_empty();
        Self::end_locked(&mut state);

        match err {
            _ if requested => {
                info!("dialogue closed");
                Ok(())
            }
            SessionError::Handler(e) if e.is::<Closed>() => {
                info!("dialogue closed by command");
                Ok(())
            }
            err => {
                warn!(error = %err, "dialogue stopped");
                Err(err)
            }
        }
    }

    fn end_locked(state: &mut State) {
        for ack in state.acks.drain(..) {
            let _ = ack.send(());
        }
        state.token.cancel();
        state.phase = Phase::Closed;
    }
}
