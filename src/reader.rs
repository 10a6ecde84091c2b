//! A blocking byte source that behaves as if it were cancellable.
//!
//! The source is owned by one background thread that performs every call into it.
//! Foreground reads hand that thread a request and wait on the reply or on the
//! cancellation token, whichever comes first. An abandoned request is never
//! aborted: the worker finishes it and the bytes are kept as a leftover buffer
//! that the next read drains before anything else happens.

use crate::cancel::{CancelToken, Cancelled, Reason};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use thiserror::Error;
use tracing::trace;

/// Number of bytes requested from the source per fetch when reading lines.
const LINE_CHUNK: usize = 4096;

/// Errors produced by [`CancellableReader`] itself, as opposed to the source.
///
/// They travel inside [`io::Error`]; use [`ReadError::from_io`] to recover them.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("cannot claim a read in process")]
    Busy,
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("reader worker is gone")]
    WorkerGone,
}

impl ReadError {
    /// Returns the reader error wrapped by `err`, if any.
    pub fn from_io(err: &io::Error) -> Option<&ReadError> {
        err.get_ref()?.downcast_ref::<ReadError>()
    }
}

impl From<ReadError> for io::Error {
    fn from(err: ReadError) -> Self {
        let kind = match &err {
            ReadError::Busy => io::ErrorKind::ResourceBusy,
            ReadError::Cancelled(Cancelled {
                reason: Reason::DeadlineExceeded,
            }) => io::ErrorKind::TimedOut,
            ReadError::Cancelled(_) => io::ErrorKind::Other,
            ReadError::WorkerGone => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}

/// Terminal condition recorded once and replayed after the leftover buffer drains.
#[derive(Debug, Clone)]
enum Terminal {
    Eof,
    Failed { kind: io::ErrorKind, message: String },
}

impl Terminal {
    fn from_error(err: &io::Error) -> Self {
        Terminal::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn replay(&self) -> io::Result<usize> {
        match self {
            Terminal::Eof => Ok(0),
            Terminal::Failed { kind, message } => Err(io::Error::new(*kind, message.clone())),
        }
    }
}

#[derive(Default)]
struct State {
    leftover: VecDeque<u8>,
    pending: bool,
    terminal: Option<Terminal>,
}

/// Releases the single read claim when dropped.
struct Claim<'a>(&'a AtomicBool);

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Wraps a blocking [`Read`] so that callers can abandon a read when a
/// [`CancelToken`] fires, without losing or duplicating bytes.
///
/// Only one read may be in progress at a time; a concurrent call fails
/// immediately with [`ReadError::Busy`] instead of queueing.
///
/// Once the token is cancelled, reads are served from bytes that were already
/// fetched (waiting for a stranded fetch if one is still running) and then report
/// end of input. After the source reports end of input or an error, that
/// condition is sticky and returned by every later read once the buffer is empty.
pub struct CancellableReader {
    token: Mutex<CancelToken>,
    claimed: AtomicBool,
    state: Mutex<State>,
    requests: Sender<usize>,
    responses: Receiver<io::Result<Vec<u8>>>,
}

impl CancellableReader {
    /// Start the background worker for `source` and bind the reader to `token`.
    pub fn new<R>(token: CancelToken, source: R) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (requests, request_rx) = bounded(1);
        let (response_tx, responses) = bounded(1);

        thread::Builder::new()
            .name("dialogue-reader".into())
            .spawn(move || fetch_loop(Box::new(source), request_rx, response_tx))?;

        Ok(Self {
            token: Mutex::new(token),
            claimed: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            requests,
            responses,
        })
    }

    /// The token currently bound to the reader.
    pub fn token(&self) -> CancelToken {
        self.token.lock().clone()
    }

    /// Bind a new token, keeping any leftover bytes and pending fetch.
    pub(crate) fn rebind(&self, token: CancelToken) {
        *self.token.lock() = token;
    }

    /// Read one line, including its trailing newline when present.
    ///
    /// Returns `Ok(None)` at end of input. Bytes past the newline stay buffered in
    /// the reader. A cancelled read leaves a partial line buffered as well.
    pub(crate) fn read_line(&self) -> io::Result<Option<Vec<u8>>> {
        let _claim = self.claim()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        loop {
            if let Some(pos) = state.leftover.iter().position(|&b| b == b'\n') {
                return Ok(Some(state.leftover.drain(..=pos).collect()));
            }

            if self.fetch(state, LINE_CHUNK)? {
                continue;
            }

            return match &state.terminal {
                Some(Terminal::Eof) if !state.leftover.is_empty() => {
                    Ok(Some(state.leftover.drain(..).collect()))
                }
                Some(terminal) => terminal.replay().map(|_| None),
                None => Err(self.cancelled_error()),
            };
        }
    }

    fn claim(&self) -> io::Result<Claim<'_>> {
        self.claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| io::Error::from(ReadError::Busy))?;
        Ok(Claim(&self.claimed))
    }

    fn cancelled_error(&self) -> io::Error {
        let reason = self
            .token()
            .err()
            .map_or(Reason::Cancelled, |c| c.reason);
        ReadError::Cancelled(Cancelled { reason }).into()
    }

    /// Append one more fetch worth of bytes to the leftover buffer.
    ///
    /// Returns `Ok(false)` when no more bytes will arrive for this call: the
    /// source is terminal, or the token is cancelled with nothing in flight.
    fn fetch(&self, state: &mut State, len: usize) -> io::Result<bool> {
        let token = self.token();

        if !state.pending {
            if state.terminal.is_some() || token.is_cancelled() {
                return Ok(false);
            }
            self.requests
                .send(len)
                .map_err(|_| io::Error::from(ReadError::WorkerGone))?;
            state.pending = true;
            trace!(len, "requested fetch from source");
        }

        let response = if token.is_cancelled() {
            // A stranded fetch is drained even after cancellation so its bytes survive.
            self.responses.recv()
        } else {
            select! {
                recv(self.responses) -> response => response,
                recv(token.done()) -> _ => {
                    trace!("read abandoned, fetch left running");
                    return Err(self.cancelled_error());
                }
            }
        };
        state.pending = false;

        match response {
            Ok(Ok(bytes)) if !bytes.is_empty() => {
                trace!(n = bytes.len(), "fetch completed");
                state.leftover.extend(bytes);
                Ok(true)
            }
            Ok(Ok(_)) => {
                trace!("source reached end of input");
                state.terminal = Some(Terminal::Eof);
                Ok(false)
            }
            Ok(Err(err)) => {
                trace!(error = %err, "source failed");
                state.terminal = Some(Terminal::from_error(&err));
                Err(err)
            }
            Err(_) => {
                let err = io::Error::from(ReadError::WorkerGone);
                state.terminal = Some(Terminal::from_error(&err));
                Err(err)
            }
        }
    }

    fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _claim = self.claim()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.leftover.is_empty() && !self.fetch(state, buf.len())? {
            return match &state.terminal {
                Some(terminal) => terminal.replay(),
                None => Ok(0),
            };
        }

        state.leftover.read(buf)
    }
}

impl Read for CancellableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf)
    }
}

impl Read for &CancellableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf)
    }
}

/// Body of the background worker: the only code that ever touches the source.
fn fetch_loop(
    mut source: Box<dyn Read + Send>,
    requests: Receiver<usize>,
    responses: Sender<io::Result<Vec<u8>>>,
) {
    for len in requests.iter() {
        let mut buf = vec![0; len];
        let result = loop {
            match source.read(&mut buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        let terminal = !matches!(result, Ok(n) if n > 0);
        let result = result.map(|n| {
            buf.truncate(n);
            buf
        });

        if responses.send(result).is_err() || terminal {
            break;
        }
    }
    trace!("reader worker exiting");
}
