//! Explicit cancellation handles.
//!
//! A [`CancelToken`] is passed to every place that may block: reads, command handlers
//! and shutdown deadlines. Nothing polls it implicitly; callers either check
//! [`CancelToken::is_cancelled`] at their own checkpoints or wait on
//! [`CancelToken::done`] inside a `crossbeam_channel::select!`.

use crossbeam_channel::{Receiver, Sender, after, bounded, select};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// [`CancelToken::cancel`] was called, directly or on a parent.
    Cancelled,
    /// The timer installed by [`CancelToken::timeout`] fired.
    DeadlineExceeded,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Reason::Cancelled => "operation cancelled",
            Reason::DeadlineExceeded => "deadline exceeded",
        })
    }
}

/// Error value reported by a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Cancelled {
    pub reason: Reason,
}

struct Inner {
    done: Receiver<()>,
    // Dropping the sender disconnects `done`, waking every receiver at once.
    trigger: Mutex<Option<Sender<()>>>,
    reason: OnceLock<Reason>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self, reason: Reason) {
        if self.reason.set(reason).is_err() {
            return;
        }
        self.trigger.lock().take();

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }
}

/// Cloneable cancellation handle. All clones observe the same state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a root token that stays live until [`CancelToken::cancel`] is called.
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                done: rx,
                trigger: Mutex::new(Some(tx)),
                reason: OnceLock::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel the token and all of its children. Later calls are no-ops.
    pub fn cancel(&self) {
        self.inner.cancel(Reason::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// The cancellation error, or `None` while the token is live.
    pub fn err(&self) -> Option<Cancelled> {
        self.inner
            .reason
            .get()
            .map(|&reason| Cancelled { reason })
    }

    /// A channel that becomes ready (disconnected) once the token is cancelled.
    ///
    /// Meant for `select!`; it never carries a message.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    /// Block the calling thread until the token is cancelled.
    pub fn wait(&self) {
        let _ = self.inner.done.recv();
    }

    /// Derive a token that is cancelled whenever `self` is, but can also be cancelled
    /// on its own without affecting `self`.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let mut children = self.inner.children.lock();
        match self.inner.reason.get() {
            Some(&reason) => child.inner.cancel(reason),
            None => {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
            }
        }
        child
    }

    /// Derive a child token that cancels itself with [`Reason::DeadlineExceeded`]
    /// once `duration` has elapsed.
    pub fn timeout(&self, duration: Duration) -> CancelToken {
        let child = self.child();
        let done = child.inner.done.clone();
        let weak = Arc::downgrade(&child.inner);

        thread::spawn(move || {
            select! {
                recv(done) -> _ => {}
                recv(after(duration)) -> _ => {
                    if let Some(inner) = weak.upgrade() {
                        inner.cancel(Reason::DeadlineExceeded);
                    }
                }
            }
        });

        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.inner.reason.get())
            .finish()
    }
}
