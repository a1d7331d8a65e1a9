//! Join-once handles over background work.
//!
//! A [`Handle`] is backed either by a native thread ([`Handle::spawn_local`])
//! or by the receiving end of a one-shot response channel whose sender
//! travels with a job dispatched to a worker process ([`oneshot`]).
//!
//! ```text
//! Running(thread | receiver) ──result ready──▶ Finished(result) ──join──▶ Joined
//! ```

use std::any::Any;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::error::{RPolarsErr, RResult, Rctx};

enum State<T> {
    Thread(JoinHandle<RResult<T>>),
    Remote(Receiver<RResult<T>>),
    Finished(RResult<T>),
    Joined,
}

/// Handle to work running on another thread or in a worker process.
pub struct Handle<T> {
    state: State<T>,
}

impl<T: Send + 'static> Handle<T> {
    /// Run `work` on a new native thread.
    pub fn spawn_local<F>(work: F) -> RResult<Self>
    where
        F: FnOnce() -> RResult<T> + Send + 'static,
    {
        let thread = std::thread::Builder::new()
            .name("rpolars-bg-local".to_string())
            .spawn(work)
            .map_err(|e| RPolarsErr::lift(e).push(Rctx::When("spawning a background thread".into())))?;
        Ok(Self {
            state: State::Thread(thread),
        })
    }
}

impl<T> Handle<T> {
    /// A handle whose result is already known.
    pub fn finished(result: RResult<T>) -> Self {
        Self {
            state: State::Finished(result),
        }
    }

    fn remote(rx: Receiver<RResult<T>>) -> Self {
        Self {
            state: State::Remote(rx),
        }
    }

    /// Whether a result is available. Never blocks.
    ///
    /// Fails with `UseAfterJoin` once the handle has been joined.
    pub fn is_finished(&mut self) -> RResult<bool> {
        let polled = match &self.state {
            State::Thread(thread) => return Ok(thread.is_finished()),
            State::Finished(_) => return Ok(true),
            State::Joined => return Err(RPolarsErr::new(Rctx::UseAfterJoin)),
            State::Remote(rx) => rx.try_recv(),
        };
        match polled {
            Ok(result) => {
                self.state = State::Finished(result);
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => {
                self.state = State::Finished(Err(sender_vanished()));
                Ok(true)
            }
        }
    }

    /// Block until the result is available and take it.
    ///
    /// The result is delivered once; later calls fail with `UseAfterJoin`.
    pub fn join(&mut self) -> RResult<T> {
        match std::mem::replace(&mut self.state, State::Joined) {
            State::Thread(thread) => thread
                .join()
                .unwrap_or_else(|payload| Err(RPolarsErr::new(Rctx::Panic(panic_message(&*payload))))),
            State::Remote(rx) => rx.recv().unwrap_or_else(|_| Err(sender_vanished())),
            State::Finished(result) => result,
            State::Joined => Err(RPolarsErr::new(Rctx::UseAfterJoin)),
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, State::Joined)
    }
}

fn sender_vanished() -> RPolarsErr {
    RPolarsErr::transport("response channel closed before a result was delivered")
}

/// Sending half of a one-shot response channel.
///
/// `send` consumes the sender, so at most one result is ever delivered.
pub struct ResponseSender<T> {
    tx: Sender<RResult<T>>,
}

impl<T> ResponseSender<T> {
    /// Deliver the result. Returns `false` if the handle was dropped.
    pub fn send(self, result: RResult<T>) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Create a one-shot response channel and the handle that waits on it.
pub fn oneshot<T>() -> (ResponseSender<T>, Handle<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (ResponseSender { tx }, Handle::remote(rx))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
