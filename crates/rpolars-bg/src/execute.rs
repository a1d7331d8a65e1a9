//! Run work in the foreground or the background behind one interface.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::{RPolarsErr, RResult, Rctx};
use crate::handle::{Handle, panic_message};
use crate::ipc::{JobOutput, ProcessLauncher};
use crate::pool::{FromJobOutput, HostCall, Launcher, WorkerPool};

/// Work that produces a `T`.
pub enum Work<T> {
    /// Pure native work; runs on a thread of this process.
    Native(Box<dyn FnOnce() -> RResult<T> + Send>),
    /// Work that calls back into the host; runs in a worker process.
    Host {
        call: HostCall,
        convert: fn(JobOutput) -> RResult<T>,
    },
}

impl<T: Send + 'static> Work<T> {
    pub fn native(work: impl FnOnce() -> RResult<T> + Send + 'static) -> Self {
        Self::Native(Box::new(work))
    }
}

impl<T: FromJobOutput> Work<T> {
    pub fn host(call: HostCall) -> Self {
        Self::Host {
            call,
            convert: T::from_output,
        }
    }
}

/// Entry point for callers that choose per call whether to block.
pub struct BackgroundEngine<L: Launcher = ProcessLauncher> {
    pool: WorkerPool<L>,
}

impl<L: Launcher> BackgroundEngine<L> {
    pub fn new(pool: WorkerPool<L>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &WorkerPool<L> {
        &self.pool
    }

    /// Start `work`. With `background` the returned handle is usually still
    /// running; without it the work has completed and the handle only holds
    /// the result.
    pub fn execute<T: Send + 'static>(&self, work: Work<T>, background: bool) -> RResult<Handle<T>> {
        match (work, background) {
            (Work::Native(f), true) => Handle::spawn_local(f),
            (Work::Native(f), false) => {
                let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
                    Err(RPolarsErr::new(Rctx::Panic(panic_message(&*payload))))
                });
                Ok(Handle::finished(result))
            }
            (Work::Host { call, convert }, true) => self.pool.dispatch_with(call, convert),
            (Work::Host { call, convert }, false) => {
                let mut handle = self.pool.dispatch_with(call, convert)?;
                Ok(Handle::finished(handle.join()))
            }
        }
    }
}
