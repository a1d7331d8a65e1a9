//! One-shot named channels over Unix domain sockets.
//!
//! Used twice during worker startup: the pool's rendezvous channel (the
//! worker connects and announces itself) and the worker's job channel (the
//! pool connects and keeps the stream for the life of the slot).

use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{RPolarsErr, RResult, Rctx};

/// How often a pending accept re-checks its deadline.
const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// A listener that accepts exactly one connection.
///
/// The socket file is removed when the listener is dropped.
pub struct OneShotListener {
    listener: UnixListener,
    path: PathBuf,
}

impl OneShotListener {
    /// Bind a fresh, uniquely named socket in `dir`.
    pub fn bind(dir: &Path, role: &str) -> RResult<Self> {
        // Keep well under the ~104 byte sun_path limit.
        let id = Uuid::new_v4().simple().to_string();
        let path = dir.join(format!("rpolars-{role}-{}.sock", &id[..16]));

        let listener = UnixListener::bind(&path).map_err(|e| {
            RPolarsErr::lift(e).push(Rctx::Transport(format!(
                "binding {role} channel at {}",
                path.display()
            )))
        })?;
        listener.set_nonblocking(true)?;

        Ok(Self { listener, path })
    }

    /// The channel name a peer connects to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `timeout` for the single connection.
    ///
    /// `check` runs between polls so the caller can bail out early, e.g. when
    /// the process that should connect has already exited.
    pub fn accept_within(
        &self,
        timeout: Duration,
        mut check: impl FnMut() -> RResult<()>,
    ) -> RResult<UnixStream> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    check()?;
                    if Instant::now() >= deadline {
                        return Err(RPolarsErr::transport(format!(
                            "no connection on {} within {:?}",
                            self.path.display(),
                            timeout
                        )));
                    }
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    return Err(RPolarsErr::lift(e).push(Rctx::Transport(format!(
                        "accepting on {}",
                        self.path.display()
                    ))));
                }
            }
        }
    }
}

impl Drop for OneShotListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Failed to remove socket {}: {}", self.path.display(), e);
        }
    }
}

/// Connect to a channel by name.
pub fn connect(path: &Path) -> RResult<UnixStream> {
    UnixStream::connect(path).map_err(|e| {
        RPolarsErr::lift(e).push(Rctx::Transport(format!(
            "connecting to {}",
            path.display()
        )))
    })
}
