use std::io;

use nix::errno::Errno;

use crate::ptracer::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not find executable `{name}`")]
    NotFound { name: String },

    #[error("could not spawn tracee")]
    Spawn { source: nix::Error },

    #[error("tracee {pid} no longer exists")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("error waiting on tracees")]
    Wait { source: nix::Error },

    #[error("event sink failed: {0}")]
    Sink(String),

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unexpected internal error")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// True if the error was caused by the tracee vanishing mid-operation,
    /// e.g. from an un-catchable `SIGKILL` delivered while we held a stale
    /// handle on it.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

/// Return an `Error::Internal` naming a violated engine invariant.
///
/// Usable in expression position, like the `unreachable!` family.
macro_rules! internal_error {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Internal(format!($($arg)*)))
    };
}

pub(crate) trait ResultExt<T> {
    /// Convert an `ESRCH` into a `TraceeDied` error for `pid`.
    ///
    /// Any ptrace or wait request against a stopped tracee can still fail
    /// with `ESRCH` if the tracee was killed out from under us.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|errno| match errno {
            Errno::ESRCH => Error::TraceeDied { pid, source: errno },
            other => Error::Nix(other),
        })
    }
}
