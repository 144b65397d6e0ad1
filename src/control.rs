use crate::proc::ProcessInfo;

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;

/// The only OS primitives the engine depends on.
///
/// A hold (`attach` .. `detach`) belongs to the calling thread: every call
/// between `attach` and the matching `detach` for a pid must come from the
/// thread which attached.
pub trait ProcessControl: Send + Sync + 'static {
    /// Checks once at startup that the control surface is usable.
    fn preflight(&self) -> Result<(), ControlError>;

    fn scan(&self) -> io::Result<Vec<ProcessInfo>>;

    /// Reads the current occupant of `pid`, `None` if there is none.
    fn inspect(&self, pid: Pid) -> io::Result<Option<ProcessInfo>>;

    /// Stops `pid` and pins it, waiting at most `timeout` for the stop.
    fn attach(&self, pid: Pid, timeout: Duration) -> Result<(), ControlError>;

    /// Resumes a held process, optionally delivering `forward` on the way out.
    fn detach(&self, pid: Pid, forward: Option<Signal>) -> Result<(), ControlError>;

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), ControlError>;

    /// Polls a held process without resuming it.
    fn held_state(&self, pid: Pid) -> Result<HeldState, ControlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeldState {
    Stopped,
    /// A signal arrived while the process was held and has been intercepted.
    Intercepted(Signal),
    Exited,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no such process")]
    NoSuchProcess,

    #[error("permission denied")]
    PermissionDenied,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("process control unavailable: {0}")]
    Unavailable(String),

    #[error("os error: {0}")]
    Os(Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Errno> for ControlError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => ControlError::NoSuchProcess,
            Errno::EPERM | Errno::EACCES => ControlError::PermissionDenied,
            errno => ControlError::Os(errno),
        }
    }
}
