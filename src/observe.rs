use crate::control::{ControlError, HeldState, ProcessControl};
use crate::proc::Fingerprint;
use crate::shutdown::Shutdown;
use crate::verify::VerifiedHandle;

use std::io;
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time::{self, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Exited; elapsed time counted from the caller's `since`.
    Exited(Duration),
    TimedOut,
}

/// Polls until the process described by `fingerprint` is gone or `bound`
/// has passed. A zombie or a new occupant of the pid counts as gone.
pub async fn wait_exit<C: ProcessControl>(
    control: &C,
    fingerprint: &Fingerprint,
    since: Instant,
    bound: Duration,
    poll: Duration,
) -> io::Result<Exit> {
    let deadline = Instant::now() + bound;
    loop {
        let alive = match control.inspect(fingerprint.pid)? {
            Some(info) => fingerprint.matches(&info),
            None => false,
        };
        let now = Instant::now();
        if !alive {
            let elapsed = now.saturating_duration_since(since);
            trace!(pid = ?fingerprint.pid, ?elapsed, "exited");
            return Ok(Exit::Exited(elapsed));
        }
        if now >= deadline {
            return Ok(Exit::TimedOut);
        }
        time::sleep(poll.min(deadline - now)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallEnd {
    /// Died while held.
    Exited(Duration),
    /// A signal stop was reported while held; the signal is forwarded when
    /// the hold is released. Rare on Linux, where a stopped tracee leaves new
    /// signals pending.
    Intercepted(Signal),
    Elapsed,
    Interrupted,
}

/// Keeps a verified process stopped for up to `duration`. Blocking; must run
/// on the thread which acquired the hold.
pub fn stall<C: ProcessControl>(
    handle: &mut VerifiedHandle<'_, C>,
    duration: Duration,
    poll: Duration,
    shutdown: &Shutdown,
) -> Result<StallEnd, ControlError> {
    let pid = handle.pid();
    let t0 = std::time::Instant::now();
    loop {
        match handle.control().held_state(pid)? {
            HeldState::Exited => return Ok(StallEnd::Exited(t0.elapsed())),
            HeldState::Intercepted(sig) => {
                trace!(?pid, ?sig, "signal intercepted during stall");
                handle.forward_on_release(sig);
                return Ok(StallEnd::Intercepted(sig));
            }
            HeldState::Stopped => {}
        }
        if shutdown.is_triggered() {
            return Ok(StallEnd::Interrupted);
        }
        let elapsed = t0.elapsed();
        if elapsed >= duration {
            return Ok(StallEnd::Elapsed);
        }
        thread::sleep(poll.min(duration - elapsed));
    }
}
