use crate::control::{ControlError, HeldState, ProcessControl};
use crate::proc::{self, ProcessInfo, PROC_ROOT};

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use std::{fs, thread};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use tracing::{trace, warn};

const WAIT_POLL: Duration = Duration::from_millis(5);
const REAP_TIMEOUT: Duration = Duration::from_millis(200);
const YAMA_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Procfs for discovery, ptrace for holds, kill(2) for delivery.
#[derive(Debug, Clone)]
pub struct LinuxControl {
    root: PathBuf,
}

impl Default for LinuxControl {
    fn default() -> Self {
        Self {
            root: PROC_ROOT.into(),
        }
    }
}

impl LinuxControl {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Stop {
    Stopped,
    Gone,
    Pending,
}

fn flags() -> Option<WaitPidFlag> {
    Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)
}

/// Waits for the attach stop of `pid`, forwarding any other signal which
/// is reported before it.
fn wait_for_stop(pid: Pid, deadline: Instant) -> Result<Stop, ControlError> {
    loop {
        match waitpid(pid, flags()) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return Ok(Stop::Pending);
                }
                thread::sleep(WAIT_POLL);
            }
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(Stop::Stopped),
            Ok(WaitStatus::Stopped(_, sig)) => {
                trace!(?pid, ?sig, "forward signal reported before attach stop");
                ptrace::cont(pid, sig)?;
            }
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(Stop::Gone),
            Ok(status) => {
                trace!(?pid, ?status, "unexpected stop while attaching");
                return Ok(Stop::Stopped);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(Stop::Gone),
            Err(errno) => return Err(errno.into()),
        }
    }
}

// Collects the exit notification of a tracee so its real parent can reap it.
fn reap(pid: Pid) {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match waitpid(pid, flags()) {
            Ok(WaitStatus::StillAlive) if Instant::now() < deadline => thread::sleep(WAIT_POLL),
            Err(Errno::EINTR) => continue,
            result => {
                trace!(?pid, ?result, "reap tracee");
                return;
            }
        }
    }
}

// The tracee never reached the attach stop and cannot be detached yet.
// SIGCONT discards the pending SIGSTOP, so it resumes instead of entering a
// group-stop once the tracer thread exits and the kernel detaches it.
fn abandon(pid: Pid) {
    let result = signal::kill(pid, Signal::SIGCONT);
    warn!(
        ?pid,
        ?result,
        "attach stop never arrived, queued SIGCONT so the target resumes when released"
    );
}

impl ProcessControl for LinuxControl {
    fn preflight(&self) -> Result<(), ControlError> {
        fs::metadata(self.root.join("self/stat")).map_err(|err| {
            ControlError::Unavailable(format!(
                "procfs is not readable: path = {}, err = {}",
                self.root.display(),
                err
            ))
        })?;

        let scope = match fs::read_to_string(YAMA_SCOPE) {
            Ok(s) => s.trim().parse::<u8>().unwrap_or(0),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        let root = unistd::geteuid().is_root();
        trace!(?scope, ?root, "ptrace preflight");

        match scope {
            3 => Err(ControlError::Unavailable(
                "ptrace is disabled: yama ptrace_scope = 3".into(),
            )),
            2 if !root => Err(ControlError::Unavailable(
                "attach requires CAP_SYS_PTRACE: yama ptrace_scope = 2".into(),
            )),
            1 if !root => {
                warn!("yama ptrace_scope = 1: only descendants of this process can be held");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn scan(&self) -> io::Result<Vec<ProcessInfo>> {
        let me = unistd::getpid();
        let mut procs = proc::scan(&self.root)?;
        procs.retain(|p| p.pid != me);
        Ok(procs)
    }

    fn inspect(&self, pid: Pid) -> io::Result<Option<ProcessInfo>> {
        proc::read_process(&self.root, pid)
    }

    fn attach(&self, pid: Pid, timeout: Duration) -> Result<(), ControlError> {
        ptrace::attach(pid)?;
        trace!(?pid, "ptrace attach");

        let deadline = Instant::now() + timeout;
        match wait_for_stop(pid, deadline) {
            Ok(Stop::Stopped) => Ok(()),
            Ok(Stop::Gone) => Err(ControlError::NoSuchProcess),
            Ok(Stop::Pending) => {
                // detaching needs a stopped tracee, so give the stop one more period
                match wait_for_stop(pid, Instant::now() + timeout) {
                    Ok(Stop::Stopped) => {
                        let _ = ptrace::detach(pid, None);
                    }
                    Ok(Stop::Gone) => {}
                    _ => abandon(pid),
                }
                Err(ControlError::Timeout(timeout))
            }
            Err(err) => {
                let _ = ptrace::detach(pid, None);
                Err(err)
            }
        }
    }

    fn detach(&self, pid: Pid, forward: Option<Signal>) -> Result<(), ControlError> {
        let result = ptrace::detach(pid, forward);
        trace!(?pid, ?forward, ?result, "ptrace detach");
        match result {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                reap(pid);
                Err(ControlError::NoSuchProcess)
            }
            Err(errno) => Err(errno.into()),
        }
    }

    fn signal(&self, pid: Pid, sig: Signal) -> Result<(), ControlError> {
        let result = signal::kill(pid, sig);
        trace!(
            "kill pid = {}, signal = {}, result = {:?}",
            pid,
            sig,
            result
        );
        result.map_err(ControlError::from)
    }

    // A tracee in the attach stop does not dequeue new signals, so
    // `Intercepted` only reports a stop that was already queued when the hold
    // started. Exit is the usual outcome.
    fn held_state(&self, pid: Pid) -> Result<HeldState, ControlError> {
        loop {
            return match waitpid(pid, flags()) {
                Ok(WaitStatus::StillAlive) => Ok(HeldState::Stopped),
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => Ok(HeldState::Stopped),
                Ok(WaitStatus::Stopped(_, sig)) => Ok(HeldState::Intercepted(sig)),
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => Ok(HeldState::Exited),
                Ok(_) => Ok(HeldState::Stopped),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) | Err(Errno::ESRCH) => Ok(HeldState::Exited),
                Err(errno) => Err(errno.into()),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::process::Command;

    #[test]
    fn abandon_resumes_a_stopped_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        signal::kill(pid, Signal::SIGSTOP).unwrap();
        let status = waitpid(pid, Some(WaitPidFlag::WUNTRACED)).unwrap();
        assert_eq!(status, WaitStatus::Stopped(pid, Signal::SIGSTOP));

        abandon(pid);
        let status = waitpid(pid, Some(WaitPidFlag::WCONTINUED)).unwrap();
        assert_eq!(status, WaitStatus::Continued(pid));

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
