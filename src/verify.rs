use crate::control::{ControlError, ProcessControl};
use crate::proc::Fingerprint;

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use scopeguard::ScopeGuard;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Pids currently held by some pipeline.
#[derive(Debug, Default)]
pub struct HoldRegistry {
    held: Mutex<HashSet<Pid>>,
}

impl HoldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Pid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, pid: Pid) -> Option<Claim<'_>> {
        if self.lock().insert(pid) {
            Some(Claim {
                registry: self,
                pid,
            })
        } else {
            None
        }
    }

    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }
}

struct Claim<'a> {
    registry: &'a HoldRegistry,
    pid: Pid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.pid);
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("process vanished before it could be held")]
    Vanished,

    #[error("pid was reused by another process")]
    Reused,

    #[error("pid is already held by another pipeline")]
    Busy,

    #[error("process did not stop within {0:?}")]
    Unresponsive(Duration),

    #[error("not permitted to hold the process")]
    PermissionDenied,

    #[error(transparent)]
    Control(ControlError),
}

impl From<ControlError> for VerifyError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::NoSuchProcess => VerifyError::Vanished,
            ControlError::PermissionDenied => VerifyError::PermissionDenied,
            ControlError::Timeout(t) => VerifyError::Unresponsive(t),
            err => VerifyError::Control(err),
        }
    }
}

/// Proof that `fingerprint.pid` denotes the expected process and is held
/// stopped. Dropping the handle releases the hold.
pub struct VerifiedHandle<'a, C: ProcessControl> {
    control: &'a C,
    fingerprint: Fingerprint,
    deadline: Instant,
    forward: Option<Signal>,
    _claim: Claim<'a>,
}

impl<'a, C: ProcessControl> VerifiedHandle<'a, C> {
    pub fn pid(&self) -> Pid {
        self.fingerprint.pid
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn control(&self) -> &'a C {
        self.control
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Delivers `signal` when the hold is released instead of swallowing it.
    pub fn forward_on_release(&mut self, signal: Signal) {
        self.forward = Some(signal);
    }
}

impl<C: ProcessControl> Drop for VerifiedHandle<'_, C> {
    fn drop(&mut self) {
        let pid = self.fingerprint.pid;
        match self.control.detach(pid, self.forward) {
            Ok(()) => trace!(?pid, "hold released"),
            Err(ControlError::NoSuchProcess) => trace!(?pid, "held process is gone"),
            Err(err) => error!(?pid, %err, "failed to release hold"),
        }
    }
}

/// Holds `expected.pid` and confirms that its occupant is still the process
/// described by `expected`. The returned handle stays valid for `ttl`.
pub fn verify<'a, C: ProcessControl>(
    control: &'a C,
    registry: &'a HoldRegistry,
    expected: &Fingerprint,
    hold_timeout: Duration,
    ttl: Duration,
) -> Result<VerifiedHandle<'a, C>, VerifyError> {
    let pid = expected.pid;
    let claim = registry.claim(pid).ok_or(VerifyError::Busy)?;

    control.attach(pid, hold_timeout)?;

    let held = scopeguard::guard(claim, |_claim| {
        if let Err(err) = control.detach(pid, None) {
            debug!(?pid, %err, "release after failed verification");
        }
    });

    let current = control.inspect(pid).map_err(ControlError::from)?;
    match current {
        Some(ref info) if expected.matches(info) => {}
        Some(info) => {
            debug!(?pid, expected = ?expected, found = ?info.fingerprint(), "pid reused");
            return Err(VerifyError::Reused);
        }
        None => return Err(VerifyError::Vanished),
    }

    let claim = ScopeGuard::into_inner(held);
    trace!(?pid, "identity verified");

    Ok(VerifiedHandle {
        control,
        fingerprint: expected.clone(),
        deadline: Instant::now() + ttl,
        forward: None,
        _claim: claim,
    })
}
