use crate::control::{ControlError, ProcessControl};
use crate::verify::VerifiedHandle;

use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum DeliverError {
    #[error("hold expired before delivery")]
    Expired,

    #[error("process changed or vanished before delivery")]
    Vanished,

    #[error("not permitted to signal the process")]
    PermissionDenied,

    #[error(transparent)]
    Control(ControlError),
}

/// Sends `signal` through a verified hold and releases the hold.
pub fn deliver<C: ProcessControl>(
    handle: VerifiedHandle<'_, C>,
    signal: Signal,
) -> Result<(), DeliverError> {
    let pid = handle.pid();

    if handle.is_expired() {
        return Err(DeliverError::Expired);
    }

    let current = handle
        .control()
        .inspect(pid)
        .map_err(|err| DeliverError::Control(err.into()))?;
    match current {
        Some(ref info) if handle.fingerprint().matches(info) => {}
        _ => return Err(DeliverError::Vanished),
    }

    let result = handle.control().signal(pid, signal);
    trace!(?pid, ?signal, ?result, "deliver");
    drop(handle);

    match result {
        Ok(()) => Ok(()),
        Err(ControlError::NoSuchProcess) => Err(DeliverError::Vanished),
        Err(ControlError::PermissionDenied) => Err(DeliverError::PermissionDenied),
        Err(err) => Err(DeliverError::Control(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::tests::{process, Slot};
    use crate::verify::{verify, HoldRegistry};

    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn deliver_sends_once_and_releases() {
        let slot = Slot::new(process(100));
        let registry = HoldRegistry::new();
        let hold = Duration::from_secs(1);
        let handle = verify(&slot, &registry, &process(100).fingerprint(), hold, hold).unwrap();

        deliver(handle, Signal::SIGTERM).unwrap();
        assert_eq!(*slot.sent.lock().unwrap(), vec![Signal::SIGTERM]);
        assert_eq!(slot.detaches.load(Ordering::SeqCst), 1);
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn expired_hold_sends_nothing() {
        let slot = Slot::new(process(100));
        let registry = HoldRegistry::new();
        let fp = process(100).fingerprint();
        let handle = verify(&slot, &registry, &fp, Duration::from_secs(1), Duration::ZERO).unwrap();

        assert!(matches!(
            deliver(handle, Signal::SIGKILL),
            Err(DeliverError::Expired)
        ));
        assert!(slot.sent.lock().unwrap().is_empty());
        assert_eq!(slot.detaches.load(Ordering::SeqCst), 1);
        assert_eq!(registry.outstanding(), 0);
    }
}
