//! Per-target state machine:
//! discovering, verifying, signaling, observing, and optionally escalating.

use crate::control::{ControlError, ProcessControl};
use crate::discovery::{discover, Discovery, ResolvedTarget};
use crate::observe::{self, wait_exit, Exit, StallEnd};
use crate::proc::Fingerprint;
use crate::run::{Engine, FatalError};
use crate::shutdown::Shutdown;
use crate::signal::{deliver, DeliverError};
use crate::target::{Matcher, SignalPolicy, TargetDescriptor};
use crate::verify::{verify, VerifyError};
use crate::{epoch_millis, Classification, OutcomeRecord};

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::task;
use tokio::time::{self, Instant};
use tracing::{info, warn};

/// Why a pipeline ended before observation.
enum Failure {
    LostToRace(String),
    PermissionDenied(String),
    Fatal(FatalError),
}

impl From<ControlError> for Failure {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::NoSuchProcess => Failure::LostToRace(err.to_string()),
            ControlError::PermissionDenied => Failure::PermissionDenied(err.to_string()),
            ControlError::Timeout(_) | ControlError::Os(_) => Failure::LostToRace(err.to_string()),
            ControlError::Unavailable(_) => Failure::Fatal(FatalError::Control(err)),
            ControlError::Io(err) => Failure::LostToRace(format!("process read failed: {}", err)),
        }
    }
}

impl From<VerifyError> for Failure {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::PermissionDenied => Failure::PermissionDenied(err.to_string()),
            VerifyError::Control(err) => err.into(),
            err => Failure::LostToRace(err.to_string()),
        }
    }
}

impl From<DeliverError> for Failure {
    fn from(err: DeliverError) -> Self {
        match err {
            DeliverError::PermissionDenied => Failure::PermissionDenied(err.to_string()),
            DeliverError::Control(err) => err.into(),
            err => Failure::LostToRace(err.to_string()),
        }
    }
}

impl From<task::JoinError> for Failure {
    fn from(err: task::JoinError) -> Self {
        Failure::Fatal(FatalError::Task(err))
    }
}

fn done(mut record: OutcomeRecord, classification: Classification) -> OutcomeRecord {
    record.classification = classification;
    record.at_ms = epoch_millis();
    record
}

fn fail(record: OutcomeRecord, failure: Failure) -> Result<OutcomeRecord, FatalError> {
    match failure {
        Failure::LostToRace(detail) => Ok(done(
            OutcomeRecord {
                detail: Some(detail),
                ..record
            },
            Classification::LostToRace,
        )),
        Failure::PermissionDenied(detail) => Ok(done(
            OutcomeRecord {
                detail: Some(detail),
                ..record
            },
            Classification::PermissionDenied,
        )),
        Failure::Fatal(err) => Err(err),
    }
}

fn millis(d: Duration) -> Option<u64> {
    Some(d.as_millis() as u64)
}

impl<C: ProcessControl> Engine<C> {
    /// Runs one target through its pipeline and emits the outcome.
    pub(crate) async fn process_target(
        self: &Arc<Self>,
        round: u64,
        target: &TargetDescriptor,
        shutdown: &Shutdown,
    ) -> Result<OutcomeRecord, FatalError> {
        let record = OutcomeRecord::new(round, &target.name, Classification::NotFound);

        let record = match self.claim_target(&target.name) {
            Some(_in_flight) => self.drive(record, target, shutdown).await?,
            None => done(
                OutcomeRecord {
                    detail: Some("target is already being processed".into()),
                    ..record
                },
                Classification::LostToRace,
            ),
        };

        self.finish(&record);
        Ok(record)
    }

    async fn drive(
        self: &Arc<Self>,
        mut record: OutcomeRecord,
        target: &TargetDescriptor,
        shutdown: &Shutdown,
    ) -> Result<OutcomeRecord, FatalError> {
        let resolved = match self.discover(&target.matcher).await? {
            Ok(Discovery::Unique(resolved)) => resolved,
            Ok(Discovery::NotFound) => return Ok(done(record, Classification::NotFound)),
            Ok(Discovery::Ambiguous(pids)) => {
                record.candidates = pids.iter().map(|p| p.as_raw()).collect();
                return Ok(done(record, Classification::AmbiguousMatch));
            }
            Err(detail) => {
                record.detail = Some(detail);
                return Ok(done(record, Classification::NotFound));
            }
        };
        record.pid = Some(resolved.pid().as_raw());

        let record = match target.policy {
            SignalPolicy::Graceful => {
                self.signal_and_observe(record, &resolved, target.graceful_signal)
                    .await?
            }
            SignalPolicy::Forceful => {
                self.signal_and_observe(record, &resolved, target.forceful_signal)
                    .await?
            }
            SignalPolicy::GracefulThenEscalate {
                escalation_timeout_ms,
            } => {
                self.escalate(
                    record,
                    &resolved,
                    target,
                    Duration::from_millis(escalation_timeout_ms),
                )
                .await?
            }
            SignalPolicy::Stall { stall_ms } => {
                self.stall(record, &resolved, Duration::from_millis(stall_ms), shutdown)
                    .await?
            }
        };

        if record.classification.is_terminated() {
            return self.check_respawn(record, target, &resolved, shutdown).await;
        }
        Ok(record)
    }

    /// Scans on a blocking thread; the inner `Err` carries a non-fatal detail.
    async fn discover(
        &self,
        matcher: &Matcher,
    ) -> Result<Result<Discovery, String>, FatalError> {
        let control = Arc::clone(&self.control);
        let matcher = matcher.clone();
        let scan = task::spawn_blocking(move || discover(&*control, &matcher));

        match time::timeout(self.timing.scan_timeout, scan).await {
            Err(_) => Ok(Err(format!(
                "process scan timed out after {:?}",
                self.timing.scan_timeout
            ))),
            Ok(joined) => match joined? {
                Ok(discovery) => Ok(Ok(discovery)),
                Err(err) => Ok(Err(format!("process scan failed: {}", err))),
            },
        }
    }

    /// Holds, verifies, signals, and releases, all on one blocking thread.
    async fn hold_and_signal(
        &self,
        fingerprint: Fingerprint,
        signal: Signal,
    ) -> Result<(), Failure> {
        let control = Arc::clone(&self.control);
        let holds = Arc::clone(&self.holds);
        let hold_timeout = self.timing.hold_timeout;

        task::spawn_blocking(move || -> Result<(), Failure> {
            let handle = verify(&*control, &*holds, &fingerprint, hold_timeout, hold_timeout)?;
            deliver(handle, signal)?;
            Ok(())
        })
        .await?
    }

    async fn signal_and_observe(
        &self,
        mut record: OutcomeRecord,
        resolved: &ResolvedTarget,
        signal: Signal,
    ) -> Result<OutcomeRecord, FatalError> {
        let fingerprint = resolved.fingerprint();
        let since = Instant::now();
        if let Err(failure) = self.hold_and_signal(fingerprint.clone(), signal).await {
            return fail(record, failure);
        }
        record.signals.push(signal.as_str().to_owned());

        let exit = match self.observe(&fingerprint, since, self.timing.max_wait).await {
            Ok(exit) => exit,
            Err(failure) => return fail(record, failure),
        };
        Ok(match exit {
            Exit::Exited(elapsed) => {
                record.elapsed_ms = millis(elapsed);
                done(record, Classification::TerminatedCleanly)
            }
            Exit::TimedOut => done(record, Classification::Survived),
        })
    }

    async fn escalate(
        &self,
        mut record: OutcomeRecord,
        resolved: &ResolvedTarget,
        target: &TargetDescriptor,
        escalation_timeout: Duration,
    ) -> Result<OutcomeRecord, FatalError> {
        let fingerprint = resolved.fingerprint();
        let since = Instant::now();
        if let Err(failure) = self
            .hold_and_signal(fingerprint.clone(), target.graceful_signal)
            .await
        {
            return fail(record, failure);
        }
        record
            .signals
            .push(target.graceful_signal.as_str().to_owned());

        match self.observe(&fingerprint, since, escalation_timeout).await {
            Ok(Exit::Exited(elapsed)) => {
                record.elapsed_ms = millis(elapsed);
                return Ok(done(record, Classification::TerminatedCleanly));
            }
            Ok(Exit::TimedOut) => {}
            Err(failure) => return fail(record, failure),
        }

        info!(
            target = %target.name,
            pid = ?resolved.pid(),
            "no exit within {:?}, escalating to {}",
            escalation_timeout,
            target.forceful_signal
        );
        if let Err(failure) = self
            .hold_and_signal(fingerprint.clone(), target.forceful_signal)
            .await
        {
            return fail(record, failure);
        }
        record
            .signals
            .push(target.forceful_signal.as_str().to_owned());

        let exit = match self.observe(&fingerprint, since, self.timing.max_wait).await {
            Ok(exit) => exit,
            Err(failure) => return fail(record, failure),
        };
        Ok(match exit {
            Exit::Exited(elapsed) => {
                record.elapsed_ms = millis(elapsed);
                done(record, Classification::TerminatedAfterEscalation)
            }
            Exit::TimedOut => done(record, Classification::Survived),
        })
    }

    async fn stall(
        &self,
        mut record: OutcomeRecord,
        resolved: &ResolvedTarget,
        duration: Duration,
        shutdown: &Shutdown,
    ) -> Result<OutcomeRecord, FatalError> {
        let fingerprint = resolved.fingerprint();
        let control = Arc::clone(&self.control);
        let holds = Arc::clone(&self.holds);
        let hold_timeout = self.timing.hold_timeout;
        let poll = self.timing.poll_interval;
        let stop = shutdown.clone();

        let held = task::spawn_blocking(move || -> Result<StallEnd, Failure> {
            let mut handle = verify(
                &*control,
                &*holds,
                &fingerprint,
                hold_timeout,
                duration + hold_timeout,
            )?;
            let end = observe::stall(&mut handle, duration, poll, &stop)?;
            drop(handle);
            Ok(end)
        })
        .await;

        let end = match held.map_err(Failure::from).and_then(|r| r) {
            Ok(end) => end,
            Err(failure) => return fail(record, failure),
        };
        record.signals.push(Signal::SIGSTOP.as_str().to_owned());

        Ok(match end {
            StallEnd::Exited(elapsed) => {
                record.elapsed_ms = millis(elapsed);
                done(record, Classification::TerminatedCleanly)
            }
            StallEnd::Intercepted(sig) => {
                let since = Instant::now();
                record.detail = Some(format!("{} arrived while held", sig));
                record.signals.push(sig.as_str().to_owned());
                match self
                    .observe(&resolved.fingerprint(), since, self.timing.max_wait)
                    .await
                {
                    Ok(Exit::Exited(elapsed)) => {
                        record.elapsed_ms = millis(elapsed);
                        done(record, Classification::TerminatedCleanly)
                    }
                    Ok(Exit::TimedOut) => done(record, Classification::Survived),
                    Err(failure) => return fail(record, failure),
                }
            }
            StallEnd::Elapsed => {
                record.detail = Some(format!(
                    "still held after {:?}, no watchdog intervened",
                    duration
                ));
                done(record, Classification::Survived)
            }
            StallEnd::Interrupted => done(record, Classification::Interrupted),
        })
    }

    async fn observe(
        &self,
        fingerprint: &Fingerprint,
        since: Instant,
        bound: Duration,
    ) -> Result<Exit, Failure> {
        wait_exit(
            &*self.control,
            fingerprint,
            since,
            bound,
            self.timing.poll_interval,
        )
        .await
        .map_err(|err| Failure::LostToRace(format!("lost track of the process: {}", err)))
    }

    async fn check_respawn(
        &self,
        mut record: OutcomeRecord,
        target: &TargetDescriptor,
        old: &ResolvedTarget,
        shutdown: &Shutdown,
    ) -> Result<OutcomeRecord, FatalError> {
        let wait = match self.timing.respawn_wait {
            Some(wait) => wait,
            None => return Ok(record),
        };

        let mut shutdown = shutdown.clone();
        tokio::select! {
            _ = time::sleep(wait) => {}
            _ = shutdown.cancelled() => return Ok(record),
        }

        match self.discover(&target.matcher).await? {
            Ok(Discovery::Unique(new)) => {
                record.respawned_pid = Some(new.pid().as_raw());
                if new.pid() == old.pid() {
                    warn!(
                        target = %target.name,
                        pid = ?new.pid(),
                        "respawned with the same pid, make sure it really restarted"
                    );
                }
            }
            Ok(Discovery::Ambiguous(pids)) => {
                warn!(target = %target.name, ?pids, "several instances after respawn");
            }
            Ok(Discovery::NotFound) | Err(_) => {
                warn!(
                    target = %target.name,
                    "not respawned within {:?}, check its supervisor",
                    wait
                );
            }
        }
        Ok(record)
    }
}
