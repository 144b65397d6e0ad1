use crate::control::{ControlError, ProcessControl};
use crate::report::{OutcomeSink, Stats};
use crate::shutdown::Shutdown;
use crate::store::DescriptorStore;
use crate::verify::HoldRegistry;
use crate::{OutcomeRecord, RoundRecord, RunConfig};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("process control unavailable")]
    Control(#[source] ControlError),

    #[error("pipeline task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// Cadence and bounds of the engine, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct Timing {
    pub round_interval: Duration,
    pub settle: Duration,
    pub max_wait: Duration,
    pub hold_timeout: Duration,
    pub poll_interval: Duration,
    pub scan_timeout: Duration,
    pub respawn_wait: Option<Duration>,
    pub workers: usize,
    pub rounds: Option<u64>,
}

impl From<&RunConfig> for Timing {
    fn from(c: &RunConfig) -> Self {
        Self {
            round_interval: Duration::from_millis(c.round_interval_ms),
            settle: Duration::from_millis(c.settle_ms),
            max_wait: Duration::from_millis(c.max_wait_ms),
            hold_timeout: Duration::from_millis(c.hold_timeout_ms),
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            scan_timeout: Duration::from_millis(c.scan_timeout_ms),
            respawn_wait: c.respawn_wait_ms.map(Duration::from_millis),
            workers: c.workers.max(1),
            rounds: c.rounds,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    stats: Stats,
    disabled: HashSet<String>,
    in_flight: HashSet<String>,
}

/// Drives rounds over the targets of a [`DescriptorStore`].
pub struct Engine<C: ProcessControl> {
    pub(crate) control: Arc<C>,
    pub(crate) holds: Arc<HoldRegistry>,
    pub(crate) timing: Timing,
    store: Arc<DescriptorStore>,
    sink: Arc<dyn OutcomeSink>,
    state: Mutex<EngineState>,
}

/// Marks a target as in flight until dropped.
pub(crate) struct InFlight<'a, C: ProcessControl> {
    engine: &'a Engine<C>,
    name: String,
}

impl<C: ProcessControl> Drop for InFlight<'_, C> {
    fn drop(&mut self) {
        self.engine.lock_state().in_flight.remove(&self.name);
    }
}

impl<C: ProcessControl> Engine<C> {
    pub fn new(
        control: Arc<C>,
        store: Arc<DescriptorStore>,
        timing: Timing,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        Self {
            control,
            holds: Arc::new(HoldRegistry::new()),
            timing,
            store,
            sink,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> Stats {
        self.lock_state().stats.clone()
    }

    /// Holds currently acquired by pipelines; zero whenever no round runs.
    pub fn outstanding_holds(&self) -> usize {
        self.holds.outstanding()
    }

    pub fn is_disabled(&self, target: &str) -> bool {
        self.lock_state().disabled.contains(target)
    }

    pub(crate) fn claim_target(&self, name: &str) -> Option<InFlight<'_, C>> {
        if self.lock_state().in_flight.insert(name.to_owned()) {
            Some(InFlight {
                engine: self,
                name: name.to_owned(),
            })
        } else {
            None
        }
    }

    pub(crate) fn finish(&self, record: &OutcomeRecord) {
        {
            let mut state = self.lock_state();
            state.stats.record(record.classification);
            if record.classification == crate::Classification::PermissionDenied {
                state.disabled.insert(record.target.clone());
            }
        }
        crate::report::log_outcome(record);
        if let Err(err) = self.sink.emit(record) {
            error!(%err, "failed to write outcome record");
        }
    }

    pub fn log_agenda(&self) {
        let snapshot = self.store.snapshot();
        info!(
            targets = snapshot.targets.len(),
            round_interval = ?self.timing.round_interval,
            settle = ?self.timing.settle,
            workers = self.timing.workers,
            "robustness tester started, target order is randomized every round"
        );
        for t in &snapshot.targets {
            info!(
                target = %t.name,
                policy = %t.policy.kind(),
                graceful = %t.graceful_signal,
                forceful = %t.forceful_signal,
                "agenda"
            );
        }
    }

    /// Runs rounds until shutdown or until the configured number of rounds.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) -> Result<Stats, FatalError> {
        self.log_agenda();

        while !shutdown.is_triggered() {
            let record = self.run_round(&shutdown).await?;
            info!(
                round = record.sequence,
                processed = record.outcomes.len(),
                "round finished"
            );

            if let Some(limit) = self.timing.rounds {
                if record.sequence >= limit {
                    break;
                }
            }

            info!("sleeping {:?} until the next round", self.timing.round_interval);
            tokio::select! {
                _ = time::sleep(self.timing.round_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        let stats = self.stats();
        info!(
            rounds = stats.rounds,
            outcomes = ?stats.outcomes,
            "robustness tester stopped"
        );
        Ok(stats)
    }

    /// One randomized pass over the current snapshot. Returns after every
    /// started pipeline has finished and released its holds.
    pub async fn run_round(
        self: &Arc<Self>,
        shutdown: &Shutdown,
    ) -> Result<RoundRecord, FatalError> {
        let snapshot = self.store.snapshot();
        let sequence = {
            let mut state = self.lock_state();
            state.stats.rounds += 1;
            state.stats.rounds
        };

        let mut order = snapshot.targets.clone();
        order.shuffle(&mut rand::thread_rng());
        let names: Vec<String> = order.iter().map(|t| t.name.clone()).collect();
        info!(round = sequence, order = ?names, "round started");

        let semaphore = Arc::new(Semaphore::new(self.timing.workers));
        let failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut stop = shutdown.clone();

        for (idx, target) in order.into_iter().enumerate() {
            if self.is_disabled(&target.name) {
                debug!(target = %target.name, "skip disabled target");
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if failed.load(Ordering::Acquire) {
                break;
            }

            let engine = Arc::clone(self);
            let shutdown = shutdown.clone();
            let failed = Arc::clone(&failed);
            tasks.spawn(async move {
                let _permit = permit;
                let result = engine.process_target(sequence, &target, &shutdown).await;
                if result.is_err() {
                    failed.store(true, Ordering::Release);
                } else {
                    engine.settle(&shutdown).await;
                }
                (idx, result)
            });
        }

        let mut slots: Vec<Option<OutcomeRecord>> = vec![None; names.len()];
        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(record))) => slots[idx] = Some(record),
                Ok((_, Err(err))) => fatal = fatal.or(Some(err)),
                Err(err) => fatal = fatal.or(Some(FatalError::Task(err))),
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        let outstanding = self.holds.outstanding();
        if outstanding != 0 {
            warn!(outstanding, "holds outstanding after round");
        }

        Ok(RoundRecord {
            sequence,
            order: names,
            outcomes: slots.into_iter().flatten().collect(),
        })
    }

    async fn settle(&self, shutdown: &Shutdown) {
        if self.timing.settle.is_zero() {
            return;
        }
        debug!("settling for {:?}", self.timing.settle);
        let mut shutdown = shutdown.clone();
        tokio::select! {
            _ = time::sleep(self.timing.settle) => {}
            _ = shutdown.cancelled() => {}
        }
    }
}
