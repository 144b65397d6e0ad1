use crate::{Classification, OutcomeRecord};

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Consumer of the outcome stream.
pub trait OutcomeSink: Send + Sync {
    fn emit(&self, record: &OutcomeRecord) -> io::Result<()>;
}

/// Writes one JSON object per line, flushing after each.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> OutcomeSink for JsonLinesSink<W> {
    fn emit(&self, record: &OutcomeRecord) -> io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let out = &mut *out;
        serde_json::to_writer(&mut *out, record)?;
        writeln!(out)?;
        out.flush()
    }
}

pub(crate) fn log_outcome(r: &OutcomeRecord) {
    let detail = r.detail.as_deref().unwrap_or("");
    match r.classification {
        Classification::TerminatedCleanly | Classification::TerminatedAfterEscalation => info!(
            round = r.round,
            target = %r.target,
            pid = ?r.pid,
            signals = ?r.signals,
            elapsed_ms = ?r.elapsed_ms,
            respawned_pid = ?r.respawned_pid,
            "{:?}",
            r.classification
        ),
        Classification::Survived => error!(
            round = r.round,
            target = %r.target,
            pid = ?r.pid,
            signals = ?r.signals,
            detail,
            "SURVIVED: target is still alive after its signals, check its shutdown path"
        ),
        Classification::AmbiguousMatch => warn!(
            round = r.round,
            target = %r.target,
            candidates = ?r.candidates,
            "several processes match the target, narrow its matcher"
        ),
        Classification::PermissionDenied => error!(
            round = r.round,
            target = %r.target,
            pid = ?r.pid,
            detail,
            "permission denied, target disabled for the rest of the run"
        ),
        Classification::LostToRace => debug!(
            round = r.round,
            target = %r.target,
            pid = ?r.pid,
            detail,
            "lost to race"
        ),
        Classification::NotFound => info!(
            round = r.round,
            target = %r.target,
            detail,
            "target not found"
        ),
        Classification::Interrupted => info!(
            round = r.round,
            target = %r.target,
            pid = ?r.pid,
            "interrupted by shutdown"
        ),
    }
}

/// Aggregate counters over the whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub rounds: u64,
    pub outcomes: BTreeMap<Classification, u64>,
}

impl Stats {
    pub(crate) fn record(&mut self, classification: Classification) {
        *self.outcomes.entry(classification).or_insert(0) += 1;
    }

    pub fn count(&self, classification: Classification) -> u64 {
        self.outcomes.get(&classification).copied().unwrap_or(0)
    }
}
