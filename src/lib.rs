#![deny(clippy::all)]

mod control;
mod discovery;
mod observe;
mod pipeline;
mod proc;
mod ptrace;
mod report;
mod run;
mod shutdown;
mod signal;
mod store;
mod target;
mod verify;

pub use crate::control::{ControlError, HeldState, ProcessControl};
pub use crate::discovery::{discover, Discovery, ResolvedTarget};
pub use crate::observe::{stall, wait_exit, Exit, StallEnd};
pub use crate::proc::{Fingerprint, ProcessInfo};
pub use crate::ptrace::LinuxControl;
pub use crate::report::{JsonLinesSink, OutcomeSink, Stats};
pub use crate::run::{Engine, FatalError, Timing};
pub use crate::shutdown::{channel as shutdown_channel, Shutdown, ShutdownTrigger};
pub use crate::signal::{deliver, DeliverError};
pub use crate::store::{load_config, DescriptorStore, Snapshot};
pub use crate::target::{Matcher, Pattern, PolicyKind, SignalPolicy, TargetDescriptor};
pub use crate::verify::{verify, HoldRegistry, VerifiedHandle, VerifyError};

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub targets: Vec<TargetDescriptor>,

    #[serde(default = "default_round_interval")]
    pub round_interval_ms: u64,

    #[serde(default)]
    pub settle_ms: u64,

    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,

    #[serde(default = "default_hold_timeout")]
    pub hold_timeout_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_ms: u64,

    #[serde(default)]
    pub respawn_wait_ms: Option<u64>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub rounds: Option<u64>,
}

fn default_round_interval() -> u64 {
    10 * 60 * 1000
}

fn default_max_wait() -> u64 {
    5000
}

fn default_hold_timeout() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_scan_timeout() -> u64 {
    2000
}

fn default_workers() -> usize {
    1
}

impl RunConfig {
    pub fn new(targets: Vec<TargetDescriptor>) -> Self {
        Self {
            targets,
            round_interval_ms: default_round_interval(),
            settle_ms: 0,
            max_wait_ms: default_max_wait(),
            hold_timeout_ms: default_hold_timeout(),
            poll_interval_ms: default_poll_interval(),
            scan_timeout_ms: default_scan_timeout(),
            respawn_wait_ms: None,
            workers: default_workers(),
            rounds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    TerminatedCleanly,
    TerminatedAfterEscalation,
    Survived,
    LostToRace,
    PermissionDenied,
    NotFound,
    AmbiguousMatch,
    Interrupted,
}

impl Classification {
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            Classification::TerminatedCleanly | Classification::TerminatedAfterEscalation
        )
    }

    /// The finding this tool exists to surface.
    pub fn is_anomaly(self) -> bool {
        self == Classification::Survived
    }
}

/// One line of the outcome stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub round: u64,
    pub target: String,
    pub pid: Option<i32>,
    pub signals: Vec<String>,
    pub classification: Classification,
    pub elapsed_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respawned_pid: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub at_ms: u64, // unix epoch
}

impl OutcomeRecord {
    pub fn new(round: u64, target: &str, classification: Classification) -> Self {
        Self {
            round,
            target: target.to_owned(),
            pid: None,
            signals: Vec::new(),
            classification,
            elapsed_ms: None,
            candidates: Vec::new(),
            respawned_pid: None,
            detail: None,
            at_ms: epoch_millis(),
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub sequence: u64,
    pub order: Vec<String>,
    pub outcomes: Vec<OutcomeRecord>,
}
