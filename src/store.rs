use crate::target::{PolicyKind, SignalPolicy, TargetDescriptor};
use crate::RunConfig;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use tracing::{info, trace};

/// Reads and parses a configuration file. Not validated: callers apply their
/// overrides first and then call [`RunConfig::validate`].
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: path = {}", path.display()))?;
    let config: RunConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config: path = {}", path.display()))?;
    trace!(?config);
    Ok(config)
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            anyhow::bail!("no targets configured");
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            validate_target(target)?;
            if !names.insert(target.name.as_str()) {
                anyhow::bail!("duplicate target name: name = {}", target.name);
            }
        }

        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }
        if self.hold_timeout_ms == 0 || self.scan_timeout_ms == 0 {
            anyhow::bail!("hold_timeout_ms and scan_timeout_ms must be positive");
        }
        if self.rounds == Some(0) {
            anyhow::bail!("rounds must be at least 1 when given");
        }

        Ok(())
    }

    /// Drops every target whose policy is in `disabled`.
    pub fn without_policies(mut self, disabled: &[PolicyKind]) -> Result<Self> {
        self.targets.retain(|t| !disabled.contains(&t.policy.kind()));
        if self.targets.is_empty() {
            anyhow::bail!("every configured target uses a disabled policy");
        }
        Ok(self)
    }
}

fn validate_target(target: &TargetDescriptor) -> Result<()> {
    if target.name.trim().is_empty() {
        anyhow::bail!("target name must not be empty");
    }

    if target.matcher.is_empty() {
        anyhow::bail!(
            "target needs at least one of exe, name, cmdline: name = {}",
            target.name
        );
    }

    if let Some(ref exe) = target.matcher.exe {
        if !exe.is_absolute() {
            anyhow::bail!(
                "executable path must be absolute: name = {}, exe = {}",
                target.name,
                exe.display()
            );
        }
    }

    match target.policy {
        SignalPolicy::GracefulThenEscalate {
            escalation_timeout_ms: 0,
        } => anyhow::bail!(
            "escalation_timeout_ms must be positive: name = {}",
            target.name
        ),
        SignalPolicy::Stall { stall_ms: 0 } => {
            anyhow::bail!("stall_ms must be positive: name = {}", target.name)
        }
        _ => {}
    }

    Ok(())
}

/// An immutable generation of the target list.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub targets: Vec<Arc<TargetDescriptor>>,
}

/// Read-mostly holder of the current snapshot. Readers clone the `Arc` and
/// never observe a partially replaced list.
#[derive(Debug)]
pub struct DescriptorStore {
    current: RwLock<Arc<Snapshot>>,
}

impl DescriptorStore {
    pub fn new(targets: Vec<TargetDescriptor>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot {
                generation: 0,
                targets: targets.into_iter().map(Arc::new).collect(),
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Installs a new list; rounds already running keep the old one.
    pub fn replace(&self, targets: Vec<TargetDescriptor>) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = guard.generation + 1;
        *guard = Arc::new(Snapshot {
            generation,
            targets: targets.into_iter().map(Arc::new).collect(),
        });
        info!(generation, count = guard.targets.len(), "target list replaced");
        generation
    }
}
