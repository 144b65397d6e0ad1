use crate::proc::ProcessInfo;

use std::fmt;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub name: String,

    pub matcher: Matcher,

    #[serde(flatten)]
    pub policy: SignalPolicy,

    #[serde(default = "default_graceful", with = "signal_name")]
    pub graceful_signal: Signal,

    #[serde(default = "default_forceful", with = "signal_name")]
    pub forceful_signal: Signal,
}

fn default_graceful() -> Signal {
    Signal::SIGTERM
}

fn default_forceful() -> Signal {
    Signal::SIGKILL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum SignalPolicy {
    Graceful,
    Forceful,
    GracefulThenEscalate { escalation_timeout_ms: u64 },
    /// Keep the target stopped under a ptrace hold and wait for its
    /// supervisor's watchdog to kill it.
    Stall { stall_ms: u64 },
}

impl SignalPolicy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            SignalPolicy::Graceful => PolicyKind::Graceful,
            SignalPolicy::Forceful => PolicyKind::Forceful,
            SignalPolicy::GracefulThenEscalate { .. } => PolicyKind::GracefulThenEscalate,
            SignalPolicy::Stall { .. } => PolicyKind::Stall,
        }
    }
}

/// Policy names without their parameters, used to disable whole policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    Graceful,
    Forceful,
    GracefulThenEscalate,
    Stall,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyKind::Graceful => "graceful",
            PolicyKind::Forceful => "forceful",
            PolicyKind::GracefulThenEscalate => "graceful-then-escalate",
            PolicyKind::Stall => "stall",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<Pattern>,
}

impl Matcher {
    pub fn is_empty(&self) -> bool {
        self.exe.is_none() && self.name.is_none() && self.cmdline.is_none()
    }

    pub fn matches(&self, info: &ProcessInfo) -> bool {
        if self.is_empty() {
            return false;
        }

        if let Some(ref exe) = self.exe {
            if info.exe.as_deref() != Some(exe.as_path()) {
                return false;
            }
        }

        if let Some(ref name) = self.name {
            if !name_matches(name, info) {
                return false;
            }
        }

        if let Some(ref pattern) = self.cmdline {
            if !pattern.0.is_match(&info.cmdline.join(" ")) {
                return false;
            }
        }

        true
    }
}

// pidof semantics: comm, basename of exe, or basename of argv[0].
fn name_matches(name: &str, info: &ProcessInfo) -> bool {
    let basename = |p: &Path| p.file_name().map(|s| s.to_string_lossy().into_owned());

    if info.comm == name {
        return true;
    }
    // comm is truncated by the kernel; trust the prefix only when exe is unreadable
    if info.exe.is_none()
        && name.len() > COMM_LEN
        && info.comm.len() == COMM_LEN
        && name.starts_with(&info.comm)
    {
        return true;
    }
    if info.exe.as_deref().and_then(basename).as_deref() == Some(name) {
        return true;
    }
    if let Some(argv0) = info.cmdline.first() {
        if basename(Path::new(argv0)).as_deref() == Some(name) {
            return true;
        }
    }
    false
}

const COMM_LEN: usize = 15;

/// A command line regex, kept as its source text for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern(pub Regex);

impl TryFrom<String> for Pattern {
    type Error = regex::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Regex::new(&s).map(Pattern)
    }
}

impl From<Pattern> for String {
    fn from(p: Pattern) -> String {
        p.0.as_str().to_owned()
    }
}

impl TargetDescriptor {
    pub fn new(name: impl Into<String>, policy: SignalPolicy) -> Self {
        Self {
            name: name.into(),
            matcher: Matcher::default(),
            policy,
            graceful_signal: default_graceful(),
            forceful_signal: default_forceful(),
        }
    }

    pub fn exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.matcher.exe = Some(exe.into());
        self
    }

    pub fn process_name(mut self, name: impl Into<String>) -> Self {
        self.matcher.name = Some(name.into());
        self
    }

    pub fn cmdline(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.matcher.cmdline = Some(Pattern(Regex::new(pattern)?));
        Ok(self)
    }

    pub fn signals(mut self, graceful: Signal, forceful: Signal) -> Self {
        self.graceful_signal = graceful;
        self.forceful_signal = forceful;
        self
    }
}

mod signal_name {
    use std::str::FromStr;

    use nix::sys::signal::Signal;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(signal: &Signal, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(signal.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signal, D::Error> {
        let s = String::deserialize(d)?;
        let upper = s.to_ascii_uppercase();
        let full = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        };
        Signal::from_str(&full).map_err(|_| de::Error::custom(format!("unknown signal: {}", s)))
    }
}
