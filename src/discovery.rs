use crate::control::ProcessControl;
use crate::proc::{Fingerprint, ProcessInfo};
use crate::target::Matcher;

use std::io;

use nix::unistd::Pid;

/// A candidate bound to a target for one round only.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub info: ProcessInfo,
}

impl ResolvedTarget {
    pub fn pid(&self) -> Pid {
        self.info.pid
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.info.fingerprint()
    }
}

#[derive(Debug, Clone)]
pub enum Discovery {
    NotFound,
    Unique(ResolvedTarget),
    Ambiguous(Vec<Pid>),
}

/// Matches every live process against `matcher`. Zombies and kernel threads
/// never match.
pub fn discover<C: ProcessControl>(control: &C, matcher: &Matcher) -> io::Result<Discovery> {
    let mut found: Vec<ProcessInfo> = control
        .scan()?
        .into_iter()
        .filter(|p| !p.is_zombie() && !p.is_kernel_thread())
        .filter(|p| matcher.matches(p))
        .collect();

    Ok(match found.len() {
        0 => Discovery::NotFound,
        1 => Discovery::Unique(ResolvedTarget {
            info: found.remove(0),
        }),
        _ => {
            let mut pids: Vec<Pid> = found.iter().map(|p| p.pid).collect();
            pids.sort();
            Discovery::Ambiguous(pids)
        }
    })
}
