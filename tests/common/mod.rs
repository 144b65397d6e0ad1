#![allow(dead_code)]

use sigprobe::{
    ControlError, DescriptorStore, Engine, HeldState, OutcomeRecord, OutcomeSink, Pid,
    ProcessControl, ProcessInfo, RunConfig, Signal, TargetDescriptor, Timing,
};

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub enum Reaction {
    ExitAfter(Duration),
    Ignore,
}

/// What happens once a process has been inspected its budgeted number of times.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Vanish,
    ReadError,
}

#[derive(Debug, Clone)]
pub struct FakeProc {
    pub comm: String,
    pub exe: PathBuf,
    pub start_time: u64,
    pub born_at: Option<Instant>,
    pub exit_at: Option<Instant>,
    pub on_graceful: Reaction,
    pub on_forceful: Reaction,
    /// Killed by a supervisor this long after being stopped.
    pub watchdog: Option<Duration>,
    /// A signal reported while held, this long after being stopped.
    pub intercept: Option<(Duration, Signal)>,
    intercept_at: Option<Instant>,
    pub respawn_pid: Option<i32>,
    /// Never reaches the attach stop.
    pub unresponsive: bool,
    /// Exits when attached after this many successful attaches.
    pub attach_budget: Option<usize>,
    pub inspect_fault: Option<(usize, Fault)>,
}

impl FakeProc {
    pub fn new(name: &str) -> Self {
        Self {
            comm: name.into(),
            exe: PathBuf::from(format!("/usr/bin/{}", name)),
            start_time: 0,
            born_at: None,
            exit_at: None,
            on_graceful: Reaction::ExitAfter(Duration::from_millis(100)),
            on_forceful: Reaction::ExitAfter(Duration::from_millis(10)),
            watchdog: None,
            intercept: None,
            intercept_at: None,
            respawn_pid: None,
            unresponsive: false,
            attach_budget: None,
            inspect_fault: None,
        }
    }

    pub fn on_graceful(mut self, r: Reaction) -> Self {
        self.on_graceful = r;
        self
    }

    pub fn on_forceful(mut self, r: Reaction) -> Self {
        self.on_forceful = r;
        self
    }

    fn alive(&self, now: Instant) -> bool {
        self.born_at.map_or(true, |t| now >= t) && self.exit_at.map_or(true, |t| now < t)
    }

    fn die_at(&mut self, at: Instant) {
        if self.exit_at.map_or(true, |t| at < t) {
            self.exit_at = Some(at);
        }
    }
}

#[derive(Debug, Default)]
struct State {
    procs: BTreeMap<i32, FakeProc>,
    next_start: u64,
    held: HashSet<i32>,
    attaches: usize,
    detaches: usize,
    signals: Vec<(i32, Signal)>,
    deny: HashSet<i32>,
    reuse_on_attach: HashSet<i32>,
    failing_scans: usize,
    scan_delay: Option<Duration>,
}

/// An in-memory process table. Time follows the tokio clock.
#[derive(Debug, Default)]
pub struct FakeOs {
    state: Mutex<State>,
}

impl FakeOs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn(&self, pid: i32, mut proc: FakeProc) {
        let mut st = self.state.lock().unwrap();
        st.next_start += 100;
        proc.start_time = st.next_start;
        st.procs.insert(pid, proc);
    }

    pub fn exit_now(&self, pid: i32) {
        let now = Instant::now();
        if let Some(p) = self.state.lock().unwrap().procs.get_mut(&pid) {
            p.die_at(now);
        }
    }

    pub fn fail_next_scans(&self, count: usize) {
        self.state.lock().unwrap().failing_scans = count;
    }

    /// Every scan blocks its thread for `delay` of real time.
    pub fn slow_scans(&self, delay: Duration) {
        self.state.lock().unwrap().scan_delay = Some(delay);
    }

    pub fn deny(&self, pid: i32) {
        self.state.lock().unwrap().deny.insert(pid);
    }

    /// The next attach to `pid` finds an unrelated process in its place.
    pub fn reuse_on_attach(&self, pid: i32) {
        self.state.lock().unwrap().reuse_on_attach.insert(pid);
    }

    pub fn signals(&self) -> Vec<(i32, Signal)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn signals_to(&self, pid: i32) -> Vec<Signal> {
        self.signals()
            .into_iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, s)| s)
            .collect()
    }

    pub fn held(&self) -> usize {
        self.state.lock().unwrap().held.len()
    }

    pub fn attaches(&self) -> usize {
        self.state.lock().unwrap().attaches
    }

    pub fn detaches(&self) -> usize {
        self.state.lock().unwrap().detaches
    }

    fn info(pid: i32, p: &FakeProc) -> ProcessInfo {
        ProcessInfo {
            pid: Pid::from_raw(pid),
            comm: p.comm.clone(),
            state: 'S',
            start_time: p.start_time,
            exe: Some(p.exe.clone()),
            cmdline: vec![p.exe.display().to_string()],
        }
    }

    fn apply(st: &mut State, pid: i32, sig: Signal, now: Instant) {
        let respawn = match st.procs.get_mut(&pid) {
            Some(p) => {
                let reaction = if sig == Signal::SIGKILL {
                    p.on_forceful
                } else {
                    p.on_graceful
                };
                match reaction {
                    Reaction::ExitAfter(d) => {
                        p.die_at(now + d);
                        p.respawn_pid.take().map(|new| (new, p.clone(), now + d))
                    }
                    Reaction::Ignore => None,
                }
            }
            None => None,
        };
        if let Some((new_pid, mut proc, at)) = respawn {
            st.next_start += 100;
            proc.start_time = st.next_start;
            proc.born_at = Some(at);
            proc.exit_at = None;
            st.procs.insert(new_pid, proc);
        }
    }
}

impl ProcessControl for FakeOs {
    fn preflight(&self) -> Result<(), ControlError> {
        Ok(())
    }

    fn scan(&self) -> io::Result<Vec<ProcessInfo>> {
        let delay = {
            let mut st = self.state.lock().unwrap();
            if st.failing_scans > 0 {
                st.failing_scans -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "process table unreadable"));
            }
            st.scan_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let now = Instant::now();
        let st = self.state.lock().unwrap();
        Ok(st
            .procs
            .iter()
            .filter(|(_, p)| p.alive(now))
            .map(|(&pid, p)| Self::info(pid, p))
            .collect())
    }

    fn inspect(&self, pid: Pid) -> io::Result<Option<ProcessInfo>> {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();
        let proc = match st.procs.get_mut(&pid.as_raw()) {
            Some(p) if p.alive(now) => p,
            _ => return Ok(None),
        };
        if let Some((budget, fault)) = proc.inspect_fault {
            if budget == 0 {
                return match fault {
                    Fault::Vanish => {
                        proc.die_at(now);
                        Ok(None)
                    }
                    Fault::ReadError => Err(io::Error::new(
                        io::ErrorKind::Other,
                        "process entry unreadable",
                    )),
                };
            }
            proc.inspect_fault = Some((budget - 1, fault));
        }
        Ok(Some(Self::info(pid.as_raw(), proc)))
    }

    fn attach(&self, pid: Pid, timeout: Duration) -> Result<(), ControlError> {
        let now = Instant::now();
        let pid = pid.as_raw();
        let mut st = self.state.lock().unwrap();
        if st.deny.contains(&pid) {
            return Err(ControlError::PermissionDenied);
        }
        if st.reuse_on_attach.remove(&pid) {
            st.next_start += 100;
            let mut lookalike = FakeProc::new("lookalike");
            lookalike.start_time = st.next_start;
            if let Some(old) = st.procs.get(&pid) {
                lookalike.comm = old.comm.clone();
                lookalike.exe = old.exe.clone();
            }
            st.procs.insert(pid, lookalike);
        }
        let proc = match st.procs.get_mut(&pid) {
            Some(p) if p.alive(now) => p,
            _ => return Err(ControlError::NoSuchProcess),
        };
        if proc.unresponsive {
            return Err(ControlError::Timeout(timeout));
        }
        match proc.attach_budget {
            Some(0) => {
                proc.die_at(now);
                return Err(ControlError::NoSuchProcess);
            }
            Some(n) => proc.attach_budget = Some(n - 1),
            None => {}
        }
        if let Some(d) = proc.watchdog {
            proc.die_at(now + d);
        }
        proc.intercept_at = proc.intercept.map(|(d, _)| now + d);
        if !st.held.insert(pid) {
            return Err(ControlError::PermissionDenied);
        }
        st.attaches += 1;
        Ok(())
    }

    fn detach(&self, pid: Pid, forward: Option<Signal>) -> Result<(), ControlError> {
        let now = Instant::now();
        let pid = pid.as_raw();
        let mut st = self.state.lock().unwrap();
        assert!(st.held.remove(&pid), "detach without hold: pid = {}", pid);
        st.detaches += 1;
        let alive = st.procs.get(&pid).map_or(false, |p| p.alive(now));
        if !alive {
            return Err(ControlError::NoSuchProcess);
        }
        if let Some(sig) = forward {
            Self::apply(&mut st, pid, sig, now);
        }
        Ok(())
    }

    fn signal(&self, pid: Pid, sig: Signal) -> Result<(), ControlError> {
        let now = Instant::now();
        let pid = pid.as_raw();
        let mut st = self.state.lock().unwrap();
        let alive = st.procs.get(&pid).map_or(false, |p| p.alive(now));
        if !alive {
            return Err(ControlError::NoSuchProcess);
        }
        st.signals.push((pid, sig));
        Self::apply(&mut st, pid, sig, now);
        Ok(())
    }

    fn held_state(&self, pid: Pid) -> Result<HeldState, ControlError> {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();
        let proc = match st.procs.get_mut(&pid.as_raw()) {
            Some(p) => p,
            None => return Ok(HeldState::Exited),
        };
        if !proc.alive(now) {
            return Ok(HeldState::Exited);
        }
        if let (Some(at), Some((_, sig))) = (proc.intercept_at, proc.intercept) {
            if now >= at {
                proc.intercept_at = None;
                return Ok(HeldState::Intercepted(sig));
            }
        }
        Ok(HeldState::Stopped)
    }
}

#[derive(Debug, Default)]
pub struct CollectSink {
    pub records: Mutex<Vec<OutcomeRecord>>,
}

impl OutcomeSink for CollectSink {
    fn emit(&self, record: &OutcomeRecord) -> io::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

impl CollectSink {
    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.records.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub os: Arc<FakeOs>,
    pub store: Arc<DescriptorStore>,
    pub sink: Arc<CollectSink>,
    pub engine: Arc<Engine<FakeOs>>,
}

pub fn harness(
    os: Arc<FakeOs>,
    targets: Vec<TargetDescriptor>,
    tune: impl FnOnce(&mut RunConfig),
) -> Harness {
    let mut config = RunConfig::new(targets);
    config.round_interval_ms = 60_000;
    config.max_wait_ms = 1000;
    config.poll_interval_ms = 100;
    tune(&mut config);
    config.validate().unwrap();

    let store = Arc::new(DescriptorStore::new(config.targets.clone()));
    let sink = Arc::new(CollectSink::default());
    let engine = Arc::new(Engine::new(
        Arc::clone(&os),
        Arc::clone(&store),
        Timing::from(&config),
        Arc::clone(&sink) as Arc<dyn OutcomeSink>,
    ));
    Harness {
        os,
        store,
        sink,
        engine,
    }
}
