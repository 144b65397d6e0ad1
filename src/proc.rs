use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::{fs, str};

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, trace};

pub const PROC_ROOT: &str = "/proc";

/// Process metadata read from procfs at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub comm: String,
    pub state: char,
    pub start_time: u64, // clock ticks since boot
    pub exe: Option<PathBuf>,
    pub cmdline: Vec<String>,
}

/// Stable attributes which tell two processes sharing a pid apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub pid: Pid,
    pub start_time: u64,
    pub exe: Option<PathBuf>,
}

impl ProcessInfo {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            pid: self.pid,
            start_time: self.start_time,
            exe: self.exe.clone(),
        }
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }

    pub fn is_kernel_thread(&self) -> bool {
        self.cmdline.is_empty() && self.exe.is_none()
    }
}

impl Fingerprint {
    /// `other` denotes the same live process.
    pub fn matches(&self, other: &ProcessInfo) -> bool {
        self.pid == other.pid
            && self.start_time == other.start_time
            && self.exe == other.exe
            && !other.is_zombie()
    }
}

/// Lists every process visible under `root`. Entries which vanish or cannot
/// be read are skipped; only an unreadable `root` is an error.
pub fn scan(root: &Path) -> io::Result<Vec<ProcessInfo>> {
    let mut procs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(%err, "skip unreadable procfs entry");
                continue;
            }
        };
        let pid = match entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            Some(pid) => Pid::from_raw(pid),
            None => continue,
        };
        match read_process(root, pid) {
            Ok(Some(info)) => procs.push(info),
            Ok(None) => {}
            Err(err) => debug!(?pid, %err, "skip unreadable process"),
        }
    }
    trace!(count = procs.len(), "scanned process table");
    Ok(procs)
}

/// Reads one process, `Ok(None)` if it does not exist (anymore).
pub fn read_process(root: &Path, pid: Pid) -> io::Result<Option<ProcessInfo>> {
    let dir = root.join(pid.to_string());

    let stat = match fs::read(dir.join("stat")) {
        Ok(buf) => buf,
        Err(err) if is_gone(&err) => return Ok(None),
        Err(err) => return Err(err),
    };
    let (comm, state, start_time) = parse_stat(&stat).ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("malformed stat: pid = {}", pid),
        )
    })?;

    // exe is unreadable for kernel threads and for foreign processes without privilege
    let exe = match fs::read_link(dir.join("exe")) {
        Ok(path) => Some(strip_deleted(path)),
        Err(err) if is_gone(&err) || err.kind() == ErrorKind::PermissionDenied => None,
        Err(err) => return Err(err),
    };

    let cmdline = match fs::read(dir.join("cmdline")) {
        Ok(buf) => parse_cmdline(&buf),
        Err(err) if is_gone(&err) => return Ok(None),
        Err(err) => return Err(err),
    };

    Ok(Some(ProcessInfo {
        pid,
        comm,
        state,
        start_time,
        exe,
        cmdline,
    }))
}

fn is_gone(err: &io::Error) -> bool {
    // ESRCH shows up when the process exits between open and read
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(Errno::ESRCH as i32)
}

// The kernel appends " (deleted)" when the binary was replaced on disk.
fn strip_deleted(path: PathBuf) -> PathBuf {
    const SUFFIX: &str = " (deleted)";
    match path.to_str() {
        Some(s) if s.ends_with(SUFFIX) => PathBuf::from(&s[..s.len() - SUFFIX.len()]),
        _ => path,
    }
}

/// Extracts `(comm, state, starttime)` from the content of `/proc/<pid>/stat`.
pub fn parse_stat(buf: &[u8]) -> Option<(String, char, u64)> {
    let open = buf.iter().position(|&b| b == b'(')?;
    let close = buf.iter().rposition(|&b| b == b')')?;
    if close < open {
        return None;
    }
    let comm = String::from_utf8_lossy(&buf[open + 1..close]).into_owned();

    let rest = str::from_utf8(&buf[close + 1..]).ok()?;
    let mut fields = rest.split_ascii_whitespace();
    let state = fields.next()?.chars().next()?;
    // starttime is field 22; state was field 3
    let start_time = fields.nth(22 - 3 - 1)?.parse().ok()?;
    Some((comm, state, start_time))
}

fn parse_cmdline(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &[u8] = b"1234 (my (odd) svc) S 1 1234 1234 0 -1 4194560 1133 0 0 0 \
        12 3 0 0 20 0 1 0 98765 12345678 456 18446744073709551615 1 1 0 0 0 0 0 \
        4096 17475 0 0 0 17 2 0 0 0 0 0";

    #[test]
    fn stat_with_parens_in_comm() {
        let (comm, state, start) = parse_stat(STAT).unwrap();
        assert_eq!(comm, "my (odd) svc");
        assert_eq!(state, 'S');
        assert_eq!(start, 98765);
    }

    #[test]
    fn truncated_stat() {
        assert_eq!(parse_stat(b"1234 (svc) S 1 2 3"), None);
        assert_eq!(parse_stat(b"garbage"), None);
    }

    #[test]
    fn cmdline_split() {
        assert_eq!(
            parse_cmdline(b"/usr/bin/svc\0--flag\0value\0"),
            vec!["/usr/bin/svc", "--flag", "value"]
        );
        assert!(parse_cmdline(b"").is_empty());
    }

    #[test]
    fn deleted_binary() {
        assert_eq!(
            strip_deleted("/usr/bin/svc (deleted)".into()),
            PathBuf::from("/usr/bin/svc")
        );
    }

    #[test]
    fn fingerprint_rejects_reuse_and_zombies() {
        let info = ProcessInfo {
            pid: Pid::from_raw(7),
            comm: "svc".into(),
            state: 'S',
            start_time: 100,
            exe: Some("/usr/bin/svc".into()),
            cmdline: vec!["svc".into()],
        };
        let fp = info.fingerprint();
        assert!(fp.matches(&info));

        let reused = ProcessInfo {
            start_time: 200,
            ..info.clone()
        };
        assert!(!fp.matches(&reused));

        let zombie = ProcessInfo {
            state: 'Z',
            ..info.clone()
        };
        assert!(!fp.matches(&zombie));
    }

    #[test]
    fn scan_skips_unreadable_entries() {
        let root = std::env::temp_dir().join(format!("sigprobe-scan-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("100")).unwrap();
        fs::write(root.join("100/stat"), STAT).unwrap();
        fs::write(root.join("100/cmdline"), b"svc\0").unwrap();
        // reading a directory as `stat` fails with EISDIR
        fs::create_dir_all(root.join("200/stat")).unwrap();
        fs::create_dir_all(root.join("self")).unwrap();

        let procs = scan(&root).unwrap();
        fs::remove_dir_all(&root).unwrap();

        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, Pid::from_raw(100));
        assert_eq!(procs[0].start_time, 98765);
        assert_eq!(procs[0].exe, None);
        assert!(scan(&root).is_err());
    }

    #[test]
    fn read_self() {
        let pid = nix::unistd::getpid();
        let info = read_process(Path::new(PROC_ROOT), pid).unwrap().unwrap();
        assert_eq!(info.pid, pid);
        assert!(info.start_time > 0);
        assert!(!info.cmdline.is_empty());
    }
}
