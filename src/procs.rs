//! Process index: a periodically refreshed snapshot of the OS process table.
//!
//! On Linux the table is read straight from /proc; on macOS it is collected
//! with `ps`, and on Windows with `tasklist`. Readers always observe either
//! the previous or the next complete snapshot — a refresh builds the whole
//! map before swapping it in.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ProcDetails {
    pub pid: i32,
    pub name: String,
    pub cmd: String,
    pub parent_pid: i32,
    pub cpu: Option<f64>,
    pub memory: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ProcessIndex {
    cache: RwLock<HashMap<i32, ProcDetails>>,
}

impl ProcessIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache with a fresh OS enumeration. On failure the previous
    /// snapshot stays intact and the error propagates to the caller, which
    /// logs it and keeps polling.
    pub fn refresh(&self) -> eyre::Result<()> {
        let snapshot = enumerate()?;
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }

    pub fn get(&self, pid: i32) -> Option<ProcDetails> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    pub fn get_name(&self, pid: i32) -> Option<String> {
        self.get(pid).map(|p| p.name)
    }

    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk up the parent chain to the transitive ancestor whose parent is 0
    /// or unknown. The walk is bounded by the cache size so a corrupt snapshot
    /// with a parent cycle cannot loop forever.
    pub fn find_root_parent(&self, pid: i32) -> Option<ProcDetails> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);

        let mut current = cache.get(&pid)?;
        for _ in 0..cache.len() {
            if current.parent_pid == 0 {
                break;
            }
            match cache.get(&current.parent_pid) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Some(current.clone())
    }

    #[cfg(test)]
    fn install(&self, snapshot: HashMap<i32, ProcDetails>) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

#[cfg(target_os = "linux")]
fn enumerate() -> eyre::Result<HashMap<i32, ProcDetails>> {
    use eyre::Context;

    let mut snapshot = HashMap::new();

    for entry in std::fs::read_dir("/proc").context("Could not open /proc")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(pid) = name.parse::<i32>() else {
            continue;
        };

        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            // Process exited between readdir and read; skip it.
            continue;
        };
        let Some((proc_name, parent_pid)) = parse_proc_stat(&stat) else {
            continue;
        };

        let cmd = std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
            .map(|c| c.replace('\0', " ").trim_end().to_string())
            .unwrap_or_default();

        let memory = std::fs::read_to_string(format!("/proc/{pid}/statm"))
            .ok()
            .and_then(|statm| parse_statm_resident_bytes(&statm));

        snapshot.insert(
            pid,
            ProcDetails {
                pid,
                name: proc_name,
                cmd,
                parent_pid,
                cpu: None,
                memory,
            },
        );
    }

    Ok(snapshot)
}

#[cfg(target_os = "macos")]
fn enumerate() -> eyre::Result<HashMap<i32, ProcDetails>> {
    use eyre::Context;

    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,ppid=,comm=,args="])
        .output()
        .context("Could not run ps")?;

    if !output.status.success() {
        eyre::bail!("ps exited with {}", output.status);
    }

    Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(windows)]
fn enumerate() -> eyre::Result<HashMap<i32, ProcDetails>> {
    use eyre::Context;

    let output = std::process::Command::new("tasklist")
        .args(["/fo", "csv", "/nh"])
        .output()
        .context("Could not run tasklist")?;

    if !output.status.success() {
        eyre::bail!("tasklist exited with {}", output.status);
    }

    Ok(parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn enumerate() -> eyre::Result<HashMap<i32, ProcDetails>> {
    eyre::bail!("process enumeration is not supported on this platform")
}

/// Pull `(comm, ppid)` out of a /proc/<pid>/stat line. The comm field is
/// parenthesized and may itself contain spaces and parentheses, so the parse
/// anchors on the last closing parenthesis.
#[allow(dead_code)]
fn parse_proc_stat(stat: &str) -> Option<(String, i32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();

    // Fields after comm: state ppid pgrp ...
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let _state = rest.next()?;
    let parent_pid = rest.next()?.parse().ok()?;

    Some((name, parent_pid))
}

/// Resident set size from /proc/<pid>/statm (second field, in pages).
#[allow(dead_code)]
fn parse_statm_resident_bytes(statm: &str) -> Option<u64> {
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

/// Parse `ps -axo pid=,ppid=,comm=,args=` output.
#[allow(dead_code)]
fn parse_ps_output(output: &str) -> HashMap<i32, ProcDetails> {
    let mut snapshot = HashMap::new();

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(pid) = fields.next().and_then(|f| f.parse::<i32>().ok()) else {
            continue;
        };
        let Some(parent_pid) = fields.next().and_then(|f| f.parse::<i32>().ok()) else {
            continue;
        };
        let Some(comm) = fields.next() else { continue };
        let cmd = fields.collect::<Vec<_>>().join(" ");

        // comm is a path on macOS; the index keys on the executable name.
        let name = comm.rsplit('/').next().unwrap_or(comm).to_string();

        snapshot.insert(
            pid,
            ProcDetails {
                pid,
                name,
                cmd,
                parent_pid,
                cpu: None,
                memory: None,
            },
        );
    }

    snapshot
}

/// Parse `tasklist /fo csv /nh` output: `"name","pid","session","#","mem"`.
/// The parent pid is not reported, so every process reads as its own root.
#[allow(dead_code)]
fn parse_tasklist_csv(output: &str) -> HashMap<i32, ProcDetails> {
    let mut snapshot = HashMap::new();

    for line in output.lines() {
        let fields: Vec<String> = line
            .split("\",\"")
            .map(|f| f.trim_matches(|c| c == '"' || c == '\r').to_string())
            .collect();
        if fields.len() < 2 {
            continue;
        }

        let name = fields[0].clone();
        let Ok(pid) = fields[1].parse::<i32>() else {
            continue;
        };

        snapshot.insert(
            pid,
            ProcDetails {
                pid,
                name: name.clone(),
                cmd: name,
                parent_pid: 0,
                cpu: None,
                memory: None,
            },
        );
    }

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(pid: i32, parent_pid: i32, name: &str) -> ProcDetails {
        ProcDetails {
            pid,
            name: name.to_string(),
            cmd: String::new(),
            parent_pid,
            cpu: None,
            memory: None,
        }
    }

    #[test]
    fn parses_stat_with_hostile_comm() {
        let line = "4242 (Web Content) S 1000 4242 4242 0 -1 4194560";
        assert_eq!(parse_proc_stat(line), Some(("Web Content".to_string(), 1000)));

        let line = "17 (a)b) c() R 2 17 17 0 -1 0";
        assert_eq!(parse_proc_stat(line), Some(("a)b) c(".to_string(), 2)));
    }

    #[test]
    fn parses_statm() {
        assert_eq!(parse_statm_resident_bytes("12345 678 90 1 0 2 0"), Some(678 * 4096));
        assert_eq!(parse_statm_resident_bytes(""), None);
    }

    #[test]
    fn parses_ps_output() {
        let out = "    1     0 /sbin/launchd launchd\n\
                   4242  1000 /Applications/Firefox.app/Contents/MacOS/firefox /Applications/Firefox.app/Contents/MacOS/firefox -foreground\n\
                   bogus line\n";
        let snapshot = parse_ps_output(out);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&4242].name, "firefox");
        assert_eq!(snapshot[&4242].parent_pid, 1000);
        assert!(snapshot[&4242].cmd.contains("-foreground"));
    }

    #[test]
    fn parses_tasklist_csv() {
        let out = "\"chrome.exe\",\"8812\",\"Console\",\"1\",\"212,516 K\"\r\n\
                   \"System Idle Process\",\"0\",\"Services\",\"0\",\"8 K\"\r\n";
        let snapshot = parse_tasklist_csv(out);
        assert_eq!(snapshot[&8812].name, "chrome.exe");
        assert_eq!(snapshot[&0].name, "System Idle Process");
    }

    #[test]
    fn walks_to_root_parent() {
        let index = ProcessIndex::new();
        index.install(HashMap::from([
            (1, details(1, 0, "init")),
            (100, details(100, 1, "firefox")),
            (101, details(101, 100, "Web Content")),
            (102, details(102, 101, "Isolated Web Co")),
        ]));

        let root = index.find_root_parent(102).expect("root");
        assert_eq!(root.pid, 1);

        // Parent missing from the cache terminates the walk.
        let index = ProcessIndex::new();
        index.install(HashMap::from([(7, details(7, 999, "orphan"))]));
        assert_eq!(index.find_root_parent(7).expect("root").pid, 7);
    }

    #[test]
    fn root_walk_survives_parent_cycles() {
        let index = ProcessIndex::new();
        index.install(HashMap::from([
            (10, details(10, 11, "a")),
            (11, details(11, 10, "b")),
        ]));

        // Bounded by the cache size; either member of the cycle is acceptable.
        let root = index.find_root_parent(10).expect("root");
        assert!(root.pid == 10 || root.pid == 11);
    }

    #[test]
    fn unknown_pid_resolves_to_none() {
        let index = ProcessIndex::new();
        assert!(index.get(12345).is_none());
        assert!(index.find_root_parent(12345).is_none());
    }
}
