//! Utility functions used to extract data from procfs

use glob::glob;
use lazy_static::lazy_static;
use nix::unistd::Pid;
use regex::Regex;
use std::{
    fs::{self, File},
    io::{self, BufReader, prelude::*},
    os::unix::fs::MetadataExt,
    path::PathBuf,
};
use thiserror::Error;

use crate::{
    containers::ContainerId,
    time::{Timestamp, suspended_nanos},
};

lazy_static! {
    /// Pattern for matching cgroups created by Docker.
    static ref RE_CGROUP_DOCKER: Regex = Regex::new(r"docker.(?P<id>[0-9a-f]+)(?:[^0-9a-f])").unwrap();
    /// Pattern for matching cgroups created by libpod/podman.
    static ref RE_CGROUP_LIBPOD: Regex = Regex::new(r"libpod(?:-conmon)?-(?P<id>[0-9a-f]+)(?:[^0-9a-f])").unwrap();
}

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
    #[error("malformed {path}")]
    InvalidStat { path: String },
}

impl ProcfsError {
    /// True when the file is gone, which for `/proc/<pid>` means the process exited.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcfsError::ReadFile { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Returns the path of the executable image of a given process.
pub fn get_process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

/// Returns the inode of the executable image of a given process.
///
/// This follows the `/proc/<pid>/exe` link, so the kernel runs `vfs_getattr`
/// on the binary itself.
pub fn get_process_image_inode(pid: Pid) -> Result<u64, ProcfsError> {
    let path = format!("/proc/{pid}/exe");
    fs::metadata(&path)
        .map(|metadata| metadata.ino())
        .map_err(|source| ProcfsError::ReadFile { source, path })
}

/// Returns the raw mountinfo of the mount namespace of a given process.
pub fn get_process_mountinfo(pid: Pid) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/mountinfo");
    fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })
}

/// Returns when a given process started, in nanoseconds of `CLOCK_MONOTONIC`.
///
/// The kernel reports the start time in clock ticks of `CLOCK_BOOTTIME` as
/// field 22 of `/proc/<pid>/stat`; the time spent suspended is subtracted.
/// The command name (field 2) may contain spaces and parentheses, so fields
/// are counted from the last `)`.
pub fn get_process_start_time(pid: Pid) -> Result<Timestamp, ProcfsError> {
    let path = format!("/proc/{pid}/stat");
    let stat = fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.clone(),
    })?;
    let start_ticks: u64 = stat
        .rsplit_once(')')
        .and_then(|(_, fields)| fields.split_whitespace().nth(19))
        .ok_or(ProcfsError::InvalidStat { path })?
        .parse()?;
    Ok(Timestamp::from_boottime(
        ticks_to_nanos(start_ticks),
        suspended_nanos(),
    ))
}

fn ticks_to_nanos(ticks: u64) -> u64 {
    let ticks_per_second = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        n if n > 0 => n as u64,
        _ => 100,
    };
    ticks.saturating_mul(1_000_000_000) / ticks_per_second
}

/// Return where a link is pointing to.
fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

fn get_container_id_from_cgroup(cgroup_info: &str) -> Option<ContainerId> {
    if let Some(id) = RE_CGROUP_DOCKER.captures(cgroup_info).and_then(|caps| caps.name("id")) {
        return Some(ContainerId::Docker(id.as_str().to_string()));
    }
    if let Some(id) = RE_CGROUP_LIBPOD.captures(cgroup_info).and_then(|caps| caps.name("id")) {
        return Some(ContainerId::Libpod(id.as_str().to_string()));
    }
    None
}

pub fn get_process_container_id(pid: Pid) -> Result<Option<ContainerId>, ProcfsError> {
    if pid.as_raw() == 0 {
        return Ok(None);
    }

    let path = format!("/proc/{pid}/cgroup");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(container_id) = get_container_id_from_cgroup(&line) {
            return Ok(Some(container_id));
        }
    }

    Ok(None)
}
