//! Collaborators of the [`ProcessResolver`](crate::ProcessResolver).
//!
//! Each concern is a trait, so tests can replace procfs and the kernel with
//! in-memory fakes. [`Resolvers::procfs`] bundles the default implementations.

use std::{path::PathBuf, time::SystemTime};

use bpf_common::{KernelMap, Pid, parsing::procfs::ProcfsError};

use crate::entry::FileEvent;

mod containers;
mod cookies;
mod dentry;
mod mounts;
mod processes;
mod time;

pub use containers::{ContainerError, ProcfsContainerResolver};
pub use cookies::RandomCookieGenerator;
pub use dentry::{
    DentryResolver, MAX_PATH_DEPTH, PATH_KEY_SIZE, PATH_LEAF_SIZE, PathError, PathKey, PathLeaf,
};
pub use mounts::{MountError, ProcfsMountResolver};
pub use processes::{ProcessListing, Procfs};
pub use time::BootTimeResolver;

/// Mount points of the processes, keyed by mount id.
pub trait MountResolver: Send {
    /// Load the mounts visible to a process.
    fn sync_cache(&mut self, pid: Pid) -> Result<(), MountError>;

    fn mount_point(&self, mount_id: u32) -> Option<PathBuf>;
}

pub trait ContainerResolver: Send {
    /// Id of the container running a process, if any.
    fn container_id(&mut self, pid: Pid) -> Result<Option<String>, ContainerError>;
}

pub trait PathResolver: Send {
    /// Absolute path of a file. [`PathError::NotFound`] when the kernel has
    /// no record of it.
    fn resolve_inode(&self, file: &FileEvent, resolvers: &Resolvers) -> Result<String, PathError>;
}

pub trait TimeResolver: Send {
    /// Wall-clock time of a `CLOCK_MONOTONIC` timestamp in nanoseconds.
    fn resolve_monotonic_timestamp(&self, raw: u64) -> SystemTime;
}

/// Live processes and their executables.
pub trait ProcessEnumerator: Send {
    fn processes(&mut self) -> Result<Vec<ProcessListing>, ProcfsError>;

    fn exe_path(&mut self, pid: Pid) -> Result<PathBuf, ProcfsError>;

    /// Inode of the executable. Implementations must stat the binary through
    /// the kernel: that's what fills the `inode_numlower` map.
    fn exe_inode(&mut self, pid: Pid) -> Result<u64, ProcfsError>;

    /// Process creation time in nanoseconds of `CLOCK_MONOTONIC`, the clock
    /// of `timestamp_raw`.
    fn start_time(&mut self, pid: Pid) -> Result<u64, ProcfsError>;
}

pub trait CookieGenerator: Send {
    fn new_cookie(&mut self) -> u32;
}

pub struct Resolvers {
    pub mounts: Box<dyn MountResolver>,
    pub containers: Box<dyn ContainerResolver>,
    pub paths: Box<dyn PathResolver>,
    pub time: Box<dyn TimeResolver>,
    pub processes: Box<dyn ProcessEnumerator>,
    pub cookies: Box<dyn CookieGenerator>,
}

impl Resolvers {
    /// Resolvers backed by procfs and the `pathnames` kernel map.
    pub fn procfs(pathnames: Box<dyn KernelMap>) -> Self {
        Self {
            mounts: Box::new(ProcfsMountResolver::default()),
            containers: Box::new(ProcfsContainerResolver),
            paths: Box::new(DentryResolver::new(pathnames)),
            time: Box::new(BootTimeResolver::detect()),
            processes: Box::new(Procfs),
            cookies: Box::new(RandomCookieGenerator::default()),
        }
    }
}
