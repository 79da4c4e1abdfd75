use std::path::PathBuf;

use bpf_common::{
    Pid,
    parsing::procfs::{self, ProcfsError},
};

use super::ProcessEnumerator;

/// A live process, as seen while enumerating `/proc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessListing {
    pub pid: Pid,
    /// Empty when the process exited before its `exe` link could be read.
    pub exe: PathBuf,
}

/// [`ProcessEnumerator`] reading `/proc`.
#[derive(Debug, Default)]
pub struct Procfs;

impl ProcessEnumerator for Procfs {
    fn processes(&mut self) -> Result<Vec<ProcessListing>, ProcfsError> {
        Ok(procfs::get_running_processes()?
            .into_iter()
            .map(|pid| ProcessListing {
                pid,
                exe: procfs::get_process_image(pid).unwrap_or_default(),
            })
            .collect())
    }

    fn exe_path(&mut self, pid: Pid) -> Result<PathBuf, ProcfsError> {
        procfs::get_process_image(pid)
    }

    fn exe_inode(&mut self, pid: Pid) -> Result<u64, ProcfsError> {
        procfs::get_process_image_inode(pid)
    }

    fn start_time(&mut self, pid: Pid) -> Result<u64, ProcfsError> {
        procfs::get_process_start_time(pid).map(|start| start.raw())
    }
}
