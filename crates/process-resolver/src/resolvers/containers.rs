use bpf_common::{
    Pid,
    containers::ContainerId,
    parsing::procfs::{self, ProcfsError},
};
use thiserror::Error;

use super::ContainerResolver;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error(transparent)]
    Procfs(#[from] ProcfsError),
}

/// Detects Docker and libpod containers from `/proc/<pid>/cgroup`.
#[derive(Debug, Default)]
pub struct ProcfsContainerResolver;

impl ContainerResolver for ProcfsContainerResolver {
    fn container_id(&mut self, pid: Pid) -> Result<Option<String>, ContainerError> {
        Ok(procfs::get_process_container_id(pid)?.map(ContainerId::into_string))
    }
}
