use std::{collections::HashMap, path::PathBuf};

use bpf_common::{
    Pid,
    parsing::{
        mountinfo::{MountInfo, parse_mountinfo},
        procfs::{self, ProcfsError},
    },
};
use thiserror::Error;

use super::MountResolver;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
    #[error("reading mount points")]
    Procfs(#[source] ProcfsError),
}

/// Mount cache filled from `/proc/<pid>/mountinfo`.
///
/// Mount ids are unique system wide, so the mounts of every namespace share
/// the same table.
#[derive(Debug, Default)]
pub struct ProcfsMountResolver {
    mounts: HashMap<u32, MountInfo>,
}

impl ProcfsMountResolver {
    fn insert(&mut self, mountinfo: &str) {
        for mount in parse_mountinfo(mountinfo) {
            self.mounts.insert(mount.mount_id, mount);
        }
    }
}

impl MountResolver for ProcfsMountResolver {
    fn sync_cache(&mut self, pid: Pid) -> Result<(), MountError> {
        let mountinfo = procfs::get_process_mountinfo(pid).map_err(|err| {
            if err.is_not_found() {
                MountError::ProcessNotFound(pid)
            } else {
                MountError::Procfs(err)
            }
        })?;
        self.insert(&mountinfo);
        log::trace!("{} mount points known after syncing {pid}", self.mounts.len());
        Ok(())
    }

    fn mount_point(&self, mount_id: u32) -> Option<PathBuf> {
        self.mounts.get(&mount_id).map(|mount| mount.mount_point.clone())
    }
}
