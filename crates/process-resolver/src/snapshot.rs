//! Seeding of the kernel maps with the processes running at startup.
//!
//! Listing `/proc` races with process creation: a child forked after the
//! listing but before its parent was inserted would be missed, since the
//! kernel instrumentation only copies the entry of the parent. The whole
//! process list is therefore walked again until a pass inserts nothing.

use std::{collections::HashMap, sync::Arc};

use bpf_common::{
    KernelMap, KprobeTarget, MapError, MapRegistry, Pid, ProbeManager, ProgramError,
    maps::{KernelMapExt, NativeBytes},
    parsing::procfs::ProcfsError,
};
use thiserror::Error;

use crate::{
    entry::{FileEvent, ProcCacheEntry, ProcessResolverEntry},
    error::SnapshotError,
    resolver::ProcessResolver,
    resolvers::{ContainerError, MountError, Resolvers},
};

/// Why a process was left out of the snapshot.
#[derive(Error, Debug)]
enum SkipReason {
    #[error("couldn't sync mount points")]
    Mounts(#[source] MountError),
    #[error("couldn't parse container ID")]
    Container(#[source] ContainerError),
    #[error("couldn't readlink binary")]
    Readlink(#[source] ProcfsError),
    #[error("couldn't stat binary")]
    Stat(#[source] ProcfsError),
    #[error("couldn't retrieve numlower value")]
    Numlower(#[source] MapError),
    #[error("couldn't insert cache entry")]
    InsertEntry(#[source] MapError),
    #[error("couldn't insert cookie")]
    InsertCookie(#[source] MapError),
}

/// A kprobe detached when dropped.
struct ActiveKprobe<'a, P: ProbeManager> {
    program: &'a mut P,
    kprobe: &'a KprobeTarget,
}

impl<'a, P: ProbeManager> ActiveKprobe<'a, P> {
    fn attach(program: &'a mut P, kprobe: &'a KprobeTarget) -> Result<Self, ProgramError> {
        program.attach_kprobe(kprobe)?;
        Ok(Self { program, kprobe })
    }
}

impl<P: ProbeManager> Drop for ActiveKprobe<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = self.program.detach_kprobe(self.kprobe) {
            log::debug!(
                "couldn't detach {}: {:#}",
                self.kprobe,
                anyhow::Error::from(err)
            );
        }
    }
}

/// Everything a snapshot pass touches, borrowed from the resolver.
struct Snapshot<'a> {
    resolvers: &'a mut Resolvers,
    pid_cookie: &'a mut dyn KernelMap,
    proc_cache: &'a mut dyn KernelMap,
    inode_numlower: &'a dyn KernelMap,
    entry_cache: &'a mut HashMap<Pid, Arc<ProcessResolverEntry>>,
}

impl Snapshot<'_> {
    /// One enumeration of the running processes. Returns how many of them
    /// were inserted in the kernel cache: zero means a fixed point.
    fn pass(&mut self) -> Result<usize, ProcfsError> {
        let processes = self.resolvers.processes.processes()?;
        let mut inserted = 0;
        for process in processes {
            // the /proc entry of short lived processes may already be gone
            if process.exe.as_os_str().is_empty() {
                continue;
            }
            if self.process(process.pid) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Insert a process in the kernel cache. Returns true if it did.
    fn process(&mut self, pid: Pid) -> bool {
        match self.try_process(pid) {
            Ok(inserted) => inserted,
            Err(reason) => {
                log::debug!(
                    "snapshot failed for {pid}: {:#}",
                    anyhow::Error::from(reason)
                );
                false
            }
        }
    }

    fn try_process(&mut self, pid: Pid) -> Result<bool, SkipReason> {
        // a cookie means the kernel cache already has this process
        if self.pid_cookie.get(&pid.to_ne_vec()).is_ok() {
            return Ok(false);
        }

        match self.resolvers.mounts.sync_cache(pid) {
            Ok(()) | Err(MountError::ProcessNotFound(_)) => {}
            Err(err) => return Err(SkipReason::Mounts(err)),
        }

        let container_id = self
            .resolvers
            .containers
            .container_id(pid)
            .map_err(SkipReason::Container)?
            .unwrap_or_default();

        let pathname = self
            .resolvers
            .processes
            .exe_path(pid)
            .map_err(SkipReason::Readlink)?;
        self.entry_cache.insert(
            pid,
            Arc::new(ProcessResolverEntry {
                pathname: pathname.to_string_lossy().into_owned(),
                timestamp: None,
            }),
        );

        // stat fires the getattr kprobe, which fills inode_numlower
        let inode = self
            .resolvers
            .processes
            .exe_inode(pid)
            .map_err(SkipReason::Stat)?;
        let overlay_num_lower: i32 = self
            .inode_numlower
            .lookup(inode)
            .map_err(SkipReason::Numlower)?;

        let timestamp_raw = self
            .resolvers
            .processes
            .start_time(pid)
            .unwrap_or_else(|err| {
                log::trace!("start time of {pid} unknown: {err}");
                0
            });

        let entry = ProcCacheEntry {
            container_id,
            file: FileEvent {
                inode,
                mount_id: 0,
                overlay_num_lower,
                path_id: 0,
            },
            timestamp_raw,
        };
        let cookie = self.resolvers.cookies.new_cookie();

        // entry first: a reader following the cookie must find it
        self.proc_cache
            .set(&cookie.to_ne_vec(), &entry.encode())
            .map_err(SkipReason::InsertEntry)?;
        self.pid_cookie
            .update(pid, cookie)
            .map_err(SkipReason::InsertCookie)?;
        log::trace!("{pid} ({}) inserted with cookie {cookie}", entry.container_id);
        Ok(true)
    }
}

impl<P: MapRegistry + ProbeManager> ProcessResolver<P> {
    /// Insert every running process into the kernel cache.
    ///
    /// The getattr kprobe stays attached only for the duration of the call.
    pub fn snapshot(&mut self) -> Result<(), SnapshotError> {
        let map_name = &self.config.inode_numlower_map;
        self.program
            .register_map(map_name)
            .map_err(|source| SnapshotError::RegisterMap {
                name: map_name.clone(),
                source,
            })?;
        let inode_numlower = match &mut self.inode_numlower {
            Some(map) => map,
            slot @ None => slot.insert(self.program.map::<8, 4>(map_name).map_err(|source| {
                SnapshotError::MissingMap {
                    name: map_name.clone(),
                    source,
                }
            })?),
        };

        let _kprobe = ActiveKprobe::attach(&mut self.program, &self.config.getattr).map_err(
            |source| SnapshotError::AttachKprobe {
                kprobe: self.config.getattr.to_string(),
                source,
            },
        )?;

        let mut snapshot = Snapshot {
            resolvers: &mut self.resolvers,
            pid_cookie: self.pid_cookie.as_mut(),
            proc_cache: self.proc_cache.as_mut(),
            inode_numlower: &**inode_numlower,
            entry_cache: &mut self.entry_cache,
        };

        log::info!("Taking a snapshot of running processes");
        let attempts = self.config.snapshot_attempts;
        let mut inserted = 0;
        for attempt in 1..=attempts {
            match snapshot.pass() {
                Ok(0) => {
                    log::info!(
                        "Inserted {inserted} processes, snapshot completed at attempt {attempt}"
                    );
                    return Ok(());
                }
                Ok(count) => {
                    inserted += count;
                    log::debug!("{count} processes inserted, snapshot attempt {attempt}");
                }
                Err(err) => log::debug!(
                    "listing processes failed, snapshot attempt {attempt}: {:#}",
                    anyhow::Error::from(err)
                ),
            }
        }
        Err(SnapshotError::NotConverged { attempts })
    }
}
