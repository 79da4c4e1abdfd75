use std::{collections::HashMap, sync::Arc};

use bpf_common::{
    KernelMap, MapRegistry, Pid, ProbeManager,
    maps::{KernelMapExt, NativeBytes},
};

use crate::{
    config::Config,
    entry::{PROC_CACHE_ENTRY_SIZE, ProcCacheEntry, ProcessResolverEntry},
    error::StartError,
    resolvers::Resolvers,
};

/// Resolves pids into [`ProcessResolverEntry`].
///
/// Lookups go to a userspace cache first. On a miss the kernel map chain
/// `pid_cookie[pid] -> proc_cache[cookie]` is followed and the decoded record
/// is turned into a path and a wall-clock time. [`ProcessResolver::snapshot`]
/// seeds the kernel maps with the processes which were already running.
pub struct ProcessResolver<P> {
    pub(crate) program: P,
    pub(crate) config: Config,
    pub(crate) resolvers: Resolvers,
    pub(crate) pid_cookie: Box<dyn KernelMap>,
    pub(crate) proc_cache: Box<dyn KernelMap>,
    /// Only bound once a snapshot runs
    pub(crate) inode_numlower: Option<Box<dyn KernelMap>>,
    pub(crate) entry_cache: HashMap<Pid, Arc<ProcessResolverEntry>>,
}

impl<P: MapRegistry + ProbeManager> ProcessResolver<P> {
    /// Bind the permanent kernel maps. Both must already be registered.
    pub fn start(mut program: P, resolvers: Resolvers, config: Config) -> Result<Self, StartError> {
        let proc_cache = program
            .map::<4, PROC_CACHE_ENTRY_SIZE>(&config.proc_cache_map)
            .map_err(|source| StartError::MissingMap {
                name: config.proc_cache_map.clone(),
                source,
            })?;
        let pid_cookie = program
            .map::<4, 4>(&config.pid_cookie_map)
            .map_err(|source| StartError::MissingMap {
                name: config.pid_cookie_map.clone(),
                source,
            })?;
        log::debug!(
            "process resolver bound to {} and {}",
            config.pid_cookie_map,
            config.proc_cache_map
        );
        Ok(Self {
            program,
            config,
            resolvers,
            pid_cookie,
            proc_cache,
            inode_numlower: None,
            entry_cache: HashMap::new(),
        })
    }
}

impl<P> ProcessResolver<P> {
    pub fn resolve(&mut self, pid: Pid) -> Option<Arc<ProcessResolverEntry>> {
        if let Some(entry) = self.entry_cache.get(&pid) {
            return Some(entry.clone());
        }
        // the event may have been delayed: ask the kernel directly
        let entry = Arc::new(self.resolve_from_kernel(pid)?);
        self.entry_cache.insert(pid, entry.clone());
        Some(entry)
    }

    /// Resolve a pid from the kernel maps only, leaving the cache untouched.
    pub fn resolve_from_kernel(&self, pid: Pid) -> Option<ProcessResolverEntry> {
        let cookie: u32 = self.pid_cookie.lookup(pid).ok()?;
        let raw = self.proc_cache.get(&cookie.to_ne_vec()).ok()?;
        let entry = match ProcCacheEntry::decode(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                log::debug!("invalid cache entry for {pid}: {err}");
                return None;
            }
        };
        let pathname = match self.resolvers.paths.resolve_inode(&entry.file, &self.resolvers) {
            Ok(pathname) => pathname,
            Err(err) => {
                log::trace!(
                    "path of {pid} (inode {}) not resolved: {:#}",
                    entry.file.inode,
                    anyhow::Error::from(err)
                );
                return None;
            }
        };
        let timestamp = self
            .resolvers
            .time
            .resolve_monotonic_timestamp(entry.timestamp_raw);
        Some(ProcessResolverEntry {
            pathname,
            timestamp: Some(timestamp),
        })
    }

    /// Insert or replace the cached identity of a pid.
    pub fn add_entry(&mut self, pid: Pid, entry: ProcessResolverEntry) {
        self.entry_cache.insert(pid, Arc::new(entry));
    }

    /// Forget a terminated process.
    ///
    /// The `proc_cache` record the pid pointed to is left in place.
    pub fn del_entry(&mut self, pid: Pid) {
        self.entry_cache.remove(&pid);
        if let Err(err) = self.pid_cookie.remove(pid) {
            log::debug!("couldn't delete cookie of {pid}: {err}");
        }
    }

    pub fn cache_len(&self) -> usize {
        self.entry_cache.len()
    }

    /// Cached identities, sorted by pid.
    pub fn entries(&self) -> Vec<(Pid, Arc<ProcessResolverEntry>)> {
        let mut entries: Vec<_> = self
            .entry_cache
            .iter()
            .map(|(pid, entry)| (*pid, entry.clone()))
            .collect();
        entries.sort_by_key(|(pid, _)| pid.as_raw());
        entries
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use bpf_common::test_utils::MemoryProgram;

    use super::*;
    use crate::{
        entry::FileEvent,
        testing::{self, Fixture},
    };

    const PID: Pid = Pid::from_raw(4242);

    /// Publish a process the way the kernel instrumentation does.
    fn publish(fixture: &Fixture, pid: Pid, cookie: u32, inode: u64, path: &str) {
        let file = FileEvent {
            inode,
            mount_id: 31,
            overlay_num_lower: 0,
            path_id: 0,
        };
        testing::insert_path(&fixture.pathnames, &file, path);
        let entry = ProcCacheEntry {
            container_id: String::new(),
            file,
            timestamp_raw: 3_000_000_000,
        };
        fixture.proc_cache.seed_raw(cookie.to_ne_vec(), entry.encode());
        fixture.pid_cookie.seed(pid, cookie);
    }

    #[test]
    fn start_requires_permanent_maps() {
        let program = MemoryProgram::new().with_map("proc_cache");
        let err = ProcessResolver::start(
            program,
            testing::resolvers_without_maps(),
            Config::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StartError::MissingMap { name, .. } if name == "pid_cookie"));

        let program = MemoryProgram::new().with_map("pid_cookie");
        let err = ProcessResolver::start(
            program,
            testing::resolvers_without_maps(),
            Config::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, StartError::MissingMap { name, .. } if name == "proc_cache"));
    }

    #[test]
    fn cache_then_kernel_fallback() {
        let mut fixture = Fixture::new();
        publish(&fixture, PID, 77, 1000, "/usr/bin/bash");

        let entry = fixture.resolver.resolve(PID).unwrap();
        assert_eq!(entry.pathname, "/usr/bin/bash");
        assert_eq!(entry.timestamp, Some(testing::boot() + Duration::from_secs(3)));
        assert_eq!(fixture.resolver.cache_len(), 1);

        fixture.pid_cookie.reset_stats();
        fixture.proc_cache.reset_stats();
        fixture.pathnames.reset_stats();
        let again = fixture.resolver.resolve(PID).unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(fixture.pid_cookie.stats().gets, 0);
        assert_eq!(fixture.proc_cache.stats().gets, 0);
        assert_eq!(fixture.pathnames.stats().gets, 0);
    }

    #[test]
    fn unknown_pid() {
        let mut fixture = Fixture::new();
        assert_eq!(fixture.resolver.resolve(PID), None);
        assert_eq!(fixture.resolver.cache_len(), 0);
    }

    #[test]
    fn dangling_cookie() {
        let mut fixture = Fixture::new();
        fixture.pid_cookie.seed(PID, 5_u32);
        assert_eq!(fixture.resolver.resolve(PID), None);
    }

    #[test]
    fn undecodable_entry() {
        let mut fixture = Fixture::new();
        fixture.pid_cookie.seed(PID, 5_u32);
        fixture.proc_cache.seed_raw(5_u32.to_ne_vec(), vec![0; 10]);
        assert_eq!(fixture.resolver.resolve(PID), None);
    }

    #[test]
    fn unresolved_path_is_not_cached() {
        let mut fixture = Fixture::new();
        let entry = ProcCacheEntry {
            file: FileEvent {
                inode: 999,
                ..Default::default()
            },
            ..Default::default()
        };
        fixture.proc_cache.seed_raw(5_u32.to_ne_vec(), entry.encode());
        fixture.pid_cookie.seed(PID, 5_u32);
        assert_eq!(fixture.resolver.resolve(PID), None);
        assert_eq!(fixture.resolver.cache_len(), 0);
    }

    #[test]
    fn add_entry_overwrites() {
        let mut fixture = Fixture::new();
        publish(&fixture, PID, 77, 1000, "/usr/bin/bash");
        fixture.resolver.add_entry(
            PID,
            ProcessResolverEntry {
                pathname: "/usr/bin/zsh".to_string(),
                timestamp: None,
            },
        );
        let now = SystemTime::now();
        fixture.resolver.add_entry(
            PID,
            ProcessResolverEntry {
                pathname: "/usr/bin/fish".to_string(),
                timestamp: Some(now),
            },
        );
        let entry = fixture.resolver.resolve(PID).unwrap();
        assert_eq!(entry.pathname, "/usr/bin/fish");
        assert_eq!(entry.timestamp, Some(now));
        assert_eq!(fixture.resolver.cache_len(), 1);
    }

    #[test]
    fn del_entry_leaves_orphaned_record() {
        let mut fixture = Fixture::new();
        publish(&fixture, PID, 77, 1000, "/usr/bin/bash");
        assert!(fixture.resolver.resolve(PID).is_some());

        fixture.resolver.del_entry(PID);
        assert_eq!(fixture.resolver.cache_len(), 0);
        assert!(!fixture.pid_cookie.contains(PID));
        assert!(fixture.proc_cache.contains(77_u32));
        assert_eq!(fixture.resolver.resolve_from_kernel(PID), None);
        assert_eq!(fixture.resolver.resolve(PID), None);

        // deleting twice is harmless
        fixture.resolver.del_entry(PID);
    }

    #[test]
    fn entries_are_sorted() {
        let mut fixture = Fixture::new();
        for pid in [30, 10, 20] {
            fixture.resolver.add_entry(
                Pid::from_raw(pid),
                ProcessResolverEntry {
                    pathname: format!("/bin/{pid}"),
                    timestamp: None,
                },
            );
        }
        let pids: Vec<i32> = fixture
            .resolver
            .entries()
            .iter()
            .map(|(pid, _)| pid.as_raw())
            .collect();
        assert_eq!(pids, vec![10, 20, 30]);
    }
}
