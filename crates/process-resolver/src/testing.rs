//! Fake processes and resolvers for unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use bpf_common::{
    KernelMap, MapRegistry, Pid,
    parsing::procfs::ProcfsError,
    test_utils::{MemoryMap, MemoryProgram, ProbeLog},
    time::BootTime,
};

use crate::{
    Config, ProcessResolver,
    entry::FileEvent,
    resolvers::{
        BootTimeResolver, ContainerError, ContainerResolver, CookieGenerator, DentryResolver,
        MountError, MountResolver, PATH_KEY_SIZE, PATH_LEAF_SIZE, PathKey, PathLeaf,
        ProcessEnumerator, ProcessListing, Resolvers,
    },
};

const GETATTR: &str = "vfs_getattr";

pub fn boot() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn gone(what: &str, pid: Pid) -> ProcfsError {
    ProcfsError::ReadFile {
        source: io::Error::from(io::ErrorKind::NotFound),
        path: format!("/proc/{pid}/{what}"),
    }
}

fn denied(path: &str) -> ProcfsError {
    ProcfsError::ReadFile {
        source: io::Error::from(io::ErrorKind::PermissionDenied),
        path: path.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mounts {
    Readable,
    Gone,
    Unreadable,
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    exe: PathBuf,
    inode: Option<u64>,
    numlower: Option<i32>,
    container: Result<Option<String>, ()>,
    mounts: Mounts,
}

impl FakeProcess {
    pub const START_TIME: u64 = 2_000_000_000;

    /// An empty `exe` is a process which exited while being listed.
    pub fn new(exe: &str, inode: u64, numlower: i32) -> Self {
        Self {
            exe: PathBuf::from(exe),
            inode: Some(inode),
            numlower: Some(numlower),
            container: Ok(None),
            mounts: Mounts::Readable,
        }
    }

    pub fn in_container(mut self, id: &str) -> Self {
        self.container = Ok(Some(id.to_string()));
        self
    }

    pub fn without_inode(mut self) -> Self {
        self.inode = None;
        self
    }

    /// The getattr kprobe won't record this binary.
    pub fn without_numlower(mut self) -> Self {
        self.numlower = None;
        self
    }

    pub fn without_container(mut self) -> Self {
        self.container = Err(());
        self
    }

    pub fn with_mounts_gone(mut self) -> Self {
        self.mounts = Mounts::Gone;
        self
    }

    pub fn with_mount_error(mut self) -> Self {
        self.mounts = Mounts::Unreadable;
        self
    }
}

#[derive(Default)]
struct SystemState {
    processes: BTreeMap<i32, FakeProcess>,
    scheduled: Vec<(usize, Pid, FakeProcess)>,
    fork_storm: bool,
    failing_listings: usize,
    listings: usize,
    mount_syncs: usize,
    mounts: HashMap<u32, PathBuf>,
    getattr: Option<(ProbeLog, MemoryMap)>,
}

/// Process table shared by the fake resolvers.
#[derive(Clone, Default)]
pub struct FakeSystem {
    inner: Arc<Mutex<SystemState>>,
}

impl FakeSystem {
    fn state(&self) -> MutexGuard<'_, SystemState> {
        self.inner.lock().unwrap()
    }

    pub fn spawn(&self, pid: Pid, process: FakeProcess) {
        self.state().processes.insert(pid.as_raw(), process);
    }

    /// Start a process right before the given listing (0 based).
    pub fn spawn_at_listing(&self, listing: usize, pid: Pid, process: FakeProcess) {
        self.state().scheduled.push((listing, pid, process));
    }

    /// Start a new process before every listing.
    pub fn fork_on_every_listing(&self) {
        self.state().fork_storm = true;
    }

    /// Fail the next `count` listings.
    pub fn fail_listings(&self, count: usize) {
        self.state().failing_listings = count;
    }

    pub fn add_mount(&self, mount_id: u32, mount_point: &str) {
        self.state()
            .mounts
            .insert(mount_id, PathBuf::from(mount_point));
    }

    /// Number of process listings, failed ones included.
    pub fn listings(&self) -> usize {
        self.state().listings
    }

    pub fn mount_syncs(&self) -> usize {
        self.state().mount_syncs
    }

    /// Emulate the getattr kprobe: while attached, stat records the overlay
    /// numlower of the binary.
    fn watch_getattr(&self, probes: ProbeLog, inode_numlower: MemoryMap) {
        self.state().getattr = Some((probes, inode_numlower));
    }
}

struct FakeMounts(FakeSystem);

impl MountResolver for FakeMounts {
    fn sync_cache(&mut self, pid: Pid) -> Result<(), MountError> {
        let mut state = self.0.state();
        state.mount_syncs += 1;
        match state.processes.get(&pid.as_raw()).map(|p| p.mounts) {
            Some(Mounts::Readable) => Ok(()),
            Some(Mounts::Unreadable) => Err(MountError::Procfs(denied("mountinfo"))),
            Some(Mounts::Gone) | None => Err(MountError::ProcessNotFound(pid)),
        }
    }

    fn mount_point(&self, mount_id: u32) -> Option<PathBuf> {
        self.0.state().mounts.get(&mount_id).cloned()
    }
}

struct FakeContainers(FakeSystem);

impl ContainerResolver for FakeContainers {
    fn container_id(&mut self, pid: Pid) -> Result<Option<String>, ContainerError> {
        match self.0.state().processes.get(&pid.as_raw()) {
            Some(process) => process
                .container
                .clone()
                .map_err(|()| ContainerError::Procfs(denied("cgroup"))),
            None => Err(ContainerError::Procfs(gone("cgroup", pid))),
        }
    }
}

struct FakeProcesses(FakeSystem);

impl ProcessEnumerator for FakeProcesses {
    fn processes(&mut self) -> Result<Vec<ProcessListing>, ProcfsError> {
        let mut state = self.0.state();
        let listing = state.listings;
        state.listings += 1;

        if state.failing_listings > 0 {
            state.failing_listings -= 1;
            return Err(denied("/proc"));
        }

        let (due, later) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition::<Vec<_>, _>(|(at, _, _)| *at <= listing);
        state.scheduled = later;
        for (_, pid, process) in due {
            state.processes.insert(pid.as_raw(), process);
        }
        if state.fork_storm {
            let pid = 10_000 + listing as i32;
            state
                .processes
                .insert(pid, FakeProcess::new("/bin/worker", pid as u64, 0));
        }

        Ok(state
            .processes
            .iter()
            .map(|(pid, process)| ProcessListing {
                pid: Pid::from_raw(*pid),
                exe: process.exe.clone(),
            })
            .collect())
    }

    fn exe_path(&mut self, pid: Pid) -> Result<PathBuf, ProcfsError> {
        match self.0.state().processes.get(&pid.as_raw()) {
            Some(process) if !process.exe.as_os_str().is_empty() => Ok(process.exe.clone()),
            _ => Err(gone("exe", pid)),
        }
    }

    fn exe_inode(&mut self, pid: Pid) -> Result<u64, ProcfsError> {
        let state = self.0.state();
        let process = state
            .processes
            .get(&pid.as_raw())
            .ok_or_else(|| gone("exe", pid))?;
        let inode = process.inode.ok_or_else(|| denied("exe"))?;
        if let (Some((probes, inode_numlower)), Some(numlower)) = (&state.getattr, process.numlower)
        {
            if probes.is_attached(GETATTR) {
                inode_numlower.seed(inode, numlower);
            }
        }
        Ok(inode)
    }

    fn start_time(&mut self, pid: Pid) -> Result<u64, ProcfsError> {
        if self.0.state().processes.contains_key(&pid.as_raw()) {
            Ok(FakeProcess::START_TIME)
        } else {
            Err(gone("stat", pid))
        }
    }
}

/// Cookies 1, 2, 3...
#[derive(Default)]
struct SequentialCookies(u32);

impl CookieGenerator for SequentialCookies {
    fn new_cookie(&mut self) -> u32 {
        self.0 += 1;
        self.0
    }
}

/// Fake resolvers on top of `system`. When `inode_numlower` is given, stat
/// fills it while the getattr kprobe of `probes` is attached.
pub fn resolvers(
    system: &FakeSystem,
    probes: ProbeLog,
    inode_numlower: Option<MemoryMap>,
    pathnames: Box<dyn KernelMap>,
) -> Resolvers {
    if let Some(inode_numlower) = inode_numlower {
        system.watch_getattr(probes, inode_numlower);
    }
    Resolvers {
        mounts: Box::new(FakeMounts(system.clone())),
        containers: Box::new(FakeContainers(system.clone())),
        paths: Box::new(DentryResolver::new(pathnames)),
        time: Box::new(BootTimeResolver::new(BootTime::from_system_time(boot()))),
        processes: Box::new(FakeProcesses(system.clone())),
        cookies: Box::new(SequentialCookies::default()),
    }
}

pub fn resolvers_without_maps() -> Resolvers {
    resolvers(
        &FakeSystem::default(),
        ProbeLog::default(),
        None,
        Box::new(MemoryMap::new()),
    )
}

/// Store `path` in the `pathnames` map as the kernel probes would.
pub fn insert_path(pathnames: &MemoryMap, file: &FileEvent, path: &str) {
    let mut key = PathKey::from(file);
    for (depth, name) in path.rsplit('/').filter(|name| !name.is_empty()).enumerate() {
        let parent = PathKey {
            inode: u64::MAX - file.inode * 4096 - depth as u64,
            ..key
        };
        let leaf = PathLeaf {
            parent,
            name: name.to_string(),
        };
        pathnames.seed_raw(key.encode(), leaf.encode());
        key = parent;
    }
    let root = PathLeaf {
        parent: PathKey::default(),
        name: "/".to_string(),
    };
    pathnames.seed_raw(key.encode(), root.encode());
}

/// A started resolver on top of in-memory maps and fake processes.
pub struct Fixture {
    pub system: FakeSystem,
    pub pid_cookie: MemoryMap,
    pub proc_cache: MemoryMap,
    pub numlower: MemoryMap,
    pub pathnames: MemoryMap,
    pub probes: ProbeLog,
    pub resolver: ProcessResolver<MemoryProgram>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(MemoryProgram::new(), Config::default())
    }

    pub fn with_config(program: MemoryProgram, config: Config) -> Self {
        let program = program.with_unregistered_map(&config.inode_numlower_map);
        let numlower = program.memory_map(&config.inode_numlower_map);
        Self::build(program, config, numlower)
    }

    /// The eBPF object lacks the `inode_numlower` map.
    pub fn without_numlower() -> Self {
        Self::build(MemoryProgram::new(), Config::default(), MemoryMap::new())
    }

    fn build(program: MemoryProgram, config: Config, numlower: MemoryMap) -> Self {
        let mut program = program
            .with_map(&config.pid_cookie_map)
            .with_map(&config.proc_cache_map)
            .with_map(&config.pathnames_map);
        let pid_cookie = program.memory_map(&config.pid_cookie_map);
        let proc_cache = program.memory_map(&config.proc_cache_map);
        let pathnames = program.memory_map(&config.pathnames_map);
        let probes = program.probes();

        let system = FakeSystem::default();
        system.add_mount(31, "/");
        let resolvers = resolvers(
            &system,
            probes.clone(),
            Some(numlower.clone()),
            program
                .map::<PATH_KEY_SIZE, PATH_LEAF_SIZE>(&config.pathnames_map)
                .unwrap(),
        );
        let resolver = ProcessResolver::start(program, resolvers, config).unwrap();

        Self {
            system,
            pid_cookie,
            proc_cache,
            numlower,
            pathnames,
            probes,
            resolver,
        }
    }
}
