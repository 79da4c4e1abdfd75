//! [`Program`] is a wrapper around [`aya::Ebpf`] which:
//! - loads the eBPF object on a blocking thread
//! - acts as the [`MapRegistry`] of the maps shared with kernel probes
//! - attaches and detaches kprobes on demand
//!
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use aya::{
    Btf, BtfError, Ebpf, EbpfLoader,
    programs::{KProbe, kprobe::KProbeLinkId},
};
use thiserror::Error;
use tokio::task::JoinError;

use crate::maps::{AyaMap, KernelMap, MapRegistry};

const PINNED_MAPS_PATH: &str = "/sys/fs/bpf/pulsar";

/// BpfContext contains extra settings which could be provided on program load
#[derive(Clone)]
pub struct BpfContext {
    /// Enable pinning to file-system for shared maps.
    /// This should be set only for the final executable, not for tests where
    /// the kernel maps must not outlive the process.
    pinning: Pinning,
    pinning_path: String,
    /// Btf allows to load it only once on startup
    btf: Arc<Btf>,
}

#[derive(Clone)]
pub enum Pinning {
    Enabled,
    Disabled,
}

impl BpfContext {
    pub fn new(pinning: Pinning) -> Result<Self, ProgramError> {
        let btf = Btf::from_sys_fs()?;
        // aya doesn't support specifying from userspace wether or not to pin maps.
        // As a hack we always pin and delete the folder on shutdown.
        let pinning_path = match pinning {
            Pinning::Enabled => PINNED_MAPS_PATH.to_string(),
            Pinning::Disabled => format!("{PINNED_MAPS_PATH}_tmp"),
        };

        Ok(Self {
            pinning,
            pinning_path,
            btf: Arc::new(btf),
        })
    }
}

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("loading probe")]
    LoadingProbe(#[from] aya::EbpfError),
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed program attach {program}")]
    ProgramAttachError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed program detach {program}")]
    ProgramDetachError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("{0} is not attached")]
    ProbeNotAttached(String),
    #[error(transparent)]
    MapError(#[from] aya::maps::MapError),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("map not registered {0}")]
    MapNotRegistered(String),
    #[error("map already used {0}")]
    MapAlreadyUsed(String),
    #[error("loading BTF {0}")]
    BtfError(#[from] BtfError),
    #[error("running background aya task {0}")]
    JoinError(#[from] JoinError),
}

/// A kprobe program of the eBPF object and the kernel function it hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KprobeTarget {
    /// Name of the program inside the eBPF object
    pub program: String,
    /// Kernel symbol to attach to
    pub function: String,
}

impl fmt::Display for KprobeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kprobe {} ({})", self.function, self.program)
    }
}

/// Dynamic activation of kprobes.
pub trait ProbeManager {
    fn attach_kprobe(&mut self, kprobe: &KprobeTarget) -> Result<(), ProgramError>;
    fn detach_kprobe(&mut self, kprobe: &KprobeTarget) -> Result<(), ProgramError>;
}

pub struct ProgramBuilder {
    /// probe name, used for logging purposes
    name: &'static str,
    /// Probe configuration
    ctx: BpfContext,
    probe: Vec<u8>,
    maps: Vec<String>,
}

impl ProgramBuilder {
    pub fn new(ctx: BpfContext, name: &'static str, probe: Vec<u8>) -> Self {
        Self {
            ctx,
            name,
            probe,
            maps: Vec::new(),
        }
    }

    /// Register a map which must be present in the object.
    pub fn map(mut self, name: &str) -> Self {
        self.maps.push(name.to_string());
        self
    }

    pub async fn start(self) -> Result<Program, ProgramError> {
        let ctx = self.ctx.clone();
        let btf = self.ctx.btf.clone();
        let pinning_path = self.ctx.pinning_path.clone();
        let probe = self.probe;

        let bpf = tokio::task::spawn_blocking(move || {
            let _ = std::fs::create_dir(&pinning_path);
            EbpfLoader::new()
                .map_pin_path(&pinning_path)
                .btf(Some(btf.as_ref()))
                .load(&probe)
        })
        .await??;

        let mut program = Program {
            ctx,
            name: self.name.to_string(),
            bpf,
            registered_maps: HashSet::new(),
            used_maps: HashSet::new(),
            loaded_programs: HashSet::new(),
            kprobe_links: HashMap::new(),
        };
        for map in &self.maps {
            program.register_map(map)?;
        }
        log::debug!("{}: loaded with maps {:?}", program.name, self.maps);
        Ok(program)
    }
}

fn extract_program<'a, T>(bpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, ProgramError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut aya::programs::Program>,
{
    bpf.program_mut(program)
        .ok_or_else(|| ProgramError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| ProgramError::ProgramTypeError(program.to_string()))
}

pub struct Program {
    ctx: BpfContext,
    name: String,
    bpf: Ebpf,
    registered_maps: HashSet<String>,
    used_maps: HashSet<String>,
    loaded_programs: HashSet<String>,
    kprobe_links: HashMap<String, KProbeLinkId>,
}

impl Drop for Program {
    fn drop(&mut self) {
        if matches!(self.ctx.pinning, Pinning::Disabled) {
            let _ = std::fs::remove_dir_all(&self.ctx.pinning_path);
        }
    }
}

impl MapRegistry for Program {
    fn register_map(&mut self, name: &str) -> Result<(), ProgramError> {
        if self.bpf.map(name).is_none() && !self.used_maps.contains(name) {
            return Err(ProgramError::MapNotFound(name.to_string()));
        }
        self.registered_maps.insert(name.to_string());
        Ok(())
    }

    fn map<const K: usize, const V: usize>(
        &mut self,
        name: &str,
    ) -> Result<Box<dyn KernelMap>, ProgramError> {
        if !self.registered_maps.contains(name) {
            return Err(ProgramError::MapNotRegistered(name.to_string()));
        }
        if self.used_maps.contains(name) {
            return Err(ProgramError::MapAlreadyUsed(name.to_string()));
        }
        let map_resource = self
            .bpf
            .take_map(name)
            .ok_or_else(|| ProgramError::MapNotFound(name.to_string()))?;
        self.used_maps.insert(name.to_string());
        Ok(Box::new(AyaMap::<K, V>::new(map_resource)?))
    }
}

impl ProbeManager for Program {
    fn attach_kprobe(&mut self, kprobe: &KprobeTarget) -> Result<(), ProgramError> {
        let load_err = |program_error| ProgramError::ProgramLoadError {
            program: kprobe.to_string(),
            program_error: Box::new(program_error),
        };
        let attach_err = |program_error| ProgramError::ProgramAttachError {
            program: kprobe.to_string(),
            program_error: Box::new(program_error),
        };
        let program: &mut KProbe = extract_program(&mut self.bpf, &kprobe.program)?;
        if !self.loaded_programs.contains(&kprobe.program) {
            program.load().map_err(load_err)?;
            self.loaded_programs.insert(kprobe.program.clone());
        }
        let link_id = program.attach(&kprobe.function, 0).map_err(attach_err)?;
        self.kprobe_links.insert(kprobe.program.clone(), link_id);
        log::debug!("{}: attached {}", self.name, kprobe);
        Ok(())
    }

    fn detach_kprobe(&mut self, kprobe: &KprobeTarget) -> Result<(), ProgramError> {
        let link_id = self
            .kprobe_links
            .remove(&kprobe.program)
            .ok_or_else(|| ProgramError::ProbeNotAttached(kprobe.to_string()))?;
        let program: &mut KProbe = extract_program(&mut self.bpf, &kprobe.program)?;
        program
            .detach(link_id)
            .map_err(|program_error| ProgramError::ProgramDetachError {
                program: kprobe.to_string(),
                program_error: Box::new(program_error),
            })?;
        log::debug!("{}: detached {}", self.name, kprobe);
        Ok(())
    }
}
