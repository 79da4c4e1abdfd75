use bpf_common::ProgramError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("{name} BPF_HASH map doesn't exist")]
    MissingMap {
        name: String,
        #[source]
        source: ProgramError,
    },
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("couldn't register map {name}")]
    RegisterMap {
        name: String,
        #[source]
        source: ProgramError,
    },
    #[error("{name} BPF_HASH map doesn't exist")]
    MissingMap {
        name: String,
        #[source]
        source: ProgramError,
    },
    #[error("couldn't attach {kprobe}")]
    AttachKprobe {
        kprobe: String,
        #[source]
        source: ProgramError,
    },
    #[error("unable to snapshot processes after {attempts} attempts")]
    NotConverged { attempts: usize },
    #[error("process resolver stopped")]
    ResolverStopped,
}
