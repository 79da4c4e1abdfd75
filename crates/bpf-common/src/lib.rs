pub mod containers;
pub mod maps;
pub mod parsing;
pub mod program;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod time;

mod bump_memlock_rlimit;

pub use bump_memlock_rlimit::bump_memlock_rlimit;
pub use maps::{KernelMap, MapError, MapRegistry, NativeBytes};
pub use program::{
    BpfContext, KprobeTarget, Pinning, ProbeManager, Program, ProgramBuilder, ProgramError,
};

pub use aya;

pub use nix::unistd::Pid;
