use std::io;

use anyhow::{Context, Result};

/// Lifts `RLIMIT_MEMLOCK` so the maps shared with the kernel probes can be
/// created. Kernels older than 5.11 charge eBPF maps against this limit.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        return Err(io::Error::last_os_error()).context("Failed to increase RLIMIT_MEMLOCK");
    }
    log::debug!("RLIMIT_MEMLOCK raised to infinity");
    Ok(())
}
