//! `pulsar-resolver` loads the eBPF object holding the kernel process cache,
//! seeds it with the running processes and prints the resolved identity of
//! the requested pids.
//!
//! ```sh
//! # Snapshot and list every running process
//! pulsar-resolver --probe process_cache.bpf.o
//!
//! # Resolve two pids from the pinned maps, without snapshotting
//! pulsar-resolver --probe process_cache.bpf.o --no-snapshot 1 4242
//! ```
//!
//! Settings are read from the `[process-resolver]` section of
//! `/var/lib/pulsar/pulsar.ini`, or of the file given with `--config-file`.

use anyhow::{Context, Result};
use bpf_common::{
    BpfContext, MapRegistry, Pid, Pinning, ProgramBuilder, bump_memlock_rlimit,
};
use process_resolver::{
    Config, MODULE_NAME, ProcessResolver, Resolvers,
    resolvers::{PATH_KEY_SIZE, PATH_LEAF_SIZE},
    start_process_resolver,
};

use crate::term_print::{Resolution, TermPrintable};

pub mod cli;
pub mod config;
pub mod term_print;

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}

pub async fn run(options: &cli::PulsarResolverOpts) -> Result<()> {
    let module_config = config::load_module_config(options.config_file.as_deref())?;
    let config = Config::try_from(&module_config)
        .with_context(|| format!("Invalid [{MODULE_NAME}] configuration"))?;

    let probe = tokio::fs::read(&options.probe)
        .await
        .with_context(|| format!("Error reading eBPF object {}", options.probe.display()))?;

    bump_memlock_rlimit()?;
    let pinning = if config.pin_maps {
        Pinning::Enabled
    } else {
        Pinning::Disabled
    };
    let ctx = BpfContext::new(pinning).context("Error initializing eBPF context")?;
    let mut program = ProgramBuilder::new(ctx, MODULE_NAME, probe)
        .map(&config.pid_cookie_map)
        .map(&config.proc_cache_map)
        .map(&config.pathnames_map)
        .start()
        .await
        .context("Error loading eBPF object")?;
    let pathnames = program.map::<PATH_KEY_SIZE, PATH_LEAF_SIZE>(&config.pathnames_map)?;

    let resolver = ProcessResolver::start(program, Resolvers::procfs(pathnames), config)?;
    let resolver = start_process_resolver(resolver);

    if !options.no_snapshot {
        resolver
            .snapshot()
            .await
            .context("Error taking a snapshot of running processes")?;
    }

    let resolutions: Vec<Resolution> = if options.pids.is_empty() {
        resolver
            .entries()
            .await
            .into_iter()
            .map(|(pid, entry)| Resolution {
                pid,
                entry: Some(entry),
            })
            .collect()
    } else {
        let mut resolutions = Vec::with_capacity(options.pids.len());
        for pid in options.pids.iter().copied().map(Pid::from_raw) {
            resolutions.push(Resolution {
                pid,
                entry: resolver.resolve(pid).await,
            });
        }
        resolutions
    };

    resolutions.term_print()?;
    Ok(())
}
