use std::{env, ffi::OsString, path::PathBuf};

use clap::{ArgAction, Parser};

pub const NAME: &str = "pulsar-resolver";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(version)]
#[clap(about = "Resolve running processes through the kernel process cache")]
pub struct PulsarResolverOpts {
    /// eBPF object defining the process cache maps and the getattr kprobe
    #[clap(long)]
    pub probe: PathBuf,
    #[clap(long)]
    pub config_file: Option<String>,
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    /// Don't seed the kernel cache with the running processes
    #[clap(long)]
    pub no_snapshot: bool,
    /// Processes to resolve. Every cached process when omitted
    pub pids: Vec<i32>,
}

impl PulsarResolverOpts {
    pub fn override_log_level(&self) -> Option<log::LevelFilter> {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> PulsarResolverOpts {
    PulsarResolverOpts::parse()
}

pub fn try_parse_from<I, T>(args: I) -> Result<PulsarResolverOpts, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    PulsarResolverOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> Option<log::LevelFilter> {
    match num {
        0 => None,
        1 => Some(log::LevelFilter::Debug),
        2..=u8::MAX => Some(log::LevelFilter::Trace),
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // One log line for the whole chain: `{:?}` adds the backtrace when one was captured.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
