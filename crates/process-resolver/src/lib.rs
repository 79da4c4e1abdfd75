//! Resolution of pids into durable process identities.
//!
//! Kernel probes keep a process cache in two chained maps: `pid_cookie`
//! points every pid to a cookie, `proc_cache` maps the cookie to the
//! serialized [`ProcCacheEntry`]. The [`ProcessResolver`] reads that chain,
//! memoizes the result in userspace and, at startup, seeds it with the
//! processes which were already running (see [`ProcessResolver::snapshot`]).
//!
//! The resolver is not synchronized: [`start_process_resolver`] gives it a
//! thread of its own and returns a cloneable [`ProcessResolverHandle`].

mod config;
pub mod entry;
mod error;
mod handle;
mod resolver;
pub mod resolvers;
mod snapshot;
#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, ModuleConfig};
pub use entry::{FileEvent, ProcCacheEntry, ProcessResolverEntry};
pub use error::{SnapshotError, StartError};
pub use handle::{ProcessResolverHandle, start_process_resolver};
pub use resolver::ProcessResolver;
pub use resolvers::Resolvers;

/// Name of the configuration section.
pub const MODULE_NAME: &str = "process-resolver";
