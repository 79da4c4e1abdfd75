use std::{collections::HashMap, fmt::Display, str::FromStr};

use bpf_common::KprobeTarget;
use thiserror::Error;

/// Raw key/value settings of the `[process-resolver]` configuration section.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value, or `default` when the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            Some(value) => parse(value, config_name),
            None => Ok(default),
        }
    }

    fn string_or(&self, config_name: &str, default: &str) -> String {
        self.get_raw(config_name).unwrap_or(default).to_string()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModuleConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value.trim()).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// Settings of the process resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// pid -> cookie
    pub pid_cookie_map: String,
    /// cookie -> serialized cache entry
    pub proc_cache_map: String,
    /// inode -> overlay numlower, only used during the snapshot
    pub inode_numlower_map: String,
    /// dentry tree walked by the path resolver
    pub pathnames_map: String,
    /// kprobe filling `inode_numlower` while the snapshot stats executables
    pub getattr: KprobeTarget,
    /// How many full enumerations the snapshot may take to converge
    pub snapshot_attempts: usize,
    /// Pin the maps on bpffs so they're shared with the kernel instrumentation
    pub pin_maps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pid_cookie_map: "pid_cookie".to_string(),
            proc_cache_map: "proc_cache".to_string(),
            inode_numlower_map: "inode_numlower".to_string(),
            pathnames_map: "pathnames".to_string(),
            getattr: KprobeTarget {
                program: "kprobe_vfs_getattr".to_string(),
                function: "vfs_getattr".to_string(),
            },
            snapshot_attempts: 5,
            pin_maps: true,
        }
    }
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let default = Config::default();
        let snapshot_attempts =
            config.with_default("snapshot_attempts", default.snapshot_attempts)?;
        if snapshot_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "snapshot_attempts".to_string(),
                value: "0".to_string(),
                err: "at least one attempt is required".to_string(),
            });
        }
        Ok(Config {
            pid_cookie_map: config.string_or("pid_cookie_map", &default.pid_cookie_map),
            proc_cache_map: config.string_or("proc_cache_map", &default.proc_cache_map),
            inode_numlower_map: config
                .string_or("inode_numlower_map", &default.inode_numlower_map),
            pathnames_map: config.string_or("pathnames_map", &default.pathnames_map),
            getattr: KprobeTarget {
                program: config.string_or("getattr_program", &default.getattr.program),
                function: config.string_or("getattr_function", &default.getattr.function),
            },
            snapshot_attempts,
            pin_maps: config.with_default("pin_maps", default.pin_maps)?,
        })
    }
}
