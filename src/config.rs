use std::path::Path;

use anyhow::{Context, Result, bail};
use process_resolver::{MODULE_NAME, ModuleConfig};

const DEFAULT_CONFIG_FILE: &str = "/var/lib/pulsar/pulsar.ini";

/// Read the `[process-resolver]` section of the configuration file.
///
/// A missing default file means default settings. A custom file must exist.
pub fn load_module_config(config_file: Option<&str>) -> Result<ModuleConfig> {
    match config_file {
        Some(config_file) => {
            let config_file = Path::new(config_file);
            if !config_file.exists() {
                bail!("Configuration file {} not found", config_file.display());
            }
            from_config_file(config_file)
        }
        None => {
            let config_file = Path::new(DEFAULT_CONFIG_FILE);
            if !config_file.exists() {
                log::debug!("{DEFAULT_CONFIG_FILE} not found, using default settings");
                return Ok(ModuleConfig::default());
            }
            from_config_file(config_file)
        }
    }
}

fn from_config_file(config_file: &Path) -> Result<ModuleConfig> {
    let conf = ini::Ini::load_from_file(config_file)
        .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

    let mut module_config = ModuleConfig::default();
    if let Some(prop) = conf.section(Some(MODULE_NAME)) {
        for (key, value) in prop.iter() {
            log::debug!("{}.{}={}", MODULE_NAME, key, value);
            module_config.insert(key.to_string(), value.to_string());
        }
    }
    Ok(module_config)
}
