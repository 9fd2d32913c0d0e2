use crate::Result;
use serde::Deserialize;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the configuration snapshot a finished run leaves behind.
pub const FULL_CONFIG_FILE: &str = "full_config.yml";
pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Backend name, or `auto`.
    pub system: String,
    pub time: String,
    pub queue: String,
    pub conda_env: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            system: "auto".to_string(),
            time: "1day".to_string(),
            queue: "default".to_string(),
            conda_env: "jax".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
struct ConfigView {
    experiment_name: String,
    dispatch: DispatchConfig,
}

impl Default for ConfigView {
    fn default() -> Self {
        Self {
            experiment_name: "exp".to_string(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// A training configuration as far as dispatch is concerned.
///
/// Only `experiment_name` and the `dispatch` section are interpreted; the
/// raw document is kept whole so it can be written back into job
/// directories without losing the training loop's settings.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub experiment_name: String,
    pub dispatch: DispatchConfig,
    raw: Value,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(text)?;
        let raw = if raw.is_null() {
            Value::Mapping(Default::default())
        } else {
            raw
        };
        let view: ConfigView = serde_yaml::from_value(raw.clone())?;
        Ok(Self {
            experiment_name: view.experiment_name,
            dispatch: view.dispatch,
            raw,
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

impl Default for Configuration {
    fn default() -> Self {
        let view = ConfigView::default();
        Self {
            experiment_name: view.experiment_name,
            dispatch: view.dispatch,
            raw: Value::Mapping(Default::default()),
        }
    }
}

/// Writes `config` as YAML to `directory/file_name` and returns the path.
pub fn dump_config(directory: &Path, config: &Configuration, file_name: &str) -> Result<PathBuf> {
    let path = directory.join(file_name);
    let text = serde_yaml::to_string(config.raw())?;
    fs::write(&path, text)?;
    Ok(path)
}
