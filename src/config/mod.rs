//! Batch configuration.
//!
//! A batch file lists the recordings to process and everything that stays
//! fixed across them. All sections except `recordings` have defaults.
//!
//! ```toml
//! log_path = "D:/SC048_out/pipeline_log.csv"
//! json_dir = "C:/ecephys/json_files"
//! modules = ["kilosort_helper", "kilosort_postprocessing"]
//!
//! [[recordings]]
//! path = "D:/SC048_out/catgt_SC048_122920_ex_g0/SC048_122920_ex_g0_tcat.imec0.ap.bin"
//! regions = ["cortex"]
//!
//! [params.refractory_period_ms]
//! default = 2.0
//! cortex = 2.0
//!
//! [params.ks_threshold]
//! default = [10, 4]
//! cortex = [10, 4]
//!
//! [sorter]
//! template_radius_um = 163
//!
//! [convert]
//! format = "npy"
//! sample_rate = 0
//!
//! [runner]
//! python = "python"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::convert::ConvertSettings;
use crate::params::{RegionParams, SorterParams};
use crate::pipeline::{Module, PythonRunner};
use crate::session::RecordingSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid batch: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Run log; appended to across batches
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Directory receiving one configuration artifact per recording
    #[serde(default = "default_json_dir")]
    pub json_dir: PathBuf,

    /// Modules run for every recording, in order
    #[serde(default = "default_modules")]
    pub modules: Vec<Module>,

    pub recordings: Vec<RecordingSpec>,

    #[serde(default)]
    pub params: RegionParams,

    #[serde(default)]
    pub sorter: SorterParams,

    #[serde(default)]
    pub convert: ConvertSettings,

    #[serde(default)]
    pub runner: PythonRunner,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("pipeline_log.csv")
}

fn default_json_dir() -> PathBuf {
    PathBuf::from("json_files")
}

fn default_modules() -> Vec<Module> {
    vec![Module::KilosortHelper, Module::KilosortPostprocessing]
}

impl BatchConfig {
    /// Load and validate a batch file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BatchConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.recordings.is_empty() {
            return Err(ConfigError::Invalid("no recordings listed".to_string()));
        }
        for spec in &self.recordings {
            if spec.regions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "recording {:?} has no region tag",
                    spec.path
                )));
            }
        }
        Ok(())
    }
}
