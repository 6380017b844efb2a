use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::{debug, info};

/// Processing modules the pipeline knows how to invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    KilosortHelper,
    KilosortPostprocessing,
    NoiseTemplates,
    MeanWaveforms,
    QualityMetrics,
}

impl Module {
    /// Name of the module as its package exposes it
    pub fn name(&self) -> &'static str {
        match self {
            Module::KilosortHelper => "kilosort_helper",
            Module::KilosortPostprocessing => "kilosort_postprocessing",
            Module::NoiseTemplates => "noise_templates",
            Module::MeanWaveforms => "mean_waveforms",
            Module::QualityMetrics => "quality_metrics",
        }
    }

    /// Whether the module rewrites the sorter's output files in place
    pub fn alters_sorter_output(&self) -> bool {
        matches!(self, Module::KilosortPostprocessing | Module::NoiseTemplates)
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Module {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kilosort_helper" => Ok(Module::KilosortHelper),
            "kilosort_postprocessing" => Ok(Module::KilosortPostprocessing),
            "noise_templates" => Ok(Module::NoiseTemplates),
            "mean_waveforms" => Ok(Module::MeanWaveforms),
            "quality_metrics" => Ok(Module::QualityMetrics),
            _ => Err(format!(
                "Unknown module: {}. Use kilosort_helper, kilosort_postprocessing, \
                 noise_templates, mean_waveforms or quality_metrics",
                s
            )),
        }
    }
}

/// The sorter must keep a pristine copy of its output when any later
/// module rewrites it.
pub fn requires_sorter_copy(modules: &[Module]) -> bool {
    modules.iter().any(Module::alters_sorter_output)
}

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Failed to launch module {module}: {source}")]
    Spawn {
        module: Module,
        source: std::io::Error,
    },
    #[error("Module {module} exited with status {status}")]
    Failed { module: Module, status: String },
}

/// Environment variable carrying the run log path to module processes
pub const RUN_LOG_ENV: &str = "SGLX_PIPELINE_LOG";

/// Inputs for one module run on one recording
#[derive(Debug, Clone)]
pub struct ModuleInvocation<'a> {
    pub artifact_path: &'a Path,
    pub output_json: PathBuf,
    pub log_path: &'a Path,
}

/// Executes a single module against a configuration artifact
#[async_trait]
pub trait ModuleRunner: Send + Sync {
    async fn run(&self, module: Module, invocation: &ModuleInvocation<'_>) -> Result<(), ModuleError>;
}

/// Runs modules as `python -m <package>.<module>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonRunner {
    /// Interpreter to launch
    pub python: PathBuf,
    /// Package containing the modules
    pub package: String,
}

impl Default for PythonRunner {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python"),
            package: "ecephys_spike_sorting.modules".to_string(),
        }
    }
}

impl PythonRunner {
    fn command(&self, module: Module, invocation: &ModuleInvocation<'_>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.python);
        cmd.arg("-W")
            .arg("ignore")
            .arg("-m")
            .arg(format!("{}.{}", self.package, module.name()))
            .arg("--input_json")
            .arg(invocation.artifact_path)
            .arg("--output_json")
            .arg(&invocation.output_json)
            .env(RUN_LOG_ENV, invocation.log_path)
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl ModuleRunner for PythonRunner {
    async fn run(&self, module: Module, invocation: &ModuleInvocation<'_>) -> Result<(), ModuleError> {
        let mut cmd = self.command(module, invocation);
        debug!("Launching {:?}", cmd);
        info!("Running {} with {:?}", module, invocation.artifact_path);

        let status = cmd
            .status()
            .await
            .map_err(|source| ModuleError::Spawn { module, source })?;

        if !status.success() {
            return Err(ModuleError::Failed {
                module,
                status: status.to_string(),
            });
        }

        Ok(())
    }
}
