//! Two-pass batch processing.
//!
//! The configuration pass resolves every recording and writes every
//! artifact before the run pass starts any module. A failure in the first
//! pass aborts the batch; failures in the second pass only affect the
//! recording they occur in.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::artifact::{materialize, ArtifactError, ConfigArtifact};
use crate::config::BatchConfig;
use crate::convert::{convert_with, ConversionOutcome, ConvertError};
use crate::params::ParamError;
use crate::pipeline::{
    ModuleRunner, PipelineDriver, RecordingOutcome, RunLog, RunLogError, CONVERSION_STEP,
};
use crate::provision::{ensure_dir, ProvisionError};
use crate::session::{IdentityError, RecordingSpec, SessionContext};

/// Log left behind by the waveform metrics tool; stale copies confuse it
pub const WAVEFORM_TOOL_LOG: &str = "C_Waves.log";

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// A recording whose artifact has been written
#[derive(Debug, Clone)]
pub struct PreparedRecording {
    pub context: SessionContext,
    pub artifact: ConfigArtifact,
    pub artifact_path: PathBuf,
}

/// Delete a stale waveform tool log from `dir`, if there is one
pub fn remove_stale_tool_log(dir: &Path) -> io::Result<bool> {
    match std::fs::remove_file(dir.join(WAVEFORM_TOOL_LOG)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Resolve, provision and materialize one recording
pub fn prepare_recording(
    spec: &RecordingSpec,
    config: &BatchConfig,
) -> Result<PreparedRecording, BatchError> {
    let context = SessionContext::resolve(spec, &config.json_dir)?;

    ensure_dir(&context.layout.output_parent())?;

    let params = config.params.resolve(&context.region)?;
    let (artifact, artifact_path) =
        materialize(&context, &params, &config.sorter, &config.modules)?;

    Ok(PreparedRecording {
        context,
        artifact,
        artifact_path,
    })
}

/// First pass: write an artifact for every recording, or fail without
/// running anything.
pub fn prepare_batch(config: &BatchConfig) -> Result<Vec<PreparedRecording>, BatchError> {
    ensure_dir(&config.json_dir)?;
    if let Some(parent) = config.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }

    let mut prepared = Vec::with_capacity(config.recordings.len());
    for (i, spec) in config.recordings.iter().enumerate() {
        match prepare_recording(spec, config) {
            Ok(recording) => prepared.push(recording),
            Err(e) => {
                error!(
                    "Configuration failed for recording {} ({:?}): {}",
                    i + 1,
                    spec.path,
                    e
                );
                return Err(e);
            }
        }
    }

    info!("Prepared {} recordings", prepared.len());
    Ok(prepared)
}

#[derive(Debug)]
pub struct RecordingReport {
    pub label: String,
    pub outcome: RecordingOutcome,
    /// `None` when conversion was disabled or the modules did not complete
    pub conversion: Option<Result<ConversionOutcome, ConvertError>>,
    /// Result of appending the recording's run log row
    pub logged: Result<(), RunLogError>,
}

impl RecordingReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_completed() && self.logged.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub recordings: Vec<RecordingReport>,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &RecordingReport> {
        self.recordings.iter().filter(|r| !r.succeeded())
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }
}

async fn convert_spike_times(
    recording: &PreparedRecording,
    config: &BatchConfig,
) -> Result<ConversionOutcome, ConvertError> {
    let path = recording.context.layout.spike_times_path();
    let settings = config.convert.clone();

    let outcome = tokio::task::spawn_blocking(move || convert_with(&path, &settings))
        .await
        .map_err(|e| ConvertError::Io(io::Error::other(e.to_string())))??;

    if let Some(reason) = outcome.fallback() {
        warn!(
            "{}: spike times converted with fallback rate {} Hz ({})",
            recording.context.label(),
            outcome.sample_rate,
            reason
        );
    }
    Ok(outcome)
}

/// Second pass: run the modules for each prepared recording in order,
/// convert its spike times, then append its run log row.
pub async fn run_batch(
    prepared: &[PreparedRecording],
    config: &BatchConfig,
    runner: &dyn ModuleRunner,
) -> BatchReport {
    let log = RunLog::new(&config.log_path);
    let driver = PipelineDriver::new(runner, &config.modules, &log);
    let mut report = BatchReport::default();

    for recording in prepared {
        let label = recording.context.label();
        let mut outcome = driver.drive(&recording.context).await;

        let conversion = if outcome.is_completed() && config.convert.enabled {
            let result = convert_spike_times(recording, config).await;
            match &result {
                Ok(converted) => {
                    if let Some(reason) = converted.fallback() {
                        outcome.note(format!(
                            "{} used fallback rate {} Hz ({})",
                            CONVERSION_STEP, converted.sample_rate, reason
                        ));
                    }
                }
                Err(e) => {
                    warn!("{}: spike time conversion failed: {}", label, e);
                    outcome.fail_conversion(e.to_string());
                }
            }
            Some(result)
        } else {
            None
        };

        let logged = driver.record(&outcome);
        if let Err(e) = &logged {
            error!("{}: {}", label, e);
        }

        report.recordings.push(RecordingReport {
            label,
            outcome,
            conversion,
            logged,
        });
    }

    info!(
        "Batch finished: {} recordings, {} failed",
        report.recordings.len(),
        report.failed_count()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{write_u64_npy, SIDECAR_FILE};
    use crate::pipeline::{Module, RecordingState, ScriptedRunner, RUN_LOG_HEADER};

    fn batch(root: &Path, names: &[&str], extra: &str) -> BatchConfig {
        let recordings: String = names
            .iter()
            .map(|n| {
                format!(
                    "[[recordings]]\npath = '{}'\nregions = [\"default\"]\n",
                    root.join("data").join(n).display()
                )
            })
            .collect();
        BatchConfig::from_toml(&format!(
            "log_path = '{}'\njson_dir = '{}'\nmodules = [\"kilosort_helper\", \"kilosort_postprocessing\", \"mean_waveforms\"]\n{}\n{}",
            root.join("logs").join("pipeline_log.csv").display(),
            root.join("json").display(),
            extra,
            recordings
        ))
        .unwrap()
    }

    fn log_rows(config: &BatchConfig) -> Vec<String> {
        std::fs::read_to_string(&config.log_path)
            .unwrap()
            .lines()
            .skip(1)
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_prepare_writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = batch(
            dir.path(),
            &["rec1_g0_tcat.imec0.ap.bin", "rec1_g0_tcat.imec1.ap.bin"],
            "",
        );

        let prepared = prepare_batch(&config).unwrap();

        assert_eq!(prepared.len(), 2);
        for p in &prepared {
            assert!(p.artifact_path.is_file());
            assert!(p.context.layout.output_parent().is_dir());
            assert!(p.artifact.kilosort_helper_params.ks_make_copy);
        }
        assert_ne!(prepared[0].artifact_path, prepared[1].artifact_path);
    }

    #[test]
    fn test_prepare_aborts_on_bad_recording() {
        let dir = tempfile::tempdir().unwrap();
        let config = batch(
            dir.path(),
            &["rec1_g0_tcat.imec0.ap.bin", "garbage.bin", "rec3_g0_tcat.imec0.ap.bin"],
            "",
        );

        let err = prepare_batch(&config).unwrap_err();
        assert!(matches!(err, BatchError::Identity(_)));
        assert!(!dir.path().join("data").join("rec3_g0").exists());
    }

    #[test]
    fn test_prepare_rejects_unknown_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = batch(dir.path(), &["rec1_g0_tcat.imec0.ap.bin"], "");
        config.recordings[0].regions = vec!["cerebellum".to_string()];

        let err = prepare_batch(&config).unwrap_err();
        assert!(matches!(err, BatchError::Param(ParamError::UnknownRegionTag { .. })));
    }

    #[tokio::test]
    async fn test_failed_recording_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = batch(
            dir.path(),
            &[
                "rec1_g0_tcat.imec0.ap.bin",
                "rec2_g0_tcat.imec0.ap.bin",
                "rec3_g0_tcat.imec0.ap.bin",
            ],
            "[convert]\nenabled = false\n",
        );
        let prepared = prepare_batch(&config).unwrap();
        let runner = ScriptedRunner::failing("rec2_g0", Module::KilosortPostprocessing);

        let report = run_batch(&prepared, &config, &runner).await;

        assert_eq!(report.recordings.len(), 3);
        let states: Vec<RecordingState> = report
            .recordings
            .iter()
            .map(|r| r.outcome.state.clone())
            .collect();
        assert_eq!(states[0], RecordingState::Completed);
        assert!(matches!(
            states[1],
            RecordingState::Failed { module: Module::KilosortPostprocessing, .. }
        ));
        assert_eq!(states[2], RecordingState::Completed);
        assert_eq!(report.failed_count(), 1);

        // 3 + 2 + 3 module calls
        assert_eq!(runner.calls().len(), 8);

        let rows = log_rows(&config);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].contains(",rec1_g0,0,") && rows[0].contains(",completed,"));
        assert!(rows[1].contains(",rec2_g0,0,") && rows[1].contains(",failed,kilosort_postprocessing,"));
        assert!(rows[2].contains(",rec3_g0,0,") && rows[2].contains(",completed,"));
    }

    #[tokio::test]
    async fn test_log_accumulates_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let first = batch(
            dir.path(),
            &["rec1_g0_tcat.imec0.ap.bin", "rec2_g0_tcat.imec0.ap.bin"],
            "[convert]\nenabled = false\n",
        );
        let runner = ScriptedRunner::default();

        let prepared = prepare_batch(&first).unwrap();
        run_batch(&prepared, &first, &runner).await;
        let after_first = std::fs::read_to_string(&first.log_path).unwrap();

        let second = batch(dir.path(), &["rec3_g0_tcat.imec0.ap.bin"], "[convert]\nenabled = false\n");
        let prepared = prepare_batch(&second).unwrap();
        run_batch(&prepared, &second, &runner).await;

        let content = std::fs::read_to_string(&second.log_path).unwrap();
        assert!(content.starts_with(&after_first));
        assert_eq!(content.lines().next(), Some(RUN_LOG_HEADER));
        assert_eq!(log_rows(&second).len(), 3);
    }

    #[tokio::test]
    async fn test_completed_recordings_are_converted() {
        let dir = tempfile::tempdir().unwrap();
        let config = batch(
            dir.path(),
            &[
                "rec1_g0_tcat.imec0.ap.bin",
                "rec2_g0_tcat.imec0.ap.bin",
                "rec3_g0_tcat.imec0.ap.bin",
            ],
            "[convert]\nformat = \"text\"\n",
        );
        let prepared = prepare_batch(&config).unwrap();

        let ks_dir = prepared[0].context.layout.module_output_dir();
        std::fs::create_dir_all(&ks_dir).unwrap();
        std::fs::write(ks_dir.join(SIDECAR_FILE), "sample_rate = 30000.0\n").unwrap();
        write_u64_npy(&prepared[0].context.layout.spike_times_path(), "(3,)", &[0, 30000, 60000]);

        // Sorter output without a sidecar
        std::fs::create_dir_all(prepared[2].context.layout.module_output_dir()).unwrap();
        write_u64_npy(&prepared[2].context.layout.spike_times_path(), "(1,)", &[45000]);

        let runner = ScriptedRunner::default();
        let report = run_batch(&prepared, &config, &runner).await;

        let first = report.recordings[0].conversion.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(
            std::fs::read_to_string(&first.output_path).unwrap(),
            "0.000000\n1.000000\n2.000000"
        );
        assert!(first.fallback().is_none());
        assert!(report.recordings[0].succeeded());

        // No sorter output for the second recording
        assert!(matches!(
            report.recordings[1].conversion,
            Some(Err(ConvertError::SourceFileNotFound(_)))
        ));
        assert!(!report.recordings[1].succeeded());
        assert!(matches!(
            report.recordings[1].outcome.state,
            RecordingState::ConversionFailed { .. }
        ));

        assert!(report.recordings[2].succeeded());
        assert!(report.recordings[2].conversion.as_ref().unwrap().as_ref().unwrap().fallback().is_some());
        assert_eq!(report.failed_count(), 1);

        let rows = log_rows(&config);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].ends_with(",completed,,"));
        assert!(rows[1].contains(",rec2_g0,0,"));
        assert!(rows[1].contains(",failed,spike_times_to_sec,Source file not found"));
        // The sidecar path in the detail is quoted, so the field is too
        assert!(rows[2].contains(",completed,,\"spike_times_to_sec used fallback rate 30000 Hz"));
    }

    #[test]
    fn test_remove_stale_tool_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_stale_tool_log(dir.path()).unwrap());
        std::fs::write(dir.path().join(WAVEFORM_TOOL_LOG), "old").unwrap();
        assert!(remove_stale_tool_log(dir.path()).unwrap());
        assert!(!dir.path().join(WAVEFORM_TOOL_LOG).exists());
    }
}
