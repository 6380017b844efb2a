//! Per-recording configuration artifact.
//!
//! The artifact is the only input a module receives, so it carries every
//! path and parameter the module sequence needs under stable field names.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::params::{ResolvedParams, SorterParams};
use crate::pipeline::{requires_sorter_copy, Module};
use crate::session::SessionContext;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Invalid artifact {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directories {
    pub ecephys_directory: PathBuf,
    pub kilosort_output_directory: PathBuf,
    pub extracted_data_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphysParams {
    pub ap_band_file: PathBuf,
    /// Parsed by the modules themselves; never read here
    pub input_meta_path: PathBuf,
    #[serde(rename = "spikeGLX_data")]
    pub spikeglx_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kilosort2Params {
    #[serde(rename = "Th")]
    pub th: [f64; 2],
    #[serde(rename = "remDup")]
    pub rem_dup: u8,
    #[serde(rename = "finalSplits")]
    pub final_splits: u8,
    #[serde(rename = "labelGood")]
    pub label_good: u8,
    pub save_rez: u8,
    pub copy_fproc: u8,
    pub minfr_goodchannels: f64,
    #[serde(rename = "templateRadius_um")]
    pub template_radius_um: f64,
    #[serde(rename = "whiteningRadius_um")]
    pub whitening_radius_um: f64,
    #[serde(rename = "doFilter")]
    pub do_filter: u8,
    #[serde(rename = "CSBseed")]
    pub csb_seed: u32,
    #[serde(rename = "LTseed")]
    pub lt_seed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilosortHelperParams {
    #[serde(rename = "spikeGLX_data")]
    pub spikeglx_data: bool,
    /// Keep an unmodified copy of the sorter output
    pub ks_make_copy: bool,
    pub kilosort2_params: Kilosort2Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KsPostprocessingParams {
    pub within_unit_overlap_window: f64,
    pub between_unit_overlap_window: f64,
    pub between_unit_dist_um: f64,
    pub deletion_mode: String,
}

impl Default for KsPostprocessingParams {
    fn default() -> Self {
        Self {
            within_unit_overlap_window: 0.000166,
            between_unit_overlap_window: 0.000166,
            between_unit_dist_um: 5.0,
            deletion_mode: "lowAmpCluster".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseWaveformParams {
    pub use_random_forest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetricsParams {
    /// ISI violation threshold in seconds
    pub isi_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatGtHelperParams {
    pub run_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CWavesParams {
    pub snr_radius_um: f64,
}

/// Complete configuration for one recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    pub session_id: String,
    pub probe: String,
    pub region: String,
    pub modules: Vec<Module>,
    pub directories: Directories,
    pub ephys_params: EphysParams,
    pub kilosort_helper_params: KilosortHelperParams,
    pub ks_postprocessing_params: KsPostprocessingParams,
    pub noise_waveform_params: NoiseWaveformParams,
    pub quality_metrics_params: QualityMetricsParams,
    #[serde(rename = "catGT_helper_params")]
    pub catgt_helper_params: CatGtHelperParams,
    pub c_waves_params: CWavesParams,
}

impl ConfigArtifact {
    /// Assemble the artifact; nothing is written.
    pub fn build(
        ctx: &SessionContext,
        params: &ResolvedParams,
        sorter: &SorterParams,
        modules: &[Module],
    ) -> Self {
        let layout = &ctx.layout;
        let data_dir = layout.data_dir();

        Self {
            session_id: ctx.session_id.clone(),
            probe: ctx.probe.clone(),
            region: ctx.region.clone(),
            modules: modules.to_vec(),
            directories: Directories {
                ecephys_directory: data_dir.clone(),
                kilosort_output_directory: layout.module_output_dir(),
                extracted_data_directory: data_dir,
            },
            ephys_params: EphysParams {
                ap_band_file: layout.continuous_file(),
                input_meta_path: layout.meta_path(),
                spikeglx_data: true,
            },
            kilosort_helper_params: KilosortHelperParams {
                spikeglx_data: true,
                ks_make_copy: requires_sorter_copy(modules),
                kilosort2_params: Kilosort2Params {
                    th: params.ks_threshold,
                    rem_dup: sorter.rem_dup,
                    final_splits: sorter.final_splits,
                    label_good: sorter.label_good,
                    save_rez: sorter.save_rez,
                    copy_fproc: sorter.copy_fproc,
                    minfr_goodchannels: sorter.minfr_goodchannels,
                    template_radius_um: sorter.template_radius_um,
                    whitening_radius_um: sorter.whitening_radius_um,
                    do_filter: sorter.do_filter,
                    csb_seed: sorter.csb_seed,
                    lt_seed: sorter.lt_seed,
                },
            },
            ks_postprocessing_params: KsPostprocessingParams::default(),
            noise_waveform_params: NoiseWaveformParams {
                use_random_forest: sorter.noise_template_use_rf,
            },
            quality_metrics_params: QualityMetricsParams {
                isi_threshold: params.isi_threshold_secs(),
            },
            catgt_helper_params: CatGtHelperParams {
                run_name: ctx.session_id.clone(),
            },
            c_waves_params: CWavesParams {
                snr_radius_um: sorter.c_waves_snr_um,
            },
        }
    }
}

/// Write `artifact` to `path`, replacing whatever was there
pub fn write_artifact(artifact: &ConfigArtifact, path: &Path) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, artifact).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
pub fn read_artifact(path: &Path) -> Result<ConfigArtifact, ArtifactError> {
    let file = File::open(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(io::BufReader::new(file)).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Build the artifact for a recording and persist it.
///
/// The artifact goes to the context's artifact path, and a record copy is
/// kept in the recording's output parent directory. Both directories must
/// already exist.
pub fn materialize(
    ctx: &SessionContext,
    params: &ResolvedParams,
    sorter: &SorterParams,
    modules: &[Module],
) -> Result<(ConfigArtifact, PathBuf), ArtifactError> {
    let artifact = ConfigArtifact::build(ctx, params, sorter, modules);
    let path = ctx.artifact_path();

    write_artifact(&artifact, &path)?;
    write_artifact(&artifact, &ctx.layout.artifact_record_path())?;

    info!("Wrote configuration for {} to {:?}", ctx.label(), path);
    Ok((artifact, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RegionParams;
    use crate::session::RecordingSpec;

    fn context(root: &Path) -> SessionContext {
        let data_dir = root.join("data");
        let json_dir = root.join("json");
        std::fs::create_dir_all(&json_dir).unwrap();
        let spec = RecordingSpec::new(data_dir.join("run_g0_tcat.imec0.ap.bin"), &["medulla"]);
        let ctx = SessionContext::resolve(&spec, &json_dir).unwrap();
        std::fs::create_dir_all(ctx.layout.output_parent()).unwrap();
        ctx
    }

    #[test]
    fn test_build_threads_copy_policy_and_params() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let params = RegionParams::default().resolve("medulla").unwrap();

        let plain = ConfigArtifact::build(&ctx, &params, &SorterParams::default(), &[Module::KilosortHelper]);
        assert!(!plain.kilosort_helper_params.ks_make_copy);
        assert!((plain.quality_metrics_params.isi_threshold - 0.0015).abs() < 1e-12);
        assert_eq!(plain.catgt_helper_params.run_name, "run_g0");
        assert_eq!(
            plain.directories.kilosort_output_directory,
            dir.path().join("data").join("run_g0").join("imec0_ks2")
        );

        let copying = ConfigArtifact::build(
            &ctx,
            &params,
            &SorterParams::default(),
            &[Module::KilosortHelper, Module::KilosortPostprocessing],
        );
        assert!(copying.kilosort_helper_params.ks_make_copy);
    }

    #[test]
    fn test_materialize_reads_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let params = RegionParams::default().resolve("medulla").unwrap();

        let (artifact, path) =
            materialize(&ctx, &params, &SorterParams::default(), &[Module::KilosortHelper]).unwrap();

        assert_eq!(read_artifact(&path).unwrap(), artifact);
        assert_eq!(read_artifact(&ctx.layout.artifact_record_path()).unwrap(), artifact);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["kilosort_helper_params"]["kilosort2_params"]["Th"][0], 10.0);
        assert_eq!(raw["catGT_helper_params"]["run_name"], "run_g0");
        assert_eq!(raw["modules"][0], "kilosort_helper");
    }

    #[test]
    fn test_materialize_overwrites_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let modules = [Module::KilosortHelper, Module::QualityMetrics];

        let first = ResolvedParams {
            refractory_period_ms: 2.0,
            ks_threshold: [10.0, 4.0],
        };
        let second = ResolvedParams {
            refractory_period_ms: 1.0,
            ks_threshold: [9.0, 9.0],
        };

        materialize(&ctx, &first, &SorterParams::default(), &modules).unwrap();
        let (_, path) = materialize(&ctx, &second, &SorterParams::default(), &[Module::KilosortHelper]).unwrap();

        let read = read_artifact(&path).unwrap();
        assert_eq!(read.kilosort_helper_params.kilosort2_params.th, [9.0, 9.0]);
        assert!((read.quality_metrics_params.isi_threshold - 0.001).abs() < 1e-12);
        assert_eq!(read.modules, vec![Module::KilosortHelper]);
    }

    #[test]
    fn test_missing_artifact_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = RecordingSpec::new(dir.path().join("run_g0_t0.imec0.ap.bin"), &["default"]);
        let ctx = SessionContext::resolve(&spec, &dir.path().join("absent")).unwrap();
        let params = RegionParams::default().resolve("default").unwrap();

        let err = materialize(&ctx, &params, &SorterParams::default(), &[]).unwrap_err();
        assert!(matches!(err, ArtifactError::Io { .. }));
    }
}
