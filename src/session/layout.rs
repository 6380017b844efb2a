//! Naming grammar for everything a recording produces on disk.
//!
//! All paths are derived here so the grammar can be tested without touching
//! the filesystem.

use std::path::{Path, PathBuf};

use super::identity::SessionIdentity;

/// Extension of the acquisition metadata sidecar
const META_EXTENSION: &str = "meta";
/// Suffix of the sorter output directory (`imec0_ks2`)
const SORTER_DIR_SUFFIX: &str = "_ks2";
/// Suffix of the per-recording configuration artifact
const ARTIFACT_SUFFIX: &str = "-input.json";
/// Sorter output holding spike sample indices
const SPIKE_TIMES_FILE: &str = "spike_times.npy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    binary_path: PathBuf,
    json_dir: PathBuf,
    session_id: String,
    probe: String,
}

impl SessionLayout {
    pub fn new(binary_path: &Path, identity: &SessionIdentity, json_dir: &Path) -> Self {
        Self {
            binary_path: binary_path.to_path_buf(),
            json_dir: json_dir.to_path_buf(),
            session_id: identity.session_id.clone(),
            probe: identity.probe.clone(),
        }
    }

    /// Directory holding the raw binary
    pub fn data_dir(&self) -> PathBuf {
        self.binary_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn continuous_file(&self) -> PathBuf {
        self.binary_path.clone()
    }

    /// `<binary>.meta`, next to the binary
    pub fn meta_path(&self) -> PathBuf {
        self.binary_path.with_extension(META_EXTENSION)
    }

    /// `<data dir>/<session id>`
    pub fn output_parent(&self) -> PathBuf {
        self.data_dir().join(&self.session_id)
    }

    /// `<output parent>/imec<probe>_ks2`
    pub fn module_output_dir(&self) -> PathBuf {
        self.output_parent()
            .join(format!("imec{}{}", self.probe, SORTER_DIR_SUFFIX))
    }

    /// File stem shared by the artifact and the module output documents.
    ///
    /// Multi-probe sessions get the probe appended so probes of one session
    /// never share an artifact.
    pub fn artifact_stem(&self) -> String {
        if self.probe.is_empty() {
            self.session_id.clone()
        } else {
            format!("{}_imec{}", self.session_id, self.probe)
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.json_dir
            .join(format!("{}{}", self.artifact_stem(), ARTIFACT_SUFFIX))
    }

    /// Copy of the artifact kept with the recording's outputs
    pub fn artifact_record_path(&self) -> PathBuf {
        self.output_parent()
            .join(format!("{}{}", self.artifact_stem(), ARTIFACT_SUFFIX))
    }

    /// Output document a module writes after running on this recording
    pub fn module_output_json(&self, module: &str) -> PathBuf {
        self.json_dir
            .join(format!("{}-{}-output.json", self.artifact_stem(), module))
    }

    pub fn spike_times_path(&self) -> PathBuf {
        self.module_output_dir().join(SPIKE_TIMES_FILE)
    }
}
