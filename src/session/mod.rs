mod identity;
mod layout;

pub use identity::IdentityError;
pub use layout::SessionLayout;

use identity::{resolve_identity, StreamBand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One recording to process, as supplied by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSpec {
    /// Full path to the raw continuous-data binary
    pub path: PathBuf,
    /// Region tags; the first one selects parameter overrides
    pub regions: Vec<String>,
}

impl RecordingSpec {
    #[cfg(test)]
    pub fn new(path: impl Into<PathBuf>, regions: &[&str]) -> Self {
        Self {
            path: path.into(),
            regions: regions.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// The tag used for parameter lookup
    pub fn primary_region(&self) -> Option<&str> {
        self.regions.first().map(String::as_str)
    }
}

/// Everything derived for one recording during the configuration pass
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub probe: String,
    pub region: String,
    pub layout: SessionLayout,
}

impl SessionContext {
    /// Derive identity and layout for a recording. Pure; touches no files.
    pub fn resolve(spec: &RecordingSpec, json_dir: &Path) -> Result<Self, IdentityError> {
        let file_name = spec
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IdentityError::MalformedIdentifier {
                name: spec.path.display().to_string(),
                reason: "path has no file name",
            })?;

        let identity = resolve_identity(file_name)?;
        debug!("{}: trigger {}, {} band", file_name, identity.trigger, identity.band);
        if identity.band == StreamBand::Lf {
            warn!("{} is an LF stream; the sorter expects AP band data", file_name);
        }
        let layout = SessionLayout::new(&spec.path, &identity, json_dir);

        Ok(Self {
            session_id: identity.session_id,
            probe: identity.probe,
            region: spec.primary_region().unwrap_or_default().to_string(),
            layout,
        })
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.layout.artifact_path()
    }

    /// Label used in logs, e.g. `run_g0 (imec1)`, or `run_g0` for legacy names
    pub fn label(&self) -> String {
        if self.probe.is_empty() {
            self.session_id.clone()
        } else {
            format!("{} (imec{})", self.session_id, self.probe)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_context() {
        let spec = RecordingSpec::new("/data/run_g0_tcat.imec0.ap.bin", &["cortex", "thalamus"]);
        let ctx = SessionContext::resolve(&spec, Path::new("/json")).unwrap();
        assert_eq!(ctx.session_id, "run_g0");
        assert_eq!(ctx.probe, "0");
        assert_eq!(ctx.region, "cortex");
        assert_eq!(ctx.artifact_path(), PathBuf::from("/json/run_g0_imec0-input.json"));
    }

    #[test]
    fn test_label_omits_empty_probe() {
        let multi = RecordingSpec::new("/data/run_g0_tcat.imec1.ap.bin", &["default"]);
        let legacy = RecordingSpec::new("/data/run_g0_t0.imec.ap.bin", &["default"]);
        assert_eq!(SessionContext::resolve(&multi, Path::new("/json")).unwrap().label(), "run_g0 (imec1)");
        assert_eq!(SessionContext::resolve(&legacy, Path::new("/json")).unwrap().label(), "run_g0");
    }

    #[test]
    fn test_resolve_rejects_bad_name() {
        let spec = RecordingSpec::new("/data/notes.txt", &["default"]);
        assert!(SessionContext::resolve(&spec, Path::new("/json")).is_err());
    }
}
