use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const RUN_LOG_HEADER: &str = "timestamp,session_id,probe,modules,status,failed_module,detail";

#[derive(Error, Debug)]
pub enum RunLogError {
    #[error("Failed to append to run log {path:?}: {source}")]
    Append { path: PathBuf, source: io::Error },
}

/// Terminal status of one recording's module sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One row of the run log
#[derive(Debug, Clone)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Local>,
    pub session_id: String,
    pub probe: String,
    /// Modules attempted, with wall time in seconds
    pub modules: Vec<(String, f64)>,
    pub status: RunStatus,
    pub failed_module: Option<String>,
    pub detail: String,
}

impl RunLogEntry {
    fn to_row(&self) -> String {
        let modules = self
            .modules
            .iter()
            .map(|(name, secs)| format!("{}:{:.2}", name, secs))
            .collect::<Vec<_>>()
            .join(";");

        [
            self.timestamp.to_rfc3339(),
            self.session_id.clone(),
            self.probe.clone(),
            modules,
            self.status.to_string(),
            self.failed_module.clone().unwrap_or_default(),
            self.detail.clone(),
        ]
        .iter()
        .map(|field| escape_field(field))
        .collect::<Vec<_>>()
        .join(",")
    }
}

/// Quote a field when it would otherwise break the row
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Append-only CSV log shared by every recording and every batch run.
///
/// The file is opened in append mode for each row and closed right after.
/// Appends are not locked: two batches writing the same log at once may
/// interleave rows.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the file is new or empty
    pub fn append(&self, entry: &RunLogEntry) -> Result<(), RunLogError> {
        let err = |source| RunLogError::Append {
            path: self.path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(err)?;
        let is_empty = file.metadata().map_err(err)?.len() == 0;

        let mut writer = BufWriter::new(file);
        if is_empty {
            writeln!(writer, "{}", RUN_LOG_HEADER).map_err(err)?;
        }
        writeln!(writer, "{}", entry.to_row()).map_err(err)?;
        writer.flush().map_err(err)?;

        debug!("Appended {} row for {} to {:?}", entry.status, entry.session_id, self.path);
        Ok(())
    }
}
