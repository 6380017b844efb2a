//! Spike time conversion from sample indices to seconds.
//!
//! Reads the sorter's `spike_times.npy` (or a whitespace separated text
//! file of indices) and writes `<stem>_sec.npy` or `<stem>_sec.txt` next to
//! it, with every value divided by the sample rate.

mod npy;
mod sample_rate;

pub use npy::{read_sample_indices, write_f64, NpyError, SampleIndices};
pub use sample_rate::{resolve_sample_rate, FallbackReason, SampleRateSource, FALLBACK_SAMPLE_RATE};

#[cfg(test)]
pub(crate) use npy::tests::write_u64_npy;
#[cfg(test)]
pub(crate) use sample_rate::SIDECAR_FILE;

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Source file not found: {0}")]
    SourceFileNotFound(PathBuf),
    #[error("No usable sample rate (supplied {supplied}, fallback {fallback})")]
    UnparsableSampleRate { supplied: f64, fallback: f64 },
    #[error("Invalid NPY input: {0}")]
    Npy(#[from] NpyError),
    #[error("Invalid sample index '{value}' at position {index}")]
    InvalidSample { index: usize, value: String },
}

/// Output encoding for converted spike times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Little-endian f64 NumPy array
    Npy,
    /// One value per line, six decimals, no trailing newline
    Text,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Npy => "npy",
            OutputFormat::Text => "txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertSettings {
    /// Convert spike times after each completed recording
    pub enabled: bool,
    pub format: OutputFormat,
    /// Rate in Hz; 0 means read it from the sidecar
    pub sample_rate: f64,
    pub fallback_rate: f64,
}

impl Default for ConvertSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            format: OutputFormat::Npy,
            sample_rate: 0.0,
            fallback_rate: FALLBACK_SAMPLE_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutcome {
    pub output_path: PathBuf,
    pub sample_rate: f64,
    pub source: SampleRateSource,
    pub count: usize,
}

impl ConversionOutcome {
    /// The fallback reason, if the fallback rate had to be used
    pub fn fallback(&self) -> Option<&FallbackReason> {
        match &self.source {
            SampleRateSource::Fallback(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Path of the converted file for `source`
pub fn output_path(source: &Path, format: OutputFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{}_sec.{}", stem, format.extension()))
}

fn read_text_indices(path: &Path) -> Result<SampleIndices, ConvertError> {
    let content = fs::read_to_string(path)?;
    let values = content
        .split_whitespace()
        .enumerate()
        .map(|(index, token)| {
            token.parse::<u64>().map_err(|_| ConvertError::InvalidSample {
                index,
                value: token.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SampleIndices {
        shape: vec![values.len()],
        values,
    })
}

fn read_indices(path: &Path) -> Result<SampleIndices, ConvertError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => Ok(read_sample_indices(path)?),
        _ => read_text_indices(path),
    }
}

/// Write one value per line with six decimals; the last line has no newline
fn write_text(path: &Path, values: &[f64]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            writer.write_all(b"\n")?;
        }
        write!(writer, "{:.6}", v)?;
    }
    writer.flush()
}

/// Convert with the built-in fallback rate
pub fn convert(path: &Path, sample_rate: f64, format: OutputFormat) -> Result<ConversionOutcome, ConvertError> {
    convert_with(
        path,
        &ConvertSettings {
            sample_rate,
            format,
            ..Default::default()
        },
    )
}

/// Convert the sample indices in `path` to seconds.
///
/// With `settings.sample_rate == 0` the rate comes from the sidecar in the
/// same directory, or from `settings.fallback_rate` when the sidecar has no
/// usable value. Output order and length match the input exactly.
pub fn convert_with(path: &Path, settings: &ConvertSettings) -> Result<ConversionOutcome, ConvertError> {
    if !path.is_file() {
        return Err(ConvertError::SourceFileNotFound(path.to_path_buf()));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let (rate, source) = resolve_sample_rate(dir, settings.sample_rate, settings.fallback_rate)?
        .ok_or(ConvertError::UnparsableSampleRate {
            supplied: settings.sample_rate,
            fallback: settings.fallback_rate,
        })?;

    let indices = read_indices(path)?;
    let seconds: Vec<f64> = indices.values.iter().map(|&s| s as f64 / rate).collect();

    let output_path = output_path(path, settings.format);
    match settings.format {
        OutputFormat::Npy => write_f64(&output_path, &indices.shape, &seconds)?,
        OutputFormat::Text => write_text(&output_path, &seconds)?,
    }

    info!(
        "Converted {} spike times at {} Hz to {:?}",
        seconds.len(),
        rate,
        output_path
    );

    Ok(ConversionOutcome {
        output_path,
        sample_rate: rate,
        source,
        count: seconds.len(),
    })
}
