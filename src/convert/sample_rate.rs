use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Parameter file the sorter writes next to its outputs
pub const SIDECAR_FILE: &str = "params.py";
/// Token identifying the sample-rate assignment in the sidecar
pub const SAMPLE_RATE_KEY: &str = "sample_rate";
/// Rate used when nothing better is available, in Hz
pub const FALLBACK_SAMPLE_RATE: f64 = 30000.0;

/// Why the fallback rate was used
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    SidecarMissing(PathBuf),
    KeyNotFound(PathBuf),
    NotPositive { path: PathBuf, value: f64 },
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::SidecarMissing(path) => write!(f, "{:?} does not exist", path),
            FallbackReason::KeyNotFound(path) => {
                write!(f, "no '{}' line in {:?}", SAMPLE_RATE_KEY, path)
            }
            FallbackReason::NotPositive { path, value } => {
                write!(f, "{:?} gives non-positive rate {}", path, value)
            }
        }
    }
}

/// Where the sample rate used for a conversion came from
#[derive(Debug, Clone, PartialEq)]
pub enum SampleRateSource {
    /// Passed in by the caller
    Supplied,
    /// Read from the sidecar parameter file
    Sidecar(PathBuf),
    /// Hardcoded or configured fallback
    Fallback(FallbackReason),
}

/// Scan a sidecar for `sample_rate = <value>`. The last parsable line wins.
pub fn read_sidecar_rate(path: &Path) -> io::Result<Option<f64>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rate = None;

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if !line.contains(SAMPLE_RATE_KEY) {
            continue;
        }

        let value = line
            .split_once('=')
            .map(|(_, v)| v.split('#').next().unwrap_or_default().trim());

        match value.map(str::parse::<f64>) {
            Some(Ok(v)) => rate = Some(v),
            _ => warn!(
                "Ignoring unparsable {} line {} in {:?}: {}",
                SAMPLE_RATE_KEY,
                line_num + 1,
                path,
                line.trim()
            ),
        }
    }

    Ok(rate)
}

/// Pick the sample rate for files in `dir`.
///
/// A positive `supplied` rate is used as is. Otherwise the sidecar in `dir`
/// is consulted, and failing that `fallback` is used and reported in the
/// returned source. Returns `None` only when `fallback` is not positive either.
pub fn resolve_sample_rate(
    dir: &Path,
    supplied: f64,
    fallback: f64,
) -> io::Result<Option<(f64, SampleRateSource)>> {
    if supplied > 0.0 && supplied.is_finite() {
        return Ok(Some((supplied, SampleRateSource::Supplied)));
    }

    let sidecar = dir.join(SIDECAR_FILE);
    let reason = if !sidecar.is_file() {
        FallbackReason::SidecarMissing(sidecar)
    } else {
        match read_sidecar_rate(&sidecar)? {
            Some(rate) if rate > 0.0 && rate.is_finite() => {
                info!("sample_rate read from {:?}: {:.10}", sidecar, rate);
                return Ok(Some((rate, SampleRateSource::Sidecar(sidecar))));
            }
            Some(value) => FallbackReason::NotPositive {
                path: sidecar,
                value,
            },
            None => FallbackReason::KeyNotFound(sidecar),
        }
    };

    if !(fallback > 0.0 && fallback.is_finite()) {
        return Ok(None);
    }

    warn!("Failed to read sample rate ({}); using {} Hz", reason, fallback);
    Ok(Some((fallback, SampleRateSource::Fallback(reason))))
}
