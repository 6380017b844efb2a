//! Region-keyed parameter tables and the constant sorter parameters.
//!
//! Tables are loaded once from the batch file and passed by reference.
//! A lookup returns the exact tag's value; an unknown tag is an error and
//! never falls back to `"default"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Key every table must carry
pub const DEFAULT_REGION: &str = "default";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("Unknown region tag '{tag}' for parameter {parameter}")]
    UnknownRegionTag { tag: String, parameter: &'static str },
    #[error("Parameter table has no \"default\" entry")]
    MissingDefault,
}

/// Mapping from region tag to one parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, T>",
    into = "BTreeMap<String, T>",
    bound(
        deserialize = "T: Deserialize<'de> + Clone",
        serialize = "T: Serialize + Clone"
    )
)]
pub struct ParameterTable<T> {
    values: BTreeMap<String, T>,
}

impl<T: Clone> ParameterTable<T> {
    pub fn new(values: BTreeMap<String, T>) -> Result<Self, ParamError> {
        if !values.contains_key(DEFAULT_REGION) {
            return Err(ParamError::MissingDefault);
        }
        Ok(Self { values })
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, T)]) -> Result<Self, ParamError> {
        Self::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    /// Look up the exact tag
    pub fn get(&self, tag: &str) -> Option<&T> {
        self.values.get(tag)
    }
}

impl<T: Clone> TryFrom<BTreeMap<String, T>> for ParameterTable<T> {
    type Error = ParamError;

    fn try_from(values: BTreeMap<String, T>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl<T> From<ParameterTable<T>> for BTreeMap<String, T> {
    fn from(table: ParameterTable<T>) -> Self {
        table.values
    }
}

/// Resolve one parameter for a region tag
pub fn resolve<'a, T: Clone>(
    table: &'a ParameterTable<T>,
    parameter: &'static str,
    tag: &str,
) -> Result<&'a T, ParamError> {
    table.get(tag).ok_or_else(|| ParamError::UnknownRegionTag {
        tag: tag.to_string(),
        parameter,
    })
}

/// Parameters that vary by brain region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionParams {
    /// Refractory period in milliseconds, used for the ISI violation threshold
    pub refractory_period_ms: ParameterTable<f64>,
    /// Sorter detection thresholds `[Th1, Th2]`
    pub ks_threshold: ParameterTable<[f64; 2]>,
}

impl Default for RegionParams {
    fn default() -> Self {
        // Values suited to KS2/KS2.5; KS3 expects thresholds around [9, 9].
        Self {
            refractory_period_ms: built_in(&[
                ("default", 2.0),
                ("cortex", 2.0),
                ("medulla", 1.5),
                ("thalamus", 1.0),
            ]),
            ks_threshold: built_in(&[
                ("default", [10.0, 4.0]),
                ("cortex", [10.0, 4.0]),
                ("medulla", [10.0, 4.0]),
                ("thalamus", [10.0, 4.0]),
            ]),
        }
    }
}

/// Compiled-in table; every caller lists `"default"` first.
fn built_in<T: Clone>(pairs: &[(&str, T)]) -> ParameterTable<T> {
    ParameterTable {
        values: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    }
}

/// Region parameters resolved for one recording
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParams {
    pub refractory_period_ms: f64,
    pub ks_threshold: [f64; 2],
}

impl ResolvedParams {
    /// ISI violation threshold in seconds
    pub fn isi_threshold_secs(&self) -> f64 {
        self.refractory_period_ms / 1000.0
    }
}

impl RegionParams {
    pub fn resolve(&self, tag: &str) -> Result<ResolvedParams, ParamError> {
        Ok(ResolvedParams {
            refractory_period_ms: *resolve(&self.refractory_period_ms, "refractory_period_ms", tag)?,
            ks_threshold: *resolve(&self.ks_threshold, "ks_threshold", tag)?,
        })
    }
}

/// Sorter and waveform parameters shared by every recording in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterParams {
    pub rem_dup: u8,
    pub save_rez: u8,
    pub copy_fproc: u8,
    pub template_radius_um: f64,
    pub whitening_radius_um: f64,
    pub minfr_goodchannels: f64,
    /// Only honoured by builds of the sorter that accept pre-filtered data
    pub do_filter: u8,
    pub final_splits: u8,
    pub label_good: u8,
    pub csb_seed: u32,
    pub lt_seed: u32,
    /// SNR radius for waveform metrics, in um
    pub c_waves_snr_um: f64,
    pub noise_template_use_rf: bool,
}

impl Default for SorterParams {
    fn default() -> Self {
        Self {
            rem_dup: 0,
            save_rez: 1,
            copy_fproc: 0,
            template_radius_um: 163.0,
            whitening_radius_um: 163.0,
            minfr_goodchannels: 0.1,
            do_filter: 0,
            final_splits: 1,
            label_good: 1,
            csb_seed: 1,
            lt_seed: 1,
            c_waves_snr_um: 160.0,
            noise_template_use_rf: false,
        }
    }
}
