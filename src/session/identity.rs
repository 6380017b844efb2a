use thiserror::Error;

/// Extension carried by every continuous-data binary
const BINARY_EXTENSION: &str = ".bin";
/// Prefix of the probe tag in a stream name (`imec0.ap`, `imec.lf`)
const PROBE_PREFIX: &str = "imec";
/// Trigger value SpikeGLX/CatGT writes for concatenated output
const CONCATENATED_TRIGGER: &str = "cat";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Malformed recording file name '{name}': {reason}")]
    MalformedIdentifier { name: String, reason: &'static str },
}

impl IdentityError {
    fn malformed(name: &str, reason: &'static str) -> Self {
        IdentityError::MalformedIdentifier {
            name: name.to_string(),
            reason,
        }
    }
}

/// Band of the continuous stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBand {
    /// Action-potential band
    Ap,
    /// Local field potential band
    Lf,
}

impl std::fmt::Display for StreamBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamBand::Ap => write!(f, "ap"),
            StreamBand::Lf => write!(f, "lf"),
        }
    }
}

/// Identity of a recording derived from its binary file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// `<run>_g<gate>`, with trigger and stream suffixes removed
    pub session_id: String,
    /// Probe index as written in the name; empty for legacy single-probe files
    pub probe: String,
    /// Trigger as written in the name (`cat` or digits)
    pub trigger: String,
    pub band: StreamBand,
}

/// Parse an acquisition file name of the form
/// `<run>_g<gate>_t<trigger>.imec<probe>.<band>.bin`.
///
/// `<trigger>` is either digits or `cat`, `<probe>` is digits or empty,
/// `<band>` is `ap` or `lf`. Anything else is rejected.
pub fn resolve_identity(file_name: &str) -> Result<SessionIdentity, IdentityError> {
    let name = file_name
        .strip_suffix(BINARY_EXTENSION)
        .ok_or_else(|| IdentityError::malformed(file_name, "missing .bin extension"))?;

    let (stem, stream) = name
        .split_once('.')
        .ok_or_else(|| IdentityError::malformed(file_name, "missing stream tag"))?;

    let (probe_tag, band) = stream
        .split_once('.')
        .ok_or_else(|| IdentityError::malformed(file_name, "missing stream band"))?;

    let band = match band {
        "ap" => StreamBand::Ap,
        "lf" => StreamBand::Lf,
        _ => return Err(IdentityError::malformed(file_name, "unknown stream band")),
    };

    let probe = probe_tag
        .strip_prefix(PROBE_PREFIX)
        .ok_or_else(|| IdentityError::malformed(file_name, "stream is not an imec probe"))?;
    if !probe.chars().all(|c| c.is_ascii_digit()) {
        return Err(IdentityError::malformed(file_name, "probe index is not numeric"));
    }

    let (session_id, trigger) = stem
        .rsplit_once("_t")
        .ok_or_else(|| IdentityError::malformed(file_name, "missing trigger suffix"))?;
    if trigger != CONCATENATED_TRIGGER && !is_index(trigger) {
        return Err(IdentityError::malformed(file_name, "invalid trigger suffix"));
    }

    let (run, gate) = session_id
        .rsplit_once("_g")
        .ok_or_else(|| IdentityError::malformed(file_name, "missing gate suffix"))?;
    if !is_index(gate) {
        return Err(IdentityError::malformed(file_name, "invalid gate suffix"));
    }
    if run.is_empty() {
        return Err(IdentityError::malformed(file_name, "empty run name"));
    }

    Ok(SessionIdentity {
        session_id: session_id.to_string(),
        probe: probe.to_string(),
        trigger: trigger.to_string(),
        band,
    })
}

fn is_index(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concatenated_name() {
        let id = resolve_identity("SC048_122920_ex_g0_tcat.imec0.ap.bin").unwrap();
        assert_eq!(id.session_id, "SC048_122920_ex_g0");
        assert_eq!(id.probe, "0");
        assert_eq!(id.trigger, "cat");
        assert_eq!(id.band, StreamBand::Ap);
    }

    #[test]
    fn test_single_trigger_name() {
        let id = resolve_identity("mouse7_day2_g12_t3.imec1.lf.bin").unwrap();
        assert_eq!(id.session_id, "mouse7_day2_g12");
        assert_eq!(id.probe, "1");
        assert_eq!(id.trigger, "3");
        assert_eq!(id.band, StreamBand::Lf);
    }

    #[test]
    fn test_legacy_single_probe_has_empty_designator() {
        let id = resolve_identity("run_g0_t0.imec.ap.bin").unwrap();
        assert_eq!(id.session_id, "run_g0");
        assert_eq!(id.probe, "");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let name = "SC048_122920_ex_g0_tcat.imec2.ap.bin";
        assert_eq!(resolve_identity(name).unwrap(), resolve_identity(name).unwrap());
    }

    #[test]
    fn test_malformed_names_are_rejected() {
        let bad = [
            "SC048_g0_tcat.imec0.ap.meta",
            "SC048_g0_tcat.bin",
            "SC048_g0_tcat.imec0.bin",
            "SC048_g0_tcat.nidq.bin",
            "SC048_g0_tcat.imecX.ap.bin",
            "SC048_g0_tcat.imec0.xx.bin",
            "SC048_g0.imec0.ap.bin",
            "SC048_g0_tfoo.imec0.ap.bin",
            "SC048_tcat.imec0.ap.bin",
            "SC048_gx_t0.imec0.ap.bin",
            "_g0_t0.imec0.ap.bin",
        ];
        for name in bad {
            assert!(
                matches!(
                    resolve_identity(name),
                    Err(IdentityError::MalformedIdentifier { .. })
                ),
                "{} should be rejected",
                name
            );
        }
    }
}
