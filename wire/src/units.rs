//! Canonical unit-aware parsing for the Kubernetes resource-quantity strings
//! (`"123n"`, `"500m"`, `"456Ki"`) emitted by `metrics.k8s.io`. This resolves
//! Open Question (b): the original implementation parsed only the leading
//! integer of these strings, silently discarding the suffix.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum UnitsError {
    #[error("empty quantity string")]
    Empty,
    #[error("quantity string {0:?} has no numeric prefix")]
    NoNumericPrefix(String),
    #[error("unrecognized quantity suffix {0:?} in {1:?}")]
    UnknownSuffix(String, String),
}

fn split_numeric_prefix(raw: &str) -> Result<(f64, &str), UnitsError> {
    if raw.is_empty() {
        return Err(UnitsError::Empty);
    }
    let split_at = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split_at);
    let number: f64 =
        number.parse().map_err(|_| UnitsError::NoNumericPrefix(raw.to_string()))?;
    Ok((number, suffix))
}

/// Parses a CPU quantity (e.g. `"250m"`, `"2"`, `"500000n"`) into a fraction
/// of a core.
pub fn parse_cpu_quantity(raw: &str) -> Result<f64, UnitsError> {
    let (value, suffix) = split_numeric_prefix(raw.trim())?;
    let cores = match suffix {
        "" => value,
        "n" => value / 1_000_000_000.0,
        "u" => value / 1_000_000.0,
        "m" => value / 1_000.0,
        "k" => value * 1_000.0,
        other => return Err(UnitsError::UnknownSuffix(other.to_string(), raw.to_string())),
    };
    Ok(cores)
}

/// Parses a memory quantity (e.g. `"456Ki"`, `"1Mi"`, `"2Gi"`, or a bare
/// byte count) into MiB.
pub fn parse_memory_quantity_mib(raw: &str) -> Result<f64, UnitsError> {
    let (value, suffix) = split_numeric_prefix(raw.trim())?;
    const KI: f64 = 1024.0;
    const MI: f64 = KI * 1024.0;
    const GI: f64 = MI * 1024.0;
    const K: f64 = 1000.0;
    const M: f64 = K * 1000.0;
    const G: f64 = M * 1000.0;
    let bytes = match suffix {
        "" => value,
        "Ki" => value * KI,
        "Mi" => value * MI,
        "Gi" => value * GI,
        "K" => value * K,
        "M" => value * M,
        "G" => value * G,
        other => return Err(UnitsError::UnknownSuffix(other.to_string(), raw.to_string())),
    };
    Ok(bytes / MI)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nanocores() {
        assert!((parse_cpu_quantity("500000000n").unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn parses_millicores() {
        assert!((parse_cpu_quantity("250m").unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn parses_bare_cores() {
        assert_eq!(parse_cpu_quantity("2").unwrap(), 2.0);
    }

    #[test]
    fn parses_kibibytes_to_mib() {
        assert!((parse_memory_quantity_mib("1024Ki").unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parses_gibibytes_to_mib() {
        assert!((parse_memory_quantity_mib("1Gi").unwrap() - 1024.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert_eq!(
            parse_cpu_quantity("3x"),
            Err(UnitsError::UnknownSuffix("x".to_string(), "3x".to_string()))
        );
    }

    #[test]
    fn rejects_empty_string() {
        assert_eq!(parse_cpu_quantity(""), Err(UnitsError::Empty));
    }
}
