//! Processing parameters for contour generation.

use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

/// swissALTI3D resolution tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 0.5 m ground sample distance (~26 MB per tile).
    High,
    /// 2.0 m ground sample distance (~1 MB per tile).
    #[default]
    Standard,
}

impl Resolution {
    /// Ground sample distance in metres.
    pub const fn gsd(&self) -> f64 {
        match self {
            Resolution::High => 0.5,
            Resolution::Standard => 2.0,
        }
    }

    /// Parse from a CLI-style name (`standard` / `high`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "2" | "2.0" => Ok(Resolution::Standard),
            "high" | "0.5" => Ok(Resolution::High),
            other => Err(EngineError::InvalidParameters(format!(
                "unknown resolution '{}', expected 'standard' or 'high'",
                other
            ))),
        }
    }
}

/// Parameters controlling contour extraction.
///
/// Together with the area geometry and the contributing tile checksums these
/// determine the derived-artifact cache key, so every field that can change
/// the output must live here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContourParams {
    /// Contour interval in metres.
    pub interval: f64,
    /// Name of the elevation attribute in output features.
    pub attribute_name: String,
    /// Douglas-Peucker tolerance in metres; 0 disables simplification.
    pub simplify_tolerance: f64,
    /// DEM resolution to fetch.
    pub resolution: Resolution,
}

impl Default for ContourParams {
    fn default() -> Self {
        Self {
            interval: 1.0,
            attribute_name: "elevation".to_string(),
            simplify_tolerance: 0.0,
            resolution: Resolution::Standard,
        }
    }
}

impl ContourParams {
    /// Create parameters with the given interval and defaults elsewhere.
    pub fn with_interval(interval: f64) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Check that every parameter is in range.
    pub fn validate(&self) -> Result<()> {
        if !self.interval.is_finite() || self.interval <= 0.0 {
            return Err(EngineError::InvalidParameters(format!(
                "contour interval must be positive, got {}",
                self.interval
            )));
        }
        if !self.simplify_tolerance.is_finite() || self.simplify_tolerance < 0.0 {
            return Err(EngineError::InvalidParameters(format!(
                "simplify tolerance must be non-negative, got {}",
                self.simplify_tolerance
            )));
        }
        let name = self.attribute_name.trim();
        if name.is_empty() || name != self.attribute_name {
            return Err(EngineError::InvalidParameters(format!(
                "attribute name must be non-empty without surrounding whitespace, got '{}'",
                self.attribute_name
            )));
        }
        Ok(())
    }

    /// Canonical JSON form used for hashing; keys are emitted in sorted order.
    pub fn canonical_json(&self) -> serde_json::Value {
        // serde_json::Map is a BTreeMap without the preserve_order feature.
        serde_json::json!({
            "attribute_name": self.attribute_name,
            "interval": self.interval,
            "resolution": self.resolution.gsd(),
            "simplify_tolerance": self.simplify_tolerance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ContourParams::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        for interval in [0.0, -1.0, f64::NAN] {
            let params = ContourParams::with_interval(interval);
            assert!(matches!(
                params.validate(),
                Err(EngineError::InvalidParameters(_))
            ));
        }
    }

    #[test]
    fn test_rejects_negative_simplify_tolerance() {
        let params = ContourParams {
            simplify_tolerance: -0.5,
            ..ContourParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::parse("HIGH").unwrap(), Resolution::High);
        assert_eq!(Resolution::parse("standard").unwrap(), Resolution::Standard);
        assert!(Resolution::parse("ultra").is_err());
    }

    #[test]
    fn test_canonical_json_has_sorted_keys() {
        let text = serde_json::to_string(&ContourParams::with_interval(2.0).canonical_json()).unwrap();
        assert_eq!(
            text,
            r#"{"attribute_name":"elevation","interval":2.0,"resolution":2.0,"simplify_tolerance":0.0}"#
        );
    }
}
