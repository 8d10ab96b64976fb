//! Project-wide bake settings
//!
//! One `BakeSettings` value is shared by every renderer of a compositor. It
//! is plain serde data so hosts can keep it next to their other project
//! configuration; a handful of fields can be overridden from the environment
//! at startup.
//!
//! Env:
//! - COMPOSITE_TRANSFORM_SENSITIVITY=low|medium|high
//! - COMPOSITE_ENABLE_CULLING=0|1
//! - COMPOSITE_MIN_TARGET_SIZE=8

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_ascii_lowercase())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    match env_string(name)?.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// How small a transform change still marks a renderer dirty
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl TransformSensitivity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Epsilon per sensitivity tier, coarse to fine
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensitivityEpsilons {
    pub low: f32,
    pub medium: f32,
    pub high: f32,
}

impl Default for SensitivityEpsilons {
    fn default() -> Self {
        Self {
            low: 1.0 / (1 << 2) as f32,
            medium: 1.0 / (1 << 5) as f32,
            high: 1.0 / (1 << 12) as f32,
        }
    }
}

/// Settings shared by every renderer of one compositor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeSettings {
    pub transform_sensitivity: TransformSensitivity,
    pub sensitivity_epsilons: SensitivityEpsilons,
    /// Culling switch applied while `play_mode` is set
    pub enable_culling_in_play_mode: bool,
    /// Culling switch applied while `play_mode` is clear
    pub enable_culling_in_edit_mode: bool,
    pub play_mode: bool,
    /// Smallest edge a bake target may have, in pixels
    pub min_target_size: u32,
    /// Relative depth or tilt above which a source forces perspective baking
    pub perspective_epsilon: f32,
    /// Factor applied to sampled transforms before comparison
    pub transform_amplification: f32,
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            transform_sensitivity: TransformSensitivity::Medium,
            sensitivity_epsilons: SensitivityEpsilons::default(),
            enable_culling_in_play_mode: true,
            enable_culling_in_edit_mode: true,
            play_mode: true,
            min_target_size: 8,
            perspective_epsilon: 0.001,
            transform_amplification: 10_000.0,
        }
    }
}

impl BakeSettings {
    /// Epsilon for the active sensitivity tier
    pub fn sensitivity(&self) -> f32 {
        match self.transform_sensitivity {
            TransformSensitivity::Low => self.sensitivity_epsilons.low,
            TransformSensitivity::Medium => self.sensitivity_epsilons.medium,
            TransformSensitivity::High => self.sensitivity_epsilons.high,
        }
    }

    /// Whether culling is enabled for the current mode
    pub fn enable_culling(&self) -> bool {
        if self.play_mode {
            self.enable_culling_in_play_mode
        } else {
            self.enable_culling_in_edit_mode
        }
    }

    pub fn with_transform_sensitivity(mut self, sensitivity: TransformSensitivity) -> Self {
        self.transform_sensitivity = sensitivity;
        self
    }

    pub fn with_culling(mut self, enabled: bool) -> Self {
        self.enable_culling_in_play_mode = enabled;
        self.enable_culling_in_edit_mode = enabled;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `COMPOSITE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("COMPOSITE_TRANSFORM_SENSITIVITY") {
            match TransformSensitivity::parse(&v) {
                Some(s) => {
                    self.transform_sensitivity = s;
                    tracing::info!(sensitivity = ?s, "transform sensitivity overridden from env");
                }
                None => tracing::warn!(value = %v, "ignoring unknown COMPOSITE_TRANSFORM_SENSITIVITY"),
            }
        }
        if let Some(v) = env_bool("COMPOSITE_ENABLE_CULLING") {
            self.enable_culling_in_play_mode = v;
            self.enable_culling_in_edit_mode = v;
            tracing::info!(enabled = v, "culling overridden from env");
        }
        if let Some(v) = env_u32("COMPOSITE_MIN_TARGET_SIZE") {
            self.min_target_size = v.max(1);
            tracing::info!(min = self.min_target_size, "minimum target size overridden from env");
        }
    }

    pub fn validate(&self) -> Result<()> {
        let e = &self.sensitivity_epsilons;
        for (name, v) in [
            ("sensitivity_epsilons.low", e.low),
            ("sensitivity_epsilons.medium", e.medium),
            ("sensitivity_epsilons.high", e.high),
            ("perspective_epsilon", self.perspective_epsilon),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(CoreError::InvalidValue {
                    name,
                    reason: format!("expected a finite non-negative number, got {v}"),
                });
            }
        }
        if self.min_target_size == 0 {
            return Err(CoreError::InvalidValue {
                name: "min_target_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.transform_amplification.is_finite() && self.transform_amplification > 0.0) {
            return Err(CoreError::InvalidValue {
                name: "transform_amplification",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tiers() {
        let s = BakeSettings::default();
        assert_eq!(s.sensitivity(), 1.0 / 32.0);
        assert_eq!(
            s.clone().with_transform_sensitivity(TransformSensitivity::Low).sensitivity(),
            0.25
        );
        assert_eq!(
            s.with_transform_sensitivity(TransformSensitivity::High).sensitivity(),
            1.0 / 4096.0
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let s = BakeSettings::from_toml_str(
            r#"
            transform_sensitivity = "high"
            enable_culling_in_edit_mode = false
            play_mode = false
            "#,
        )
        .unwrap();
        assert_eq!(s.transform_sensitivity, TransformSensitivity::High);
        assert!(!s.enable_culling());
        assert_eq!(s.min_target_size, 8);
    }

    #[test]
    fn test_custom_epsilons() {
        let s = BakeSettings::from_toml_str(
            r#"
            transform_sensitivity = "low"
            [sensitivity_epsilons]
            low = 0.5
            medium = 0.1
            high = 0.01
            "#,
        )
        .unwrap();
        assert_eq!(s.sensitivity(), 0.5);
    }

    #[test]
    fn test_validation_rejects_zero_min_size() {
        let err = BakeSettings::from_toml_str("min_target_size = 0").unwrap_err();
        assert!(matches!(err, CoreError::InvalidValue { name: "min_target_size", .. }));
    }
}
