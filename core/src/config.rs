//! Engine configuration.
//!
//! [`EngineConfig`] is plain serde data so drivers can keep it next to their other job
//! settings. Every field has a default, so an empty JSON object is a valid configuration.

use crate::error::{DataSetError, Result};
use nndataset_kernels::KernelParams;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-example nonzero limit of the fast Boolean sparse kernels.
pub const DEFAULT_MAX_SPARSE: u32 = 4608;
/// Per-example nonzero limit of the fast analog sparse kernels.
pub const DEFAULT_MAX_SPARSE_ANALOG: u32 = 2304;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base RNG seed; worker `r` seeds its generator with `seed + r`.
    pub seed: u64,
    pub max_sparse: u32,
    pub max_sparse_analog: u32,
    pub kernel: KernelParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 12134,
            max_sparse: DEFAULT_MAX_SPARSE,
            max_sparse_analog: DEFAULT_MAX_SPARSE_ANALOG,
            kernel: KernelParams::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| DataSetError::io(path, e))?;
        Self::from_json_str(&json)
    }

    /// Fast-kernel nonzero limit for Boolean or analog data.
    pub fn sparse_limit(&self, boolean: bool) -> u32 {
        if boolean {
            self.max_sparse
        } else {
            self.max_sparse_analog
        }
    }

    /// Rejects parameter values the kernels cannot use.
    ///
    /// # Errors
    ///
    /// Returns [`DataSetError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let k = &self.kernel;
        let unit = |name: &str, v: f32| {
            if v > 0.0 && v < 1.0 {
                Ok(())
            } else {
                Err(DataSetError::Config(format!(
                    "{name} must lie in (0, 1), got {v}"
                )))
            }
        };
        unit("one_target", k.one_target)?;
        unit("zero_target", k.zero_target)?;
        for (name, v) in [("one_scale", k.one_scale), ("zero_scale", k.zero_scale)] {
            if v < 0.0 || !v.is_finite() {
                return Err(DataSetError::Config(format!(
                    "{name} must be a non-negative number, got {v}"
                )));
            }
        }
        if !(0.0..1.0).contains(&k.denoising_p) {
            return Err(DataSetError::Config(format!(
                "denoising_p must lie in [0, 1), got {}",
                k.denoising_p
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.sparse_limit(true), DEFAULT_MAX_SPARSE);
        assert_eq!(config.sparse_limit(false), DEFAULT_MAX_SPARSE_ANALOG);
    }

    #[test]
    fn test_partial_kernel_section() {
        let config =
            EngineConfig::from_json_str(r#"{"seed": 7, "kernel": {"denoising_p": 0.25}}"#)
                .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.kernel.denoising_p, 0.25);
        assert_eq!(config.kernel.one_target, 0.9);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.kernel.denoising_p = 1.0;
        assert!(matches!(config.validate(), Err(DataSetError::Config(_))));

        let mut config = EngineConfig::default();
        config.kernel.one_target = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.kernel.zero_scale = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{\"seed\": \"x\"}"),
            Err(DataSetError::Json(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"max_sparse": 10}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_sparse, 10);
    }
}
