//! Engine configuration

use crate::error::{MemoryError, Result};
use crate::reconsolidation::ReconsolidationConfig;
use crate::refine::RefineConfig;
use crate::temporal::{TemporalConfig, TemporalPolicy};
use crate::windowing::WindowingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for every component of the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub windowing: WindowingConfig,
    pub temporal: TemporalConfig,
    pub refine: RefineConfig,
    pub reconsolidation: ReconsolidationConfig,
    /// Policy used when a consolidation request does not name one
    pub default_policy: TemporalPolicy,
}

impl EngineConfig {
    /// Load from a JSON file; missing sections keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| MemoryError::Configuration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let epsilon = self.windowing.epsilon_days;
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(MemoryError::Configuration(format!(
                "windowing.epsilon_days must be a positive number, got {epsilon}"
            )));
        }
        if self.windowing.min_memories == 0 {
            return Err(MemoryError::Configuration(
                "windowing.min_memories must be at least 1".to_string(),
            ));
        }
        if self.temporal.max_graph_nodes == 0 {
            return Err(MemoryError::Configuration(
                "temporal.max_graph_nodes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for engine config
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn windowing(mut self, windowing: WindowingConfig) -> Self {
        self.config.windowing = windowing;
        self
    }

    pub fn temporal(mut self, temporal: TemporalConfig) -> Self {
        self.config.temporal = temporal;
        self
    }

    pub fn refine(mut self, refine: RefineConfig) -> Self {
        self.config.refine = refine;
        self
    }

    pub fn reconsolidation(mut self, reconsolidation: ReconsolidationConfig) -> Self {
        self.config.reconsolidation = reconsolidation;
        self
    }

    pub fn default_policy(mut self, policy: TemporalPolicy) -> Self {
        self.config.default_policy = policy;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refine::MergeDisposal;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "refine": {{ "allow_delete": true, "merge_disposal": "delete" }}, "default_policy": "strict" }}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert!(config.refine.allow_delete);
        assert_eq!(config.refine.max_actions, 20);
        assert_eq!(config.refine.merge_disposal, MergeDisposal::Delete);
        assert_eq!(config.default_policy, TemporalPolicy::Strict);
        assert_eq!(config.windowing.epsilon_days, 14.0);
        assert_eq!(config.reconsolidation.slow_threshold_ms, 500);
    }

    #[test]
    fn rejects_unusable_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "windowing": {{ "epsilon_days": 0 }} }}"#).unwrap();
        let err = EngineConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, MemoryError::Configuration(_)));

        let config = EngineConfigBuilder::new()
            .default_policy(TemporalPolicy::Off)
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_policy, TemporalPolicy::Off);
    }
}
