use std::time::Duration;

use crate::models::ModelType;
use crate::scoring::DEFAULT_ML_MODEL;

/// How often the hybrid step re-reads its prerequisite predictions before
/// giving up for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Label of the simulated-ML variant, also the hybrid model's ML input.
    pub ml_model: String,
    /// Maximum students scored at once.
    pub concurrency: usize,
    pub hybrid_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ml_model: DEFAULT_ML_MODEL.to_string(),
            concurrency: 8,
            hybrid_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// The ML label must not collide with a built-in model, or stored rows
    /// would read back as the wrong model.
    pub fn validate(&self) -> anyhow::Result<()> {
        let label = self.ml_model.trim();
        if label.is_empty() {
            anyhow::bail!("ML model name must not be empty");
        }
        if !matches!(ModelType::from(label), ModelType::Ml(_)) {
            anyhow::bail!("ML model name '{label}' is reserved for a built-in model");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.ml_model, "random-forest");
        assert_eq!(config.hybrid_retry.attempts, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_reserved_ml_labels() {
        let config = EngineConfig {
            ml_model: "hybrid".to_string(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let blank = EngineConfig {
            ml_model: "  ".to_string(),
            ..EngineConfig::default()
        };
        assert!(blank.validate().is_err());
    }
}
