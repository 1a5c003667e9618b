use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};

/// Session-level settings consulted by query tree passes, plan building and
/// pipeline lowering.
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Upper bound on parallel streams in the lowered pipeline.
    pub max_threads: usize,
    /// Target row count per output batch.
    pub max_block_size: usize,
    /// Hash partitions used by shuffle exchanges around aggregation.
    pub shuffle_partitions: usize,
    /// Master switch for plan-level step optimizations during lowering.
    pub query_plan_enable_optimizations: bool,
    /// Ceiling on optimizations applied per lowering (0 = unlimited).
    pub query_plan_max_optimizations_to_apply: usize,
    /// Push filters into table scans.
    pub query_plan_filter_push_down: bool,
    /// Merge adjacent filter/projection steps.
    pub query_plan_merge_expressions: bool,
    /// Result row ceiling applied to the final pipeline.
    pub max_result_rows: Option<u64>,
    /// Result byte ceiling applied to the final pipeline.
    pub max_result_bytes: Option<u64>,
    /// Wall-clock ceiling for the whole query.
    pub max_execution_time_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_threads: 8,
            max_block_size: 8192,
            shuffle_partitions: 64,
            query_plan_enable_optimizations: true,
            query_plan_max_optimizations_to_apply: 10_000,
            query_plan_filter_push_down: true,
            query_plan_merge_expressions: true,
            max_result_rows: None,
            max_result_bytes: None,
            max_execution_time_ms: None,
        }
    }
}

impl Settings {
    /// Parse settings from a JSON document and validate them.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let settings: Settings =
            serde_json::from_str(s).map_err(|e| QuarryError::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file on disk.
    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    /// Reject values that would make lowering meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(QuarryError::InvalidConfig(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if self.max_block_size == 0 {
            return Err(QuarryError::InvalidConfig(
                "max_block_size must be at least 1".to_string(),
            ));
        }
        if self.shuffle_partitions == 0 {
            return Err(QuarryError::InvalidConfig(
                "shuffle_partitions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use crate::QuarryError;

    #[test]
    fn partial_json_keeps_defaults() {
        let s = Settings::from_json_str(r#"{"max_threads": 2, "max_result_rows": 100}"#)
            .expect("settings");
        assert_eq!(s.max_threads, 2);
        assert_eq!(s.max_result_rows, Some(100));
        assert_eq!(s.max_block_size, Settings::default().max_block_size);
        assert!(s.query_plan_enable_optimizations);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let err = Settings::from_json_str(r#"{"max_block_size": 0}"#).unwrap_err();
        assert!(matches!(err, QuarryError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = Settings::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, QuarryError::InvalidConfig(_)));
    }
}
