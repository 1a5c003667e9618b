use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a storage limit is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitScope {
    /// Whole local pipeline.
    #[default]
    Local,
    /// Each leaf source separately.
    Leaf,
}

/// Resource ceilings attached to a plan before it is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLimits {
    pub scope: LimitScope,
    pub max_rows: Option<u64>,
    pub max_bytes: Option<u64>,
    pub max_execution_time: Option<Duration>,
}

impl StorageLimits {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn leaf() -> Self {
        Self {
            scope: LimitScope::Leaf,
            ..Self::default()
        }
    }

    pub fn with_max_rows(mut self, rows: u64) -> Self {
        self.max_rows = Some(rows);
        self
    }

    pub fn with_max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    pub fn with_max_execution_time(mut self, t: Duration) -> Self {
        self.max_execution_time = Some(t);
        self
    }
}

/// Limits in registration order.
pub type StorageLimitsList = Vec<StorageLimits>;
