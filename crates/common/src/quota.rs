//! Shared result quota.
//!
//! A [`Quota`] is created once per session and shared by every compilation
//! derived from it. The lowered pipeline of a final-stage query carries a
//! handle to it so downstream consumption can be metered; intermediate-stage
//! pipelines never carry one because a coordinator meters the merged result.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{QuarryError, Result};

/// Ceilings enforced by a [`Quota`]. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Maximum result rows across all metered pipelines.
    pub max_result_rows: Option<u64>,
    /// Maximum result bytes across all metered pipelines.
    pub max_result_bytes: Option<u64>,
}

/// Snapshot of consumed quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Rows consumed so far.
    pub result_rows: u64,
    /// Bytes consumed so far.
    pub result_bytes: u64,
}

/// Session-wide quota handle.
#[derive(Debug)]
pub struct Quota {
    name: String,
    limits: QuotaLimits,
    result_rows: AtomicU64,
    result_bytes: AtomicU64,
}

impl Quota {
    /// Create a named quota with the given ceilings.
    #[must_use]
    pub fn new(name: impl Into<String>, limits: QuotaLimits) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limits,
            result_rows: AtomicU64::new(0),
            result_bytes: AtomicU64::new(0),
        })
    }

    /// Create a quota with no ceilings.
    #[must_use]
    pub fn unlimited(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, QuotaLimits::default())
    }

    /// Quota name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured ceilings.
    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Current consumption.
    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            result_rows: self.result_rows.load(Ordering::Acquire),
            result_bytes: self.result_bytes.load(Ordering::Acquire),
        }
    }

    /// Account `rows`/`bytes` of produced result.
    ///
    /// Either both counters advance or neither does; a consumption that would
    /// cross a ceiling fails with [`QuarryError::Execution`].
    pub fn consume(&self, rows: u64, bytes: u64) -> Result<()> {
        reserve(&self.result_rows, rows, self.limits.max_result_rows).map_err(|used| {
            QuarryError::Execution(format!(
                "quota '{}' exceeded: result rows {} + {rows} > {}",
                self.name,
                used,
                self.limits.max_result_rows.unwrap_or_default()
            ))
        })?;
        if let Err(used) = reserve(&self.result_bytes, bytes, self.limits.max_result_bytes) {
            self.result_rows.fetch_sub(rows, Ordering::AcqRel);
            return Err(QuarryError::Execution(format!(
                "quota '{}' exceeded: result bytes {} + {bytes} > {}",
                self.name,
                used,
                self.limits.max_result_bytes.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

/// CAS loop adding `amount` under an optional ceiling. Returns the observed
/// value on refusal.
fn reserve(counter: &AtomicU64, amount: u64, ceiling: Option<u64>) -> std::result::Result<(), u64> {
    loop {
        let current = counter.load(Ordering::Acquire);
        let next = current.saturating_add(amount);
        if let Some(max) = ceiling {
            if next > max {
                return Err(current);
            }
        }
        if counter
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_respects_row_ceiling() {
        let quota = Quota::new(
            "q",
            QuotaLimits {
                max_result_rows: Some(10),
                max_result_bytes: None,
            },
        );
        quota.consume(6, 100).expect("first");
        let err = quota.consume(5, 100).unwrap_err();
        assert!(matches!(err, QuarryError::Execution(_)));
        assert_eq!(
            quota.usage(),
            QuotaUsage {
                result_rows: 6,
                result_bytes: 100
            }
        );
    }

    #[test]
    fn byte_refusal_rolls_back_rows() {
        let quota = Quota::new(
            "q",
            QuotaLimits {
                max_result_rows: None,
                max_result_bytes: Some(64),
            },
        );
        assert!(quota.consume(3, 65).is_err());
        assert_eq!(quota.usage(), QuotaUsage::default());
    }
}
