//! Shared configuration, error types, IDs and quota primitives for quarry crates.
//!
//! Architecture role:
//! - defines the [`Settings`] consulted by passes, planning and lowering
//! - provides common [`QuarryError`] / [`Result`] contracts
//! - hosts the session-wide [`Quota`] handle attached to final-stage pipelines
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`quota`]

pub mod config;
pub mod error;
pub mod ids;
pub mod quota;

pub use config::Settings;
pub use error::{QuarryError, Result};
pub use ids::*;
pub use quota::{Quota, QuotaLimits, QuotaUsage};
