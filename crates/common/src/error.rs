use thiserror::Error;

/// Canonical error taxonomy shared by every quarry crate.
///
/// Classification guidance:
/// - [`QuarryError::Planning`]: name/type/shape issues discovered while building
///   the query tree or the logical plan
/// - [`QuarryError::Execution`]: failures while lowering or metering a pipeline
/// - [`QuarryError::InvalidConfig`]: settings/catalog/environment contract violations
/// - [`QuarryError::Unsupported`]: syntactically valid but intentionally unimplemented SQL
/// - [`QuarryError::UnsupportedQueryShape`]: the normalizer rejected the top-level node
/// - [`QuarryError::PassPrecondition`]: a query tree pass found a broken invariant
/// - [`QuarryError::PlannerReused`] / [`QuarryError::LimitsAfterBuild`]: caller bugs
///   against the planner state machine
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Invalid or inconsistent configuration/catalog state.
    ///
    /// Examples:
    /// - zero `max_threads` or `max_block_size`
    /// - malformed settings/catalog JSON
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Query tree construction and planning failures.
    ///
    /// Examples:
    /// - unknown table/column
    /// - type mismatch in expressions
    /// - invalid LIMIT/OFFSET values
    #[error("planning error: {0}")]
    Planning(String),

    /// Lowering and quota failures after planning succeeded.
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The top-level query node is neither a SELECT nor a UNION of SELECTs.
    ///
    /// Carries the rendered form of the offending node.
    #[error("unsupported query shape: expected SELECT or UNION of SELECTs, got {0}")]
    UnsupportedQueryShape(String),

    /// A query tree pass observed that an invariant it depends on is absent.
    #[error("pass '{pass}' precondition failed: {reason}")]
    PassPrecondition {
        /// Name of the failing pass.
        pass: String,
        /// What was missing.
        reason: String,
    },

    /// The planner was asked to do something its current state no longer allows.
    #[error("planner reused: {operation} is not allowed in the current compilation state")]
    PlannerReused {
        /// Operation the caller attempted.
        operation: &'static str,
    },

    /// Storage limits were registered after the plan root was finalized.
    #[error("storage limits must be added before the query plan is built")]
    LimitsAfterBuild,
}

/// Standard quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;
