//! Settings bundles handed to pipeline lowering, derived from the
//! compilation context.

use std::time::Duration;

use crate::context::ExecutionContext;

/// Which plan rewrites lowering may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPlanOptimizationSettings {
    pub optimize_plan: bool,
    /// Upper bound on applied rewrites; `0` means unlimited.
    pub max_optimizations_to_apply: usize,
    pub filter_push_down: bool,
    pub merge_expressions: bool,
}

impl Default for QueryPlanOptimizationSettings {
    fn default() -> Self {
        Self {
            optimize_plan: true,
            max_optimizations_to_apply: 10_000,
            filter_push_down: true,
            merge_expressions: true,
        }
    }
}

impl QueryPlanOptimizationSettings {
    pub fn from_context(context: &ExecutionContext) -> Self {
        let s = context.settings();
        Self {
            optimize_plan: s.query_plan_enable_optimizations,
            max_optimizations_to_apply: s.query_plan_max_optimizations_to_apply,
            filter_push_down: s.query_plan_filter_push_down,
            merge_expressions: s.query_plan_merge_expressions,
        }
    }

    pub fn disabled() -> Self {
        Self {
            optimize_plan: false,
            ..Self::default()
        }
    }
}

/// Resource wiring for the physical pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildQueryPipelineSettings {
    pub max_threads: usize,
    /// Target rows per output batch.
    pub max_block_size: usize,
    /// Hash partitions used by shuffle exchanges.
    pub shuffle_partitions: usize,
    pub max_execution_time: Option<Duration>,
}

impl Default for BuildQueryPipelineSettings {
    fn default() -> Self {
        Self {
            max_threads: 8,
            max_block_size: 8192,
            shuffle_partitions: 64,
            max_execution_time: None,
        }
    }
}

impl BuildQueryPipelineSettings {
    pub fn from_context(context: &ExecutionContext) -> Self {
        let s = context.settings();
        Self {
            max_threads: s.max_threads,
            max_block_size: s.max_block_size,
            shuffle_partitions: s.shuffle_partitions,
            max_execution_time: s.max_execution_time_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_from_context_settings() {
        let mut ctx = ExecutionContext::empty();
        ctx.settings_mut().query_plan_filter_push_down = false;
        ctx.settings_mut().max_threads = 2;
        ctx.settings_mut().max_execution_time_ms = Some(1500);

        let opt = QueryPlanOptimizationSettings::from_context(&ctx);
        assert!(opt.optimize_plan);
        assert!(!opt.filter_push_down);

        let build = BuildQueryPipelineSettings::from_context(&ctx);
        assert_eq!(build.max_threads, 2);
        assert_eq!(build.max_execution_time, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn defaults_match_default_settings() {
        let ctx = ExecutionContext::empty();
        assert_eq!(
            QueryPlanOptimizationSettings::from_context(&ctx),
            QueryPlanOptimizationSettings::default()
        );
        assert_eq!(
            BuildQueryPipelineSettings::from_context(&ctx),
            BuildQueryPipelineSettings::default()
        );
    }
}
