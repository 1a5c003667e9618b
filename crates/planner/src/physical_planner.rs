use quarry_common::Result;
use tracing::debug;

use crate::limits::StorageLimits;
use crate::logical_plan::{AggregateMode, Expr, LogicalPlan};
use crate::physical_plan::{
    CoalesceBatchesExec, DistinctExec, EmptyExec, ExchangeExec, FilterExec,
    FinalHashAggregateExec, LimitExec, PartialHashAggregateExec, PartitioningSpec, PhysicalPipeline,
    PhysicalPlan, ProjectExec, ShuffleReadExchange, ShuffleWriteExchange, SortExec,
    TableScanExec, UnionExec,
};
use crate::query_plan::QueryPlan;
use crate::settings::{BuildQueryPipelineSettings, QueryPlanOptimizationSettings};

/// Turns a built logical plan into a physical pipeline.
///
/// Implementations receive the plan only after it reached its final shape;
/// they must not retain it.
pub trait PipelineLowering: Send + Sync {
    fn lower(
        &self,
        plan: &QueryPlan,
        optimization: &QueryPlanOptimizationSettings,
        build: &BuildQueryPipelineSettings,
    ) -> Result<PhysicalPipeline>;
}

/// Rule-based rewrites followed by [`create_physical_plan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPipelineLowering;

impl PipelineLowering for DefaultPipelineLowering {
    fn lower(
        &self,
        plan: &QueryPlan,
        optimization: &QueryPlanOptimizationSettings,
        build: &BuildQueryPipelineSettings,
    ) -> Result<PhysicalPipeline> {
        let logical = if optimization.optimize_plan {
            optimize_logical_plan(plan.root().clone(), optimization)
        } else {
            plan.root().clone()
        };
        let root = PhysicalPlan::CoalesceBatches(CoalesceBatchesExec {
            target_batch_rows: build.max_block_size,
            input: Box::new(create_physical_plan(&logical, build)?),
        });
        let mut limits = plan.storage_limits().to_vec();
        if let Some(t) = build.max_execution_time {
            limits.push(StorageLimits::local().with_max_execution_time(t));
        }
        debug!(
            operator = root.name(),
            max_threads = build.max_threads,
            limits = limits.len(),
            "lowered query plan"
        );
        Ok(PhysicalPipeline::new(root, plan.header(), build.max_threads, limits))
    }
}

/// Apply the enabled plan rewrites bottom-up.
///
/// Rewrites: merge `Filter(Filter(x))`, inline `Projection(Projection(x))` and
/// push filters into table scans. At most `max_optimizations_to_apply`
/// rewrites are applied (`0` means unlimited). Headers are preserved.
pub fn optimize_logical_plan(
    plan: LogicalPlan,
    settings: &QueryPlanOptimizationSettings,
) -> LogicalPlan {
    let mut budget = RewriteBudget {
        limit: settings.max_optimizations_to_apply,
        applied: 0,
    };
    rewrite(plan, settings, &mut budget)
}

struct RewriteBudget {
    limit: usize,
    applied: usize,
}

impl RewriteBudget {
    fn try_apply(&mut self, rule: &'static str) -> bool {
        if self.limit != 0 && self.applied >= self.limit {
            return false;
        }
        self.applied += 1;
        debug!(rule, applied = self.applied, "applying plan rewrite");
        true
    }
}

fn rewrite(
    plan: LogicalPlan,
    settings: &QueryPlanOptimizationSettings,
    budget: &mut RewriteBudget,
) -> LogicalPlan {
    let plan = map_children(plan, &mut |child| rewrite(child, settings, budget));
    match plan {
        LogicalPlan::Filter { predicate, input } => match *input {
            LogicalPlan::TableScan {
                table,
                projection,
                mut filters,
                schema,
            } if settings.filter_push_down && budget.try_apply("push_filter_into_scan") => {
                filters.push(predicate);
                LogicalPlan::TableScan {
                    table,
                    projection,
                    filters,
                    schema,
                }
            }
            LogicalPlan::Filter {
                predicate: inner,
                input: inner_input,
            } if settings.merge_expressions && budget.try_apply("merge_filters") => {
                LogicalPlan::Filter {
                    predicate: Expr::And(Box::new(inner), Box::new(predicate)),
                    input: inner_input,
                }
            }
            other => LogicalPlan::Filter {
                predicate,
                input: Box::new(other),
            },
        },
        LogicalPlan::Projection {
            exprs,
            schema,
            input,
        } => match *input {
            LogicalPlan::Projection {
                exprs: inner,
                schema: inner_schema,
                input: inner_input,
            } if settings.merge_expressions => {
                let merged = exprs
                    .iter()
                    .map(|(e, name)| e.substitute_columns(&inner).map(|e| (e, name.clone())))
                    .collect::<Option<Vec<_>>>();
                match merged {
                    Some(merged) if budget.try_apply("merge_projections") => {
                        LogicalPlan::Projection {
                            exprs: merged,
                            schema,
                            input: inner_input,
                        }
                    }
                    _ => LogicalPlan::Projection {
                        exprs,
                        schema,
                        input: Box::new(LogicalPlan::Projection {
                            exprs: inner,
                            schema: inner_schema,
                            input: inner_input,
                        }),
                    },
                }
            }
            other => LogicalPlan::Projection {
                exprs,
                schema,
                input: Box::new(other),
            },
        },
        other => other,
    }
}

fn map_children(
    plan: LogicalPlan,
    f: &mut dyn FnMut(LogicalPlan) -> LogicalPlan,
) -> LogicalPlan {
    match plan {
        LogicalPlan::Filter { predicate, input } => LogicalPlan::Filter {
            predicate,
            input: Box::new(f(*input)),
        },
        LogicalPlan::Projection {
            exprs,
            schema,
            input,
        } => LogicalPlan::Projection {
            exprs,
            schema,
            input: Box::new(f(*input)),
        },
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            mode,
            schema,
            input,
        } => LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            mode,
            schema,
            input: Box::new(f(*input)),
        },
        LogicalPlan::Distinct { input } => LogicalPlan::Distinct {
            input: Box::new(f(*input)),
        },
        LogicalPlan::Sort { exprs, input } => LogicalPlan::Sort {
            exprs,
            input: Box::new(f(*input)),
        },
        LogicalPlan::Limit { skip, fetch, input } => LogicalPlan::Limit {
            skip,
            fetch,
            input: Box::new(f(*input)),
        },
        LogicalPlan::Union { inputs, schema } => LogicalPlan::Union {
            inputs: inputs.into_iter().map(|i| f(i)).collect(),
            schema,
        },
        leaf @ (LogicalPlan::OneRow
        | LogicalPlan::EmptySource { .. }
        | LogicalPlan::TableScan { .. }) => leaf,
    }
}

/// Lower a logical plan to physical operators.
///
/// A final aggregate lowers to `PartialHashAggregate -> ShuffleWrite ->
/// ShuffleRead -> FinalHashAggregate`, hash partitioned by the group key
/// output names (single partition without keys). A partial aggregate lowers
/// to the partial operator alone; the consumer merges its state.
pub fn create_physical_plan(
    logical: &LogicalPlan,
    build: &BuildQueryPipelineSettings,
) -> Result<PhysicalPlan> {
    match logical {
        LogicalPlan::OneRow => Ok(PhysicalPlan::OneRow),
        LogicalPlan::EmptySource { table, schema } => Ok(PhysicalPlan::Empty(EmptyExec {
            table: table.clone(),
            schema: schema.as_ref().clone(),
        })),
        LogicalPlan::TableScan {
            table,
            projection,
            filters,
            schema,
        } => Ok(PhysicalPlan::TableScan(TableScanExec {
            table: table.clone(),
            schema: schema.as_ref().clone(),
            projection: projection.clone(),
            filters: filters.clone(),
        })),

        LogicalPlan::Filter { predicate, input } => {
            let child = create_physical_plan(input, build)?;
            Ok(PhysicalPlan::Filter(FilterExec {
                predicate: predicate.clone(),
                input: Box::new(child),
            }))
        }

        LogicalPlan::Projection { exprs, input, .. } => {
            let child = create_physical_plan(input, build)?;
            Ok(PhysicalPlan::Project(ProjectExec {
                exprs: exprs.clone(),
                input: Box::new(child),
            }))
        }

        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            mode,
            input,
            ..
        } => {
            let child = create_physical_plan(input, build)?;
            let partial = PhysicalPlan::PartialHashAggregate(PartialHashAggregateExec {
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
                input: Box::new(child),
            });
            if *mode == AggregateMode::Partial {
                return Ok(partial);
            }

            let partitioning = if group_exprs.is_empty() {
                PartitioningSpec::Single
            } else {
                PartitioningSpec::HashKeys {
                    keys: group_exprs.iter().map(|(_, name)| name.clone()).collect(),
                    partitions: build.shuffle_partitions,
                }
            };
            let write = PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(ShuffleWriteExchange {
                input: Box::new(partial),
                partitioning: partitioning.clone(),
            }));
            let read = PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(ShuffleReadExchange {
                input: Box::new(write),
                partitioning,
            }));
            Ok(PhysicalPlan::FinalHashAggregate(FinalHashAggregateExec {
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
                input: Box::new(read),
            }))
        }

        LogicalPlan::Distinct { input } => {
            let child = create_physical_plan(input, build)?;
            Ok(PhysicalPlan::Distinct(DistinctExec {
                input: Box::new(child),
            }))
        }
        LogicalPlan::Sort { exprs, input } => {
            let child = create_physical_plan(input, build)?;
            Ok(PhysicalPlan::Sort(SortExec {
                exprs: exprs.clone(),
                input: Box::new(child),
            }))
        }
        LogicalPlan::Limit { skip, fetch, input } => {
            let child = create_physical_plan(input, build)?;
            Ok(PhysicalPlan::Limit(LimitExec {
                skip: *skip,
                fetch: *fetch,
                input: Box::new(child),
            }))
        }
        LogicalPlan::Union { inputs, .. } => Ok(PhysicalPlan::Union(UnionExec {
            inputs: inputs
                .iter()
                .map(|i| create_physical_plan(i, build))
                .collect::<Result<Vec<_>>>()?,
        })),
    }
}
