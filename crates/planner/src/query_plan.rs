use std::sync::Arc;

use arrow_schema::SchemaRef;
use quarry_common::{QuarryError, Result};

use crate::limits::StorageLimits;
use crate::logical_plan::{AggregateMode, LogicalPlan};
use crate::options::{CompilationOptions, PlannerConfiguration, ProcessingStage};
use crate::physical_plan::PhysicalPipeline;
use crate::physical_planner::PipelineLowering;
use crate::query_tree::{QueryNode, QueryTree, SelectNode, SourceNode, UnionMode};
use crate::settings::{BuildQueryPipelineSettings, QueryPlanOptimizationSettings};

/// Logical plan plus the storage limits registered for it.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    root: LogicalPlan,
    storage_limits: Vec<StorageLimits>,
}

impl QueryPlan {
    pub fn new(root: LogicalPlan) -> Self {
        Self {
            root,
            storage_limits: vec![],
        }
    }

    pub fn root(&self) -> &LogicalPlan {
        &self.root
    }

    /// Output header of the plan root.
    pub fn header(&self) -> SchemaRef {
        self.root.schema()
    }

    /// Limits in registration order.
    pub fn storage_limits(&self) -> &[StorageLimits] {
        &self.storage_limits
    }

    pub fn add_storage_limits(&mut self, limits: impl IntoIterator<Item = StorageLimits>) {
        self.storage_limits.extend(limits);
    }

    pub fn into_root(self) -> LogicalPlan {
        self.root
    }

    /// Lower through `lowering` with the given policies.
    pub fn build_pipeline(
        &self,
        lowering: &dyn PipelineLowering,
        optimization: &QueryPlanOptimizationSettings,
        build: &BuildQueryPipelineSettings,
    ) -> Result<PhysicalPipeline> {
        lowering.lower(self, optimization, build)
    }
}

/// Plan `tree` up to `options.to_stage`.
///
/// In analyze-only mode table reads become [`LogicalPlan::EmptySource`]s with
/// the same header, so the root header matches a full plan of the same tree.
pub fn build_query_plan(
    tree: &QueryTree,
    options: &CompilationOptions,
    config: PlannerConfiguration,
) -> Result<QueryPlan> {
    let planner = StepPlanner {
        only_analyze: config.only_analyze,
    };
    Ok(QueryPlan::new(planner.plan_node(&tree.root, options.to_stage)?))
}

struct StepPlanner {
    only_analyze: bool,
}

impl StepPlanner {
    fn plan_node(&self, node: &QueryNode, stage: ProcessingStage) -> Result<LogicalPlan> {
        match node {
            QueryNode::Select(select) => self.plan_select(select, stage),
            QueryNode::Union(union) => {
                let inputs = union
                    .branches
                    .iter()
                    .map(|b| self.plan_select(b, stage))
                    .collect::<Result<Vec<_>>>()?;
                let schema = if stage.is_complete() {
                    Arc::clone(&union.schema)
                } else {
                    common_header(&inputs, stage)?
                };
                let plan = LogicalPlan::Union { inputs, schema };
                Ok(match union.mode {
                    UnionMode::All => plan,
                    UnionMode::Distinct => LogicalPlan::Distinct {
                        input: Box::new(plan),
                    },
                })
            }
        }
    }

    fn plan_select(&self, select: &SelectNode, stage: ProcessingStage) -> Result<LogicalPlan> {
        let mut plan = match &select.source {
            SourceNode::OneRow => LogicalPlan::OneRow,
            SourceNode::Table { name, schema, .. } if self.only_analyze => {
                LogicalPlan::EmptySource {
                    table: name.clone(),
                    schema: Arc::clone(schema),
                }
            }
            SourceNode::Table { name, schema, .. } => LogicalPlan::TableScan {
                table: name.clone(),
                projection: Some(schema.fields().iter().map(|f| f.name().clone()).collect()),
                filters: vec![],
                schema: Arc::clone(schema),
            },
            // Derived tables are always planned in full.
            SourceNode::Subquery { query, .. } => {
                self.plan_node(query, ProcessingStage::Complete)?
            }
        };

        if let Some(predicate) = &select.filter {
            plan = LogicalPlan::Filter {
                predicate: predicate.clone(),
                input: Box::new(plan),
            };
        }
        if stage == ProcessingStage::FetchColumns {
            return Ok(plan);
        }

        if let Some(agg) = &select.aggregation {
            let mode = if stage == ProcessingStage::WithMergeableState {
                AggregateMode::Partial
            } else {
                AggregateMode::Final
            };
            plan = LogicalPlan::Aggregate {
                group_exprs: agg.group_exprs.clone(),
                aggr_exprs: agg.aggr_exprs.clone(),
                mode,
                schema: Arc::clone(&agg.schema),
                input: Box::new(plan),
            };
            if mode == AggregateMode::Partial {
                return Ok(plan);
            }
        }

        plan = LogicalPlan::Projection {
            exprs: select.projection.clone(),
            schema: Arc::clone(&select.schema),
            input: Box::new(plan),
        };
        if select.distinct {
            plan = LogicalPlan::Distinct {
                input: Box::new(plan),
            };
        }
        if !select.order_by.is_empty() {
            plan = LogicalPlan::Sort {
                exprs: select.order_by.clone(),
                input: Box::new(plan),
            };
        }
        if select.limit.is_some() || select.offset > 0 {
            plan = LogicalPlan::Limit {
                skip: select.offset,
                fetch: select.limit,
                input: Box::new(plan),
            };
        }
        Ok(plan)
    }
}

/// Header shared by union inputs planned to an intermediate stage.
fn common_header(inputs: &[LogicalPlan], stage: ProcessingStage) -> Result<SchemaRef> {
    let first = inputs
        .first()
        .map(LogicalPlan::schema)
        .ok_or_else(|| QuarryError::Planning("UNION without branches".to_string()))?;
    for input in &inputs[1..] {
        let header = input.schema();
        let same = header.fields().len() == first.fields().len()
            && header
                .fields()
                .iter()
                .zip(first.fields())
                .all(|(a, b)| a.data_type() == b.data_type());
        if !same {
            return Err(QuarryError::Planning(format!(
                "UNION branches produce different headers at stage {stage:?}"
            )));
        }
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use quarry_common::{QuarryError, Settings};
    use quarry_sql::CanonicalQuery;

    use super::*;
    use crate::analyzer::{QueryTreeBuilder, SchemaProvider, SqlQueryTreeBuilder};
    use crate::context::ExecutionContext;

    struct OneTable(SchemaRef);

    impl SchemaProvider for OneTable {
        fn table_schema(&self, table: &str) -> quarry_common::Result<SchemaRef> {
            if table == "t" {
                Ok(Arc::clone(&self.0))
            } else {
                Err(QuarryError::Planning(format!("unknown table: {table}")))
            }
        }
    }

    fn tree(sql: &str) -> QueryTree {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, false),
            Field::new("v", DataType::Int64, true),
        ]));
        let ctx = ExecutionContext::new(Settings::default(), Arc::new(OneTable(schema)));
        SqlQueryTreeBuilder
            .build(&CanonicalQuery::parse(sql).expect("parse"), &ctx)
            .expect("build")
    }

    fn step_names(plan: &LogicalPlan, out: &mut Vec<&'static str>) {
        out.push(match plan {
            LogicalPlan::OneRow => "OneRow",
            LogicalPlan::EmptySource { .. } => "EmptySource",
            LogicalPlan::TableScan { .. } => "TableScan",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Projection { .. } => "Projection",
            LogicalPlan::Aggregate { .. } => "Aggregate",
            LogicalPlan::Distinct { .. } => "Distinct",
            LogicalPlan::Sort { .. } => "Sort",
            LogicalPlan::Limit { .. } => "Limit",
            LogicalPlan::Union { .. } => "Union",
        });
        for c in plan.children() {
            step_names(c, out);
        }
    }

    fn steps(plan: &QueryPlan) -> Vec<&'static str> {
        let mut out = vec![];
        step_names(plan.root(), &mut out);
        out
    }

    #[test]
    fn complete_plan_has_all_steps() {
        let t = tree("SELECT k, SUM(v) AS s FROM t WHERE v > 0 GROUP BY k ORDER BY s LIMIT 5");
        let plan = build_query_plan(&t, &CompilationOptions::default(), PlannerConfiguration::default())
            .expect("plan");
        assert_eq!(
            steps(&plan),
            vec!["Limit", "Sort", "Projection", "Aggregate", "Filter", "TableScan"]
        );
        assert_eq!(plan.header(), t.schema());
    }

    #[test]
    fn analyze_only_keeps_header_with_empty_sources() {
        let t = tree("SELECT DISTINCT k FROM t");
        let options = CompilationOptions::analyze();
        let analyzed = build_query_plan(&t, &options, PlannerConfiguration::from(&options))
            .expect("plan");
        let full = build_query_plan(&t, &CompilationOptions::default(), PlannerConfiguration::default())
            .expect("plan");
        assert!(steps(&analyzed).contains(&"EmptySource"));
        assert!(!steps(&analyzed).contains(&"TableScan"));
        assert_eq!(analyzed.header(), full.header());
    }

    #[test]
    fn mergeable_state_stops_at_partial_aggregate() {
        let t = tree("SELECT k, COUNT(*) FROM t GROUP BY k");
        let options = CompilationOptions::default().with_stage(ProcessingStage::WithMergeableState);
        let plan = build_query_plan(&t, &options, PlannerConfiguration::default()).expect("plan");
        match plan.root() {
            LogicalPlan::Aggregate { mode, .. } => assert_eq!(*mode, AggregateMode::Partial),
            other => panic!("expected partial aggregate, got {other:?}"),
        }
    }

    #[test]
    fn fetch_columns_plans_source_and_filter() {
        let t = tree("SELECT k FROM t WHERE v = 1");
        let options = CompilationOptions::default().with_stage(ProcessingStage::FetchColumns);
        let plan = build_query_plan(&t, &options, PlannerConfiguration::default()).expect("plan");
        assert_eq!(steps(&plan), vec!["Filter", "TableScan"]);
    }

    #[test]
    fn union_distinct_adds_distinct_step() {
        let t = tree("SELECT k FROM t UNION SELECT 'x'");
        let plan = build_query_plan(&t, &CompilationOptions::default(), PlannerConfiguration::default())
            .expect("plan");
        assert_eq!(steps(&plan)[..2], ["Distinct", "Union"]);
    }
}
