use std::mem;

use arrow_schema::SchemaRef;
use quarry_common::{QuarryError, Result};
use tracing::{debug, warn};

use crate::explain::explain_logical;
use crate::limits::StorageLimitsList;
use crate::options::{CompilationOptions, PlannerConfiguration};
use crate::physical_plan::PhysicalPipeline;
use crate::physical_planner::PipelineLowering;
use crate::query_plan::{build_query_plan, QueryPlan};
use crate::query_tree::QueryTree;
use crate::settings::{BuildQueryPipelineSettings, QueryPlanOptimizationSettings};

enum PlannerState {
    /// No plan yet; limits wait here until the first build.
    Unbuilt { pending_limits: StorageLimitsList },
    Built(QueryPlan),
    /// The plan was moved out. Terminal.
    Extracted,
}

/// Lazily builds and caches the logical plan of one resolved query tree.
///
/// `Unbuilt -> Built -> Extracted`. The plan is built on first demand and at
/// most once; a failed build leaves the planner `Unbuilt`. Storage limits are
/// accepted only while `Unbuilt`. Not safe for concurrent use; every mutating
/// operation takes `&mut self`.
pub struct Planner {
    tree: QueryTree,
    options: CompilationOptions,
    config: PlannerConfiguration,
    state: PlannerState,
    pipelines_built: usize,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            PlannerState::Unbuilt { .. } => "unbuilt",
            PlannerState::Built(_) => "built",
            PlannerState::Extracted => "extracted",
        };
        f.debug_struct("Planner")
            .field("state", &state)
            .field("options", &self.options)
            .field("pipelines_built", &self.pipelines_built)
            .finish()
    }
}

impl Planner {
    pub fn new(tree: QueryTree, options: CompilationOptions, config: PlannerConfiguration) -> Self {
        Self {
            tree,
            options,
            config,
            state: PlannerState::Unbuilt {
                pending_limits: vec![],
            },
            pipelines_built: 0,
        }
    }

    pub fn query_tree(&self) -> &QueryTree {
        &self.tree
    }

    pub fn options(&self) -> &CompilationOptions {
        &self.options
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, PlannerState::Built(_))
    }

    /// Build the plan unless it already exists. No-op once built.
    pub fn build_query_plan_if_needed(&mut self) -> Result<()> {
        self.ensure_built("build_query_plan")
    }

    /// Root output header; builds the plan on first call.
    pub fn schema(&mut self) -> Result<SchemaRef> {
        Ok(self.query_plan()?.header())
    }

    /// Cached plan; builds it on first call.
    pub fn query_plan(&mut self) -> Result<&QueryPlan> {
        self.ensure_built("query_plan")?;
        match &self.state {
            PlannerState::Built(plan) => Ok(plan),
            _ => Err(QuarryError::PlannerReused {
                operation: "query_plan",
            }),
        }
    }

    /// Register limits applied when the plan is built.
    pub fn add_storage_limits(&mut self, limits: StorageLimitsList) -> Result<()> {
        match &mut self.state {
            PlannerState::Unbuilt { pending_limits } => {
                pending_limits.extend(limits);
                Ok(())
            }
            PlannerState::Built(_) | PlannerState::Extracted => Err(QuarryError::LimitsAfterBuild),
        }
    }

    /// Lower the cached plan.
    ///
    /// Lowering is never cached. Unless the options allow repeated
    /// execution, only the first call lowers; later calls fail with
    /// [`QuarryError::PlannerReused`].
    pub fn build_pipeline(
        &mut self,
        lowering: &dyn PipelineLowering,
        optimization: &QueryPlanOptimizationSettings,
        build: &BuildQueryPipelineSettings,
    ) -> Result<PhysicalPipeline> {
        self.ensure_built("build_pipeline")?;
        if self.pipelines_built > 0 && !self.options.allow_repeated_execution {
            warn!(
                pipelines_built = self.pipelines_built,
                "repeated pipeline build rejected"
            );
            return Err(QuarryError::PlannerReused {
                operation: "build_pipeline",
            });
        }
        let PlannerState::Built(plan) = &self.state else {
            return Err(QuarryError::PlannerReused {
                operation: "build_pipeline",
            });
        };
        let pipeline = plan.build_pipeline(lowering, optimization, build)?;
        self.pipelines_built += 1;
        Ok(pipeline)
    }

    pub fn pipelines_built(&self) -> usize {
        self.pipelines_built
    }

    /// Move the plan out. The planner is unusable afterwards.
    pub fn extract_query_plan(&mut self) -> Result<QueryPlan> {
        self.ensure_built("extract_query_plan")?;
        match mem::replace(&mut self.state, PlannerState::Extracted) {
            PlannerState::Built(plan) => Ok(plan),
            _ => Err(QuarryError::PlannerReused {
                operation: "extract_query_plan",
            }),
        }
    }

    pub fn into_query_plan(mut self) -> Result<QueryPlan> {
        self.extract_query_plan()
    }

    fn ensure_built(&mut self, operation: &'static str) -> Result<()> {
        let pending_limits = match &mut self.state {
            PlannerState::Built(_) => return Ok(()),
            PlannerState::Extracted => return Err(QuarryError::PlannerReused { operation }),
            PlannerState::Unbuilt { pending_limits } => pending_limits,
        };
        let mut plan = build_query_plan(&self.tree, &self.options, self.config)?;
        plan.add_storage_limits(mem::take(pending_limits));
        debug!(
            stage = ?self.options.to_stage,
            only_analyze = self.config.only_analyze,
            limits = plan.storage_limits().len(),
            plan = %explain_logical(plan.root()),
            "query plan built"
        );
        self.state = PlannerState::Built(plan);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::limits::StorageLimits;
    use crate::logical_plan::{one_row_schema, Expr, LiteralValue};
    use crate::query_tree::{projection_schema, QueryNode, SelectNode, SourceNode};

    fn tree() -> QueryTree {
        let projection = vec![(Expr::Literal(LiteralValue::Int64(1)), "1".to_string())];
        let schema = projection_schema(&projection, &one_row_schema()).expect("schema");
        QueryTree::new(QueryNode::Select(SelectNode {
            source: SourceNode::OneRow,
            filter: None,
            aggregation: None,
            projection,
            distinct: false,
            order_by: vec![],
            limit: None,
            offset: 0,
            schema,
        }))
    }

    fn planner(options: CompilationOptions) -> Planner {
        let config = PlannerConfiguration::from(&options);
        Planner::new(tree(), options, config)
    }

    struct CountingLowering(Arc<AtomicUsize>);

    impl PipelineLowering for CountingLowering {
        fn lower(
            &self,
            plan: &QueryPlan,
            optimization: &QueryPlanOptimizationSettings,
            build: &BuildQueryPipelineSettings,
        ) -> Result<PhysicalPipeline> {
            self.0.fetch_add(1, Ordering::SeqCst);
            crate::physical_planner::DefaultPipelineLowering.lower(plan, optimization, build)
        }
    }

    #[test]
    fn schema_is_stable_across_calls() {
        let mut p = planner(CompilationOptions::default());
        assert!(!p.is_built());
        let first = p.schema().expect("schema");
        assert!(p.is_built());
        let second = p.schema().expect("schema");
        assert_eq!(first, second);
        assert_eq!(first.fields().len(), 1);
    }

    #[test]
    fn pending_limits_are_applied_in_order() {
        let mut p = planner(CompilationOptions::default());
        p.add_storage_limits(vec![StorageLimits::local().with_max_rows(1)])
            .expect("limits");
        p.add_storage_limits(vec![StorageLimits::leaf().with_max_bytes(2)])
            .expect("limits");
        let plan = p.query_plan().expect("plan");
        assert_eq!(
            plan.storage_limits(),
            &[
                StorageLimits::local().with_max_rows(1),
                StorageLimits::leaf().with_max_bytes(2)
            ]
        );
    }

    #[test]
    fn limits_after_build_are_rejected() {
        let mut p = planner(CompilationOptions::default());
        p.build_query_plan_if_needed().expect("build");
        let err = p.add_storage_limits(vec![StorageLimits::local()]).unwrap_err();
        assert!(matches!(err, QuarryError::LimitsAfterBuild));
    }

    #[test]
    fn extraction_is_single_use() {
        let mut p = planner(CompilationOptions::default());
        let plan = p.extract_query_plan().expect("extract");
        assert_eq!(plan.header().fields().len(), 1);
        assert!(matches!(
            p.extract_query_plan().unwrap_err(),
            QuarryError::PlannerReused { .. }
        ));
        assert!(matches!(p.schema().unwrap_err(), QuarryError::PlannerReused { .. }));
        assert!(matches!(
            p.add_storage_limits(vec![]).unwrap_err(),
            QuarryError::LimitsAfterBuild
        ));
    }

    #[test]
    fn repeated_pipeline_needs_opt_in() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lowering = CountingLowering(Arc::clone(&calls));
        let opt = QueryPlanOptimizationSettings::default();
        let build = BuildQueryPipelineSettings::default();

        let mut p = planner(CompilationOptions::default());
        p.build_pipeline(&lowering, &opt, &build).expect("first");
        assert!(matches!(
            p.build_pipeline(&lowering, &opt, &build).unwrap_err(),
            QuarryError::PlannerReused { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut p = planner(CompilationOptions::default().with_allow_repeated_execution(true));
        p.build_pipeline(&lowering, &opt, &build).expect("first");
        p.build_pipeline(&lowering, &opt, &build).expect("second");
        assert_eq!(p.pipelines_built(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
