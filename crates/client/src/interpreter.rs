use std::sync::Arc;

use arrow_schema::SchemaRef;
use quarry_common::{Quota, Result};
use quarry_planner::{
    build_compilation_context, BuildQueryPipelineSettings, CompilationOptions,
    DefaultPipelineLowering, ExecutionContext, PhysicalPipeline, PipelineLowering, Planner,
    PlannerConfiguration, QueryPlan, QueryPlanOptimizationSettings, QueryTree, QueryTreeBuilder,
    QueryTreePassManager, SqlQueryTreeBuilder, StorageLimitsList,
};
use quarry_sql::{normalize_query, parse_query, CanonicalQuery, RawQuery};
use tracing::{debug, info};

/// Pluggable collaborators of a compilation.
#[derive(Clone)]
pub struct CompilerComponents {
    pub tree_builder: Arc<dyn QueryTreeBuilder>,
    pub passes: Arc<QueryTreePassManager>,
    pub lowering: Arc<dyn PipelineLowering>,
}

impl Default for CompilerComponents {
    fn default() -> Self {
        Self {
            tree_builder: Arc::new(SqlQueryTreeBuilder),
            passes: QueryTreePassManager::shared_default(),
            lowering: Arc::new(DefaultPipelineLowering),
        }
    }
}

impl std::fmt::Debug for CompilerComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerComponents")
            .field("passes", &self.passes)
            .finish_non_exhaustive()
    }
}

/// Result handle of [`SelectQueryInterpreter::execute`].
#[derive(Debug)]
pub struct BlockIo {
    pipeline: PhysicalPipeline,
}

impl BlockIo {
    pub fn pipeline(&self) -> &PhysicalPipeline {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> PhysicalPipeline {
        self.pipeline
    }

    pub fn header(&self) -> SchemaRef {
        self.pipeline.header()
    }

    /// Quota metering consumption of this result, if attached.
    pub fn quota(&self) -> Option<&Arc<Quota>> {
        self.pipeline.quota()
    }
}

/// One compilation of a SELECT or UNION query.
///
/// Owns a private copy of the ambient context, the resolved query tree (via
/// its [`Planner`]) and the display form of the query. Single owner; not
/// meant to be shared between threads while compiling.
#[derive(Debug)]
pub struct SelectQueryInterpreter {
    query: CanonicalQuery,
    context: ExecutionContext,
    options: CompilationOptions,
    planner: Planner,
    components: CompilerComponents,
}

impl SelectQueryInterpreter {
    pub fn new(raw: RawQuery, ambient: &ExecutionContext, options: CompilationOptions) -> Result<Self> {
        Self::with_components(raw, ambient, options, CompilerComponents::default())
    }

    pub fn from_sql(sql: &str, ambient: &ExecutionContext, options: CompilationOptions) -> Result<Self> {
        Self::new(parse_query(sql)?, ambient, options)
    }

    /// Normalize, resolve and run passes over `raw`.
    ///
    /// With `ignore_ast_optimizations` only the first registered pass runs.
    pub fn with_components(
        raw: RawQuery,
        ambient: &ExecutionContext,
        options: CompilationOptions,
        components: CompilerComponents,
    ) -> Result<Self> {
        let query = normalize_query(raw)?;
        let context = build_compilation_context(ambient, &options)?;
        info!(
            query_id = %context.query_id(),
            stage = ?options.to_stage,
            only_analyze = options.only_analyze,
            "compiling query"
        );

        let mut tree = components.tree_builder.build(&query, &context)?;
        if options.ignore_ast_optimizations {
            let up_to = components.passes.len().min(1);
            components.passes.run_up_to(&mut tree, &context, up_to)?;
        } else {
            components.passes.run(&mut tree, &context)?;
        }

        let config = PlannerConfiguration::from(&options);
        Ok(Self {
            query,
            context,
            planner: Planner::new(tree, options.clone(), config),
            options,
            components,
        })
    }

    pub fn from_query_tree(
        tree: QueryTree,
        ambient: &ExecutionContext,
        options: CompilationOptions,
    ) -> Result<Self> {
        Self::from_query_tree_with_components(tree, ambient, options, CompilerComponents::default())
    }

    /// Start from an already resolved tree.
    ///
    /// No normalization and no passes run; the display form of the query is
    /// re-derived from the tree.
    pub fn from_query_tree_with_components(
        tree: QueryTree,
        ambient: &ExecutionContext,
        options: CompilationOptions,
        components: CompilerComponents,
    ) -> Result<Self> {
        let context = build_compilation_context(ambient, &options)?;
        let query = components.tree_builder.to_display_form(&tree)?;
        info!(
            query_id = %context.query_id(),
            stage = ?options.to_stage,
            only_analyze = options.only_analyze,
            "compiling resolved query tree"
        );
        let config = PlannerConfiguration::from(&options);
        Ok(Self {
            query,
            context,
            planner: Planner::new(tree, options.clone(), config),
            options,
            components,
        })
    }

    /// Output header of `raw` without building a runnable pipeline.
    pub fn sample_block(
        raw: RawQuery,
        ambient: &ExecutionContext,
        options: CompilationOptions,
    ) -> Result<SchemaRef> {
        Self::sample_block_with(raw, ambient, options, CompilerComponents::default())
    }

    pub fn sample_block_with(
        raw: RawQuery,
        ambient: &ExecutionContext,
        options: CompilationOptions,
        components: CompilerComponents,
    ) -> Result<SchemaRef> {
        Self::with_components(raw, ambient, options.with_only_analyze(true), components)?.schema()
    }

    /// Output header of an already resolved tree.
    pub fn sample_block_for_tree(
        tree: QueryTree,
        ambient: &ExecutionContext,
        options: CompilationOptions,
    ) -> Result<SchemaRef> {
        Self::sample_block_for_tree_with(tree, ambient, options, CompilerComponents::default())
    }

    pub fn sample_block_for_tree_with(
        tree: QueryTree,
        ambient: &ExecutionContext,
        options: CompilationOptions,
        components: CompilerComponents,
    ) -> Result<SchemaRef> {
        Self::from_query_tree_with_components(
            tree,
            ambient,
            options.with_only_analyze(true),
            components,
        )?
        .schema()
    }

    pub fn schema(&mut self) -> Result<SchemaRef> {
        self.planner.schema()
    }

    pub fn add_storage_limits(&mut self, limits: StorageLimitsList) -> Result<()> {
        self.planner.add_storage_limits(limits)
    }

    /// Lower the plan with settings derived from the private context.
    pub fn build_query_pipeline(&mut self) -> Result<PhysicalPipeline> {
        let optimization = QueryPlanOptimizationSettings::from_context(&self.context);
        let build = BuildQueryPipelineSettings::from_context(&self.context);
        debug!(
            query_id = %self.context.query_id(),
            optimize = optimization.optimize_plan,
            max_threads = build.max_threads,
            "building query pipeline"
        );
        self.planner
            .build_pipeline(self.components.lowering.as_ref(), &optimization, &build)
    }

    /// Lower and wrap into a [`BlockIo`].
    ///
    /// The context quota is attached only for `Complete` stage compilations
    /// that do not ignore quota.
    pub fn execute(&mut self) -> Result<BlockIo> {
        let mut pipeline = self.build_query_pipeline()?;
        if self.options.to_stage.is_complete() && !self.options.ignore_quota {
            if let Some(quota) = self.context.quota() {
                debug!(
                    query_id = %self.context.query_id(),
                    quota = quota.name(),
                    "attaching quota"
                );
                pipeline.set_quota(Arc::clone(quota));
            }
        }
        Ok(BlockIo { pipeline })
    }

    pub fn extract_query_plan(&mut self) -> Result<QueryPlan> {
        self.planner.extract_query_plan()
    }

    pub fn into_query_plan(self) -> Result<QueryPlan> {
        self.planner.into_query_plan()
    }

    /// Display form of the compiled query.
    pub fn query(&self) -> &CanonicalQuery {
        &self.query
    }

    pub fn query_tree(&self) -> &QueryTree {
        self.planner.query_tree()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn options(&self) -> &CompilationOptions {
        &self.options
    }
}
