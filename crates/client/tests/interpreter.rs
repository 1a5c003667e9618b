use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use quarry_client::{CompilerComponents, SelectQueryInterpreter};
use quarry_common::{QuarryError, Quota, Settings};
use quarry_planner::{
    BuildQueryPipelineSettings, CompilationOptions, DefaultPipelineLowering, ExecutionContext,
    LiteralValue, PhysicalPipeline, PipelineLowering, ProcessingStage, QueryNode, QueryPlan,
    QueryPlanOptimizationSettings, QueryTree, QueryTreeBuilder, QueryTreePass,
    QueryTreePassManager, SchemaProvider, SqlQueryTreeBuilder, StorageLimits, SHARD_COUNT_SCALAR,
    SHARD_NUM_SCALAR,
};
use quarry_sql::{parse_query, CanonicalQuery};

struct Tables;

impl SchemaProvider for Tables {
    fn table_schema(&self, table: &str) -> quarry_common::Result<SchemaRef> {
        match table {
            "t" => Ok(Arc::new(Schema::new(vec![
                Field::new("a", DataType::Int64, false),
                Field::new("b", DataType::Utf8, true),
                Field::new("c", DataType::Float64, true),
            ]))),
            other => Err(QuarryError::Planning(format!("unknown table: {other}"))),
        }
    }
}

fn ambient() -> ExecutionContext {
    ExecutionContext::new(Settings::default(), Arc::new(Tables)).with_quota(Quota::unlimited("test"))
}

struct CountingLowering(Arc<AtomicUsize>);

impl PipelineLowering for CountingLowering {
    fn lower(
        &self,
        plan: &QueryPlan,
        optimization: &QueryPlanOptimizationSettings,
        build: &BuildQueryPipelineSettings,
    ) -> quarry_common::Result<PhysicalPipeline> {
        self.0.fetch_add(1, Ordering::SeqCst);
        DefaultPipelineLowering.lower(plan, optimization, build)
    }
}

struct CountingPass(Arc<AtomicUsize>);

impl QueryTreePass for CountingPass {
    fn name(&self) -> &str {
        "counting"
    }

    fn run(&self, _tree: &mut QueryTree, _context: &ExecutionContext) -> quarry_common::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn counting_components(lowered: &Arc<AtomicUsize>) -> CompilerComponents {
    CompilerComponents {
        lowering: Arc::new(CountingLowering(Arc::clone(lowered))),
        ..CompilerComponents::default()
    }
}

fn compile(sql: &str, options: CompilationOptions) -> SelectQueryInterpreter {
    SelectQueryInterpreter::from_sql(sql, &ambient(), options).expect("compile")
}

#[test]
fn select_one_has_one_column_in_both_modes() {
    let lowered = Arc::new(AtomicUsize::new(0));
    let ctx = ambient();

    let mut full = SelectQueryInterpreter::with_components(
        parse_query("SELECT 1").expect("parse"),
        &ctx,
        CompilationOptions::default(),
        counting_components(&lowered),
    )
    .expect("compile");
    let full_schema = full.schema().expect("schema");
    assert_eq!(full_schema.fields().len(), 1);

    let analyzed = SelectQueryInterpreter::sample_block_with(
        parse_query("SELECT 1").expect("parse"),
        &ctx,
        CompilationOptions::default(),
        counting_components(&lowered),
    )
    .expect("sample block");
    assert_eq!(analyzed, full_schema);
    assert_eq!(lowered.load(Ordering::SeqCst), 0);

    full.execute().expect("execute");
    assert_eq!(lowered.load(Ordering::SeqCst), 1);
}

#[test]
fn analyze_only_header_matches_full_plan() {
    for sql in [
        "SELECT b, SUM(a) AS s, AVG(c) FROM t WHERE a > 1 GROUP BY b ORDER BY s DESC LIMIT 3",
        "SELECT DISTINCT b FROM t",
        "SELECT a FROM t UNION ALL SELECT 2.5",
        "SELECT x.a + 1 AS n FROM (SELECT a FROM t WHERE b = 'k') AS x",
    ] {
        let full = compile(sql, CompilationOptions::default())
            .schema()
            .expect("schema");
        let analyzed = SelectQueryInterpreter::sample_block(
            parse_query(sql).expect("parse"),
            &ambient(),
            CompilationOptions::default(),
        )
        .expect("sample block");
        assert_eq!(analyzed, full, "sql={sql}");
    }
}

#[test]
fn schema_is_idempotent() {
    let mut interpreter = compile("SELECT a, b FROM t", CompilationOptions::default());
    let first = interpreter.schema().expect("first");
    let second = interpreter.schema().expect("second");
    assert_eq!(first, second);
}

#[test]
fn storage_limits_after_build_fail() {
    let limits = || vec![StorageLimits::local().with_max_rows(5)];

    let mut i = compile("SELECT a FROM t", CompilationOptions::default());
    i.schema().expect("schema");
    assert!(matches!(i.add_storage_limits(limits()), Err(QuarryError::LimitsAfterBuild)));

    let mut i = compile("SELECT a FROM t", CompilationOptions::default());
    i.execute().expect("execute");
    assert!(matches!(i.add_storage_limits(limits()), Err(QuarryError::LimitsAfterBuild)));

    let mut i = compile("SELECT a FROM t", CompilationOptions::default());
    i.build_query_pipeline().expect("pipeline");
    assert!(matches!(i.add_storage_limits(limits()), Err(QuarryError::LimitsAfterBuild)));
}

#[test]
fn storage_limits_before_build_reach_pipeline() {
    let mut i = compile("SELECT a FROM t", CompilationOptions::default());
    i.add_storage_limits(vec![StorageLimits::leaf().with_max_bytes(1024)])
        .expect("limits");
    let pipeline = i.execute().expect("execute").into_pipeline();
    assert_eq!(
        pipeline.storage_limits(),
        &[StorageLimits::leaf().with_max_bytes(1024)]
    );
}

#[test]
fn extract_query_plan_is_single_use() {
    let mut i = compile("SELECT a FROM t", CompilationOptions::default());
    let plan = i.extract_query_plan().expect("extract");
    assert_eq!(plan.header().fields().len(), 1);
    assert!(matches!(
        i.extract_query_plan(),
        Err(QuarryError::PlannerReused { .. })
    ));
}

#[test]
fn shard_scalars_are_private_to_the_compilation() {
    let ctx = ambient();
    let i = SelectQueryInterpreter::from_sql(
        "SELECT _shard_num, _shard_count",
        &ctx,
        CompilationOptions::default().with_shard(3, 8),
    )
    .expect("compile");

    let num = i.context().scalar(SHARD_NUM_SCALAR).expect("shard num");
    let count = i.context().scalar(SHARD_COUNT_SCALAR).expect("shard count");
    assert_eq!(num.value().expect("value"), LiteralValue::UInt32(3));
    assert_eq!(count.value().expect("value"), LiteralValue::UInt32(8));
    assert_eq!(num.data_type(), &DataType::UInt32);

    assert_eq!(ctx.scalars().count(), 0);
    assert_ne!(ctx.query_id(), i.context().query_id());

    let header = i.query_tree().schema();
    assert_eq!(header.field(0).data_type(), &DataType::UInt32);
    assert_eq!(header.field(1).data_type(), &DataType::UInt32);
}

#[test]
fn pass_skipping_runs_only_the_first_pass() {
    let sql = "SELECT a FROM t WHERE 1 = 1";

    let skipped = compile(sql, CompilationOptions::default().with_ignore_ast_optimizations(true));
    let QueryNode::Select(select) = &skipped.query_tree().root else {
        panic!("expected select");
    };
    assert!(select.filter.is_some());

    let full = compile(sql, CompilationOptions::default());
    let QueryNode::Select(select) = &full.query_tree().root else {
        panic!("expected select");
    };
    assert!(select.filter.is_none());
}

#[test]
fn pass_skipping_with_custom_passes() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let components = CompilerComponents {
        passes: Arc::new(
            QueryTreePassManager::builder()
                .pass(Arc::new(CountingPass(Arc::clone(&first))))
                .pass(Arc::new(CountingPass(Arc::clone(&second))))
                .build(),
        ),
        ..CompilerComponents::default()
    };
    SelectQueryInterpreter::with_components(
        parse_query("SELECT 1").expect("parse"),
        &ambient(),
        CompilationOptions::default().with_ignore_ast_optimizations(true),
        components,
    )
    .expect("compile");
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[test]
fn quota_attached_only_for_complete_stage() {
    let mut complete = compile("SELECT b, COUNT(*) FROM t GROUP BY b", CompilationOptions::default());
    let io = complete.execute().expect("execute");
    let quota = io.quota().expect("quota attached");
    assert_eq!(quota.name(), "test");

    let mut partial = compile(
        "SELECT b, COUNT(*) FROM t GROUP BY b",
        CompilationOptions::default().with_stage(ProcessingStage::WithMergeableState),
    );
    assert!(partial.execute().expect("execute").quota().is_none());

    let mut ignored = compile(
        "SELECT b FROM t",
        CompilationOptions::default().with_ignore_quota(true),
    );
    assert!(ignored.execute().expect("execute").quota().is_none());
}

#[test]
fn repeated_execution_is_opt_in() {
    let mut once = compile("SELECT a FROM t", CompilationOptions::default());
    once.execute().expect("first");
    assert!(matches!(once.execute(), Err(QuarryError::PlannerReused { .. })));

    let mut repeated = compile(
        "SELECT a FROM t",
        CompilationOptions::default().with_allow_repeated_execution(true),
    );
    let first = repeated.execute().expect("first");
    let second = repeated.execute().expect("second");
    assert_eq!(first.header(), second.header());
}

#[test]
fn parenthesized_query_is_unwrapped() {
    let mut i = compile("((SELECT a, b FROM t))", CompilationOptions::default());
    assert_eq!(i.schema().expect("schema").fields().len(), 2);
}

#[test]
fn non_select_statement_is_rejected() {
    for sql in ["INSERT INTO t VALUES (1, 'x', 1.0)", "VALUES (1)"] {
        let err = SelectQueryInterpreter::from_sql(sql, &ambient(), CompilationOptions::default())
            .unwrap_err();
        assert!(
            matches!(err, QuarryError::UnsupportedQueryShape(_)),
            "sql={sql} err={err}"
        );
    }
}

#[test]
fn resolved_tree_entry_skips_passes_and_derives_display_form() {
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ambient();
    let tree = SqlQueryTreeBuilder
        .build(
            &CanonicalQuery::parse("SELECT a AS x FROM t WHERE a > 1").expect("parse"),
            &ctx,
        )
        .expect("tree");
    let expected = tree.schema();
    let components = CompilerComponents {
        passes: Arc::new(
            QueryTreePassManager::builder()
                .pass(Arc::new(CountingPass(Arc::clone(&calls))))
                .build(),
        ),
        ..CompilerComponents::default()
    };

    let mut i = SelectQueryInterpreter::from_query_tree_with_components(
        tree,
        &ctx,
        CompilationOptions::default(),
        components,
    )
    .expect("compile");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(i.schema().expect("schema"), expected);

    let display = i.query().to_string();
    let reparsed = CanonicalQuery::parse(&display).expect("display form parses");
    let rebuilt = SqlQueryTreeBuilder.build(&reparsed, &ctx).expect("rebuild");
    assert_eq!(rebuilt.schema(), expected);
}

#[test]
fn sample_block_for_resolved_tree_matches_full_schema() {
    let lowered = Arc::new(AtomicUsize::new(0));
    let ctx = ambient();
    let tree = || {
        SqlQueryTreeBuilder
            .build(
                &CanonicalQuery::parse("SELECT b, SUM(a) AS s FROM t GROUP BY b").expect("parse"),
                &ctx,
            )
            .expect("tree")
    };

    let header = SelectQueryInterpreter::sample_block_for_tree_with(
        tree(),
        &ctx,
        CompilationOptions::default(),
        counting_components(&lowered),
    )
    .expect("sample block");
    let mut full = SelectQueryInterpreter::from_query_tree(tree(), &ctx, CompilationOptions::default())
        .expect("compile");
    assert_eq!(header, full.schema().expect("schema"));
    assert_eq!(
        SelectQueryInterpreter::sample_block_for_tree(tree(), &ctx, CompilationOptions::default())
            .expect("sample block"),
        header
    );
    assert_eq!(lowered.load(Ordering::SeqCst), 0);
}

#[test]
fn resolved_tree_with_shard_scalars_keeps_types() {
    let options = CompilationOptions::default().with_shard(3, 8);
    let mut i = compile("SELECT _shard_num AS s, a FROM t", options.clone());
    let expected = i.schema().expect("schema");
    assert_eq!(expected.field(0).data_type(), &DataType::UInt32);

    let tree = i.query_tree().clone();
    let mut resolved = SelectQueryInterpreter::from_query_tree(tree, &ambient(), options)
        .expect("compile");
    assert_eq!(resolved.schema().expect("schema"), expected);

    let reparsed = CanonicalQuery::parse(&resolved.query().to_string()).expect("display parses");
    let rebuilt = SqlQueryTreeBuilder.build(&reparsed, &ambient()).expect("rebuild");
    assert_eq!(rebuilt.schema(), expected);
}

#[test]
fn union_at_intermediate_stage_needs_matching_branches() {
    let mut ok = compile(
        "SELECT b, COUNT(*) FROM t GROUP BY b UNION ALL SELECT b, COUNT(*) FROM t GROUP BY b",
        CompilationOptions::default().with_stage(ProcessingStage::WithMergeableState),
    );
    ok.schema().expect("schema");

    let mut mismatched = compile(
        "SELECT b, COUNT(*) FROM t GROUP BY b UNION ALL SELECT b, c FROM t",
        CompilationOptions::default().with_stage(ProcessingStage::WithMergeableState),
    );
    assert!(matches!(mismatched.schema(), Err(QuarryError::Planning(_))));
}
