use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use quarry_client::Engine;
use quarry_common::{QuarryError, Settings};
use quarry_planner::{explain_physical, CompilationOptions, LogicalPlan, ProcessingStage};
use quarry_storage::{Catalog, TableDef};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("quarry_planner=debug,quarry_client=debug")
        .try_init();
}

fn engine() -> Engine {
    init_tracing();
    let engine = Engine::new(Settings::default()).expect("engine");
    engine
        .register_table(
            "sales",
            TableDef::new(
                "ignored",
                "parquet",
                Schema::new(vec![
                    Field::new("region", DataType::Utf8, false),
                    Field::new("amount", DataType::Float64, true),
                    Field::new("qty", DataType::Int64, true),
                ]),
            ),
        )
        .expect("register");
    engine
}

#[test]
fn register_table_overrides_name() {
    let engine = engine();
    assert_eq!(engine.list_tables().expect("tables"), vec!["sales".to_string()]);
    assert_eq!(engine.table_schema("sales").expect("schema").fields().len(), 3);
    assert!(matches!(
        engine.table_schema("ignored"),
        Err(QuarryError::Planning(_))
    ));
}

#[test]
fn register_catalog_copies_every_table() {
    let engine = Engine::new(Settings::default()).expect("engine");
    let mut catalog = Catalog::new();
    catalog.register_table(TableDef::new(
        "t",
        "parquet",
        Schema::new(vec![Field::new("id", DataType::Int64, false)]),
    ));
    catalog.register_table(TableDef::new(
        "u",
        "csv",
        Schema::new(vec![Field::new("name", DataType::Utf8, true)]),
    ));
    engine.register_catalog(&catalog).expect("register");
    assert_eq!(
        engine.list_tables().expect("tables"),
        vec!["t".to_string(), "u".to_string()]
    );
    let header = engine
        .sample_block("SELECT id FROM t", CompilationOptions::default())
        .expect("sample block");
    assert_eq!(header.field(0).data_type(), &DataType::Int64);
}

#[test]
fn sample_block_matches_compiled_schema() {
    let engine = engine();
    let sql = "SELECT region, SUM(amount) AS total, COUNT(*) AS n FROM sales GROUP BY region";
    let header = engine
        .sample_block(sql, CompilationOptions::default())
        .expect("sample block");
    let mut interpreter = engine
        .compile(sql, CompilationOptions::default())
        .expect("compile");
    assert_eq!(interpreter.schema().expect("schema"), header);
    let names = header
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["region", "total", "n"]);
}

#[test]
fn unknown_table_is_planning_error() {
    let engine = engine();
    let err = engine
        .compile("SELECT x FROM missing", CompilationOptions::default())
        .unwrap_err();
    assert!(matches!(err, QuarryError::Planning(_)), "err={err}");
}

#[test]
fn analyze_only_plan_reads_no_tables() {
    let engine = engine();
    let mut interpreter = engine
        .compile("SELECT region FROM sales WHERE qty > 3", CompilationOptions::analyze())
        .expect("compile");
    let root = interpreter.extract_query_plan().expect("plan").into_root();

    fn has_table_scan(plan: &LogicalPlan) -> bool {
        matches!(plan, LogicalPlan::TableScan { .. }) || plan.children().into_iter().any(has_table_scan)
    }
    assert!(!has_table_scan(&root));
}

#[test]
fn lowering_pushes_filters_and_splits_aggregates() {
    let engine = engine();
    let mut interpreter = engine
        .compile(
            "SELECT region, SUM(amount) FROM sales WHERE qty > 3 GROUP BY region",
            CompilationOptions::default(),
        )
        .expect("compile");
    let io = interpreter.execute().expect("execute");
    let text = explain_physical(io.pipeline().root());
    assert!(text.starts_with("CoalesceBatches target_batch_rows=8192\n"), "{text}");
    assert!(text.contains("FinalHashAggregate"), "{text}");
    assert!(text.contains("ShuffleRead hash(keys=[\"region\"], partitions=64)"), "{text}");
    assert!(text.contains("PartialHashAggregate"), "{text}");
    assert!(text.contains("pushed_filters=1"), "{text}");
    assert!(!text.contains("Filter ("), "{text}");
}

#[test]
fn disabled_optimizations_keep_filter_step() {
    init_tracing();
    let settings = Settings {
        query_plan_enable_optimizations: false,
        ..Settings::default()
    };
    let engine = Engine::new(settings).expect("engine");
    engine
        .register_table(
            "t",
            TableDef::new("t", "parquet", Schema::new(vec![Field::new("a", DataType::Int64, false)])),
        )
        .expect("register");
    let mut interpreter = engine
        .compile("SELECT a FROM t WHERE a > 1", CompilationOptions::default())
        .expect("compile");
    let io = interpreter.execute().expect("execute");
    let text = explain_physical(io.pipeline().root());
    assert!(text.contains("Filter"), "{text}");
    assert!(text.contains("pushed_filters=0"), "{text}");
}

#[test]
fn session_quota_limits_follow_settings() {
    let settings = Settings {
        max_result_rows: Some(10),
        ..Settings::default()
    };
    let engine = Engine::new(settings).expect("engine");
    let quota = engine.quota();
    assert_eq!(quota.limits().max_result_rows, Some(10));

    let mut interpreter = engine
        .compile("SELECT 1", CompilationOptions::default())
        .expect("compile");
    let io = interpreter.execute().expect("execute");
    let attached = io.quota().expect("quota");
    assert!(Arc::ptr_eq(attached, &quota));
    attached.consume(10, 0).expect("within limits");
    assert!(matches!(attached.consume(1, 0), Err(QuarryError::Execution(_))));
}

#[test]
fn fetch_columns_stage_has_no_quota() {
    let engine = engine();
    let mut interpreter = engine
        .compile(
            "SELECT region FROM sales",
            CompilationOptions::default().with_stage(ProcessingStage::FetchColumns),
        )
        .expect("compile");
    assert!(interpreter.execute().expect("execute").quota().is_none());
}

#[test]
fn invalid_settings_are_rejected() {
    let settings = Settings {
        max_threads: 0,
        ..Settings::default()
    };
    assert!(matches!(
        Engine::new(settings),
        Err(QuarryError::InvalidConfig(_))
    ));
}
