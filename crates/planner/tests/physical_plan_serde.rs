use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use quarry_planner::{
    create_physical_plan, explain_physical, AggExpr, AggregateMode, BuildQueryPipelineSettings,
    Expr, LogicalPlan, PhysicalPlan,
};

#[test]
fn physical_plan_is_serializable() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("region", DataType::Utf8, true),
    ]));
    let agg_schema = Arc::new(Schema::new(vec![
        Field::new("region", DataType::Utf8, true),
        Field::new("count(id)", DataType::Int64, false),
    ]));
    let logical = LogicalPlan::Limit {
        skip: 0,
        fetch: Some(10),
        input: Box::new(LogicalPlan::Aggregate {
            group_exprs: vec![(
                Expr::ColumnRef {
                    name: "region".to_string(),
                    index: 1,
                },
                "region".to_string(),
            )],
            aggr_exprs: vec![(
                AggExpr::Count(Expr::ColumnRef {
                    name: "id".to_string(),
                    index: 0,
                }),
                "count(id)".to_string(),
            )],
            mode: AggregateMode::Final,
            schema: agg_schema,
            input: Box::new(LogicalPlan::TableScan {
                table: "t".to_string(),
                projection: Some(vec!["id".to_string(), "region".to_string()]),
                filters: vec![],
                schema,
            }),
        }),
    };

    let phys = create_physical_plan(&logical, &BuildQueryPipelineSettings::default()).unwrap();

    let s = serde_json::to_string(&phys).unwrap();
    let back: PhysicalPlan = serde_json::from_str(&s).unwrap();
    assert_eq!(explain_physical(&back), explain_physical(&phys));
}
