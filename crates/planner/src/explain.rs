use crate::logical_plan::{AggExpr, AggregateMode, Expr, LiteralValue, LogicalPlan, SortExpr};
use crate::physical_plan::{ExchangeExec, PartitioningSpec, PhysicalPlan};

/// Render logical plan as human-readable multiline text.
pub fn explain_logical(plan: &LogicalPlan) -> String {
    let mut s = String::new();
    fmt_plan(plan, 0, &mut s);
    s
}

/// Render physical operator tree as human-readable multiline text.
pub fn explain_physical(plan: &PhysicalPlan) -> String {
    let mut s = String::new();
    fmt_physical(plan, 0, &mut s);
    s
}

fn fmt_plan(plan: &LogicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        LogicalPlan::OneRow => out.push_str(&format!("{pad}OneRow\n")),
        LogicalPlan::EmptySource { table, schema } => {
            out.push_str(&format!(
                "{pad}EmptySource table={table} columns={}\n",
                schema.fields().len()
            ));
        }
        LogicalPlan::TableScan {
            table,
            projection,
            filters,
            ..
        } => {
            out.push_str(&format!("{pad}TableScan table={table}\n"));
            out.push_str(&format!("{pad}  projection={projection:?}\n"));
            out.push_str(&format!("{pad}  pushed_filters={}\n", filters.len()));
            for f in filters {
                out.push_str(&format!("{pad}    {}\n", fmt_expr(f)));
            }
        }
        LogicalPlan::Filter { predicate, input } => {
            out.push_str(&format!("{pad}Filter {}\n", fmt_expr(predicate)));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Projection { exprs, input, .. } => {
            out.push_str(&format!("{pad}Projection\n"));
            for (e, name) in exprs {
                out.push_str(&format!("{pad}  {name} := {}\n", fmt_expr(e)));
            }
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            mode,
            input,
            ..
        } => {
            let mode = match mode {
                AggregateMode::Final => "final",
                AggregateMode::Partial => "partial",
            };
            out.push_str(&format!("{pad}Aggregate mode={mode}\n"));
            fmt_aggregate(group_exprs, aggr_exprs, &pad, out);
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Distinct { input } => {
            out.push_str(&format!("{pad}Distinct\n"));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Sort { exprs, input } => {
            out.push_str(&format!("{pad}Sort {}\n", fmt_sort(exprs)));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Limit { skip, fetch, input } => {
            out.push_str(&format!("{pad}Limit skip={skip} fetch={fetch:?}\n"));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Union { inputs, .. } => {
            out.push_str(&format!("{pad}Union inputs={}\n", inputs.len()));
            for i in inputs {
                fmt_plan(i, indent + 1, out);
            }
        }
    }
}

fn fmt_physical(plan: &PhysicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        PhysicalPlan::Empty(x) => {
            out.push_str(&format!("{pad}Empty table={}\n", x.table));
        }
        PhysicalPlan::TableScan(x) => {
            out.push_str(&format!(
                "{pad}TableScan table={} projection={:?} pushed_filters={}\n",
                x.table,
                x.projection,
                x.filters.len()
            ));
        }
        PhysicalPlan::Filter(x) => {
            out.push_str(&format!("{pad}Filter {}\n", fmt_expr(&x.predicate)));
        }
        PhysicalPlan::CoalesceBatches(x) => {
            out.push_str(&format!(
                "{pad}CoalesceBatches target_batch_rows={}\n",
                x.target_batch_rows
            ));
        }
        PhysicalPlan::PartialHashAggregate(x) => {
            out.push_str(&format!("{pad}PartialHashAggregate\n"));
            fmt_aggregate(&x.group_exprs, &x.aggr_exprs, &pad, out);
        }
        PhysicalPlan::FinalHashAggregate(x) => {
            out.push_str(&format!("{pad}FinalHashAggregate\n"));
            fmt_aggregate(&x.group_exprs, &x.aggr_exprs, &pad, out);
        }
        PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(x)) => {
            out.push_str(&format!(
                "{pad}ShuffleWrite {}\n",
                fmt_partitioning(&x.partitioning)
            ));
        }
        PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(x)) => {
            out.push_str(&format!(
                "{pad}ShuffleRead {}\n",
                fmt_partitioning(&x.partitioning)
            ));
        }
        PhysicalPlan::Sort(x) => out.push_str(&format!("{pad}Sort {}\n", fmt_sort(&x.exprs))),
        PhysicalPlan::Limit(x) => {
            out.push_str(&format!("{pad}Limit skip={} fetch={:?}\n", x.skip, x.fetch));
        }
        PhysicalPlan::Project(x) => {
            out.push_str(&format!("{pad}Project\n"));
            for (e, name) in &x.exprs {
                out.push_str(&format!("{pad}  {name} := {}\n", fmt_expr(e)));
            }
        }
        other => out.push_str(&format!("{pad}{}\n", other.name())),
    }
    for child in plan.children() {
        fmt_physical(child, indent + 1, out);
    }
}

fn fmt_aggregate(
    group_exprs: &[(Expr, String)],
    aggr_exprs: &[(AggExpr, String)],
    pad: &str,
    out: &mut String,
) {
    out.push_str(&format!("{pad}  group_by={}\n", group_exprs.len()));
    for (g, name) in group_exprs {
        out.push_str(&format!("{pad}    {name} := {}\n", fmt_expr(g)));
    }
    out.push_str(&format!("{pad}  aggs={}\n", aggr_exprs.len()));
    for (a, name) in aggr_exprs {
        out.push_str(&format!(
            "{pad}    {name} := {}({})\n",
            a.function_name(),
            fmt_expr(a.arg())
        ));
    }
}

fn fmt_partitioning(p: &PartitioningSpec) -> String {
    match p {
        PartitioningSpec::HashKeys { keys, partitions } => {
            format!("hash(keys={keys:?}, partitions={partitions})")
        }
        PartitioningSpec::Single => "single".to_string(),
    }
}

fn fmt_sort(exprs: &[SortExpr]) -> String {
    exprs
        .iter()
        .map(|s| {
            format!(
                "{} {}{}",
                fmt_expr(&s.expr),
                if s.asc { "asc" } else { "desc" },
                if s.nulls_first { " nulls_first" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_expr(e: &Expr) -> String {
    match e {
        Expr::ColumnRef { name, index } => format!("{name}#{index}"),
        Expr::Literal(LiteralValue::Utf8(s)) => format!("'{s}'"),
        Expr::Literal(v) => format!("{v:?}"),
        Expr::Cast { expr, to_type } => format!("cast({} as {to_type:?})", fmt_expr(expr)),
        Expr::Not(x) => format!("NOT ({})", fmt_expr(x)),
        Expr::And(a, b) => format!("({}) AND ({})", fmt_expr(a), fmt_expr(b)),
        Expr::Or(a, b) => format!("({}) OR ({})", fmt_expr(a), fmt_expr(b)),
        Expr::BinaryOp { left, op, right } => {
            format!("({}) {} ({})", fmt_expr(left), op.sql(), fmt_expr(right))
        }
        Expr::CaseWhen {
            branches,
            else_expr,
        } => {
            let mut s = "CASE".to_string();
            for (c, v) in branches {
                s.push_str(&format!(" WHEN {} THEN {}", fmt_expr(c), fmt_expr(v)));
            }
            if let Some(e) = else_expr {
                s.push_str(&format!(" ELSE {}", fmt_expr(e)));
            }
            s.push_str(" END");
            s
        }
    }
}
