//! Query tree passes.
//!
//! Each pass rewrites the tree in place and may rely on the invariants left by
//! the passes before it in the default order:
//! 1. [`ValidateQueryTree`]
//! 2. [`FoldConstants`]
//! 3. [`EliminateTrivialFilters`]
//! 4. [`PruneUnusedColumns`]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arrow_schema::{DataType, Schema, SchemaRef};
use quarry_common::{QuarryError, Result};

use crate::context::ExecutionContext;
use crate::logical_plan::{BinaryOp, Expr, LiteralValue};
use crate::query_tree::{QueryTree, SelectNode, SourceNode};

/// One rewrite over a resolved query tree.
pub trait QueryTreePass: Send + Sync {
    /// Stable pass name used in logs and errors.
    fn name(&self) -> &str;

    /// Rewrite `tree` in place.
    fn run(&self, tree: &mut QueryTree, context: &ExecutionContext) -> Result<()>;
}

fn precondition(pass: &str, reason: impl Into<String>) -> QuarryError {
    QuarryError::PassPrecondition {
        pass: pass.to_string(),
        reason: reason.into(),
    }
}

// -----------------------------
// validate_query_tree
// -----------------------------

/// Structural check run before any rewrite.
///
/// Every column reference must be in range of its scope input, every output
/// column must be typed like its expression, and union branches must agree
/// with the union header.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidateQueryTree;

impl ValidateQueryTree {
    const NAME: &'static str = "validate_query_tree";

    fn check_select(select: &SelectNode) -> Result<()> {
        let fail = |reason: String| precondition(Self::NAME, reason);
        let source = select.source.schema();

        if let Some(f) = &select.filter {
            f.data_type(&source).map_err(|e| fail(format!("filter: {e}")))?;
        }
        if let Some(agg) = &select.aggregation {
            let width = agg.group_exprs.len() + agg.aggr_exprs.len();
            if agg.schema.fields().len() != width {
                return Err(fail(format!(
                    "aggregation header has {} columns, expected {width}",
                    agg.schema.fields().len()
                )));
            }
            for (e, _) in &agg.group_exprs {
                e.data_type(&source)
                    .map_err(|err| fail(format!("group key: {err}")))?;
            }
            for (a, _) in &agg.aggr_exprs {
                a.arg()
                    .data_type(&source)
                    .map_err(|err| fail(format!("aggregate {}: {err}", a.function_name())))?;
            }
        }

        let input = select.projection_input();
        if select.projection.len() != select.schema.fields().len() {
            return Err(fail(format!(
                "projection has {} expressions but header has {} columns",
                select.projection.len(),
                select.schema.fields().len()
            )));
        }
        for ((e, name), field) in select.projection.iter().zip(select.schema.fields()) {
            let dt = e
                .data_type(&input)
                .map_err(|err| fail(format!("column {name}: {err}")))?;
            if &dt != field.data_type() {
                return Err(fail(format!(
                    "column {name} is typed {:?} but its expression yields {dt:?}",
                    field.data_type()
                )));
            }
        }
        for s in &select.order_by {
            s.expr
                .data_type(&select.schema)
                .map_err(|err| fail(format!("ORDER BY: {err}")))?;
        }
        Ok(())
    }
}

impl QueryTreePass for ValidateQueryTree {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, tree: &mut QueryTree, _context: &ExecutionContext) -> Result<()> {
        tree.for_each_select_mut(&mut |select| Self::check_select(select))?;
        tree.root.for_each_union(&mut |union| {
            for (i, branch) in union.branches.iter().enumerate() {
                let branch_types = branch.schema.fields().iter().map(|f| f.data_type());
                let union_types = union.schema.fields().iter().map(|f| f.data_type());
                if branch.schema.fields().len() != union.schema.fields().len()
                    || !branch_types.eq(union_types)
                {
                    return Err(precondition(
                        Self::NAME,
                        format!("union branch {i} does not match the union header"),
                    ));
                }
            }
            Ok(())
        })
    }
}

// -----------------------------
// fold_constants
// -----------------------------

/// Evaluates literal-only arithmetic, comparisons, casts and boolean logic.
#[derive(Debug, Default, Clone, Copy)]
pub struct FoldConstants;

impl QueryTreePass for FoldConstants {
    fn name(&self) -> &str {
        "fold_constants"
    }

    fn run(&self, tree: &mut QueryTree, _context: &ExecutionContext) -> Result<()> {
        tree.for_each_select_mut(&mut |select| {
            if let Some(f) = select.filter.take() {
                select.filter = Some(fold_constants_expr(f));
            }
            if let Some(agg) = &mut select.aggregation {
                for (e, _) in agg.group_exprs.iter_mut() {
                    *e = fold_constants_expr(e.clone());
                }
                for (a, _) in agg.aggr_exprs.iter_mut() {
                    let arg = a.arg_mut();
                    *arg = fold_constants_expr(arg.clone());
                }
            }
            for (e, _) in select.projection.iter_mut() {
                *e = fold_constants_expr(e.clone());
            }
            for s in select.order_by.iter_mut() {
                s.expr = fold_constants_expr(s.expr.clone());
            }
            Ok(())
        })
    }
}

fn fold_constants_expr(e: Expr) -> Expr {
    match e {
        Expr::Not(inner) => {
            let inner = fold_constants_expr(*inner);
            match inner {
                Expr::Literal(LiteralValue::Boolean(b)) => Expr::Literal(LiteralValue::Boolean(!b)),
                _ => Expr::Not(Box::new(inner)),
            }
        }
        Expr::And(a, b) => {
            let a = fold_constants_expr(*a);
            let b = fold_constants_expr(*b);
            match (&a, &b) {
                (Expr::Literal(LiteralValue::Boolean(false)), _)
                | (_, Expr::Literal(LiteralValue::Boolean(false))) => {
                    Expr::Literal(LiteralValue::Boolean(false))
                }
                (Expr::Literal(LiteralValue::Boolean(true)), _) => b,
                (_, Expr::Literal(LiteralValue::Boolean(true))) => a,
                _ => Expr::And(Box::new(a), Box::new(b)),
            }
        }
        Expr::Or(a, b) => {
            let a = fold_constants_expr(*a);
            let b = fold_constants_expr(*b);
            match (&a, &b) {
                (Expr::Literal(LiteralValue::Boolean(true)), _)
                | (_, Expr::Literal(LiteralValue::Boolean(true))) => {
                    Expr::Literal(LiteralValue::Boolean(true))
                }
                (Expr::Literal(LiteralValue::Boolean(false)), _) => b,
                (_, Expr::Literal(LiteralValue::Boolean(false))) => a,
                _ => Expr::Or(Box::new(a), Box::new(b)),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let l = fold_constants_expr(*left);
            let r = fold_constants_expr(*right);
            if let (Expr::Literal(lv), Expr::Literal(rv)) = (&l, &r) {
                if let Some(out) = eval_binary(lv.clone(), op, rv.clone()) {
                    return Expr::Literal(out);
                }
            }
            Expr::BinaryOp {
                left: Box::new(l),
                op,
                right: Box::new(r),
            }
        }
        Expr::Cast { expr, to_type } => {
            let inner = fold_constants_expr(*expr);
            if let Expr::Literal(v) = &inner {
                if let Some(out) = cast_literal(v, &to_type) {
                    return Expr::Literal(out);
                }
            }
            Expr::Cast {
                expr: Box::new(inner),
                to_type,
            }
        }
        Expr::CaseWhen {
            branches,
            else_expr,
        } => Expr::CaseWhen {
            branches: branches
                .into_iter()
                .map(|(c, v)| (fold_constants_expr(c), fold_constants_expr(v)))
                .collect(),
            else_expr: else_expr.map(|e| Box::new(fold_constants_expr(*e))),
        },
        other => other,
    }
}

/// Literal cast whose result keeps the target type; `None` leaves the cast in place.
fn cast_literal(v: &LiteralValue, to: &DataType) -> Option<LiteralValue> {
    use LiteralValue::*;
    match (v, to) {
        (Int64(i), DataType::Float64) => Some(Float64(*i as f64)),
        (UInt32(u), DataType::Int64) => Some(Int64(i64::from(*u))),
        (UInt32(u), DataType::Float64) => Some(Float64(f64::from(*u))),
        (Int64(i), DataType::UInt32) => u32::try_from(*i).ok().map(UInt32),
        (v, to) if &v.data_type() == to => Some(v.clone()),
        _ => None,
    }
}

fn eval_binary(l: LiteralValue, op: BinaryOp, r: LiteralValue) -> Option<LiteralValue> {
    use LiteralValue::*;
    match (l, op, r) {
        (Boolean(a), BinaryOp::Eq, Boolean(b)) => Some(Boolean(a == b)),
        (Boolean(a), BinaryOp::NotEq, Boolean(b)) => Some(Boolean(a != b)),

        (Int64(a), BinaryOp::Plus, Int64(b)) => a.checked_add(b).map(Int64),
        (Int64(a), BinaryOp::Minus, Int64(b)) => a.checked_sub(b).map(Int64),
        (Int64(a), BinaryOp::Multiply, Int64(b)) => a.checked_mul(b).map(Int64),
        (Int64(a), BinaryOp::Eq, Int64(b)) => Some(Boolean(a == b)),
        (Int64(a), BinaryOp::NotEq, Int64(b)) => Some(Boolean(a != b)),
        (Int64(a), BinaryOp::Lt, Int64(b)) => Some(Boolean(a < b)),
        (Int64(a), BinaryOp::LtEq, Int64(b)) => Some(Boolean(a <= b)),
        (Int64(a), BinaryOp::Gt, Int64(b)) => Some(Boolean(a > b)),
        (Int64(a), BinaryOp::GtEq, Int64(b)) => Some(Boolean(a >= b)),

        (UInt32(a), BinaryOp::Eq, UInt32(b)) => Some(Boolean(a == b)),
        (UInt32(a), BinaryOp::NotEq, UInt32(b)) => Some(Boolean(a != b)),

        (Float64(a), BinaryOp::Plus, Float64(b)) => finite(a + b),
        (Float64(a), BinaryOp::Minus, Float64(b)) => finite(a - b),
        (Float64(a), BinaryOp::Multiply, Float64(b)) => finite(a * b),
        (Float64(a), BinaryOp::Divide, Float64(b)) if b != 0.0 => finite(a / b),
        (Float64(a), BinaryOp::Eq, Float64(b)) => Some(Boolean(a == b)),
        (Float64(a), BinaryOp::NotEq, Float64(b)) => Some(Boolean(a != b)),
        (Float64(a), BinaryOp::Lt, Float64(b)) => Some(Boolean(a < b)),
        (Float64(a), BinaryOp::LtEq, Float64(b)) => Some(Boolean(a <= b)),
        (Float64(a), BinaryOp::Gt, Float64(b)) => Some(Boolean(a > b)),
        (Float64(a), BinaryOp::GtEq, Float64(b)) => Some(Boolean(a >= b)),

        (Utf8(a), BinaryOp::Eq, Utf8(b)) => Some(Boolean(a == b)),
        (Utf8(a), BinaryOp::NotEq, Utf8(b)) => Some(Boolean(a != b)),
        _ => None,
    }
}

// Infinite or NaN results stay unfolded.
fn finite(v: f64) -> Option<LiteralValue> {
    v.is_finite().then_some(LiteralValue::Float64(v))
}

// -----------------------------
// eliminate_trivial_filters
// -----------------------------

/// Drops `WHERE TRUE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EliminateTrivialFilters;

impl EliminateTrivialFilters {
    const NAME: &'static str = "eliminate_trivial_filters";
}

impl QueryTreePass for EliminateTrivialFilters {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, tree: &mut QueryTree, _context: &ExecutionContext) -> Result<()> {
        tree.for_each_select_mut(&mut |select| {
            let Some(filter) = &select.filter else {
                return Ok(());
            };
            let dt = filter.data_type(&select.source.schema())?;
            if !matches!(dt, DataType::Boolean | DataType::Null) {
                return Err(precondition(
                    Self::NAME,
                    format!("filter must be boolean, got {dt:?}"),
                ));
            }
            if matches!(filter, Expr::Literal(LiteralValue::Boolean(true))) {
                select.filter = None;
            }
            Ok(())
        })
    }
}

// -----------------------------
// prune_unused_columns
// -----------------------------

/// Narrows table sources to the columns the select reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneUnusedColumns;

impl QueryTreePass for PruneUnusedColumns {
    fn name(&self) -> &str {
        "prune_unused_columns"
    }

    fn run(&self, tree: &mut QueryTree, _context: &ExecutionContext) -> Result<()> {
        tree.for_each_select_mut(&mut prune_select)
    }
}

fn prune_select(select: &mut SelectNode) -> Result<()> {
    let SourceNode::Table { schema, .. } = &select.source else {
        return Ok(());
    };
    let width = schema.fields().len();

    let mut used = BTreeSet::new();
    if let Some(f) = &select.filter {
        f.collect_column_indices(&mut used);
    }
    match &select.aggregation {
        Some(agg) => {
            for (e, _) in &agg.group_exprs {
                e.collect_column_indices(&mut used);
            }
            for (a, _) in &agg.aggr_exprs {
                a.arg().collect_column_indices(&mut used);
            }
        }
        None => {
            for (e, _) in &select.projection {
                e.collect_column_indices(&mut used);
            }
        }
    }
    // Keep one column so the scan still reports row counts.
    if used.is_empty() && width > 0 {
        used.insert(0);
    }
    if used.len() == width {
        return Ok(());
    }

    let mapping = used
        .iter()
        .enumerate()
        .map(|(new, old)| (*old, new))
        .collect::<HashMap<_, _>>();
    let narrowed: SchemaRef = Arc::new(Schema::new(
        used.iter()
            .map(|i| schema.field(*i).clone())
            .collect::<Vec<_>>(),
    ));

    if let Some(f) = &mut select.filter {
        f.remap_columns(&mapping)?;
    }
    match &mut select.aggregation {
        Some(agg) => {
            for (e, _) in agg.group_exprs.iter_mut() {
                e.remap_columns(&mapping)?;
            }
            for (a, _) in agg.aggr_exprs.iter_mut() {
                a.arg_mut().remap_columns(&mapping)?;
            }
        }
        None => {
            for (e, _) in select.projection.iter_mut() {
                e.remap_columns(&mapping)?;
            }
        }
    }
    if let SourceNode::Table { schema, .. } = &mut select.source {
        *schema = narrowed;
    }
    Ok(())
}

/// The default passes in their fixed order.
pub fn default_passes() -> Vec<Arc<dyn QueryTreePass>> {
    vec![
        Arc::new(ValidateQueryTree),
        Arc::new(FoldConstants),
        Arc::new(EliminateTrivialFilters),
        Arc::new(PruneUnusedColumns),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema};
    use quarry_common::QuarryError;

    use super::*;
    use crate::logical_plan::one_row_schema;
    use crate::query_tree::QueryNode;

    fn table_select(filter: Option<Expr>, projection: Vec<(Expr, String)>) -> QueryTree {
        let source_schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Utf8, true),
            Field::new("c", DataType::Float64, true),
        ]));
        let schema = crate::query_tree::projection_schema(&projection, &source_schema)
            .expect("schema");
        QueryTree::new(QueryNode::Select(SelectNode {
            source: SourceNode::Table {
                name: "t".to_string(),
                alias: None,
                schema: source_schema,
            },
            filter,
            aggregation: None,
            projection,
            distinct: false,
            order_by: vec![],
            limit: None,
            offset: 0,
            schema,
        }))
    }

    fn col(name: &str, index: usize) -> Expr {
        Expr::ColumnRef {
            name: name.to_string(),
            index,
        }
    }

    fn lit(i: i64) -> Expr {
        Expr::Literal(LiteralValue::Int64(i))
    }

    fn select(tree: &QueryTree) -> &SelectNode {
        match &tree.root {
            QueryNode::Select(s) => s,
            QueryNode::Union(_) => panic!("expected select"),
        }
    }

    #[test]
    fn fold_then_eliminate_drops_tautology() {
        let ctx = ExecutionContext::empty();
        let filter = Expr::BinaryOp {
            left: Box::new(lit(1)),
            op: BinaryOp::Eq,
            right: Box::new(lit(1)),
        };
        let mut tree = table_select(Some(filter), vec![(col("a", 0), "a".to_string())]);
        FoldConstants.run(&mut tree, &ctx).expect("fold");
        assert_eq!(
            select(&tree).filter,
            Some(Expr::Literal(LiteralValue::Boolean(true)))
        );
        EliminateTrivialFilters.run(&mut tree, &ctx).expect("eliminate");
        assert_eq!(select(&tree).filter, None);
    }

    #[test]
    fn fold_leaves_overflow_unfolded() {
        let e = Expr::BinaryOp {
            left: Box::new(lit(i64::MAX)),
            op: BinaryOp::Plus,
            right: Box::new(lit(1)),
        };
        assert!(matches!(fold_constants_expr(e), Expr::BinaryOp { .. }));
    }

    #[test]
    fn fold_leaves_float_overflow_unfolded() {
        let big = || Box::new(Expr::Literal(LiteralValue::Float64(f64::MAX)));
        let e = Expr::BinaryOp {
            left: big(),
            op: BinaryOp::Multiply,
            right: big(),
        };
        assert!(matches!(fold_constants_expr(e), Expr::BinaryOp { .. }));

        let e = Expr::BinaryOp {
            left: Box::new(Expr::Literal(LiteralValue::Float64(1.5))),
            op: BinaryOp::Multiply,
            right: Box::new(Expr::Literal(LiteralValue::Float64(2.0))),
        };
        assert_eq!(fold_constants_expr(e), Expr::Literal(LiteralValue::Float64(3.0)));
    }

    #[test]
    fn non_boolean_filter_fails_precondition() {
        let ctx = ExecutionContext::empty();
        let mut tree = table_select(Some(col("a", 0)), vec![(col("a", 0), "a".to_string())]);
        match EliminateTrivialFilters.run(&mut tree, &ctx) {
            Err(QuarryError::PassPrecondition { pass, .. }) => {
                assert_eq!(pass, "eliminate_trivial_filters")
            }
            other => panic!("expected PassPrecondition, got {other:?}"),
        }
    }

    #[test]
    fn prune_narrows_table_and_remaps() {
        let ctx = ExecutionContext::empty();
        let filter = Expr::BinaryOp {
            left: Box::new(col("c", 2)),
            op: BinaryOp::Gt,
            right: Box::new(Expr::Literal(LiteralValue::Float64(0.5))),
        };
        let mut tree = table_select(Some(filter), vec![(col("c", 2), "c".to_string())]);
        PruneUnusedColumns.run(&mut tree, &ctx).expect("prune");
        let s = select(&tree);
        assert_eq!(s.source.schema().fields().len(), 1);
        assert_eq!(s.projection[0].0, col("c", 0));
        ValidateQueryTree.run(&mut tree, &ctx).expect("still valid");
    }

    #[test]
    fn validate_rejects_out_of_range_reference() {
        let ctx = ExecutionContext::empty();
        let mut tree = table_select(None, vec![(col("a", 0), "a".to_string())]);
        if let QueryNode::Select(s) = &mut tree.root {
            s.projection[0].0 = col("zz", 9);
        }
        assert!(matches!(
            ValidateQueryTree.run(&mut tree, &ctx),
            Err(QuarryError::PassPrecondition { .. })
        ));
    }

    #[test]
    fn one_row_source_is_never_pruned() {
        let ctx = ExecutionContext::empty();
        let projection = vec![(lit(1), "1".to_string())];
        let schema = crate::query_tree::projection_schema(&projection, &one_row_schema())
            .expect("schema");
        let mut tree = QueryTree::new(QueryNode::Select(SelectNode {
            source: SourceNode::OneRow,
            filter: None,
            aggregation: None,
            projection,
            distinct: false,
            order_by: vec![],
            limit: None,
            offset: 0,
            schema,
        }));
        let before = tree.clone();
        PruneUnusedColumns.run(&mut tree, &ctx).expect("prune");
        assert_eq!(tree, before);
    }
}
