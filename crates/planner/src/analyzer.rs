use std::cell::RefCell;
use std::sync::Arc;

use arrow_schema::{DataType, Field, FieldRef, Schema, SchemaRef};
use quarry_common::{QuarryError, Result};
use quarry_sql::CanonicalQuery;
use sqlparser::ast::{
    BinaryOperator as SqlBinaryOp, Distinct, Expr as SqlExpr, FunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, Ident, ObjectName, OrderByExpr, Query, Select, SelectItem,
    SetExpr, SetOperator, SetQuantifier, TableFactor, UnaryOperator, Value,
};

use crate::context::ExecutionContext;
use crate::logical_plan::{one_row_schema, AggExpr, BinaryOp, Expr, LiteralValue, SortExpr};
use crate::query_tree::{
    projection_schema, Aggregation, QueryNode, QueryTree, SelectNode, SourceNode, UnionMode,
    UnionNode,
};

/// The analyzer needs schemas to resolve columns.
/// The client session provides this from its catalog.
pub trait SchemaProvider: Send + Sync {
    /// Return schema for a table by name.
    fn table_schema(&self, table: &str) -> Result<SchemaRef>;
}

/// Builds resolved query trees and renders them back to canonical queries.
pub trait QueryTreeBuilder: Send + Sync {
    /// Resolve names and types of `query` against `context`.
    fn build(&self, query: &CanonicalQuery, context: &ExecutionContext) -> Result<QueryTree>;

    /// Canonical query equivalent to `tree`, for display and logging.
    fn to_display_form(&self, tree: &QueryTree) -> Result<CanonicalQuery>;
}

/// [`QueryTreeBuilder`] over the sqlparser AST.
///
/// Guarantees:
/// - column names become positional `Expr::ColumnRef`s against the scope input;
/// - identifiers that are not columns bind to context scalars as literals;
/// - expression/aggregate types are inferred and checked;
/// - required casts are inserted for supported coercions, including across
///   union branches.
///
/// Error taxonomy:
/// - `Planning`: semantic/type/name resolution failures
/// - `Unsupported`: valid SQL shape outside the supported subset
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlQueryTreeBuilder;

impl QueryTreeBuilder for SqlQueryTreeBuilder {
    fn build(&self, query: &CanonicalQuery, context: &ExecutionContext) -> Result<QueryTree> {
        let binder = ExprBinder { context };
        Ok(QueryTree::new(binder.build_query(query.query())?))
    }

    fn to_display_form(&self, tree: &QueryTree) -> Result<CanonicalQuery> {
        CanonicalQuery::parse(&tree.to_sql())
    }
}

struct ExprBinder<'a> {
    context: &'a ExecutionContext,
}

impl ExprBinder<'_> {
    // -------------------------
    // Query shapes
    // -------------------------

    fn build_query(&self, q: &Query) -> Result<QueryNode> {
        if q.with.is_some() {
            return Err(QuarryError::Unsupported(
                "WITH clauses are not supported".to_string(),
            ));
        }
        if q.fetch.is_some() {
            return Err(QuarryError::Unsupported(
                "FETCH is not supported (use LIMIT)".to_string(),
            ));
        }
        let node = self.build_set_expr(&q.body)?;
        let order_by = q
            .order_by
            .as_ref()
            .map(|o| o.exprs.as_slice())
            .unwrap_or_default();
        let limit = q.limit.as_ref().map(|e| literal_usize(e, "LIMIT")).transpose()?;
        let offset = q
            .offset
            .as_ref()
            .map(|o| literal_usize(&o.value, "OFFSET"))
            .transpose()?
            .unwrap_or(0);
        if order_by.is_empty() && limit.is_none() && offset == 0 {
            return Ok(node);
        }

        let mut select = match node {
            QueryNode::Select(s)
                if s.order_by.is_empty() && s.limit.is_none() && s.offset == 0 =>
            {
                s
            }
            other => wrap_in_select(other),
        };
        select.order_by = self.bind_order_by(order_by, &select)?;
        select.limit = limit;
        select.offset = offset;
        Ok(QueryNode::Select(select))
    }

    fn build_set_expr(&self, body: &SetExpr) -> Result<QueryNode> {
        match body {
            SetExpr::Select(s) => Ok(QueryNode::Select(self.build_select(s)?)),
            SetExpr::Query(q) => self.build_query(q),
            SetExpr::SetOperation {
                op: SetOperator::Union,
                set_quantifier,
                ..
            } => {
                let mode = union_mode(set_quantifier)?;
                let mut branches = vec![];
                self.collect_union_branches(body, mode, &mut branches)?;
                Ok(QueryNode::Union(unify_union(mode, branches)?))
            }
            SetExpr::SetOperation { op, .. } => Err(QuarryError::Unsupported(format!(
                "set operation {op} is not supported"
            ))),
            other => Err(QuarryError::Unsupported(format!(
                "unsupported query body: {other}"
            ))),
        }
    }

    /// Flatten a chain of same-mode unions into its select branches.
    fn collect_union_branches(
        &self,
        body: &SetExpr,
        mode: UnionMode,
        out: &mut Vec<SelectNode>,
    ) -> Result<()> {
        match body {
            SetExpr::SetOperation {
                op: SetOperator::Union,
                set_quantifier,
                left,
                right,
            } if union_mode(set_quantifier)? == mode => {
                self.collect_union_branches(left, mode, out)?;
                self.collect_union_branches(right, mode, out)
            }
            other => {
                match self.build_set_expr(other)? {
                    QueryNode::Select(s) => out.push(s),
                    QueryNode::Union(u) if u.mode == mode => out.extend(u.branches),
                    union => out.push(wrap_in_select(union)),
                }
                Ok(())
            }
        }
    }

    fn build_select(&self, s: &Select) -> Result<SelectNode> {
        if s.top.is_some() || s.into.is_some() || s.having.is_some() || s.qualify.is_some() {
            return Err(QuarryError::Unsupported(
                "TOP, INTO, HAVING and QUALIFY are not supported".to_string(),
            ));
        }
        let distinct = match &s.distinct {
            None => false,
            Some(Distinct::Distinct) => true,
            Some(Distinct::On(_)) => {
                return Err(QuarryError::Unsupported(
                    "DISTINCT ON is not supported".to_string(),
                ))
            }
        };

        let source = self.build_source(s)?;
        let resolver = match &source {
            SourceNode::OneRow => Resolver::new(None, one_row_schema()),
            SourceNode::Table {
                name,
                alias,
                schema,
            } => Resolver::new(Some(alias.clone().unwrap_or_else(|| name.clone())), schema.clone()),
            SourceNode::Subquery { alias, query } => Resolver::new(alias.clone(), query.schema()),
        };

        let filter = match &s.selection {
            Some(selection) => {
                let (pred, dt) = self.bind(selection, &resolver)?;
                if !matches!(dt, DataType::Boolean | DataType::Null) {
                    return Err(QuarryError::Planning(format!(
                        "WHERE predicate must be boolean, got {dt:?}"
                    )));
                }
                Some(pred)
            }
            None => None,
        };

        let group_by = match &s.group_by {
            GroupByExpr::Expressions(es, _mods) => es.as_slice(),
            GroupByExpr::All(_mods) => {
                return Err(QuarryError::Unsupported(
                    "GROUP BY ALL is not supported".to_string(),
                ))
            }
        };
        let aggregating = !group_by.is_empty()
            || s.projection.iter().any(|item| match item {
                SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                    contains_aggregate(e)
                }
                _ => false,
            });

        let (aggregation, projection) = if aggregating {
            let scope = AggregationScope::new(self, &resolver, group_by)?;
            let projection = self.bind_projection(&s.projection, &resolver, &scope)?;
            (Some(scope.finish()), projection)
        } else {
            (None, self.bind_projection(&s.projection, &resolver, &resolver)?)
        };
        if projection.is_empty() {
            return Err(QuarryError::Planning("empty SELECT list".to_string()));
        }

        let input = match &aggregation {
            Some(agg) => Arc::clone(&agg.schema),
            None => resolver.schema(),
        };
        let schema = projection_schema(&projection, &input)?;
        Ok(SelectNode {
            source,
            filter,
            aggregation,
            projection,
            distinct,
            order_by: vec![],
            limit: None,
            offset: 0,
            schema,
        })
    }

    fn build_source(&self, s: &Select) -> Result<SourceNode> {
        let twj = match s.from.as_slice() {
            [] => return Ok(SourceNode::OneRow),
            [twj] => twj,
            _ => {
                return Err(QuarryError::Unsupported(
                    "only one FROM source is supported".to_string(),
                ))
            }
        };
        if !twj.joins.is_empty() {
            return Err(QuarryError::Unsupported("JOIN is not supported".to_string()));
        }
        match &twj.relation {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    return Err(QuarryError::Unsupported(format!(
                        "table function {name} is not supported"
                    )));
                }
                let table = object_name_to_string(name);
                let schema = self.context.table_schema(&table)?;
                Ok(SourceNode::Table {
                    name: table,
                    alias: table_alias(alias.as_ref().map(|a| (&a.name, a.columns.is_empty())))?,
                    schema,
                })
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
            } => {
                if *lateral {
                    return Err(QuarryError::Unsupported(
                        "LATERAL subqueries are not supported".to_string(),
                    ));
                }
                Ok(SourceNode::Subquery {
                    alias: table_alias(alias.as_ref().map(|a| (&a.name, a.columns.is_empty())))?,
                    query: Box::new(self.build_query(subquery)?),
                })
            }
            other => Err(QuarryError::Unsupported(format!(
                "unsupported FROM source: {other}"
            ))),
        }
    }

    fn bind_projection(
        &self,
        items: &[SelectItem],
        source: &Resolver,
        scope: &dyn Scope,
    ) -> Result<Vec<(Expr, String)>> {
        let mut out = vec![];
        for item in items {
            match item {
                SelectItem::UnnamedExpr(e) => {
                    let (expr, _) = self.bind(e, scope)?;
                    out.push((expr, output_name(e)));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let (bound, _) = self.bind(expr, scope)?;
                    out.push((bound, alias.value.clone()));
                }
                SelectItem::Wildcard(_) => {
                    for f in source.fields.iter() {
                        let (expr, _) = self.bind_column(None, f.name(), scope)?;
                        out.push((expr, f.name().clone()));
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = object_name_to_string(name);
                    if source.qualifier.as_deref() != Some(qualifier.as_str()) {
                        return Err(QuarryError::Planning(format!(
                            "unknown relation in wildcard: {qualifier}.*"
                        )));
                    }
                    for f in source.fields.iter() {
                        let (expr, _) = self.bind_column(Some(&qualifier), f.name(), scope)?;
                        out.push((expr, f.name().clone()));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Bind ORDER BY keys over the output columns of `select`.
    fn bind_order_by(&self, keys: &[OrderByExpr], select: &SelectNode) -> Result<Vec<SortExpr>> {
        let output = Resolver::new(None, Arc::clone(&select.schema));
        keys.iter()
            .map(|k| {
                let expr = match &k.expr {
                    SqlExpr::Value(Value::Number(n, _)) => {
                        let pos: usize = n.parse().map_err(|_| {
                            QuarryError::Planning(format!("bad ORDER BY position: {n}"))
                        })?;
                        let field = pos
                            .checked_sub(1)
                            .and_then(|i| output.fields.get(i).map(|f| (i, f)))
                            .ok_or_else(|| {
                                QuarryError::Planning(format!(
                                    "ORDER BY position {pos} is out of range"
                                ))
                            })?;
                        Expr::ColumnRef {
                            name: field.1.name().clone(),
                            index: field.0,
                        }
                    }
                    other => {
                        let text = other.to_string();
                        match output.fields.iter().position(|f| *f.name() == text) {
                            Some(index) => Expr::ColumnRef { name: text, index },
                            None => self.bind(other, &output)?.0,
                        }
                    }
                };
                let asc = k.asc.unwrap_or(true);
                Ok(SortExpr {
                    expr,
                    asc,
                    nulls_first: k.nulls_first.unwrap_or(false),
                })
            })
            .collect()
    }

    // -------------------------
    // Expressions
    // -------------------------

    fn bind(&self, e: &SqlExpr, scope: &dyn Scope) -> Result<(Expr, DataType)> {
        if let Some(bound) = scope.intercept(e, self)? {
            return Ok(bound);
        }
        match e {
            SqlExpr::Identifier(id) => self.bind_column(None, &id.value, scope),
            SqlExpr::CompoundIdentifier(parts) => match parts.as_slice() {
                [rel, col] => self.bind_column(Some(&rel.value), &col.value, scope),
                _ => Err(QuarryError::Unsupported(format!(
                    "unsupported compound identifier: {e}"
                ))),
            },
            SqlExpr::Value(v) => {
                let lit = sql_value_to_literal(v)?;
                let dt = lit.data_type();
                Ok((Expr::Literal(lit), dt))
            }
            SqlExpr::Nested(inner) => self.bind(inner, scope),
            SqlExpr::BinaryOp { left, op, right } => {
                let (l, ldt) = self.bind(left, scope)?;
                let (r, rdt) = self.bind(right, scope)?;
                match op {
                    SqlBinaryOp::And | SqlBinaryOp::Or => {
                        ensure_boolean(&ldt, op)?;
                        ensure_boolean(&rdt, op)?;
                        let (l, r) = (Box::new(l), Box::new(r));
                        let out = if *op == SqlBinaryOp::And {
                            Expr::And(l, r)
                        } else {
                            Expr::Or(l, r)
                        };
                        Ok((out, DataType::Boolean))
                    }
                    _ => {
                        let bop = sql_binop_to_binop(op)?;
                        let (l, r, dt) = if bop.is_comparison() {
                            let (l, r, _) = coerce_for_compare(l, ldt, r, rdt)?;
                            (l, r, DataType::Boolean)
                        } else {
                            coerce_for_arith(bop, l, ldt, r, rdt)?
                        };
                        Ok((
                            Expr::BinaryOp {
                                left: Box::new(l),
                                op: bop,
                                right: Box::new(r),
                            },
                            dt,
                        ))
                    }
                }
            }
            SqlExpr::UnaryOp { op, expr } => {
                let (inner, dt) = self.bind(expr, scope)?;
                match op {
                    UnaryOperator::Not => {
                        ensure_boolean(&dt, "NOT")?;
                        Ok((Expr::Not(Box::new(inner)), DataType::Boolean))
                    }
                    UnaryOperator::Plus if is_numeric(&dt) => Ok((inner, dt)),
                    UnaryOperator::Minus => match inner {
                        Expr::Literal(LiteralValue::Int64(i)) => {
                            Ok((Expr::Literal(LiteralValue::Int64(-i)), dt))
                        }
                        Expr::Literal(LiteralValue::Float64(f)) => {
                            Ok((Expr::Literal(LiteralValue::Float64(-f)), dt))
                        }
                        other => {
                            let zero = Expr::Literal(LiteralValue::Int64(0));
                            let (l, r, dt) = coerce_for_arith(
                                BinaryOp::Minus,
                                zero,
                                DataType::Int64,
                                other,
                                dt,
                            )?;
                            Ok((
                                Expr::BinaryOp {
                                    left: Box::new(l),
                                    op: BinaryOp::Minus,
                                    right: Box::new(r),
                                },
                                dt,
                            ))
                        }
                    },
                    _ => Err(QuarryError::Unsupported(format!(
                        "unsupported unary op: {op}"
                    ))),
                }
            }
            SqlExpr::Cast {
                expr, data_type, ..
            } => {
                let (inner, from) = self.bind(expr, scope)?;
                let to = sql_type_to_arrow(&data_type.to_string())?;
                Ok((cast_if_needed(inner, &from, &to), to))
            }
            SqlExpr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => self.bind_case(
                operand.as_deref(),
                conditions,
                results,
                else_result.as_deref(),
                scope,
            ),
            SqlExpr::Function(f) => {
                let name = object_name_to_string(&f.name);
                if aggregate_kind(&name).is_some() {
                    Err(QuarryError::Planning(format!(
                        "aggregate function {name} is not allowed here"
                    )))
                } else {
                    Err(QuarryError::Unsupported(format!(
                        "unsupported function: {name}"
                    )))
                }
            }
            _ => Err(QuarryError::Unsupported(format!(
                "unsupported SQL expression: {e}"
            ))),
        }
    }

    fn bind_case(
        &self,
        operand: Option<&SqlExpr>,
        conditions: &[SqlExpr],
        results: &[SqlExpr],
        else_result: Option<&SqlExpr>,
        scope: &dyn Scope,
    ) -> Result<(Expr, DataType)> {
        let operand = operand.map(|o| self.bind(o, scope)).transpose()?;
        let mut conds = Vec::with_capacity(conditions.len());
        for c in conditions {
            let (ce, cdt) = self.bind(c, scope)?;
            let cond = match &operand {
                Some((oe, odt)) => {
                    let (l, r, _) = coerce_for_compare(oe.clone(), odt.clone(), ce, cdt)?;
                    Expr::BinaryOp {
                        left: Box::new(l),
                        op: BinaryOp::Eq,
                        right: Box::new(r),
                    }
                }
                None => {
                    ensure_boolean(&cdt, "CASE WHEN")?;
                    ce
                }
            };
            conds.push(cond);
        }

        let mut values = results
            .iter()
            .map(|r| self.bind(r, scope))
            .collect::<Result<Vec<_>>>()?;
        let else_bound = else_result.map(|e| self.bind(e, scope)).transpose()?;
        let mut types = values.iter().map(|(_, dt)| dt.clone()).collect::<Vec<_>>();
        if let Some((_, dt)) = &else_bound {
            types.push(dt.clone());
        }
        let target = coerce_case_result_type(&types)?;
        let branches = conds
            .into_iter()
            .zip(values.drain(..))
            .map(|(c, (v, dt))| (c, cast_if_needed(v, &dt, &target)))
            .collect();
        let else_expr = else_bound.map(|(e, dt)| Box::new(cast_if_needed(e, &dt, &target)));
        Ok((
            Expr::CaseWhen {
                branches,
                else_expr,
            },
            target,
        ))
    }

    /// Resolve a column in `scope`, falling back to a context scalar.
    fn bind_column(
        &self,
        qualifier: Option<&str>,
        name: &str,
        scope: &dyn Scope,
    ) -> Result<(Expr, DataType)> {
        if let Some((index, field)) = scope.resolve_column(qualifier, name)? {
            return Ok((
                Expr::ColumnRef {
                    name: field.name().clone(),
                    index,
                },
                field.data_type().clone(),
            ));
        }
        if qualifier.is_none() {
            if let Some(binding) = self.context.scalar(name) {
                let dt = binding.data_type().clone();
                let expr = match binding.value()? {
                    LiteralValue::Null => {
                        cast_if_needed(Expr::Literal(LiteralValue::Null), &DataType::Null, &dt)
                    }
                    v => Expr::Literal(v),
                };
                return Ok((expr, dt));
            }
        }
        let full = match qualifier {
            Some(q) => format!("{q}.{name}"),
            None => name.to_string(),
        };
        Err(QuarryError::Planning(format!("unknown column: {full}")))
    }
}

// -------------------------
// Scopes
// -------------------------

/// Name-resolution scope of an expression.
trait Scope {
    /// Bind `e` as a whole, or return `None` to bind it structurally.
    fn intercept(&self, e: &SqlExpr, binder: &ExprBinder<'_>) -> Result<Option<(Expr, DataType)>>;

    /// Position and field of a column in the scope input.
    fn resolve_column(&self, qualifier: Option<&str>, name: &str) -> Result<Option<(usize, Field)>>;
}

/// Columns of a single relation.
#[derive(Debug, Clone)]
struct Resolver {
    qualifier: Option<String>,
    fields: Vec<FieldRef>,
}

impl Resolver {
    fn new(qualifier: Option<String>, schema: SchemaRef) -> Self {
        Self {
            qualifier,
            fields: schema.fields().iter().cloned().collect(),
        }
    }

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.fields.iter().map(|f| (**f).clone()).collect::<Vec<_>>(),
        ))
    }

    fn resolve(&self, qualifier: Option<&str>, name: &str) -> Result<Option<(usize, Field)>> {
        if let Some(q) = qualifier {
            if self.qualifier.as_deref() != Some(q) {
                return Ok(None);
            }
        }
        let found = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name() == name)
            .collect::<Vec<_>>();
        match found.as_slice() {
            [] => Ok(None),
            [(i, f)] => Ok(Some((*i, (***f).clone()))),
            _ => Err(QuarryError::Planning(format!(
                "ambiguous column reference: {name}"
            ))),
        }
    }
}

impl Scope for Resolver {
    fn intercept(&self, _e: &SqlExpr, _binder: &ExprBinder<'_>) -> Result<Option<(Expr, DataType)>> {
        Ok(None)
    }

    fn resolve_column(&self, qualifier: Option<&str>, name: &str) -> Result<Option<(usize, Field)>> {
        self.resolve(qualifier, name)
    }
}

struct GroupKey {
    text: String,
    expr: Expr,
    field: Field,
}

/// Scope over the output of an aggregation: group keys, then aggregates.
///
/// Aggregate calls found while binding are registered on the fly.
struct AggregationScope<'r> {
    source: &'r Resolver,
    keys: Vec<GroupKey>,
    aggs: RefCell<Vec<(AggExpr, Field)>>,
}

impl<'r> AggregationScope<'r> {
    fn new(binder: &ExprBinder<'_>, source: &'r Resolver, group_by: &[SqlExpr]) -> Result<Self> {
        let input = source.schema();
        let keys = group_by
            .iter()
            .map(|g| {
                let (expr, dt) = binder.bind(g, source)?;
                let nullable = expr.nullable(&input);
                let name = output_name(g);
                Ok(GroupKey {
                    text: g.to_string(),
                    expr,
                    field: Field::new(name, dt, nullable),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            source,
            keys,
            aggs: RefCell::new(vec![]),
        })
    }

    fn finish(self) -> Aggregation {
        let aggs = self.aggs.into_inner();
        let fields = self
            .keys
            .iter()
            .map(|k| k.field.clone())
            .chain(aggs.iter().map(|(_, f)| f.clone()))
            .collect::<Vec<_>>();
        Aggregation {
            group_exprs: self
                .keys
                .into_iter()
                .map(|k| {
                    let name = k.field.name().clone();
                    (k.expr, name)
                })
                .collect(),
            aggr_exprs: aggs
                .into_iter()
                .map(|(a, f)| (a, f.name().clone()))
                .collect(),
            schema: Arc::new(Schema::new(fields)),
        }
    }

    fn bind_aggregate(
        &self,
        f: &sqlparser::ast::Function,
        binder: &ExprBinder<'_>,
    ) -> Result<(Expr, DataType)> {
        let fname = object_name_to_string(&f.name);
        let kind = aggregate_kind(&fname).ok_or_else(|| {
            QuarryError::Planning(format!("{fname} is not an aggregate function"))
        })?;
        if f.over.is_some() || f.filter.is_some() {
            return Err(QuarryError::Unsupported(format!(
                "window and FILTER clauses on {fname} are not supported"
            )));
        }
        let list = match &f.args {
            FunctionArguments::List(list) => list,
            _ => {
                return Err(QuarryError::Unsupported(format!(
                    "unsupported argument form for {fname}"
                )))
            }
        };
        if list.duplicate_treatment.is_some() {
            return Err(QuarryError::Unsupported(format!(
                "DISTINCT/ALL inside {fname} is not supported"
            )));
        }
        let (arg, arg_dt) = match list.args.as_slice() {
            [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] if kind == "COUNT" => {
                (Expr::Literal(LiteralValue::Int64(1)), DataType::Int64)
            }
            [FunctionArg::Unnamed(FunctionArgExpr::Expr(e))] => binder.bind(e, self.source)?,
            _ => {
                return Err(QuarryError::Unsupported(format!(
                    "{fname}() requires exactly one argument"
                )))
            }
        };
        let agg = match kind {
            "COUNT" => AggExpr::Count(arg),
            "SUM" => AggExpr::Sum(arg),
            "MIN" => AggExpr::Min(arg),
            "MAX" => AggExpr::Max(arg),
            _ => AggExpr::Avg(arg),
        };
        if matches!(agg, AggExpr::Sum(_) | AggExpr::Avg(_)) && !is_numeric(&arg_dt) {
            return Err(QuarryError::Planning(format!(
                "{fname} requires a numeric argument, got {arg_dt:?}"
            )));
        }
        let dt = agg.result_type(&arg_dt);

        let mut aggs = self.aggs.borrow_mut();
        let pos = match aggs.iter().position(|(a, _)| *a == agg) {
            Some(pos) => pos,
            None => {
                let nullable = !matches!(agg, AggExpr::Count(_));
                aggs.push((agg, Field::new(f.to_string(), dt.clone(), nullable)));
                aggs.len() - 1
            }
        };
        let index = self.keys.len() + pos;
        Ok((
            Expr::ColumnRef {
                name: aggs[pos].1.name().clone(),
                index,
            },
            dt,
        ))
    }
}

impl Scope for AggregationScope<'_> {
    fn intercept(&self, e: &SqlExpr, binder: &ExprBinder<'_>) -> Result<Option<(Expr, DataType)>> {
        let text = e.to_string();
        if let Some(i) = self.keys.iter().position(|k| k.text == text) {
            let field = &self.keys[i].field;
            return Ok(Some((
                Expr::ColumnRef {
                    name: field.name().clone(),
                    index: i,
                },
                field.data_type().clone(),
            )));
        }
        match e {
            SqlExpr::Function(f) if aggregate_kind(&object_name_to_string(&f.name)).is_some() => {
                self.bind_aggregate(f, binder).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn resolve_column(&self, qualifier: Option<&str>, name: &str) -> Result<Option<(usize, Field)>> {
        let Some((source_index, _)) = self.source.resolve(qualifier, name)? else {
            return Ok(None);
        };
        let key = self.keys.iter().position(|k| {
            matches!(k.expr, Expr::ColumnRef { index, .. } if index == source_index)
        });
        match key {
            Some(i) => Ok(Some((i, self.keys[i].field.clone()))),
            None => Err(QuarryError::Planning(format!(
                "column {name} must appear in GROUP BY or be used in an aggregate function"
            ))),
        }
    }
}

// -------------------------
// Helpers
// -------------------------

fn wrap_in_select(node: QueryNode) -> SelectNode {
    let schema = node.schema();
    let projection = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(index, f)| {
            (
                Expr::ColumnRef {
                    name: f.name().clone(),
                    index,
                },
                f.name().clone(),
            )
        })
        .collect();
    SelectNode {
        source: SourceNode::Subquery {
            alias: None,
            query: Box::new(node),
        },
        filter: None,
        aggregation: None,
        projection,
        distinct: false,
        order_by: vec![],
        limit: None,
        offset: 0,
        schema,
    }
}

fn union_mode(q: &SetQuantifier) -> Result<UnionMode> {
    match q {
        SetQuantifier::All => Ok(UnionMode::All),
        SetQuantifier::Distinct | SetQuantifier::None => Ok(UnionMode::Distinct),
        other => Err(QuarryError::Unsupported(format!("UNION {other} is not supported"))),
    }
}

/// Cast every branch to the common column types; names come from the first branch.
fn unify_union(mode: UnionMode, mut branches: Vec<SelectNode>) -> Result<UnionNode> {
    let arity = branches
        .first()
        .map(|b| b.schema.fields().len())
        .ok_or_else(|| QuarryError::Planning("UNION without branches".to_string()))?;
    if let Some(bad) = branches.iter().find(|b| b.schema.fields().len() != arity) {
        return Err(QuarryError::Planning(format!(
            "UNION branches must have the same number of columns: {arity} vs {}",
            bad.schema.fields().len()
        )));
    }

    let mut fields = Vec::with_capacity(arity);
    for i in 0..arity {
        let types = branches
            .iter()
            .map(|b| b.schema.field(i).data_type().clone())
            .collect::<Vec<_>>();
        let target = coerce_case_result_type(&types)?;
        let nullable = branches.iter().any(|b| b.schema.field(i).is_nullable());
        fields.push(Field::new(branches[0].schema.field(i).name(), target, nullable));
    }

    for branch in branches.iter_mut() {
        if branch
            .schema
            .fields()
            .iter()
            .zip(&fields)
            .all(|(f, t)| f.data_type() == t.data_type())
        {
            continue;
        }
        let input = branch.projection_input();
        for ((expr, _), target) in branch.projection.iter_mut().zip(&fields) {
            let from = expr.data_type(&input)?;
            *expr = cast_if_needed(expr.clone(), &from, target.data_type());
        }
        branch.schema = projection_schema(&branch.projection, &input)?;
    }

    Ok(UnionNode {
        mode,
        branches,
        schema: Arc::new(Schema::new(fields)),
    })
}

fn contains_aggregate(e: &SqlExpr) -> bool {
    match e {
        SqlExpr::Function(f) => aggregate_kind(&object_name_to_string(&f.name)).is_some(),
        SqlExpr::BinaryOp { left, right, .. } => contains_aggregate(left) || contains_aggregate(right),
        SqlExpr::UnaryOp { expr, .. } | SqlExpr::Nested(expr) | SqlExpr::Cast { expr, .. } => {
            contains_aggregate(expr)
        }
        SqlExpr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            operand.as_deref().is_some_and(contains_aggregate)
                || conditions.iter().any(contains_aggregate)
                || results.iter().any(contains_aggregate)
                || else_result.as_deref().is_some_and(contains_aggregate)
        }
        _ => false,
    }
}

fn aggregate_kind(name: &str) -> Option<&'static str> {
    Some(match name.to_uppercase().as_str() {
        "COUNT" => "COUNT",
        "SUM" => "SUM",
        "MIN" => "MIN",
        "MAX" => "MAX",
        "AVG" => "AVG",
        _ => return None,
    })
}

/// Output column name: identifier name for plain columns, SQL text otherwise.
fn output_name(e: &SqlExpr) -> String {
    match e {
        SqlExpr::Identifier(id) => id.value.clone(),
        SqlExpr::CompoundIdentifier(parts) => parts
            .last()
            .map(|p| p.value.clone())
            .unwrap_or_else(|| e.to_string()),
        _ => e.to_string(),
    }
}

fn table_alias(alias: Option<(&Ident, bool)>) -> Result<Option<String>> {
    match alias {
        None => Ok(None),
        Some((name, true)) => Ok(Some(name.value.clone())),
        Some((name, false)) => Err(QuarryError::Unsupported(format!(
            "column aliases on relation {name} are not supported"
        ))),
    }
}

fn object_name_to_string(n: &ObjectName) -> String {
    n.0.iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

fn sql_value_to_literal(v: &Value) -> Result<LiteralValue> {
    match v {
        Value::Number(s, _) => {
            if s.contains(['.', 'e', 'E']) {
                let f: f64 = s
                    .parse()
                    .map_err(|_| QuarryError::Planning(format!("bad number: {s}")))?;
                Ok(LiteralValue::Float64(f))
            } else {
                let i: i64 = s
                    .parse()
                    .map_err(|_| QuarryError::Planning(format!("bad number: {s}")))?;
                Ok(LiteralValue::Int64(i))
            }
        }
        Value::SingleQuotedString(s) => Ok(LiteralValue::Utf8(s.clone())),
        Value::Boolean(b) => Ok(LiteralValue::Boolean(*b)),
        Value::Null => Ok(LiteralValue::Null),
        _ => Err(QuarryError::Unsupported(format!(
            "unsupported SQL literal: {v}"
        ))),
    }
}

fn literal_usize(e: &SqlExpr, clause: &str) -> Result<usize> {
    match e {
        SqlExpr::Value(Value::Number(s, _)) => s
            .parse::<usize>()
            .map_err(|_| QuarryError::Planning(format!("{clause} must be a non-negative integer"))),
        _ => Err(QuarryError::Planning(format!(
            "{clause} must be a literal integer"
        ))),
    }
}

fn sql_binop_to_binop(op: &SqlBinaryOp) -> Result<BinaryOp> {
    Ok(match op {
        SqlBinaryOp::Eq => BinaryOp::Eq,
        SqlBinaryOp::NotEq => BinaryOp::NotEq,
        SqlBinaryOp::Lt => BinaryOp::Lt,
        SqlBinaryOp::LtEq => BinaryOp::LtEq,
        SqlBinaryOp::Gt => BinaryOp::Gt,
        SqlBinaryOp::GtEq => BinaryOp::GtEq,
        SqlBinaryOp::Plus => BinaryOp::Plus,
        SqlBinaryOp::Minus => BinaryOp::Minus,
        SqlBinaryOp::Multiply => BinaryOp::Multiply,
        SqlBinaryOp::Divide => BinaryOp::Divide,
        _ => {
            return Err(QuarryError::Unsupported(format!(
                "unsupported binary operator: {op}"
            )))
        }
    })
}

/// Arrow type for a rendered SQL type name.
fn sql_type_to_arrow(sql_type: &str) -> Result<DataType> {
    let t = sql_type.to_uppercase();
    Ok(match t.as_str() {
        "INT" | "INTEGER" | "INT4" | "INT32" => DataType::Int32,
        "BIGINT" | "INT8" | "INT64" => DataType::Int64,
        "INT UNSIGNED" | "INTEGER UNSIGNED" | "UINT32" => DataType::UInt32,
        "BIGINT UNSIGNED" | "UINT64" => DataType::UInt64,
        "REAL" | "FLOAT4" | "FLOAT32" => DataType::Float32,
        "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" | "FLOAT8" | "FLOAT64" => DataType::Float64,
        "TEXT" | "STRING" => DataType::Utf8,
        "BOOLEAN" | "BOOL" => DataType::Boolean,
        s if s.starts_with("VARCHAR") || s.starts_with("CHAR") => DataType::Utf8,
        _ => {
            return Err(QuarryError::Unsupported(format!(
                "unsupported CAST target type: {sql_type}"
            )))
        }
    })
}

fn ensure_boolean(dt: &DataType, what: impl std::fmt::Display) -> Result<()> {
    if matches!(dt, DataType::Boolean | DataType::Null) {
        Ok(())
    } else {
        Err(QuarryError::Planning(format!(
            "{what} requires boolean operands, got {dt:?}"
        )))
    }
}

// -------------------------
// Type inference + casts
// -------------------------

pub(crate) fn is_numeric(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

fn numeric_rank(dt: &DataType) -> Option<u8> {
    Some(match dt {
        DataType::Int8 => 1,
        DataType::Int16 => 2,
        DataType::Int32 => 3,
        DataType::Int64 => 4,
        DataType::UInt8 => 1,
        DataType::UInt16 => 2,
        DataType::UInt32 => 3,
        DataType::UInt64 => 4,
        DataType::Float32 => 5,
        DataType::Float64 => 6,
        _ => return None,
    })
}

fn wider_numeric(a: &DataType, b: &DataType) -> Option<DataType> {
    let ra = numeric_rank(a)?;
    let rb = numeric_rank(b)?;
    if ra >= rb {
        Some(a.clone())
    } else {
        Some(b.clone())
    }
}

pub(crate) fn cast_if_needed(expr: Expr, from: &DataType, to: &DataType) -> Expr {
    if from == to {
        expr
    } else {
        Expr::Cast {
            expr: Box::new(expr),
            to_type: to.clone(),
        }
    }
}

fn coerce_for_compare(
    left: Expr,
    ldt: DataType,
    right: Expr,
    rdt: DataType,
) -> Result<(Expr, Expr, DataType)> {
    // Null can be cast to the other side.
    if ldt == DataType::Null {
        return Ok((cast_if_needed(left, &ldt, &rdt), right, rdt));
    }
    if rdt == DataType::Null {
        return Ok((left, cast_if_needed(right, &rdt, &ldt), ldt));
    }

    if is_numeric(&ldt) && is_numeric(&rdt) {
        let target = wider_numeric(&ldt, &rdt).ok_or_else(|| {
            QuarryError::Planning("failed to determine numeric widening type".to_string())
        })?;
        return Ok((
            cast_if_needed(left, &ldt, &target),
            cast_if_needed(right, &rdt, &target),
            target,
        ));
    }

    if matches!(ldt, DataType::Utf8 | DataType::LargeUtf8)
        && matches!(rdt, DataType::Utf8 | DataType::LargeUtf8)
    {
        let target = if ldt == DataType::LargeUtf8 || rdt == DataType::LargeUtf8 {
            DataType::LargeUtf8
        } else {
            DataType::Utf8
        };
        return Ok((
            cast_if_needed(left, &ldt, &target),
            cast_if_needed(right, &rdt, &target),
            target,
        ));
    }

    if ldt == rdt {
        return Ok((left, right, ldt));
    }

    Err(QuarryError::Planning(format!(
        "cannot compare types {ldt:?} and {rdt:?}"
    )))
}

fn coerce_for_arith(
    op: BinaryOp,
    left: Expr,
    ldt: DataType,
    right: Expr,
    rdt: DataType,
) -> Result<(Expr, Expr, DataType)> {
    let ldt_eff = if ldt == DataType::Null { rdt.clone() } else { ldt.clone() };
    let rdt_eff = if rdt == DataType::Null { ldt_eff.clone() } else { rdt.clone() };
    if !is_numeric(&ldt_eff) || !is_numeric(&rdt_eff) {
        return Err(QuarryError::Planning(format!(
            "arithmetic requires numeric operands, got {ldt:?} {} {rdt:?}",
            op.sql()
        )));
    }

    // division produces float
    let target = if op == BinaryOp::Divide {
        DataType::Float64
    } else {
        wider_numeric(&ldt_eff, &rdt_eff)
            .ok_or_else(|| QuarryError::Planning("failed numeric widening".to_string()))?
    };
    Ok((
        cast_if_needed(left, &ldt, &target),
        cast_if_needed(right, &rdt, &target),
        target,
    ))
}

fn coerce_case_result_type(types: &[DataType]) -> Result<DataType> {
    let mut target: Option<DataType> = None;
    for dt in types {
        if *dt == DataType::Null {
            continue;
        }
        target = Some(match target {
            None => dt.clone(),
            Some(t) if t == *dt => t,
            Some(t) if is_numeric(&t) && is_numeric(dt) => wider_numeric(&t, dt).ok_or_else(|| {
                QuarryError::Planning("failed to determine numeric widening type".to_string())
            })?,
            Some(DataType::Utf8) if *dt == DataType::LargeUtf8 => DataType::LargeUtf8,
            Some(DataType::LargeUtf8) if *dt == DataType::Utf8 => DataType::LargeUtf8,
            Some(t) => {
                return Err(QuarryError::Planning(format!(
                    "type mismatch: cannot unify {t:?} and {dt:?}"
                )));
            }
        });
    }
    Ok(target.unwrap_or(DataType::Null))
}
