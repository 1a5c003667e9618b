//! Resolved, typed representation of a query.
//!
//! A [`QueryTree`] mirrors the canonical query after name and type
//! resolution. Query tree passes mutate it in place; once a planner owns it,
//! it is read-only.

use std::fmt::Write as _;
use std::sync::Arc;

use arrow_schema::{DataType, Schema, SchemaRef};
use quarry_common::Result;

use crate::logical_plan::{one_row_schema, AggExpr, Expr, LiteralValue, SortExpr};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTree {
    pub root: QueryNode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    Select(SelectNode),
    Union(UnionNode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionMode {
    All,
    Distinct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionNode {
    pub mode: UnionMode,
    pub branches: Vec<SelectNode>,
    pub schema: SchemaRef,
}

/// Where a select reads its rows from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceNode {
    /// FROM-less select.
    OneRow,
    /// Catalog table; `schema` lists only the columns the scope reads.
    Table {
        name: String,
        alias: Option<String>,
        schema: SchemaRef,
    },
    /// Derived table.
    Subquery {
        alias: Option<String>,
        query: Box<QueryNode>,
    },
}

impl SourceNode {
    pub fn schema(&self) -> SchemaRef {
        match self {
            SourceNode::OneRow => one_row_schema(),
            SourceNode::Table { schema, .. } => Arc::clone(schema),
            SourceNode::Subquery { query, .. } => query.schema(),
        }
    }
}

/// GROUP BY keys plus aggregate calls.
///
/// The output row is the group keys followed by the aggregates, described by
/// `schema`; the select's projection resolves against it.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub group_exprs: Vec<(Expr, String)>,
    pub aggr_exprs: Vec<(AggExpr, String)>,
    pub schema: SchemaRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectNode {
    pub source: SourceNode,
    pub filter: Option<Expr>,
    pub aggregation: Option<Aggregation>,
    pub projection: Vec<(Expr, String)>,
    pub distinct: bool,
    /// Keys over the projection output.
    pub order_by: Vec<SortExpr>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub schema: SchemaRef,
}

impl SelectNode {
    /// Input of the projection: aggregation output when grouping, source otherwise.
    pub fn projection_input(&self) -> SchemaRef {
        match &self.aggregation {
            Some(agg) => Arc::clone(&agg.schema),
            None => self.source.schema(),
        }
    }

    fn has_modifiers(&self) -> bool {
        !self.order_by.is_empty() || self.limit.is_some() || self.offset > 0
    }
}

impl QueryNode {
    pub fn schema(&self) -> SchemaRef {
        match self {
            QueryNode::Select(s) => Arc::clone(&s.schema),
            QueryNode::Union(u) => Arc::clone(&u.schema),
        }
    }

    /// Visit every select node, innermost first.
    pub fn for_each_select_mut(
        &mut self,
        f: &mut dyn FnMut(&mut SelectNode) -> Result<()>,
    ) -> Result<()> {
        match self {
            QueryNode::Select(select) => visit_select_mut(select, f),
            QueryNode::Union(union) => {
                for branch in union.branches.iter_mut() {
                    visit_select_mut(branch, f)?;
                }
                Ok(())
            }
        }
    }

    /// Visit every union node, innermost first.
    pub fn for_each_union(&self, f: &mut dyn FnMut(&UnionNode) -> Result<()>) -> Result<()> {
        match self {
            QueryNode::Select(select) => visit_unions_in_select(select, f),
            QueryNode::Union(union) => {
                for branch in &union.branches {
                    visit_unions_in_select(branch, f)?;
                }
                f(union)
            }
        }
    }
}

fn visit_select_mut(
    select: &mut SelectNode,
    f: &mut dyn FnMut(&mut SelectNode) -> Result<()>,
) -> Result<()> {
    if let SourceNode::Subquery { query, .. } = &mut select.source {
        query.for_each_select_mut(f)?;
    }
    f(select)
}

fn visit_unions_in_select(
    select: &SelectNode,
    f: &mut dyn FnMut(&UnionNode) -> Result<()>,
) -> Result<()> {
    match &select.source {
        SourceNode::Subquery { query, .. } => query.for_each_union(f),
        _ => Ok(()),
    }
}

impl QueryTree {
    pub fn new(root: QueryNode) -> Self {
        Self { root }
    }

    /// Output schema of the whole query.
    pub fn schema(&self) -> SchemaRef {
        self.root.schema()
    }

    pub fn for_each_select_mut(
        &mut self,
        f: &mut dyn FnMut(&mut SelectNode) -> Result<()>,
    ) -> Result<()> {
        self.root.for_each_select_mut(f)
    }

    /// Render the tree back to SQL text.
    ///
    /// Identifiers are always double-quoted so the text re-parses to the same
    /// shape regardless of keyword collisions.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        render_node(&self.root, &mut out);
        out
    }
}

fn render_node(node: &QueryNode, out: &mut String) {
    match node {
        QueryNode::Select(select) => render_select(select, out),
        QueryNode::Union(union) => {
            let sep = match union.mode {
                UnionMode::All => " UNION ALL ",
                UnionMode::Distinct => " UNION DISTINCT ",
            };
            for (i, branch) in union.branches.iter().enumerate() {
                if i > 0 {
                    out.push_str(sep);
                }
                if branch.has_modifiers() {
                    out.push('(');
                    render_select(branch, out);
                    out.push(')');
                } else {
                    render_select(branch, out);
                }
            }
        }
    }
}

fn render_select(select: &SelectNode, out: &mut String) {
    out.push_str("SELECT ");
    if select.distinct {
        out.push_str("DISTINCT ");
    }
    let source_names = source_column_names(&select.source);
    let items = select
        .projection
        .iter()
        .map(|(e, name)| {
            let text = match &select.aggregation {
                Some(agg) => render_over_aggregation(e, agg, &source_names),
                None => render_expr(e, &source_names),
            };
            format!("{text} AS {}", quote_ident(name))
        })
        .collect::<Vec<_>>();
    out.push_str(&items.join(", "));

    match &select.source {
        SourceNode::OneRow => {}
        SourceNode::Table { name, alias, .. } => {
            let _ = write!(out, " FROM {}", quote_ident(name));
            if let Some(a) = alias {
                let _ = write!(out, " AS {}", quote_ident(a));
            }
        }
        SourceNode::Subquery { alias, query } => {
            out.push_str(" FROM (");
            render_node(query, out);
            let _ = write!(
                out,
                ") AS {}",
                quote_ident(alias.as_deref().unwrap_or("_subquery"))
            );
        }
    }

    if let Some(f) = &select.filter {
        let _ = write!(out, " WHERE {}", render_expr(f, &source_names));
    }
    if let Some(agg) = &select.aggregation {
        if !agg.group_exprs.is_empty() {
            let keys = agg
                .group_exprs
                .iter()
                .map(|(e, _)| render_expr(e, &source_names))
                .collect::<Vec<_>>();
            let _ = write!(out, " GROUP BY {}", keys.join(", "));
        }
    }
    if !select.order_by.is_empty() {
        let output_names = select
            .projection
            .iter()
            .map(|(_, n)| n.clone())
            .collect::<Vec<_>>();
        let keys = select
            .order_by
            .iter()
            .map(|s| {
                format!(
                    "{} {}",
                    render_expr(&s.expr, &output_names),
                    if s.asc { "ASC" } else { "DESC" }
                )
            })
            .collect::<Vec<_>>();
        let _ = write!(out, " ORDER BY {}", keys.join(", "));
    }
    if let Some(n) = select.limit {
        let _ = write!(out, " LIMIT {n}");
    }
    if select.offset > 0 {
        let _ = write!(out, " OFFSET {}", select.offset);
    }
}

fn source_column_names(source: &SourceNode) -> Vec<String> {
    source
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}

/// Render `e` over the aggregation output: every column reference becomes
/// the group key or aggregate call it names.
fn render_over_aggregation(e: &Expr, agg: &Aggregation, source_names: &[String]) -> String {
    render_expr_with(e, &|index, _| {
        if let Some((key, _)) = agg.group_exprs.get(index) {
            return render_expr(key, source_names);
        }
        match agg.aggr_exprs.get(index - agg.group_exprs.len()) {
            Some((a, _)) => render_agg(a, source_names),
            None => "NULL".to_string(),
        }
    })
}

fn render_agg(a: &AggExpr, names: &[String]) -> String {
    format!("{}({})", a.function_name(), render_expr(a.arg(), names))
}

fn render_expr(e: &Expr, names: &[String]) -> String {
    render_expr_with(e, &|index, name| {
        quote_ident(names.get(index).map(String::as_str).unwrap_or(name))
    })
}

fn render_expr_with(e: &Expr, column: &dyn Fn(usize, &str) -> String) -> String {
    let r = |e: &Expr| render_expr_with(e, column);
    match e {
        Expr::ColumnRef { name, index } => column(*index, name),
        Expr::Literal(v) => render_literal(v),
        Expr::BinaryOp { left, op, right } => format!("({} {} {})", r(left), op.sql(), r(right)),
        Expr::Cast { expr, to_type } => match sql_type_name(to_type) {
            Some(t) => format!("CAST({} AS {t})", r(expr)),
            None => r(expr),
        },
        Expr::And(a, b) => format!("({} AND {})", r(a), r(b)),
        Expr::Or(a, b) => format!("({} OR {})", r(a), r(b)),
        Expr::Not(e) => format!("(NOT {})", r(e)),
        Expr::CaseWhen {
            branches,
            else_expr,
        } => {
            let mut s = String::from("CASE");
            for (c, v) in branches {
                let _ = write!(s, " WHEN {} THEN {}", r(c), r(v));
            }
            if let Some(e) = else_expr {
                let _ = write!(s, " ELSE {}", r(e));
            }
            s.push_str(" END");
            s
        }
    }
}

fn render_literal(v: &LiteralValue) -> String {
    match v {
        LiteralValue::Int64(i) => i.to_string(),
        LiteralValue::UInt32(u) => format!("CAST({u} AS INT UNSIGNED)"),
        LiteralValue::Float64(f) if f.is_finite() => format!("{f:?}"),
        LiteralValue::Float64(f) => format!("CAST('{f}' AS DOUBLE)"),
        LiteralValue::Utf8(s) => format!("'{}'", s.replace('\'', "''")),
        LiteralValue::Boolean(true) => "TRUE".to_string(),
        LiteralValue::Boolean(false) => "FALSE".to_string(),
        LiteralValue::Null => "NULL".to_string(),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL spelling of an arrow type, for the types CAST can target.
pub fn sql_type_name(dt: &DataType) -> Option<&'static str> {
    Some(match dt {
        DataType::Int32 => "INT",
        DataType::Int64 => "BIGINT",
        DataType::UInt32 => "INT UNSIGNED",
        DataType::UInt64 => "BIGINT UNSIGNED",
        DataType::Float32 => "REAL",
        DataType::Float64 => "DOUBLE",
        DataType::Utf8 => "VARCHAR",
        DataType::Boolean => "BOOLEAN",
        _ => return None,
    })
}

/// Build an output schema for `exprs` evaluated over `input`.
pub fn projection_schema(exprs: &[(Expr, String)], input: &Schema) -> Result<SchemaRef> {
    let fields = exprs
        .iter()
        .map(|(e, name)| {
            Ok(arrow_schema::Field::new(
                name,
                e.data_type(input)?,
                e.nullable(input),
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}
