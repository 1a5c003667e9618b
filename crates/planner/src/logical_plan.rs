use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use quarry_common::{QuarryError, Result};
use serde::{Deserialize, Serialize};

/// Resolved scalar expression.
///
/// Column references are positional against the input schema of the step (or
/// query tree scope) that owns the expression; `name` is kept for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    ColumnRef {
        name: String,
        index: usize,
    },
    Literal(LiteralValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to_type: DataType,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    CaseWhen {
        branches: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    UInt32(u32),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl LiteralValue {
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::UInt32(_) => DataType::UInt32,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::Utf8(_) => DataType::Utf8,
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::Null => DataType::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    pub fn sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

impl Expr {
    /// Infer the output type against `input`.
    ///
    /// Operands of binary operators are expected to be coerced to a common
    /// type already; arithmetic takes the left operand's type.
    pub fn data_type(&self, input: &Schema) -> Result<DataType> {
        match self {
            Expr::ColumnRef { name, index } => input
                .fields()
                .get(*index)
                .map(|f| f.data_type().clone())
                .ok_or_else(|| {
                    QuarryError::Planning(format!(
                        "column {name}#{index} out of range for input of width {}",
                        input.fields().len()
                    ))
                }),
            Expr::Literal(v) => Ok(v.data_type()),
            Expr::BinaryOp { left, op, right } => {
                let ldt = left.data_type(input)?;
                let rdt = right.data_type(input)?;
                if op.is_comparison() {
                    Ok(DataType::Boolean)
                } else if ldt == DataType::Null {
                    Ok(rdt)
                } else {
                    Ok(ldt)
                }
            }
            Expr::Cast { expr, to_type } => {
                expr.data_type(input)?;
                Ok(to_type.clone())
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.data_type(input)?;
                r.data_type(input)?;
                Ok(DataType::Boolean)
            }
            Expr::Not(e) => {
                e.data_type(input)?;
                Ok(DataType::Boolean)
            }
            Expr::CaseWhen {
                branches,
                else_expr,
            } => {
                let mut out = DataType::Null;
                for (cond, value) in branches {
                    cond.data_type(input)?;
                    let dt = value.data_type(input)?;
                    if out == DataType::Null {
                        out = dt;
                    }
                }
                if let Some(e) = else_expr {
                    let dt = e.data_type(input)?;
                    if out == DataType::Null {
                        out = dt;
                    }
                }
                Ok(out)
            }
        }
    }

    /// Conservative nullability against `input`.
    pub fn nullable(&self, input: &Schema) -> bool {
        match self {
            Expr::ColumnRef { index, .. } => input
                .fields()
                .get(*index)
                .map(|f| f.is_nullable())
                .unwrap_or(true),
            Expr::Literal(v) => matches!(v, LiteralValue::Null),
            Expr::BinaryOp { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                left.nullable(input) || right.nullable(input)
            }
            Expr::Cast { expr, .. } | Expr::Not(expr) => expr.nullable(input),
            Expr::CaseWhen {
                branches,
                else_expr,
            } => {
                branches.iter().any(|(_, v)| v.nullable(input))
                    || else_expr.as_ref().map_or(true, |e| e.nullable(input))
            }
        }
    }

    /// Collect positional column references.
    pub fn collect_column_indices(&self, out: &mut BTreeSet<usize>) {
        match self {
            Expr::ColumnRef { index, .. } => {
                out.insert(*index);
            }
            Expr::Literal(_) => {}
            Expr::BinaryOp { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                left.collect_column_indices(out);
                right.collect_column_indices(out);
            }
            Expr::Cast { expr, .. } | Expr::Not(expr) => expr.collect_column_indices(out),
            Expr::CaseWhen {
                branches,
                else_expr,
            } => {
                for (c, v) in branches {
                    c.collect_column_indices(out);
                    v.collect_column_indices(out);
                }
                if let Some(e) = else_expr {
                    e.collect_column_indices(out);
                }
            }
        }
    }

    /// Rewrite column positions through `mapping` (old index -> new index).
    pub fn remap_columns(&mut self, mapping: &HashMap<usize, usize>) -> Result<()> {
        match self {
            Expr::ColumnRef { name, index } => {
                *index = *mapping.get(index).ok_or_else(|| {
                    QuarryError::Planning(format!("column {name}#{index} has no remapped position"))
                })?;
                Ok(())
            }
            Expr::Literal(_) => Ok(()),
            Expr::BinaryOp { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                left.remap_columns(mapping)?;
                right.remap_columns(mapping)
            }
            Expr::Cast { expr, .. } | Expr::Not(expr) => expr.remap_columns(mapping),
            Expr::CaseWhen {
                branches,
                else_expr,
            } => {
                for (c, v) in branches.iter_mut() {
                    c.remap_columns(mapping)?;
                    v.remap_columns(mapping)?;
                }
                if let Some(e) = else_expr {
                    e.remap_columns(mapping)?;
                }
                Ok(())
            }
        }
    }

    /// Replace every column reference with the matching expression of `inputs`.
    ///
    /// Used to inline one projection into the next.
    pub fn substitute_columns(&self, inputs: &[(Expr, String)]) -> Option<Expr> {
        Some(match self {
            Expr::ColumnRef { index, .. } => inputs.get(*index)?.0.clone(),
            Expr::Literal(v) => Expr::Literal(v.clone()),
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(left.substitute_columns(inputs)?),
                op: *op,
                right: Box::new(right.substitute_columns(inputs)?),
            },
            Expr::Cast { expr, to_type } => Expr::Cast {
                expr: Box::new(expr.substitute_columns(inputs)?),
                to_type: to_type.clone(),
            },
            Expr::And(l, r) => Expr::And(
                Box::new(l.substitute_columns(inputs)?),
                Box::new(r.substitute_columns(inputs)?),
            ),
            Expr::Or(l, r) => Expr::Or(
                Box::new(l.substitute_columns(inputs)?),
                Box::new(r.substitute_columns(inputs)?),
            ),
            Expr::Not(e) => Expr::Not(Box::new(e.substitute_columns(inputs)?)),
            Expr::CaseWhen {
                branches,
                else_expr,
            } => Expr::CaseWhen {
                branches: branches
                    .iter()
                    .map(|(c, v)| Some((c.substitute_columns(inputs)?, v.substitute_columns(inputs)?)))
                    .collect::<Option<Vec<_>>>()?,
                else_expr: match else_expr {
                    Some(e) => Some(Box::new(e.substitute_columns(inputs)?)),
                    None => None,
                },
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggExpr {
    Count(Expr),
    Sum(Expr),
    Min(Expr),
    Max(Expr),
    Avg(Expr),
}

impl AggExpr {
    pub fn arg(&self) -> &Expr {
        match self {
            AggExpr::Count(e) | AggExpr::Sum(e) | AggExpr::Min(e) | AggExpr::Max(e) | AggExpr::Avg(e) => e,
        }
    }

    pub fn arg_mut(&mut self) -> &mut Expr {
        match self {
            AggExpr::Count(e) | AggExpr::Sum(e) | AggExpr::Min(e) | AggExpr::Max(e) | AggExpr::Avg(e) => e,
        }
    }

    pub fn function_name(&self) -> &'static str {
        match self {
            AggExpr::Count(_) => "count",
            AggExpr::Sum(_) => "sum",
            AggExpr::Min(_) => "min",
            AggExpr::Max(_) => "max",
            AggExpr::Avg(_) => "avg",
        }
    }

    /// Result type given the argument type.
    pub fn result_type(&self, arg_type: &DataType) -> DataType {
        match self {
            AggExpr::Count(_) => DataType::Int64,
            AggExpr::Avg(_) => DataType::Float64,
            AggExpr::Sum(_) | AggExpr::Min(_) | AggExpr::Max(_) => arg_type.clone(),
        }
    }
}

/// Sort key over the output columns of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExpr {
    pub expr: Expr,
    pub asc: bool,
    pub nulls_first: bool,
}

/// Whether an aggregation step produces final values or mergeable partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateMode {
    Final,
    Partial,
}

/// Logical query plan step tree.
///
/// Every step reports its output header through [`LogicalPlan::schema`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogicalPlan {
    /// Single row with a single `dummy` column; source of FROM-less selects.
    OneRow,
    /// Source that produces no rows but declares `schema`. Stands in for table
    /// reads when only the shape of the result is needed.
    EmptySource {
        table: String,
        schema: SchemaRef,
    },
    TableScan {
        table: String,
        projection: Option<Vec<String>>,
        filters: Vec<Expr>,
        schema: SchemaRef,
    },
    Filter {
        predicate: Expr,
        input: Box<LogicalPlan>,
    },
    Projection {
        exprs: Vec<(Expr, String)>,
        schema: SchemaRef,
        input: Box<LogicalPlan>,
    },
    Aggregate {
        group_exprs: Vec<(Expr, String)>,
        aggr_exprs: Vec<(AggExpr, String)>,
        mode: AggregateMode,
        schema: SchemaRef,
        input: Box<LogicalPlan>,
    },
    Distinct {
        input: Box<LogicalPlan>,
    },
    Sort {
        exprs: Vec<SortExpr>,
        input: Box<LogicalPlan>,
    },
    Limit {
        skip: usize,
        fetch: Option<usize>,
        input: Box<LogicalPlan>,
    },
    Union {
        inputs: Vec<LogicalPlan>,
        schema: SchemaRef,
    },
}

impl LogicalPlan {
    /// Output header of this step.
    pub fn schema(&self) -> SchemaRef {
        match self {
            LogicalPlan::OneRow => one_row_schema(),
            LogicalPlan::EmptySource { schema, .. }
            | LogicalPlan::TableScan { schema, .. }
            | LogicalPlan::Projection { schema, .. }
            | LogicalPlan::Aggregate { schema, .. }
            | LogicalPlan::Union { schema, .. } => Arc::clone(schema),
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Distinct { input }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => input.schema(),
        }
    }

    pub fn children(&self) -> Vec<&LogicalPlan> {
        match self {
            LogicalPlan::OneRow
            | LogicalPlan::EmptySource { .. }
            | LogicalPlan::TableScan { .. } => vec![],
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Projection { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Distinct { input }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => vec![input.as_ref()],
            LogicalPlan::Union { inputs, .. } => inputs.iter().collect(),
        }
    }
}

/// Header of [`LogicalPlan::OneRow`].
pub fn one_row_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    Arc::clone(SCHEMA.get_or_init(|| {
        Arc::new(Schema::new(vec![Field::new("dummy", DataType::UInt8, false)]))
    }))
}
