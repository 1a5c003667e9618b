use std::fmt;

use sqlparser::ast::{Query, SetExpr, SetOperator, Statement};

/// A parsed statement tagged by the shape of its top-level query node.
///
/// Classification rules:
/// - body `SELECT` is [`RawQuery::Select`];
/// - body `UNION [ALL|DISTINCT]` is [`RawQuery::SelectUnion`];
/// - a bare parenthesized query is [`RawQuery::Subquery`]. Nested parentheses
///   are collapsed, so the child is never itself a `Subquery`;
/// - a parenthesized query carrying its own `WITH`/`ORDER BY`/`LIMIT`/`OFFSET`/
///   `FETCH` is a single-branch [`RawQuery::SelectUnion`];
/// - everything else (DML, DDL, `VALUES`, `INTERSECT`, `EXCEPT`) is
///   [`RawQuery::Other`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawQuery {
    /// Union of selects.
    SelectUnion(Box<Query>),
    /// Single select.
    Select(Box<Query>),
    /// Parenthesized query wrapping exactly one child.
    Subquery(Box<RawQuery>),
    /// Any statement that is not a select-shaped query.
    Other(Box<Statement>),
}

/// Discriminant of [`RawQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawQueryKind {
    /// See [`RawQuery::SelectUnion`].
    SelectUnion,
    /// See [`RawQuery::Select`].
    Select,
    /// See [`RawQuery::Subquery`].
    Subquery,
    /// See [`RawQuery::Other`].
    Other,
}

impl RawQuery {
    /// Classify a parsed statement.
    pub fn from_statement(stmt: Statement) -> Self {
        match stmt {
            Statement::Query(q) => Self::from_query(*q),
            other => RawQuery::Other(Box::new(other)),
        }
    }

    /// Classify a query.
    pub fn from_query(query: Query) -> Self {
        match query.body.as_ref() {
            SetExpr::Select(_) => RawQuery::Select(Box::new(query)),
            SetExpr::SetOperation {
                op: SetOperator::Union,
                ..
            } => RawQuery::SelectUnion(Box::new(query)),
            SetExpr::Query(_) if has_outer_modifiers(&query) => {
                RawQuery::SelectUnion(Box::new(query))
            }
            SetExpr::Query(inner) => match Self::from_query(inner.as_ref().clone()) {
                RawQuery::Subquery(child) => RawQuery::Subquery(child),
                child => RawQuery::Subquery(Box::new(child)),
            },
            _ => RawQuery::Other(Box::new(Statement::Query(Box::new(query)))),
        }
    }

    pub fn kind(&self) -> RawQueryKind {
        match self {
            RawQuery::SelectUnion(_) => RawQueryKind::SelectUnion,
            RawQuery::Select(_) => RawQueryKind::Select,
            RawQuery::Subquery(_) => RawQueryKind::Subquery,
            RawQuery::Other(_) => RawQueryKind::Other,
        }
    }
}

fn has_outer_modifiers(query: &Query) -> bool {
    query.with.is_some()
        || query.order_by.is_some()
        || query.limit.is_some()
        || query.offset.is_some()
        || query.fetch.is_some()
}

impl fmt::Display for RawQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawQuery::SelectUnion(q) | RawQuery::Select(q) => write!(f, "{q}"),
            RawQuery::Subquery(child) => write!(f, "({child})"),
            RawQuery::Other(stmt) => write!(f, "{stmt}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RawQuery, RawQueryKind};
    use crate::parse_query;

    fn kind_of(sql: &str) -> RawQueryKind {
        parse_query(sql).expect("parse").kind()
    }

    #[test]
    fn classifies_top_level_shapes() {
        assert_eq!(kind_of("SELECT 1"), RawQueryKind::Select);
        assert_eq!(
            kind_of("SELECT 1 UNION ALL SELECT 2"),
            RawQueryKind::SelectUnion
        );
        assert_eq!(kind_of("(SELECT 1)"), RawQueryKind::Subquery);
        assert_eq!(kind_of("(SELECT 1) LIMIT 1"), RawQueryKind::SelectUnion);
        assert_eq!(kind_of("SELECT 1 INTERSECT SELECT 1"), RawQueryKind::Other);
        assert_eq!(kind_of("CREATE TABLE t (a INT)"), RawQueryKind::Other);
    }

    #[test]
    fn nested_parentheses_collapse_to_one_subquery() {
        match parse_query("((SELECT 1))").expect("parse") {
            RawQuery::Subquery(child) => assert_eq!(child.kind(), RawQueryKind::Select),
            other => panic!("expected subquery, got {other:?}"),
        }
    }

    #[test]
    fn multiple_statements_are_rejected() {
        assert!(parse_query("SELECT 1; SELECT 2").is_err());
    }
}
