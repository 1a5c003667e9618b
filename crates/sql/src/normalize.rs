use std::fmt;

use quarry_common::{QuarryError, Result};
use sqlparser::ast::Query;

use crate::raw_query::RawQuery;

/// Top-level query after normalization: always a select or a union of selects.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalQuery {
    /// Union of selects (possibly a single parenthesized branch with modifiers).
    SelectUnion(Box<Query>),
    /// Single select.
    Select(Box<Query>),
}

impl CanonicalQuery {
    /// Parse and normalize SQL text.
    pub fn parse(sql: &str) -> Result<Self> {
        normalize_query(crate::parse_query(sql)?)
    }

    pub fn query(&self) -> &Query {
        match self {
            CanonicalQuery::SelectUnion(q) | CanonicalQuery::Select(q) => q,
        }
    }
}

impl fmt::Display for CanonicalQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.query())
    }
}

impl From<CanonicalQuery> for RawQuery {
    fn from(q: CanonicalQuery) -> Self {
        match q {
            CanonicalQuery::SelectUnion(q) => RawQuery::SelectUnion(q),
            CanonicalQuery::Select(q) => RawQuery::Select(q),
        }
    }
}

/// Reduce a raw query to its canonical top-level node.
///
/// Selects and unions pass through unchanged; a parenthesized subquery yields
/// its child. The parser already collapsed nested parentheses, so no
/// recursive unwrapping happens here. Anything else fails with
/// [`QuarryError::UnsupportedQueryShape`] carrying the node's SQL text.
pub fn normalize_query(raw: RawQuery) -> Result<CanonicalQuery> {
    match raw {
        RawQuery::SelectUnion(q) => Ok(CanonicalQuery::SelectUnion(q)),
        RawQuery::Select(q) => Ok(CanonicalQuery::Select(q)),
        RawQuery::Subquery(child) => match *child {
            RawQuery::SelectUnion(q) => Ok(CanonicalQuery::SelectUnion(q)),
            RawQuery::Select(q) => Ok(CanonicalQuery::Select(q)),
            other => Err(QuarryError::UnsupportedQueryShape(other.to_string())),
        },
        other => Err(QuarryError::UnsupportedQueryShape(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_query, CanonicalQuery};
    use crate::parse_query;
    use crate::raw_query::RawQuery;
    use quarry_common::QuarryError;

    #[test]
    fn select_and_union_are_identity() {
        for sql in ["SELECT 1", "SELECT a FROM t UNION ALL SELECT b FROM u"] {
            let raw = parse_query(sql).expect("parse");
            let expected = raw.clone();
            let canonical = normalize_query(raw).expect("normalize");
            assert_eq!(RawQuery::from(canonical), expected);
        }
    }

    #[test]
    fn subquery_yields_its_child() {
        let raw = parse_query("(SELECT 1 UNION DISTINCT SELECT 2)").expect("parse");
        let child = match &raw {
            RawQuery::Subquery(child) => child.as_ref().clone(),
            other => panic!("expected subquery, got {other:?}"),
        };
        let canonical = normalize_query(raw).expect("normalize");
        assert!(matches!(canonical, CanonicalQuery::SelectUnion(_)));
        assert_eq!(RawQuery::from(canonical), child);
    }

    #[test]
    fn other_shapes_are_rejected_with_rendered_node() {
        let raw = parse_query("INSERT INTO t VALUES (1)").expect("parse");
        match normalize_query(raw) {
            Err(QuarryError::UnsupportedQueryShape(text)) => {
                assert!(text.contains("INSERT INTO t"), "got {text}");
            }
            other => panic!("expected UnsupportedQueryShape, got {other:?}"),
        }
    }

    #[test]
    fn subquery_around_other_shape_is_rejected() {
        let raw = parse_query("(SELECT 1 EXCEPT SELECT 2)").expect("parse");
        assert!(matches!(
            normalize_query(raw),
            Err(QuarryError::UnsupportedQueryShape(_))
        ));
    }
}
