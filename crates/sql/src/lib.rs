//! SQL syntax layer: parsing, top-level query classification and normalization.
//!
//! Key modules:
//! - [`raw_query`]: tags a parsed statement by query shape
//! - [`normalize`]: reduces a [`RawQuery`] to a [`CanonicalQuery`]

pub mod normalize;
pub mod raw_query;

use quarry_common::{QuarryError, Result};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

pub use normalize::{normalize_query, CanonicalQuery};
pub use raw_query::{RawQuery, RawQueryKind};

pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| QuarryError::Planning(e.to_string()))
}

/// Parse exactly one statement and classify its top-level shape.
pub fn parse_query(sql: &str) -> Result<RawQuery> {
    let mut stmts = parse_sql(sql)?;
    if stmts.len() != 1 {
        return Err(QuarryError::Unsupported(format!(
            "expected exactly one statement, got {}",
            stmts.len()
        )));
    }
    Ok(RawQuery::from_statement(stmts.remove(0)))
}
