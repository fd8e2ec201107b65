//! Translation of the supported OData subset
//! (`$top`, `$skip`, `$select`, `$filter`, `$orderby`) into parameterised
//! T-SQL against a catalog-declared alias mapping.
//!
//! Field references are resolved through the endpoint's alias map and
//! rejected when outside `allowedColumns`; every user-supplied value is
//! emitted as a bound parameter, never as SQL text.

pub mod lexer;
pub mod parser;
pub mod sql;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ODataError {
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("syntax error in {clause}: {message}")]
    Syntax { clause: &'static str, message: String },

    #[error("$top must not exceed {0}")]
    TopTooLarge(u32),

    #[error("invalid literal: {0}")]
    InvalidLiteral(String),
}

/// A value bound to one `@Pn` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Guid(uuid::Uuid),
    Date(chrono::NaiveDate),
    DateTime(chrono::DateTime<chrono::Utc>),
    Null,
}

/// Raw query options as extracted from the request URL.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top: Option<u32>,
    pub skip: Option<u32>,
    pub select: Option<String>,
    pub filter: Option<String>,
    pub orderby: Option<String>,
}

/// The id extracted from an `Endpoint(<literal>)` path segment.
#[derive(Debug, Clone, PartialEq)]
pub enum IdLiteral {
    Int(i64),
    Str(String),
    Guid(uuid::Uuid),
}

/// A ready-to-execute statement.
#[derive(Debug, Clone)]
pub struct TranslatedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// The page size requested (the statement fetches `top + 1` rows).
    pub top: u32,
    pub skip: u32,
    /// Aliases in output order, for row reshaping.
    pub select_aliases: Vec<String>,
}

pub use sql::{build_by_id_query, build_collection_query};
