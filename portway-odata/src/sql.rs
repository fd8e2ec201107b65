use crate::parser::{self, FilterExpr, OrderByItem, StringFn};
use crate::{IdLiteral, ODataError, QueryOptions, SqlValue, TranslatedQuery};
use portway_core::endpoint::SqlEndpoint;

/// Page size applied when the request carries no `$top`.
const DEFAULT_TOP: u32 = 50;

/// Accumulates bound parameters and hands out `@Pn` placeholders
/// (1-based, the TDS convention).
struct ParamBinder {
    params: Vec<SqlValue>,
}

impl ParamBinder {
    fn new() -> Self {
        Self { params: Vec::new() }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("@P{}", self.params.len())
    }
}

fn resolve<'a>(endpoint: &'a SqlEndpoint, alias: &str) -> Result<&'a str, ODataError> {
    endpoint
        .alias_to_database
        .get(alias)
        .map(String::as_str)
        .ok_or_else(|| ODataError::UnknownField(alias.to_string()))
}

/// Build the SELECT for a collection request.
///
/// The statement fetches `top + 1` rows so the caller can detect a further
/// page without a second round-trip.
pub fn build_collection_query(
    endpoint: &SqlEndpoint,
    options: &QueryOptions,
    max_top: u32,
) -> Result<TranslatedQuery, ODataError> {
    let top = options.top.unwrap_or_else(|| DEFAULT_TOP.min(max_top));
    if top > max_top {
        return Err(ODataError::TopTooLarge(max_top));
    }
    let skip = options.skip.unwrap_or(0);

    let mut binder = ParamBinder::new();

    let (column_list, select_aliases) = build_select(endpoint, options.select.as_deref())?;

    let where_clause = match &options.filter {
        Some(filter) => {
            let expr = parser::parse_filter(filter)?;
            Some(emit_filter(endpoint, &expr, &mut binder)?)
        }
        None => None,
    };

    let order_clause = build_orderby(endpoint, options.orderby.as_deref())?;

    let fetch = top as u64 + 1;
    let mut sql = String::new();
    if skip == 0 {
        sql.push_str(&format!("SELECT TOP ({fetch}) {column_list} FROM {}", endpoint.qualified_object()));
        if let Some(where_clause) = &where_clause {
            sql.push_str(&format!(" WHERE {where_clause}"));
        }
        sql.push_str(&format!(" ORDER BY {order_clause}"));
    } else {
        sql.push_str(&format!("SELECT {column_list} FROM {}", endpoint.qualified_object()));
        if let Some(where_clause) = &where_clause {
            sql.push_str(&format!(" WHERE {where_clause}"));
        }
        sql.push_str(&format!(
            " ORDER BY {order_clause} OFFSET {skip} ROWS FETCH NEXT {fetch} ROWS ONLY"
        ));
    }

    Ok(TranslatedQuery {
        sql,
        params: binder.params,
        top,
        skip,
        select_aliases,
    })
}

/// Build the SELECT for an id-addressed request
/// (`Endpoint(42)`, `Endpoint('v')`, `Endpoint(guid'…')`).
///
/// Equivalent to a synthesised `primaryKey eq <id>` filter with `$top`
/// forced to 1. The primary key is a database column and bypasses alias
/// resolution.
pub fn build_by_id_query(
    endpoint: &SqlEndpoint,
    id: &IdLiteral,
) -> Result<TranslatedQuery, ODataError> {
    let mut binder = ParamBinder::new();
    let (column_list, select_aliases) = build_select(endpoint, None)?;

    let value = match id {
        IdLiteral::Int(n) => SqlValue::I64(*n),
        IdLiteral::Str(s) => SqlValue::String(s.clone()),
        IdLiteral::Guid(g) => SqlValue::Guid(*g),
    };
    let placeholder = binder.bind(value);

    let sql = format!(
        "SELECT TOP (1) {column_list} FROM {} WHERE [{}] = {placeholder}",
        endpoint.qualified_object(),
        endpoint.primary_key,
    );

    Ok(TranslatedQuery {
        sql,
        params: binder.params,
        top: 1,
        skip: 0,
        select_aliases,
    })
}

fn build_select(
    endpoint: &SqlEndpoint,
    select: Option<&str>,
) -> Result<(String, Vec<String>), ODataError> {
    let aliases = match select {
        Some(select) => parser::parse_select(select)?,
        None => endpoint.allowed_columns.clone(),
    };
    if aliases.is_empty() {
        return Err(ODataError::Syntax {
            clause: "$select",
            message: "endpoint exposes no columns".into(),
        });
    }

    let mut parts = Vec::with_capacity(aliases.len());
    for alias in &aliases {
        let column = resolve(endpoint, alias)?;
        if column == alias {
            parts.push(format!("[{column}]"));
        } else {
            parts.push(format!("[{column}] AS [{alias}]"));
        }
    }
    Ok((parts.join(", "), aliases))
}

fn build_orderby(endpoint: &SqlEndpoint, orderby: Option<&str>) -> Result<String, ODataError> {
    let mut parts = Vec::new();
    let mut pk_present = false;

    if let Some(orderby) = orderby {
        for OrderByItem { field, descending } in parser::parse_orderby(orderby)? {
            let column = resolve(endpoint, &field)?;
            if column == endpoint.primary_key {
                pk_present = true;
            }
            parts.push(format!(
                "[{column}] {}",
                if descending { "DESC" } else { "ASC" }
            ));
        }
    }

    // Trailing primary-key tiebreaker keeps paging stable.
    if !pk_present {
        parts.push(format!("[{}] ASC", endpoint.primary_key));
    }
    Ok(parts.join(", "))
}

fn emit_filter(
    endpoint: &SqlEndpoint,
    expr: &FilterExpr,
    binder: &mut ParamBinder,
) -> Result<String, ODataError> {
    match expr {
        FilterExpr::Compare { field, op, value } => {
            let column = resolve(endpoint, field)?;
            if *value == SqlValue::Null {
                return Ok(match op {
                    parser::CompareOp::Eq => format!("[{column}] IS NULL"),
                    _ => format!("[{column}] IS NOT NULL"),
                });
            }
            let placeholder = binder.bind(value.clone());
            Ok(format!("[{column}] {} {placeholder}", op.sql()))
        }
        FilterExpr::Function { func, field, value } => {
            let column = resolve(endpoint, field)?;
            let pattern = match func {
                StringFn::Contains => format!("%{value}%"),
                StringFn::StartsWith => format!("{value}%"),
                StringFn::EndsWith => format!("%{value}"),
            };
            let placeholder = binder.bind(SqlValue::String(pattern));
            Ok(format!("[{column}] LIKE {placeholder}"))
        }
        FilterExpr::And(left, right) => Ok(format!(
            "({} AND {})",
            emit_filter(endpoint, left, binder)?,
            emit_filter(endpoint, right, binder)?
        )),
        FilterExpr::Or(left, right) => Ok(format!(
            "({} OR {})",
            emit_filter(endpoint, left, binder)?,
            emit_filter(endpoint, right, binder)?
        )),
        FilterExpr::Not(inner) => Ok(format!("NOT ({})", emit_filter(endpoint, inner, binder)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn products() -> SqlEndpoint {
        let mut alias_to_database = HashMap::new();
        alias_to_database.insert("Code".to_string(), "ItemCode".to_string());
        alias_to_database.insert("Name".to_string(), "Description".to_string());
        alias_to_database.insert("Price".to_string(), "Price".to_string());
        let database_to_alias = alias_to_database
            .iter()
            .map(|(a, c)| (c.clone(), a.clone()))
            .collect();
        SqlEndpoint {
            schema: "dbo".into(),
            object_name: "Products".into(),
            primary_key: "ItemCode".into(),
            allowed_columns: vec!["Code".into(), "Name".into(), "Price".into()],
            alias_to_database,
            database_to_alias,
            procedure: None,
            command_timeout_secs: 30,
        }
    }

    #[test]
    fn test_collection_query_with_alias_and_filter() {
        let options = QueryOptions {
            top: Some(2),
            select: Some("Code".into()),
            filter: Some("Name eq 'Widget'".into()),
            ..Default::default()
        };
        let q = build_collection_query(&products(), &options, 1000).unwrap();
        assert_eq!(
            q.sql,
            "SELECT TOP (3) [ItemCode] AS [Code] FROM [dbo].[Products] \
             WHERE [Description] = @P1 ORDER BY [ItemCode] ASC"
        );
        assert_eq!(q.params, vec![SqlValue::String("Widget".into())]);
        assert_eq!(q.top, 2);
        assert_eq!(q.select_aliases, vec!["Code"]);
    }

    #[test]
    fn test_skip_uses_offset_fetch() {
        let options = QueryOptions {
            top: Some(10),
            skip: Some(20),
            orderby: Some("Name desc".into()),
            ..Default::default()
        };
        let q = build_collection_query(&products(), &options, 1000).unwrap();
        assert!(q.sql.contains("ORDER BY [Description] DESC, [ItemCode] ASC"));
        assert!(q.sql.contains("OFFSET 20 ROWS FETCH NEXT 11 ROWS ONLY"));
        assert!(!q.sql.contains("TOP"));
    }

    #[test]
    fn test_orderby_on_primary_key_gets_no_duplicate_tiebreaker() {
        let options = QueryOptions {
            orderby: Some("Code".into()),
            ..Default::default()
        };
        let q = build_collection_query(&products(), &options, 1000).unwrap();
        assert!(q.sql.ends_with("ORDER BY [ItemCode] ASC"));
    }

    #[test]
    fn test_unknown_alias_rejected_everywhere() {
        // No alias outside allowedColumns may reach the SQL text.
        let endpoint = products();
        for options in [
            QueryOptions {
                select: Some("Secret".into()),
                ..Default::default()
            },
            QueryOptions {
                filter: Some("Secret eq 1".into()),
                ..Default::default()
            },
            QueryOptions {
                filter: Some("Name eq 'x' or Secret eq 1".into()),
                ..Default::default()
            },
            QueryOptions {
                orderby: Some("Secret".into()),
                ..Default::default()
            },
        ] {
            let err = build_collection_query(&endpoint, &options, 1000).unwrap_err();
            assert_eq!(err, ODataError::UnknownField("Secret".into()));
        }
    }

    #[test]
    fn test_database_column_name_is_not_an_alias() {
        // The external surface speaks aliases only.
        let options = QueryOptions {
            filter: Some("ItemCode eq 'X'".into()),
            ..Default::default()
        };
        assert_eq!(
            build_collection_query(&products(), &options, 1000).unwrap_err(),
            ODataError::UnknownField("ItemCode".into())
        );
    }

    #[test]
    fn test_top_cap() {
        let options = QueryOptions {
            top: Some(5000),
            ..Default::default()
        };
        assert_eq!(
            build_collection_query(&products(), &options, 1000).unwrap_err(),
            ODataError::TopTooLarge(1000)
        );
    }

    #[test]
    fn test_boolean_operators_and_parentheses() {
        let options = QueryOptions {
            filter: Some("Price gt 10 and (Name eq 'A' or not Code eq 'B')".into()),
            ..Default::default()
        };
        let q = build_collection_query(&products(), &options, 1000).unwrap();
        assert!(q.sql.contains(
            "([Price] > @P1 AND ([Description] = @P2 OR NOT ([ItemCode] = @P3)))"
        ));
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn test_string_functions_emit_like_patterns() {
        let options = QueryOptions {
            filter: Some("contains(Name,'gear') and startswith(Code,'X-') and endswith(Name,'kit')".into()),
            ..Default::default()
        };
        let q = build_collection_query(&products(), &options, 1000).unwrap();
        assert_eq!(
            q.params,
            vec![
                SqlValue::String("%gear%".into()),
                SqlValue::String("X-%".into()),
                SqlValue::String("%kit".into()),
            ]
        );
        assert!(q.sql.contains("[Description] LIKE @P1"));
    }

    #[test]
    fn test_null_comparisons_emit_is_null() {
        let options = QueryOptions {
            filter: Some("Name eq null or Code ne null".into()),
            ..Default::default()
        };
        let q = build_collection_query(&products(), &options, 1000).unwrap();
        assert!(q.sql.contains("[Description] IS NULL"));
        assert!(q.sql.contains("[ItemCode] IS NOT NULL"));
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_values_never_appear_in_sql_text() {
        let options = QueryOptions {
            filter: Some("Name eq 'Robert''); DROP TABLE Products;--'".into()),
            ..Default::default()
        };
        let q = build_collection_query(&products(), &options, 1000).unwrap();
        assert!(!q.sql.contains("DROP TABLE"));
        assert_eq!(
            q.params,
            vec![SqlValue::String("Robert'); DROP TABLE Products;--".into())]
        );
    }

    #[test]
    fn test_by_id_string() {
        let q = build_by_id_query(&products(), &IdLiteral::Str("X-1".into())).unwrap();
        assert_eq!(
            q.sql,
            "SELECT TOP (1) [ItemCode] AS [Code], [Description] AS [Name], [Price] \
             FROM [dbo].[Products] WHERE [ItemCode] = @P1"
        );
        assert_eq!(q.params, vec![SqlValue::String("X-1".into())]);
        assert_eq!(q.top, 1);
    }

    #[test]
    fn test_by_id_int_and_guid() {
        let q = build_by_id_query(&products(), &IdLiteral::Int(42)).unwrap();
        assert_eq!(q.params, vec![SqlValue::I64(42)]);

        let guid = uuid::Uuid::parse_str("0e7d3bfc-8ac5-47e5-a2e8-5bafe25a4f9f").unwrap();
        let q = build_by_id_query(&products(), &IdLiteral::Guid(guid)).unwrap();
        assert_eq!(q.params, vec![SqlValue::Guid(guid)]);
    }

    #[test]
    fn test_default_select_lists_all_aliases_in_order() {
        let q = build_collection_query(&products(), &QueryOptions::default(), 1000).unwrap();
        assert_eq!(q.select_aliases, vec!["Code", "Name", "Price"]);
        assert_eq!(q.top, 50);
    }
}
