use crate::pool::EnvironmentPools;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use portway_core::endpoint::SqlEndpoint;
use portway_core::environment::EnvironmentSettings;
use portway_core::error::GatewayError;
use portway_odata::{SqlValue, TranslatedQuery};
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use std::time::Duration;
use tiberius::{ColumnData, FromSql, Query, Row};
use tracing::{debug, error};

static PROPERTY_NAME: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Result of a collection read. The statement fetched `top + 1` rows;
/// `has_more` reports whether the extra row existed. `rows` is already
/// trimmed to the page.
#[derive(Debug)]
pub struct CollectionResult {
    pub rows: Vec<Value>,
    pub has_more: bool,
    pub top: u32,
    pub skip: u32,
}

/// Runs translated statements and stored-procedure calls against the
/// per-environment pools, shaping rows back to JSON.
pub struct SqlExecutor {
    pools: EnvironmentPools,
    command_timeout: Duration,
}

impl SqlExecutor {
    pub fn new(pools: EnvironmentPools, command_timeout: Duration) -> Self {
        Self {
            pools,
            command_timeout,
        }
    }

    pub fn pools(&self) -> &EnvironmentPools {
        &self.pools
    }

    /// GET collection: run the translated query and trim to the page.
    pub async fn get_collection(
        &self,
        environment: &EnvironmentSettings,
        query: &TranslatedQuery,
    ) -> Result<CollectionResult, GatewayError> {
        let rows = self.fetch_rows(environment, &query.sql, &query.params).await?;

        let has_more = rows.len() as u64 > query.top as u64;
        let mut rows: Vec<Value> = rows.iter().map(row_to_json).collect();
        rows.truncate(query.top as usize);

        Ok(CollectionResult {
            rows,
            has_more,
            top: query.top,
            skip: query.skip,
        })
    }

    /// GET by id: a single row, or `None` for 404.
    pub async fn get_by_id(
        &self,
        environment: &EnvironmentSettings,
        query: &TranslatedQuery,
    ) -> Result<Option<Value>, GatewayError> {
        let rows = self.fetch_rows(environment, &query.sql, &query.params).await?;
        Ok(rows.first().map(row_to_json))
    }

    /// POST/PUT/DELETE through the endpoint's stored procedure.
    ///
    /// `properties` is the request body (or `{ <primaryKey>: id }` for
    /// DELETE); every key must be an allowed column alias. Returns the
    /// procedure's first result row, reshaped through `databaseToAlias`.
    pub async fn execute_procedure(
        &self,
        environment: &EnvironmentSettings,
        endpoint: &SqlEndpoint,
        method: &str,
        username: &str,
        properties: &Map<String, Value>,
    ) -> Result<Option<Value>, GatewayError> {
        let procedure = endpoint
            .procedure
            .as_deref()
            .ok_or_else(|| GatewayError::MethodNotAllowed(method.to_string()))?;

        let (sql, params) = build_procedure_call(endpoint, procedure, method, username, properties)?;
        let rows = self.fetch_rows(environment, &sql, &params).await?;

        Ok(rows.first().map(|row| reshape_row(row, endpoint)))
    }

    /// Run one statement and return its first result row as a JSON map.
    /// Used by the webhook ingester.
    pub async fn run_statement(
        &self,
        environment: &EnvironmentSettings,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<Map<String, Value>>, GatewayError> {
        let rows = self.fetch_rows(environment, sql, params).await?;
        Ok(rows.first().map(|row| match row_to_json(row) {
            Value::Object(map) => map,
            _ => Map::new(),
        }))
    }

    async fn fetch_rows(
        &self,
        environment: &EnvironmentSettings,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Row>, GatewayError> {
        let pool = self.pools.get(environment).await?;
        let mut conn = pool.get().await.map_err(|e| {
            error!(environment = %environment.name, error = %e, "SQL pool exhausted");
            GatewayError::UpstreamUnavailable
        })?;

        let mut query = Query::new(sql.to_string());
        for param in params {
            bind_value(&mut query, param);
        }

        debug!(environment = %environment.name, sql = %sql, "Executing SQL");

        let result = tokio::time::timeout(self.command_timeout, async {
            let stream = query.query(&mut *conn).await?;
            stream.into_first_result().await
        })
        .await
        .map_err(|_| GatewayError::Timeout)?;

        result.map_err(map_tiberius_error)
    }
}

fn bind_value<'a>(query: &mut Query<'a>, value: &'a SqlValue) {
    match value {
        SqlValue::String(s) => query.bind(s.as_str()),
        SqlValue::I64(n) => query.bind(*n),
        SqlValue::F64(f) => query.bind(*f),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Guid(g) => query.bind(*g),
        SqlValue::Date(d) => query.bind(*d),
        SqlValue::DateTime(dt) => query.bind(*dt),
        SqlValue::Null => query.bind(Option::<&str>::None),
    }
}

/// Build `EXEC [schema].[proc] @Method = @P1, @UserName = @P2, @prop = @Pn…`
/// with every value as a bound parameter.
pub(crate) fn build_procedure_call(
    endpoint: &SqlEndpoint,
    procedure: &str,
    method: &str,
    username: &str,
    properties: &Map<String, Value>,
) -> Result<(String, Vec<SqlValue>), GatewayError> {
    let mut params: Vec<SqlValue> = vec![
        SqlValue::String(method.to_string()),
        SqlValue::String(username.to_string()),
    ];
    let mut assignments = vec![
        "@Method = @P1".to_string(),
        "@UserName = @P2".to_string(),
    ];

    for (name, value) in properties {
        let accepted = endpoint.is_column_allowed(name) || name == &endpoint.primary_key;
        if !accepted || !PROPERTY_NAME.is_match(name) {
            return Err(GatewayError::Validation(format!(
                "property '{name}' is not an allowed column"
            )));
        }
        params.push(json_to_sql_value(value));
        assignments.push(format!("@{name} = @P{}", params.len()));
    }

    let sql = format!(
        "EXEC {} {}",
        qualify_procedure(&endpoint.schema, procedure),
        assignments.join(", ")
    );
    Ok((sql, params))
}

fn qualify_procedure(default_schema: &str, procedure: &str) -> String {
    match procedure.split_once('.') {
        Some((schema, name)) => format!("[{}].[{}]", schema.trim_matches(['[', ']']), name.trim_matches(['[', ']'])),
        None => format!("[{default_schema}].[{}]", procedure.trim_matches(['[', ']'])),
    }
}

fn json_to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::I64(i)
            } else {
                SqlValue::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::String(s.clone()),
        // Structured values travel as JSON text.
        other => SqlValue::String(other.to_string()),
    }
}

/// Convert a result row to a JSON object keyed by the statement's output
/// column names (already aliased for translated reads).
pub(crate) fn row_to_json(row: &Row) -> Value {
    let mut object = Map::new();
    for (column, data) in row.cells() {
        object.insert(column.name().to_string(), cell_to_json(data));
    }
    Value::Object(object)
}

/// As `row_to_json`, but remapping database column names to their aliases
/// (stored procedures return raw columns).
fn reshape_row(row: &Row, endpoint: &SqlEndpoint) -> Value {
    let mut object = Map::new();
    for (column, data) in row.cells() {
        let name = endpoint
            .database_to_alias
            .get(column.name())
            .cloned()
            .unwrap_or_else(|| column.name().to_string());
        object.insert(name, cell_to_json(data));
    }
    Value::Object(object)
}

fn cell_to_json(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(|n| json!(n)).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(|n| json!(n)).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(|n| json!(n)).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(|n| json!(n)).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|n| json!(n)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(|n| json!(n)).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(|b| json!(b)).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| json!(s.as_ref()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v.map(|g| json!(g.to_string())).unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v
            .map(|n| json!(n.value() as f64 / 10f64.powi(n.scale() as i32)))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| json!(base64::engine::general_purpose::STANDARD.encode(b.as_ref())))
            .unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| json!(x.as_ref().to_string()))
            .unwrap_or(Value::Null),
        data @ ColumnData::Date(_) => NaiveDate::from_sql(data)
            .ok()
            .flatten()
            .map(|d| json!(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        data @ ColumnData::Time(_) => NaiveTime::from_sql(data)
            .ok()
            .flatten()
            .map(|t| json!(t.format("%H:%M:%S%.3f").to_string()))
            .unwrap_or(Value::Null),
        data @ (ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_)) => {
            NaiveDateTime::from_sql(data)
                .ok()
                .flatten()
                .map(|dt| json!(dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()))
                .unwrap_or(Value::Null)
        }
        data @ ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(data)
            .ok()
            .flatten()
            .map(|dt| json!(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
    }
}

/// Map a driver error to a gateway error. Constraint-class server errors
/// surface a sanitised 400; everything else is logged and collapses to a
/// generic 500.
fn map_tiberius_error(err: tiberius::error::Error) -> GatewayError {
    if let tiberius::error::Error::Server(token) = &err {
        let code = token.code();
        if let Some(message) = user_message_for_code(code) {
            debug!(code, "Constraint violation surfaced to client");
            return GatewayError::Validation(message.to_string());
        }
        error!(code, message = %token.message(), "SQL Server error");
        return GatewayError::Internal(format!("sql server error {code}"));
    }
    error!(error = %err, "SQL driver error");
    GatewayError::Internal("sql driver error".to_string())
}

/// Vendor error codes that are safe (and useful) to explain to callers.
fn user_message_for_code(code: u32) -> Option<&'static str> {
    match code {
        2601 | 2627 => Some("A record with the same key already exists"),
        547 => Some("The change conflicts with a reference constraint"),
        515 => Some("A required field is missing or null"),
        8152 | 2628 => Some("A value is too long for the target column"),
        245 | 8114 => Some("A value has the wrong type for the target column"),
        _ => None,
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
        let database_to_alias = alias_to_database
            .iter()
            .map(|(a, c)| (c.clone(), a.clone()))
            .collect();
        SqlEndpoint {
            schema: "dbo".into(),
            object_name: "Products".into(),
            primary_key: "ItemCode".into(),
            allowed_columns: vec!["Code".into(), "Name".into()],
            alias_to_database,
            database_to_alias,
            procedure: Some("ManageProducts".into()),
            command_timeout_secs: 30,
        }
    }

    #[test]
    fn test_procedure_call_shape() {
        let mut body = Map::new();
        body.insert("Code".into(), json!("X-1"));
        body.insert("Name".into(), json!("Widget"));

        let (sql, params) =
            build_procedure_call(&products(), "ManageProducts", "INSERT", "svc-orders", &body)
                .unwrap();

        assert!(sql.starts_with("EXEC [dbo].[ManageProducts] @Method = @P1, @UserName = @P2"));
        assert!(sql.contains("@Code = @P3"));
        assert!(sql.contains("@Name = @P4"));
        assert_eq!(params[0], SqlValue::String("INSERT".into()));
        assert_eq!(params[1], SqlValue::String("svc-orders".into()));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_procedure_rejects_unknown_property() {
        let mut body = Map::new();
        body.insert("Hidden".into(), json!(1));

        let err = build_procedure_call(&products(), "ManageProducts", "UPDATE", "svc", &body)
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_procedure_accepts_primary_key_for_delete() {
        let mut body = Map::new();
        body.insert("ItemCode".into(), json!("X-1"));

        let (sql, params) =
            build_procedure_call(&products(), "ManageProducts", "DELETE", "svc", &body).unwrap();
        assert!(sql.contains("@ItemCode = @P3"));
        assert_eq!(params[0], SqlValue::String("DELETE".into()));
    }

    #[test]
    fn test_qualified_procedure_names() {
        assert_eq!(qualify_procedure("dbo", "Manage"), "[dbo].[Manage]");
        assert_eq!(qualify_procedure("dbo", "sales.Manage"), "[sales].[Manage]");
        assert_eq!(qualify_procedure("dbo", "[sales].[Manage]"), "[sales].[Manage]");
    }

    #[test]
    fn test_json_to_sql_value_conversion() {
        assert_eq!(json_to_sql_value(&json!(null)), SqlValue::Null);
        assert_eq!(json_to_sql_value(&json!(true)), SqlValue::Bool(true));
        assert_eq!(json_to_sql_value(&json!(42)), SqlValue::I64(42));
        assert_eq!(json_to_sql_value(&json!(1.5)), SqlValue::F64(1.5));
        assert_eq!(
            json_to_sql_value(&json!("text")),
            SqlValue::String("text".into())
        );
        // Nested structures travel as JSON text
        assert_eq!(
            json_to_sql_value(&json!({"a": 1})),
            SqlValue::String("{\"a\":1}".into())
        );
    }

    #[test]
    fn test_vendor_code_mapping() {
        assert!(user_message_for_code(2627).unwrap().contains("same key"));
        assert!(user_message_for_code(2601).is_some());
        assert!(user_message_for_code(547).unwrap().contains("constraint"));
        assert!(user_message_for_code(515).is_some());
        // Login failures and the like stay generic
        assert!(user_message_for_code(18456).is_none());
        assert!(user_message_for_code(208).is_none());
    }
}
