use crate::executor::SqlExecutor;
use chrono::Utc;
use portway_core::endpoint::WebhookEndpoint;
use portway_core::environment::EnvironmentSettings;
use portway_core::error::GatewayError;
use portway_odata::SqlValue;
use serde_json::{Value, json};
use tracing::info;

/// Inserts validated webhook payloads into the endpoint's inbox table.
///
/// Id validation against the endpoint's allow-list happens at dispatch;
/// this layer owns the INSERT and the returned row id.
pub struct WebhookIngester<'a> {
    executor: &'a SqlExecutor,
}

impl<'a> WebhookIngester<'a> {
    pub fn new(executor: &'a SqlExecutor) -> Self {
        Self { executor }
    }

    /// Insert one payload; returns `{ "Id": <new row id> }`.
    ///
    /// The payload must already be validated as JSON text; it is stored
    /// verbatim, not re-serialised.
    pub async fn ingest(
        &self,
        environment: &EnvironmentSettings,
        endpoint: &WebhookEndpoint,
        webhook_id: &str,
        payload: &str,
    ) -> Result<Value, GatewayError> {
        let (sql, params) = build_insert(endpoint, webhook_id, payload);
        let row = self
            .executor
            .run_statement(environment, &sql, &params)
            .await?
            .ok_or_else(|| GatewayError::Internal("webhook insert returned no row".into()))?;

        let id = row.get("Id").cloned().unwrap_or(Value::Null);
        info!(webhook_id = %webhook_id, "Webhook payload stored");
        Ok(json!({ "Id": id }))
    }
}

fn build_insert(
    endpoint: &WebhookEndpoint,
    webhook_id: &str,
    payload: &str,
) -> (String, Vec<SqlValue>) {
    let sql = format!(
        "INSERT INTO [{}].[{}] ([WebhookId], [Payload], [ReceivedAt]) \
         OUTPUT INSERTED.[Id] AS [Id] VALUES (@P1, @P2, @P3)",
        endpoint.schema, endpoint.table_name
    );
    let params = vec![
        SqlValue::String(webhook_id.to_string()),
        SqlValue::String(payload.to_string()),
        SqlValue::DateTime(Utc::now()),
    ];
    (sql, params)
}
