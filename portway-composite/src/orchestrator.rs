use crate::template;
use async_trait::async_trait;
use chrono::Utc;
use portway_core::endpoint::{CompositeEndpoint, CompositeStep};
use portway_core::error::GatewayError;
use portway_core::response::GatewayResponse;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

/// The in-process dispatcher seam. The orchestrator never sees the
/// dispatcher type itself (the trait breaks the cycle between the two),
/// and calls carry the authenticated principal, not the raw token.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(
        &self,
        environment: &str,
        endpoint: &str,
        method: &str,
        body: Value,
    ) -> Result<GatewayResponse, GatewayError>;
}

pub struct CompositeOrchestrator;

impl CompositeOrchestrator {
    /// Execute a composite endpoint against a request body.
    ///
    /// Steps run in declaration order, which the catalog has already
    /// verified to be a valid topological order of `dependsOn` (a step may
    /// only depend on an earlier one). The first failing step aborts the
    /// whole composite; nothing is compensated.
    pub async fn execute(
        invoker: &dyn StepInvoker,
        composite: &CompositeEndpoint,
        environment: &str,
        username: &str,
        request_id: &str,
        body: &Value,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut recorded: Map<String, Value> = Map::new();
        let context = build_context(environment, username);

        for step in &composite.steps {
            debug!(step = %step.name, endpoint = %step.target_endpoint, "Executing composite step");

            let outcome = if step.is_array {
                Self::execute_array_step(
                    invoker,
                    step,
                    environment,
                    request_id,
                    body,
                    &recorded,
                    &context,
                )
                .await?
            } else {
                let input = resolve_input(step, body)?;
                let input = template::apply_transformations(
                    input,
                    &step.template_transformations,
                    request_id,
                    &recorded,
                    &context,
                )?;
                Self::execute_single(invoker, step, environment, input).await?
            };

            match outcome {
                StepOutcome::Success(value) => {
                    recorded.insert(step.name.clone(), value);
                }
                StepOutcome::Failure { status, detail } => {
                    info!(step = %step.name, status, "Composite aborted by failing step");
                    return Ok(failure_response(&step.name, status, detail, request_id));
                }
            }
        }

        Ok(GatewayResponse::json(
            200,
            &json!({
                "RequestId": request_id,
                "Steps": Value::Object(recorded),
            }),
        ))
    }

    async fn execute_array_step(
        invoker: &dyn StepInvoker,
        step: &CompositeStep,
        environment: &str,
        request_id: &str,
        body: &Value,
        recorded: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<StepOutcome, GatewayError> {
        // The catalog rejects array steps without an ArrayProperty.
        let property = step.array_property.as_deref().ok_or_else(|| {
            GatewayError::Internal(format!("array step '{}' has no array property", step.name))
        })?;
        let items = body
            .get(property)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                GatewayError::Validation(format!("body property '{property}' must be an array"))
            })?;

        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            let input = template::apply_transformations(
                item.clone(),
                &step.template_transformations,
                request_id,
                recorded,
                context,
            )?;
            match Self::execute_single(invoker, step, environment, input).await? {
                StepOutcome::Success(value) => responses.push(value),
                failure @ StepOutcome::Failure { .. } => return Ok(failure),
            }
        }
        Ok(StepOutcome::Success(Value::Array(responses)))
    }

    async fn execute_single(
        invoker: &dyn StepInvoker,
        step: &CompositeStep,
        environment: &str,
        input: Value,
    ) -> Result<StepOutcome, GatewayError> {
        let response = invoker
            .invoke(environment, &step.target_endpoint, &step.method, input)
            .await?;

        let value = parse_body(&response);
        if response.is_success() {
            Ok(StepOutcome::Success(value))
        } else {
            Ok(StepOutcome::Failure {
                status: response.status,
                detail: value,
            })
        }
    }
}

enum StepOutcome {
    Success(Value),
    Failure { status: u16, detail: Value },
}

fn resolve_input(step: &CompositeStep, body: &Value) -> Result<Value, GatewayError> {
    match &step.source_property {
        Some(property) => body
            .get(property)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Validation(format!("body property '{property}' is missing"))
            }),
        None => Ok(body.clone()),
    }
}

fn build_context(environment: &str, username: &str) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("environment".to_string(), json!(environment));
    context.insert("username".to_string(), json!(username));
    context
}

fn parse_body(response: &GatewayResponse) -> Value {
    if response.body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&response.body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&response.body).into_owned()))
}

fn failure_response(step: &str, status: u16, detail: Value, request_id: &str) -> GatewayResponse {
    GatewayResponse::json(
        status,
        &json!({
            "success": false,
            "error": format!("Step '{step}' failed"),
            "errorDetail": detail,
            "timestamp": Utc::now().to_rfc3339(),
            "requestId": request_id,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_core::endpoint::CompositeStep;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every invocation; scripted responses per endpoint.
    struct MockInvoker {
        calls: Mutex<Vec<(String, String, Value)>>,
        responses: HashMap<String, Box<dyn Fn(usize) -> GatewayResponse + Send + Sync>>,
    }

    impl MockInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: HashMap::new(),
            }
        }

        fn respond_with(
            mut self,
            endpoint: &str,
            f: impl Fn(usize) -> GatewayResponse + Send + Sync + 'static,
        ) -> Self {
            self.responses.insert(endpoint.to_string(), Box::new(f));
            self
        }

        fn calls(&self) -> Vec<(String, String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepInvoker for MockInvoker {
        async fn invoke(
            &self,
            _environment: &str,
            endpoint: &str,
            method: &str,
            body: Value,
        ) -> Result<GatewayResponse, GatewayError> {
            let mut calls = self.calls.lock().unwrap();
            let count = calls
                .iter()
                .filter(|(e, _, _)| e == endpoint)
                .count();
            calls.push((endpoint.to_string(), method.to_string(), body));
            drop(calls);
            match self.responses.get(endpoint) {
                Some(f) => Ok(f(count)),
                None => Ok(GatewayResponse::json(404, &json!({"error": "unknown"}))),
            }
        }
    }

    fn step(name: &str, endpoint: &str) -> CompositeStep {
        CompositeStep {
            name: name.into(),
            target_endpoint: endpoint.into(),
            method: "POST".into(),
            source_property: None,
            is_array: false,
            array_property: None,
            depends_on: None,
            template_transformations: HashMap::new(),
        }
    }

    fn sales_order() -> CompositeEndpoint {
        let mut lines = step("CreateOrderLines", "OrderLines");
        lines.is_array = true;
        lines.array_property = Some("Lines".into());

        let mut header = step("CreateOrderHeader", "OrderHeaders");
        header.source_property = Some("Header".into());
        header.depends_on = Some("CreateOrderLines".into());
        header.template_transformations.insert(
            "TransactionKey".into(),
            "$prev.CreateOrderLines.0.d.TransactionKey".into(),
        );

        CompositeEndpoint {
            steps: vec![lines, header],
        }
    }

    #[tokio::test]
    async fn test_sales_order_happy_path() {
        let invoker = MockInvoker::new()
            .respond_with("OrderLines", |n| {
                GatewayResponse::json(201, &json!({"d": {"TransactionKey": format!("TK-{}", n + 1)}}))
            })
            .respond_with("OrderHeaders", |_| {
                GatewayResponse::json(201, &json!({"OrderNumber": 7001}))
            });

        let body = json!({
            "Lines": [{"Item": "A"}, {"Item": "B"}],
            "Header": {"Customer": "C-100"},
        });

        let response = CompositeOrchestrator::execute(
            &invoker,
            &sales_order(),
            "600",
            "svc-orders",
            "rid-1",
            &body,
        )
        .await
        .unwrap();

        assert_eq!(response.status, 200);
        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        // Two line posts in element order, then the header post.
        assert_eq!(calls[0].0, "OrderLines");
        assert_eq!(calls[0].2["Item"], "A");
        assert_eq!(calls[1].2["Item"], "B");
        // The header call received the first line's TransactionKey.
        assert_eq!(calls[2].0, "OrderHeaders");
        assert_eq!(calls[2].2["TransactionKey"], "TK-1");
        assert_eq!(calls[2].2["Customer"], "C-100");

        let aggregated: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(aggregated["RequestId"], "rid-1");
        assert_eq!(
            aggregated["Steps"]["CreateOrderLines"][1]["d"]["TransactionKey"],
            "TK-2"
        );
        assert_eq!(aggregated["Steps"]["CreateOrderHeader"]["OrderNumber"], 7001);
    }

    #[tokio::test]
    async fn test_failing_step_aborts_composite() {
        let invoker = MockInvoker::new()
            .respond_with("OrderLines", |n| {
                if n == 0 {
                    GatewayResponse::json(201, &json!({"d": {"TransactionKey": "TK-1"}}))
                } else {
                    GatewayResponse::json(400, &json!({"error": "bad line"}))
                }
            })
            .respond_with("OrderHeaders", |_| {
                GatewayResponse::json(201, &json!({"OrderNumber": 1}))
            });

        let body = json!({
            "Lines": [{"Item": "A"}, {"Item": "broken"}],
            "Header": {"Customer": "C-100"},
        });

        let response = CompositeOrchestrator::execute(
            &invoker,
            &sales_order(),
            "600",
            "svc",
            "rid-2",
            &body,
        )
        .await
        .unwrap();

        // The composite surfaces the failing step's status and never
        // reaches the header step.
        assert_eq!(response.status, 400);
        let error: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(error["success"], false);
        assert!(error["error"].as_str().unwrap().contains("CreateOrderLines"));
        assert_eq!(invoker.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_array_property_is_validation_error() {
        let invoker = MockInvoker::new();
        let body = json!({"Header": {}});

        let err = CompositeOrchestrator::execute(
            &invoker,
            &sales_order(),
            "600",
            "svc",
            "rid-3",
            &body,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_guid_transformation_is_fresh_per_element() {
        let mut line = step("Tag", "Tags");
        line.is_array = true;
        line.array_property = Some("Items".into());
        line.template_transformations
            .insert("Id".into(), "$guid".into());
        let composite = CompositeEndpoint {
            steps: vec![line],
        };

        let invoker =
            MockInvoker::new().respond_with("Tags", |_| GatewayResponse::json(200, &json!({})));
        let body = json!({"Items": [{}, {}]});

        CompositeOrchestrator::execute(&invoker, &composite, "600", "svc", "rid", &body)
            .await
            .unwrap();

        let calls = invoker.calls();
        let a = calls[0].2["Id"].as_str().unwrap().to_string();
        let b = calls[1].2["Id"].as_str().unwrap().to_string();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_context_variables_resolve() {
        let mut s = step("One", "Echo");
        s.template_transformations
            .insert("Env".into(), "$context.environment".into());
        s.template_transformations
            .insert("User".into(), "$context.username".into());
        let composite = CompositeEndpoint {
            steps: vec![s],
        };

        let invoker =
            MockInvoker::new().respond_with("Echo", |_| GatewayResponse::json(200, &json!({})));
        CompositeOrchestrator::execute(&invoker, &composite, "600", "alice", "rid", &json!({}))
            .await
            .unwrap();

        let calls = invoker.calls();
        assert_eq!(calls[0].2["Env"], "600");
        assert_eq!(calls[0].2["User"], "alice");
    }
}
