use portway_core::error::GatewayError;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Walk a dotted path into a JSON value; numeric segments index arrays.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate one template expression.
///
/// `$guid` yields a fresh GUID per substitution, `$requestid` the
/// orchestrator's trace id, `$prev.<step>.<path>` digs into an earlier
/// step's recorded response, `$context.<var>` into the request context.
/// Anything else is a literal.
pub fn evaluate(
    expression: &str,
    request_id: &str,
    prev: &Map<String, Value>,
    context: &Map<String, Value>,
) -> Result<Value, GatewayError> {
    match expression {
        "$guid" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        "$requestid" => Ok(Value::String(request_id.to_string())),
        _ => {
            if let Some(rest) = expression.strip_prefix("$prev.") {
                let (step, path) = rest.split_once('.').unwrap_or((rest, ""));
                let step_value = prev.get(step).ok_or_else(|| {
                    GatewayError::Validation(format!("template references unknown step '{step}'"))
                })?;
                let value = if path.is_empty() {
                    Some(step_value)
                } else {
                    resolve_path(step_value, path)
                };
                value.cloned().ok_or_else(|| {
                    GatewayError::Validation(format!(
                        "template path '{path}' not found in step '{step}' response"
                    ))
                })
            } else if let Some(var) = expression.strip_prefix("$context.") {
                context.get(var).cloned().ok_or_else(|| {
                    GatewayError::Validation(format!("unknown context variable '{var}'"))
                })
            } else {
                Ok(Value::String(expression.to_string()))
            }
        }
    }
}

/// Apply a step's template transformations onto its input object.
pub fn apply_transformations(
    input: Value,
    transformations: &HashMap<String, String>,
    request_id: &str,
    prev: &Map<String, Value>,
    context: &Map<String, Value>,
) -> Result<Value, GatewayError> {
    if transformations.is_empty() {
        return Ok(input);
    }

    let mut object = match input {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(GatewayError::Validation(format!(
                "template transformations need an object input, got {}",
                kind_name(&other)
            )));
        }
    };

    for (key, expression) in transformations {
        let value = evaluate(expression, request_id, prev, context)?;
        object.insert(key.clone(), value);
    }
    Ok(Value::Object(object))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_path_objects_and_arrays() {
        let value = json!({"d": {"results": [{"Key": "abc"}, {"Key": "def"}]}});
        assert_eq!(resolve_path(&value, "d.results.1.Key"), Some(&json!("def")));
        assert_eq!(resolve_path(&value, "d.results.9.Key"), None);
        assert_eq!(resolve_path(&value, "d.missing"), None);
    }

    #[test]
    fn test_guid_is_fresh_per_substitution() {
        let prev = Map::new();
        let ctx = Map::new();
        let a = evaluate("$guid", "rid", &prev, &ctx).unwrap();
        let b = evaluate("$guid", "rid", &prev, &ctx).unwrap();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_requestid_and_literals() {
        let prev = Map::new();
        let ctx = Map::new();
        assert_eq!(
            evaluate("$requestid", "rid-1", &prev, &ctx).unwrap(),
            json!("rid-1")
        );
        assert_eq!(
            evaluate("plain text", "rid-1", &prev, &ctx).unwrap(),
            json!("plain text")
        );
    }

    #[test]
    fn test_prev_lookup() {
        let mut prev = Map::new();
        prev.insert(
            "CreateOrderLines".into(),
            json!([{"d": {"TransactionKey": "TK-1"}}]),
        );
        let ctx = Map::new();
        assert_eq!(
            evaluate("$prev.CreateOrderLines.0.d.TransactionKey", "rid", &prev, &ctx).unwrap(),
            json!("TK-1")
        );
        assert!(evaluate("$prev.Missing.x", "rid", &prev, &ctx).is_err());
        assert!(evaluate("$prev.CreateOrderLines.5.d", "rid", &prev, &ctx).is_err());
    }

    #[test]
    fn test_context_lookup() {
        let prev = Map::new();
        let mut ctx = Map::new();
        ctx.insert("environment".into(), json!("600"));
        assert_eq!(
            evaluate("$context.environment", "rid", &prev, &ctx).unwrap(),
            json!("600")
        );
        assert!(evaluate("$context.nope", "rid", &prev, &ctx).is_err());
    }

    #[test]
    fn test_apply_transformations() {
        let mut transformations = HashMap::new();
        transformations.insert("TransactionKey".to_string(), "$requestid".to_string());
        let prev = Map::new();
        let ctx = Map::new();

        let out = apply_transformations(
            json!({"Existing": 1}),
            &transformations,
            "rid-9",
            &prev,
            &ctx,
        )
        .unwrap();
        assert_eq!(out, json!({"Existing": 1, "TransactionKey": "rid-9"}));

        // Null input becomes a fresh object
        let out = apply_transformations(Value::Null, &transformations, "rid-9", &prev, &ctx).unwrap();
        assert_eq!(out, json!({"TransactionKey": "rid-9"}));

        // Scalar input cannot take transformations
        assert!(apply_transformations(json!(42), &transformations, "rid", &prev, &ctx).is_err());
    }
}
