use crate::endpoint::Endpoint;
use crate::error::GatewayError;

/// Match a single scope pattern against a value.
///
/// `*` grants everything; `6*` matches `600`; otherwise exact.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}

/// Match any pattern in a CSV pattern list.
fn csv_matches(patterns: &str, value: &str) -> bool {
    patterns
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|p| pattern_matches(p, value))
}

/// The token's environment grant. Endpoint-level environment checks are
/// separate (see [`check_endpoint_environment`]).
pub fn check_token_environment(
    allowed_environments: &str,
    environment: &str,
) -> Result<(), GatewayError> {
    if csv_matches(allowed_environments, environment) {
        Ok(())
    } else {
        Err(GatewayError::EnvironmentDenied {
            requested: environment.to_string(),
            available_environments: allowed_environments.to_string(),
        })
    }
}

/// The token's endpoint grant, matched against the endpoint's scope name
/// (`composite/<name>` and `webhook/<name>` for those kinds).
pub fn check_token_scope(allowed_scopes: &str, endpoint: &Endpoint) -> Result<(), GatewayError> {
    let scope_name = endpoint.scope_name();
    if csv_matches(allowed_scopes, &scope_name) {
        Ok(())
    } else {
        Err(GatewayError::ScopeDenied {
            requested: scope_name,
            available_scopes: allowed_scopes.to_string(),
        })
    }
}

/// The endpoint's own environment allow-list.
pub fn check_endpoint_environment(
    endpoint: &Endpoint,
    environment: &str,
) -> Result<(), GatewayError> {
    if endpoint.allows_environment(environment) {
        Ok(())
    } else {
        Err(GatewayError::EnvironmentDenied {
            requested: environment.to_string(),
            available_environments: endpoint.allowed_environments.join(","),
        })
    }
}
