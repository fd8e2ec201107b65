use portway_limit::RateLimitDecision;

/// Hardening headers applied to every response.
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("referrer-policy", "no-referrer"),
    ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
];

/// The rate-limit header set carried on allowed and refused responses
/// alike; refusals additionally get `Retry-After`.
pub fn rate_limit_headers(decision: &RateLimitDecision) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_secs.to_string()),
        ("x-ratelimit-resource", decision.resource.as_str().to_string()),
        ("x-ratelimit-used", decision.used.to_string()),
    ];
    if let Some(retry) = decision.retry_after_secs {
        headers.push(("retry-after", retry.to_string()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_limit::LimitResource;

    #[test]
    fn test_allowed_decision_has_no_retry_after() {
        let decision = RateLimitDecision {
            allowed: true,
            resource: LimitResource::Token,
            limit: 200,
            remaining: 150,
            used: 50,
            reset_secs: 15,
            retry_after_secs: None,
        };
        let headers = rate_limit_headers(&decision);
        assert_eq!(headers.len(), 5);
        assert!(headers.iter().any(|(k, v)| *k == "x-ratelimit-resource" && v == "token"));
        assert!(!headers.iter().any(|(k, _)| *k == "retry-after"));
    }

    #[test]
    fn test_denied_decision_has_retry_after() {
        let decision = RateLimitDecision {
            allowed: false,
            resource: LimitResource::Ip,
            limit: 2,
            remaining: 0,
            used: 2,
            reset_secs: 60,
            retry_after_secs: Some(60),
        };
        let headers = rate_limit_headers(&decision);
        assert!(headers.iter().any(|(k, v)| *k == "retry-after" && v == "60"));
    }

    #[test]
    fn test_security_header_set() {
        let names: Vec<&str> = SECURITY_HEADERS.iter().map(|(k, _)| *k).collect();
        assert!(names.contains(&"x-content-type-options"));
        assert!(names.contains(&"x-frame-options"));
        assert!(names.contains(&"strict-transport-security"));
        assert!(names.contains(&"referrer-policy"));
        assert!(names.contains(&"permissions-policy"));
    }
}
