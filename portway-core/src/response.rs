use crate::error::GatewayError;
use bytes::Bytes;

/// The handler-level response every endpoint kind produces; the HTTP
/// surface adds security and rate-limit headers on the way out.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl From<&GatewayError> for GatewayResponse {
    fn from(err: &GatewayError) -> Self {
        Self::json(err.status_code(), &err.to_envelope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_response() {
        let resp = GatewayResponse::json(200, &serde_json::json!({"ok": true}));
        assert_eq!(resp.status, 200);
        assert!(resp.is_success());
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
    }

    #[test]
    fn test_error_conversion() {
        let err = GatewayError::NotFound("Products".into());
        let resp = GatewayResponse::from(&err);
        assert_eq!(resp.status, 404);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["success"], false);
    }
}
