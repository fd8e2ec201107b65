//! Upstream URL rewriting for proxied response bodies.

/// Replace every occurrence of the upstream base URL with the gateway's
/// public address for the endpoint.
///
/// This is a byte-level substring replacement, not a parse of the body:
/// a response that legitimately contains the upstream prefix as data is
/// rewritten as well. That matches the documented gateway behaviour;
/// callers must not apply it to SOAP traffic.
pub fn rewrite_upstream_urls(body: &[u8], upstream_base: &str, public_base: &str) -> Vec<u8> {
    let needle = upstream_base.trim_end_matches('/').as_bytes();
    let replacement = public_base.trim_end_matches('/').as_bytes();
    if needle.is_empty() {
        return body.to_vec();
    }

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(body[i]);
            i += 1;
        }
    }
    out
}

/// The gateway-side base a rewritten URL points at:
/// `<scheme>://<host>/api/<env>/<endpoint>`.
pub fn public_base(scheme: &str, host: &str, environment: &str, endpoint: &str) -> String {
    format!("{scheme}://{host}/api/{environment}/{endpoint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_rewrite() {
        let body = br#"{"next": "http://erp.local:8080/v1/items?page=2"}"#;
        let out = rewrite_upstream_urls(
            body,
            "http://erp.local:8080/v1",
            &public_base("https", "gateway.example.com", "600", "Items"),
        );
        assert_eq!(
            out,
            br#"{"next": "https://gateway.example.com/api/600/Items/items?page=2"}"#
        );
    }

    #[test]
    fn test_multiple_occurrences() {
        let body = b"a http://up/base/x b http://up/base/y";
        let out = rewrite_upstream_urls(body, "http://up/base", "https://gw/api/600/E");
        assert_eq!(out, b"a https://gw/api/600/E/x b https://gw/api/600/E/y");
    }

    #[test]
    fn test_no_occurrence_is_identity() {
        let body = b"nothing to see";
        let out = rewrite_upstream_urls(body, "http://up/base", "https://gw/api/600/E");
        assert_eq!(out, body.to_vec());
    }

    #[test]
    fn test_trailing_slashes_normalised() {
        let out = rewrite_upstream_urls(b"http://up/base/x", "http://up/base/", "https://gw/e/");
        assert_eq!(out, b"https://gw/e/x");
    }

    #[test]
    fn test_binaryish_bodies_survive() {
        let body = [0u8, 159, 146, 150];
        let out = rewrite_upstream_urls(&body, "http://up", "https://gw");
        assert_eq!(out, body.to_vec());
    }
}
