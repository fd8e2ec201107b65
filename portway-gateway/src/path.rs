//! Request path grammar:
//!
//! ```text
//! <env> "/" [<namespace> "/"] <endpoint>[<id-suffix>] ["/" <remainder>]
//! <id-suffix>  ::= "(" <literal> ")"
//! <literal>    ::= integer | "'" string "'" | "guid'" guid "'"
//! ```
//!
//! Whether the second segment is a namespace or an endpoint is decided by
//! the dispatcher against the catalog; this module only splits and parses.

use portway_core::error::GatewayError;
use portway_odata::IdLiteral;

/// A split request path (everything after `/api/`), before catalog
/// resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPath {
    pub environment: String,
    /// Path segments after the environment, percent-decoded, non-empty.
    pub segments: Vec<String>,
}

pub fn split_path(path: &str) -> Result<RawPath, GatewayError> {
    let mut segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(percent_decode);
    let environment = segments
        .next()
        .ok_or_else(|| GatewayError::NotFound("missing environment segment".into()))?;
    let segments: Vec<String> = segments.collect();
    if segments.is_empty() {
        return Err(GatewayError::NotFound(format!(
            "no endpoint in path '{path}'"
        )));
    }
    Ok(RawPath {
        environment,
        segments,
    })
}

/// Split `Products('X-1')` into the endpoint name and its id literal.
pub fn split_endpoint_segment(segment: &str) -> Result<(String, Option<IdLiteral>), GatewayError> {
    let Some(open) = segment.find('(') else {
        return Ok((segment.to_string(), None));
    };
    if !segment.ends_with(')') {
        return Err(GatewayError::Validation(format!(
            "malformed id suffix in '{segment}'"
        )));
    }
    let name = segment[..open].to_string();
    let literal = &segment[open + 1..segment.len() - 1];
    Ok((name, Some(parse_id_literal(literal)?)))
}

fn parse_id_literal(literal: &str) -> Result<IdLiteral, GatewayError> {
    if let Some(rest) = literal.strip_prefix("guid'") {
        let value = rest.strip_suffix('\'').ok_or_else(|| {
            GatewayError::Validation(format!("malformed guid literal '{literal}'"))
        })?;
        let guid = uuid::Uuid::parse_str(value)
            .map_err(|_| GatewayError::Validation(format!("invalid guid '{value}'")))?;
        return Ok(IdLiteral::Guid(guid));
    }
    if let Some(rest) = literal.strip_prefix('\'') {
        let value = rest.strip_suffix('\'').ok_or_else(|| {
            GatewayError::Validation(format!("malformed string literal '{literal}'"))
        })?;
        return Ok(IdLiteral::Str(value.replace("''", "'")));
    }
    literal
        .parse::<i64>()
        .map(IdLiteral::Int)
        .map_err(|_| GatewayError::Validation(format!("invalid id literal '{literal}'")))
}

/// Parse a raw query string into decoded pairs, preserving order.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

/// Minimal percent decoding (plus `+` as space); bad escapes pass through.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 3 <= bytes.len() => {
                match u8::from_str_radix(&input[i + 1..i + 3], 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Minimal percent encoding for query-string values (NextLink building).
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'$' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
