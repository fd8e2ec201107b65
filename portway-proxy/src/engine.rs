use crate::cache::{self, CachedResponse, ResponseCache};
use crate::rewrite;
use crate::single_flight::KeyedLocks;
use bytes::Bytes;
use http::{HeaderMap, Method};
use portway_core::error::GatewayError;
use portway_core::policy::NetworkAccessPolicy;
use portway_core::response::GatewayResponse;
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Request headers that never travel upstream. The gateway bearer token
/// stays at the gateway; environment header injection carries upstream
/// credentials when needed.
const STRIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-authorization",
    "te",
    "upgrade",
    "accept-encoding",
    "authorization",
];

const STRIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
];

/// How a proxied response met the cache; exposed as `X-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Engine-wide timing configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_cache_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub lock_retry: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

/// One proxied request as prepared by the dispatcher.
#[derive(Debug)]
pub struct ProxyRequest {
    pub environment: String,
    pub endpoint_name: String,
    pub upstream_url: String,
    pub method: Method,
    /// Path remainder after the endpoint segment (no leading slash).
    pub remainder: String,
    /// Raw query string without the `?`.
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Headers injected for this environment.
    pub env_headers: HashMap<String, String>,
    pub request_scheme: String,
    pub request_host: String,
    pub cache_ttl: Option<Duration>,
    pub timeout: Option<Duration>,
}

/// Forwards requests to the configured upstream, caching GET responses
/// with single-flight coalescing on misses.
pub struct ProxyEngine {
    client: reqwest::Client,
    cache: Arc<dyn ResponseCache>,
    locks: KeyedLocks,
    policy: Arc<NetworkAccessPolicy>,
    settings: EngineSettings,
}

impl ProxyEngine {
    pub fn new(
        cache: Arc<dyn ResponseCache>,
        policy: Arc<NetworkAccessPolicy>,
        settings: EngineSettings,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            cache,
            locks: KeyedLocks::new(),
            policy,
            settings,
        })
    }

    pub async fn handle(&self, request: ProxyRequest) -> Result<GatewayResponse, GatewayError> {
        let upstream_url = build_upstream_url(&request.upstream_url, &request.remainder, &request.query);
        self.enforce_policy(&upstream_url).await?;

        let soap = is_soap_request(&request, &upstream_url);

        if request.method == Method::GET && !soap {
            self.handle_cached_get(&request, &upstream_url).await
        } else {
            let response = self.execute(&request, &upstream_url, soap).await?;
            Ok(to_gateway_response(response, CacheStatus::Bypass))
        }
    }

    async fn handle_cached_get(
        &self,
        request: &ProxyRequest,
        upstream_url: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        let key = cache::cache_key(
            &request.environment,
            &request.endpoint_name,
            &request.remainder,
            &request.query,
            header_str(&request.headers, "authorization"),
            header_str(&request.headers, "accept-language"),
        );
        let ttl = request.cache_ttl.unwrap_or(self.settings.default_cache_ttl);

        let (response, status) = fetch_through_cache(
            self.cache.as_ref(),
            &self.locks,
            &key,
            &request.endpoint_name,
            ttl,
            self.settings.lock_wait,
            self.settings.lock_lease,
            self.settings.lock_retry,
            || async { self.execute(request, upstream_url, false).await },
        )
        .await?;

        Ok(to_gateway_response(response, status))
    }

    async fn enforce_policy(&self, upstream_url: &str) -> Result<(), GatewayError> {
        let parsed = reqwest::Url::parse(upstream_url)
            .map_err(|_| GatewayError::Upstream("invalid upstream url".into()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::Upstream("upstream url has no host".into()))?;

        self.policy
            .check_host(host)
            .map_err(|v| GatewayError::PolicyDenied(v.to_string()))?;

        // Literal addresses check directly; names are resolved so that a
        // hostname pointing into a blocked range is refused before dialing.
        // IPv6 literals come back bracketed from the URL parser.
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs: Vec<IpAddr> = if let Ok(ip) = bare_host.parse::<IpAddr>() {
            vec![ip]
        } else {
            let port = parsed.port_or_known_default().unwrap_or(80);
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| {
                    warn!(host = %host, error = %e, "Upstream DNS resolution failed");
                    GatewayError::UpstreamUnavailable
                })?
                .map(|addr| addr.ip())
                .collect()
        };
        self.policy
            .check_addrs(addrs.iter())
            .map_err(|v| GatewayError::PolicyDenied(v.to_string()))?;
        Ok(())
    }

    /// Execute one upstream exchange. GET retries once on a
    /// connection-level failure.
    async fn execute(
        &self,
        request: &ProxyRequest,
        upstream_url: &str,
        soap: bool,
    ) -> Result<CachedResponse, GatewayError> {
        let first = self.execute_once(request, upstream_url, soap).await;
        match first {
            Err(GatewayError::Upstream(_)) if request.method == Method::GET => {
                debug!(url = %upstream_url, "Retrying GET after connection failure");
                self.execute_once(request, upstream_url, soap).await
            }
            other => other,
        }
    }

    async fn execute_once(
        &self,
        request: &ProxyRequest,
        upstream_url: &str,
        soap: bool,
    ) -> Result<CachedResponse, GatewayError> {
        let mut builder = self
            .client
            .request(request.method.clone(), upstream_url)
            .timeout(request.timeout.unwrap_or(self.settings.request_timeout));

        for (name, value) in request.headers.iter() {
            if STRIP_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        for (name, value) in &request.env_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if method_has_body(&request.method) && !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();

        let mut headers = Vec::new();
        for (name, value) in response.headers().iter() {
            if STRIP_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.push((name.as_str().to_string(), value.to_string()));
            }
        }

        let body = response.bytes().await.map_err(map_reqwest_error)?;

        // SOAP passthrough keeps the body byte-exact; everything else has
        // upstream self-references rewritten to the gateway address.
        let body = if soap || !is_textual(&headers) {
            body
        } else {
            let public = rewrite::public_base(
                &request.request_scheme,
                &request.request_host,
                &request.environment,
                &request.endpoint_name,
            );
            Bytes::from(rewrite::rewrite_upstream_urls(
                &body,
                &request.upstream_url,
                &public,
            ))
        };

        Ok(CachedResponse {
            status,
            headers,
            body,
            stored_at: Instant::now(),
            ttl: Duration::ZERO,
        })
    }
}

/// The single-flight cache read path.
///
/// Misses race for the key's lock; the winner re-checks the cache, fills
/// it on a cacheable response, and releases. Losers that exhaust `wait`
/// execute uncached rather than pile onto the upstream forever.
#[allow(clippy::too_many_arguments)]
pub async fn fetch_through_cache<F, Fut>(
    cache: &dyn ResponseCache,
    locks: &KeyedLocks,
    key: &str,
    scope: &str,
    ttl: Duration,
    wait: Duration,
    lease: Duration,
    retry: Duration,
    fetch: F,
) -> Result<(CachedResponse, CacheStatus), GatewayError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse, GatewayError>>,
{
    if let Some(hit) = cache.get(key).await {
        return Ok((hit, CacheStatus::Hit));
    }

    match locks.acquire(key, wait, lease, retry).await {
        Some(mut lock) => {
            // Another filler may have completed while this caller waited.
            if let Some(hit) = cache.get(key).await {
                lock.release();
                return Ok((hit, CacheStatus::Hit));
            }

            let mut response = fetch().await?;
            if is_cacheable(&response) {
                response.ttl = max_age_override(&response.headers).unwrap_or(ttl);
                cache.put(key, scope, response.clone()).await;
            }
            lock.release();
            Ok((response, CacheStatus::Miss))
        }
        None => {
            debug!(key = %key, "Single-flight wait timed out, executing uncached");
            let response = fetch().await?;
            Ok((response, CacheStatus::Bypass))
        }
    }
}

fn to_gateway_response(response: CachedResponse, status: CacheStatus) -> GatewayResponse {
    let mut headers = response.headers;
    headers.push(("x-cache".to_string(), status.as_str().to_string()));
    GatewayResponse {
        status: response.status,
        headers,
        body: response.body,
    }
}

pub(crate) fn build_upstream_url(base: &str, remainder: &str, query: &str) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    if !remainder.is_empty() {
        url.push('/');
        url.push_str(remainder.trim_start_matches('/'));
    }
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn is_soap_request(request: &ProxyRequest, upstream_url: &str) -> bool {
    if request.headers.contains_key("soapaction") {
        return true;
    }
    if let Some(content_type) = header_str(&request.headers, "content-type") {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.starts_with("text/xml") || content_type.starts_with("application/soap+xml")
        {
            return true;
        }
    }
    let path_end = upstream_url.split('?').next().unwrap_or(upstream_url);
    path_end.ends_with(".svc")
}

fn method_has_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_cacheable(response: &CachedResponse) -> bool {
    (200..300).contains(&response.status) && is_textual(&response.headers)
}

fn is_textual(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| {
            let value = value.to_ascii_lowercase();
            value.contains("json")
                || value.contains("xml")
                || value.starts_with("text/")
        })
        .unwrap_or(false)
}

/// `Cache-Control: max-age=N` on the upstream response overrides the
/// endpoint TTL.
fn max_age_override(headers: &[(String, String)]) -> Option<Duration> {
    let value = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("cache-control"))
        .map(|(_, value)| value.to_ascii_lowercase())?;
    for directive in value.split(',') {
        if let Some(age) = directive.trim().strip_prefix("max-age=") {
            if let Ok(secs) = age.trim().parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
        }
    }
    None
}

fn map_reqwest_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::Timeout;
    }
    // The driver error may embed internal hostnames; log it, return a
    // neutral message.
    warn!(error = %err, "Upstream request failed");
    GatewayError::Upstream("upstream connection failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryResponseCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_response(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from(body.to_string()),
            stored_at: Instant::now(),
            ttl: Duration::ZERO,
        }
    }

    #[test]
    fn test_upstream_url_building() {
        assert_eq!(
            build_upstream_url("http://erp.local/v1/", "items/42", "expand=lines"),
            "http://erp.local/v1/items/42?expand=lines"
        );
        assert_eq!(build_upstream_url("http://erp.local/v1", "", ""), "http://erp.local/v1");
    }

    #[test]
    fn test_soap_detection() {
        let mut request = ProxyRequest {
            environment: "600".into(),
            endpoint_name: "Legacy".into(),
            upstream_url: "http://erp.local/Service.svc".into(),
            method: Method::POST,
            remainder: String::new(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            env_headers: HashMap::new(),
            request_scheme: "https".into(),
            request_host: "gw".into(),
            cache_ttl: None,
            timeout: None,
        };
        assert!(is_soap_request(&request, "http://erp.local/Service.svc"));

        request.upstream_url = "http://erp.local/api".into();
        assert!(!is_soap_request(&request, "http://erp.local/api"));

        request
            .headers
            .insert("soapaction", "\"urn:op\"".parse().unwrap());
        assert!(is_soap_request(&request, "http://erp.local/api"));

        let mut xml = HeaderMap::new();
        xml.insert("content-type", "text/xml; charset=utf-8".parse().unwrap());
        request.headers = xml;
        assert!(is_soap_request(&request, "http://erp.local/api"));
    }

    #[test]
    fn test_cacheability() {
        assert!(is_cacheable(&ok_response("{}")));

        let mut not_ok = ok_response("{}");
        not_ok.status = 500;
        assert!(!is_cacheable(&not_ok));

        let mut binary = ok_response("x");
        binary.headers = vec![("content-type".into(), "application/octet-stream".into())];
        assert!(!is_cacheable(&binary));

        let mut xml = ok_response("<a/>");
        xml.headers = vec![("content-type".into(), "application/xml".into())];
        assert!(is_cacheable(&xml));
    }

    #[test]
    fn test_max_age_override() {
        let headers = vec![("cache-control".into(), "public, max-age=120".into())];
        assert_eq!(max_age_override(&headers), Some(Duration::from_secs(120)));
        assert_eq!(max_age_override(&[]), None);
        let no_store = vec![("cache-control".into(), "no-store".into())];
        assert_eq!(max_age_override(&no_store), None);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let cache = Arc::new(MemoryResponseCache::new(64));
        let locks = Arc::new(KeyedLocks::new());
        let upstream_calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            let locks = Arc::clone(&locks);
            let upstream_calls = Arc::clone(&upstream_calls);
            tasks.push(tokio::spawn(async move {
                fetch_through_cache(
                    cache.as_ref(),
                    &locks,
                    "proxy:600:Accounts:::",
                    "Accounts",
                    Duration::from_secs(30),
                    Duration::from_secs(10),
                    Duration::from_secs(30),
                    Duration::from_millis(5),
                    || async {
                        upstream_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(ok_response("{\"rows\": []}"))
                    },
                )
                .await
                .unwrap()
            }));
        }

        let mut hits = 0;
        for task in tasks {
            let (response, status) = task.await.unwrap();
            assert_eq!(response.body, Bytes::from("{\"rows\": []}"));
            if status == CacheStatus::Hit {
                hits += 1;
            }
        }

        assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);
        assert!(hits >= 19);
    }

    #[tokio::test]
    async fn test_uncacheable_responses_are_not_stored() {
        let cache = MemoryResponseCache::new(64);
        let locks = KeyedLocks::new();

        let mut error_response = ok_response("boom");
        error_response.status = 502;

        let (_, status) = fetch_through_cache(
            &cache,
            &locks,
            "k",
            "s",
            Duration::from_secs(30),
            Duration::from_millis(50),
            Duration::from_secs(30),
            Duration::from_millis(5),
            || async { Ok(error_response.clone()) },
        )
        .await
        .unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_error_propagates_and_releases_lock() {
        let cache = MemoryResponseCache::new(64);
        let locks = KeyedLocks::new();

        let result = fetch_through_cache(
            &cache,
            &locks,
            "k",
            "s",
            Duration::from_secs(30),
            Duration::from_millis(50),
            Duration::from_secs(30),
            Duration::from_millis(5),
            || async { Err(GatewayError::UpstreamUnavailable) },
        )
        .await;
        assert!(result.is_err());

        // The lock was released on the error path; a new fill succeeds.
        let (_, status) = fetch_through_cache(
            &cache,
            &locks,
            "k",
            "s",
            Duration::from_secs(30),
            Duration::from_millis(50),
            Duration::from_secs(30),
            Duration::from_millis(5),
            || async { Ok(ok_response("{}")) },
        )
        .await
        .unwrap();
        assert_eq!(status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_cache_control_overrides_endpoint_ttl() {
        let cache = MemoryResponseCache::new(64);
        let locks = KeyedLocks::new();

        let mut response = ok_response("{}");
        response
            .headers
            .push(("cache-control".into(), "max-age=300".into()));

        fetch_through_cache(
            &cache,
            &locks,
            "k",
            "s",
            Duration::from_secs(30),
            Duration::from_millis(50),
            Duration::from_secs(30),
            Duration::from_millis(5),
            || async { Ok(response.clone()) },
        )
        .await
        .unwrap();

        let stored = cache.get("k").await.unwrap();
        assert_eq!(stored.ttl, Duration::from_secs(300));
    }
}
