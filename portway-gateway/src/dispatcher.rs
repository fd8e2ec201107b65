use crate::path::{self, RawPath};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use portway_auth::{TokenRecord, TokenStore};
use portway_composite::{CompositeOrchestrator, StepInvoker};
use portway_core::catalog::{CatalogSnapshot, EndpointCatalog};
use portway_core::endpoint::{
    Endpoint, EndpointKind, FilesEndpoint, SqlEndpoint, StaticEndpoint, WebhookEndpoint,
};
use portway_core::environment::{EnvironmentRegistry, EnvironmentSettings};
use portway_core::error::GatewayError;
use portway_core::response::GatewayResponse;
use portway_core::scope;
use portway_limit::{RateLimitDecision, RateLimiter};
use portway_observability::{GatewayMetrics, TrafficLog, TrafficLogEntry};
use portway_odata::{IdLiteral, ODataError, QueryOptions};
use portway_proxy::engine::ProxyRequest;
use portway_sql::CollectionResult;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Composite steps may chain into further composites this many levels deep.
const MAX_COMPOSITE_DEPTH: u32 = 3;

// ── Backend seams ────────────────────────────────────────────────────────────

/// SQL execution seam (collection/id reads, procedure writes, webhook
/// inserts).
#[async_trait]
pub trait SqlGateway: Send + Sync {
    async fn get_collection(
        &self,
        environment: &EnvironmentSettings,
        query: &portway_odata::TranslatedQuery,
    ) -> Result<CollectionResult, GatewayError>;

    async fn get_by_id(
        &self,
        environment: &EnvironmentSettings,
        query: &portway_odata::TranslatedQuery,
    ) -> Result<Option<Value>, GatewayError>;

    async fn execute_procedure(
        &self,
        environment: &EnvironmentSettings,
        endpoint: &SqlEndpoint,
        method: &str,
        username: &str,
        properties: &Map<String, Value>,
    ) -> Result<Option<Value>, GatewayError>;

    async fn ingest_webhook(
        &self,
        environment: &EnvironmentSettings,
        endpoint: &WebhookEndpoint,
        webhook_id: &str,
        payload: &str,
    ) -> Result<Value, GatewayError>;
}

/// Proxy forwarding seam.
#[async_trait]
pub trait ProxyGateway: Send + Sync {
    async fn forward(&self, request: ProxyRequest) -> Result<GatewayResponse, GatewayError>;
}

/// Static/file endpoints are served by the external blob-store and
/// doc-surface collaborators behind this seam.
#[async_trait]
pub trait BlobGateway: Send + Sync {
    async fn handle_static(
        &self,
        endpoint: &StaticEndpoint,
        method: &Method,
    ) -> Result<GatewayResponse, GatewayError>;

    async fn handle_files(
        &self,
        endpoint: &FilesEndpoint,
        method: &Method,
        remainder: &str,
        body: Bytes,
    ) -> Result<GatewayResponse, GatewayError>;
}

/// Default blob gateway for deployments without a configured store.
pub struct NullBlobStore;

#[async_trait]
impl BlobGateway for NullBlobStore {
    async fn handle_static(
        &self,
        _endpoint: &StaticEndpoint,
        _method: &Method,
    ) -> Result<GatewayResponse, GatewayError> {
        Err(GatewayError::UpstreamUnavailable)
    }

    async fn handle_files(
        &self,
        _endpoint: &FilesEndpoint,
        _method: &Method,
        _remainder: &str,
        _body: Bytes,
    ) -> Result<GatewayResponse, GatewayError> {
        Err(GatewayError::UpstreamUnavailable)
    }
}

#[async_trait]
impl SqlGateway for portway_sql::SqlExecutor {
    async fn get_collection(
        &self,
        environment: &EnvironmentSettings,
        query: &portway_odata::TranslatedQuery,
    ) -> Result<CollectionResult, GatewayError> {
        portway_sql::SqlExecutor::get_collection(self, environment, query).await
    }

    async fn get_by_id(
        &self,
        environment: &EnvironmentSettings,
        query: &portway_odata::TranslatedQuery,
    ) -> Result<Option<Value>, GatewayError> {
        portway_sql::SqlExecutor::get_by_id(self, environment, query).await
    }

    async fn execute_procedure(
        &self,
        environment: &EnvironmentSettings,
        endpoint: &SqlEndpoint,
        method: &str,
        username: &str,
        properties: &Map<String, Value>,
    ) -> Result<Option<Value>, GatewayError> {
        portway_sql::SqlExecutor::execute_procedure(
            self,
            environment,
            endpoint,
            method,
            username,
            properties,
        )
        .await
    }

    async fn ingest_webhook(
        &self,
        environment: &EnvironmentSettings,
        endpoint: &WebhookEndpoint,
        webhook_id: &str,
        payload: &str,
    ) -> Result<Value, GatewayError> {
        portway_sql::WebhookIngester::new(self)
            .ingest(environment, endpoint, webhook_id, payload)
            .await
    }
}

#[async_trait]
impl ProxyGateway for portway_proxy::ProxyEngine {
    async fn forward(&self, request: ProxyRequest) -> Result<GatewayResponse, GatewayError> {
        self.handle(request).await
    }
}

// ── Request/response types ───────────────────────────────────────────────────

/// One request as handed over by the HTTP listener (leading `/api/`
/// already stripped).
#[derive(Debug)]
pub struct IncomingRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub scheme: String,
    pub host: String,
    pub request_id: String,
}

/// Dispatch outcome plus the rate-limit decision the response headers
/// report.
pub struct DispatchResult {
    pub response: GatewayResponse,
    pub rate_limit: Option<RateLimitDecision>,
}

#[derive(Default, Clone)]
struct RouteInfo {
    environment: String,
    namespace: String,
    endpoint: String,
    kind: &'static str,
    username: Option<String>,
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

/// The request pipeline: IP bucket → token verification → token bucket →
/// catalog resolution → environment/scope/method gates → kind handler.
pub struct Dispatcher {
    catalog: Arc<EndpointCatalog>,
    environments: Arc<EnvironmentRegistry>,
    tokens: Arc<TokenStore>,
    limiter: Arc<RateLimiter>,
    sql: Arc<dyn SqlGateway>,
    proxy: Arc<dyn ProxyGateway>,
    blobs: Arc<dyn BlobGateway>,
    traffic: TrafficLog,
    metrics: Arc<GatewayMetrics>,
    max_top: u32,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<EndpointCatalog>,
        environments: Arc<EnvironmentRegistry>,
        tokens: Arc<TokenStore>,
        limiter: Arc<RateLimiter>,
        sql: Arc<dyn SqlGateway>,
        proxy: Arc<dyn ProxyGateway>,
        blobs: Arc<dyn BlobGateway>,
        traffic: TrafficLog,
        metrics: Arc<GatewayMetrics>,
        max_top: u32,
    ) -> Self {
        Self {
            catalog,
            environments,
            tokens,
            limiter,
            sql,
            proxy,
            blobs,
            traffic,
            metrics,
            max_top,
        }
    }

    pub async fn dispatch(&self, request: IncomingRequest) -> DispatchResult {
        let started = Instant::now();

        // IP bucket first: a flooding client never reaches token work.
        let ip_decision = self.limiter.check_ip(&request.client_ip);
        if !ip_decision.allowed {
            let response = rate_limited_response(&ip_decision);
            self.finish(&request, started, RouteInfo::default(), &response, "rate limit (ip)");
            self.metrics.rate_limited_total.with_label_values(&["ip"]).inc();
            return DispatchResult {
                response,
                rate_limit: Some(ip_decision),
            };
        }

        // Bearer verification between the two bucket families.
        let record = match self.authenticate(&request.headers).await {
            Ok(record) => record,
            Err(err) => {
                let response = GatewayResponse::from(&err);
                self.finish(&request, started, RouteInfo::default(), &response, "authentication");
                return DispatchResult {
                    response,
                    rate_limit: Some(ip_decision),
                };
            }
        };

        let token_key = bearer_token(&request.headers).unwrap_or_default();
        let token_decision = self.limiter.check_token(&token_key);
        if !token_decision.allowed {
            let response = rate_limited_response(&token_decision);
            let info = RouteInfo {
                username: Some(record.username.clone()),
                ..RouteInfo::default()
            };
            self.finish(&request, started, info, &response, "rate limit (token)");
            self.metrics.rate_limited_total.with_label_values(&["token"]).inc();
            return DispatchResult {
                response,
                rate_limit: Some(token_decision),
            };
        }

        let (response, mut info) = match self.route(&request, &record).await {
            Ok((response, info)) => (response, info),
            Err((err, info)) => (GatewayResponse::from(&err), info),
        };
        info.username = Some(record.username.clone());

        let reason = if response.is_success() { "" } else { "handler refused" };
        self.finish(&request, started, info, &response, reason);

        DispatchResult {
            response,
            rate_limit: Some(token_decision),
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<TokenRecord, GatewayError> {
        let token = bearer_token(headers).ok_or(GatewayError::MissingToken)?;
        self.tokens
            .verify(&token)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or(GatewayError::InvalidToken)
    }

    async fn route(
        &self,
        request: &IncomingRequest,
        record: &TokenRecord,
    ) -> Result<(GatewayResponse, RouteInfo), (GatewayError, RouteInfo)> {
        let raw = path::split_path(&request.path).map_err(|_| {
            (
                GatewayError::NotFound(format!("{} /api/{}", request.method, request.path)),
                RouteInfo::default(),
            )
        })?;

        let mut info = RouteInfo {
            environment: raw.environment.clone(),
            ..RouteInfo::default()
        };

        if !self.environments.is_allowed(&raw.environment) {
            return Err((
                GatewayError::EnvironmentDenied {
                    requested: raw.environment.clone(),
                    available_environments: self.environments.allowed().join(","),
                },
                info,
            ));
        }

        scope::check_token_environment(&record.allowed_environments, &raw.environment)
            .map_err(|e| (e, info.clone()))?;

        let snapshot = self.catalog.snapshot();
        let (endpoint, id, remainder) = self
            .resolve(&snapshot, &raw)
            .map_err(|e| (e, info.clone()))?;
        info.namespace = endpoint.namespace.clone();
        info.endpoint = endpoint.name.clone();
        info.kind = endpoint.kind.label();

        // Private endpoints exist only for composite steps.
        if endpoint.is_private {
            return Err((
                GatewayError::NotFound(format!("{} /api/{}", request.method, request.path)),
                info,
            ));
        }

        scope::check_endpoint_environment(&endpoint, &raw.environment).map_err(|e| (e, info.clone()))?;
        scope::check_token_scope(&record.allowed_scopes, &endpoint).map_err(|e| (e, info.clone()))?;

        if !endpoint.allows_method(request.method.as_str()) {
            return Err((
                GatewayError::MethodNotAllowed(request.method.to_string()),
                info,
            ));
        }

        let response = self
            .handle_endpoint(request, record, &raw.environment, &endpoint, id, &remainder)
            .await
            .map_err(|e| (e, info.clone()))?;

        Ok((response, info))
    }

    /// Decide which catalog entry a path addresses. With two or more
    /// segments the first may be a namespace; an unmatched namespaced
    /// lookup falls back to the empty namespace for older descriptors.
    ///
    /// The second segment may also be free-form remainder data for a
    /// namespace-less endpoint (a proxy path fragment with a stray `(`,
    /// say), so a malformed id suffix there is a non-match, not an error.
    fn resolve(
        &self,
        snapshot: &CatalogSnapshot,
        raw: &RawPath,
    ) -> Result<(Arc<Endpoint>, Option<IdLiteral>, String), GatewayError> {
        let segments = &raw.segments;

        if segments.len() >= 2 {
            if let Ok((name, id)) = path::split_endpoint_segment(&segments[1]) {
                if let Some(endpoint) = snapshot.get(&segments[0], &name) {
                    return Ok((endpoint, id, segments[2..].join("/")));
                }
            }
        }

        let (name, id) = path::split_endpoint_segment(&segments[0])?;
        if let Some(endpoint) = snapshot.get("", &name) {
            return Ok((endpoint, id, segments[1..].join("/")));
        }

        if segments.len() >= 2 {
            if let Ok((name, id)) = path::split_endpoint_segment(&segments[1]) {
                if let Some(endpoint) = snapshot.get("", &name) {
                    return Ok((endpoint, id, segments[2..].join("/")));
                }
            }
        }

        Err(GatewayError::NotFound(format!(
            "no endpoint for path '{}'",
            raw.segments.join("/")
        )))
    }

    async fn handle_endpoint(
        &self,
        request: &IncomingRequest,
        record: &TokenRecord,
        environment: &str,
        endpoint: &Endpoint,
        id: Option<IdLiteral>,
        remainder: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        match &endpoint.kind {
            EndpointKind::Sql(sql) => {
                let settings = self.environment_settings(environment)?;
                self.handle_sql(request, record, &settings, endpoint, sql, id)
                    .await
            }
            EndpointKind::Proxy(proxy) => {
                let settings = self.environment_settings(environment)?;
                let proxy_request = ProxyRequest {
                    environment: environment.to_string(),
                    endpoint_name: endpoint.name.clone(),
                    upstream_url: proxy.upstream_url.clone(),
                    method: request.method.clone(),
                    remainder: remainder.to_string(),
                    query: request.query.clone(),
                    headers: request.headers.clone(),
                    body: request.body.clone(),
                    env_headers: settings.headers.clone(),
                    request_scheme: request.scheme.clone(),
                    request_host: request.host.clone(),
                    cache_ttl: proxy.cache_ttl_secs.map(Duration::from_secs),
                    timeout: proxy.request_timeout_secs.map(Duration::from_secs),
                };
                self.proxy.forward(proxy_request).await
            }
            EndpointKind::Composite(composite) => {
                let body: Value = if request.body.is_empty() {
                    json!({})
                } else {
                    serde_json::from_slice(&request.body)
                        .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))?
                };
                let invoker = InternalInvoker {
                    dispatcher: self,
                    scheme: request.scheme.clone(),
                    host: request.host.clone(),
                    username: record.username.clone(),
                    depth: 0,
                };
                CompositeOrchestrator::execute(
                    &invoker,
                    composite,
                    environment,
                    &record.username,
                    &request.request_id,
                    &body,
                )
                .await
            }
            EndpointKind::Webhook(webhook) => {
                let settings = self.environment_settings(environment)?;
                self.handle_webhook(request, &settings, webhook, remainder)
                    .await
            }
            EndpointKind::Static(static_endpoint) => {
                self.blobs.handle_static(static_endpoint, &request.method).await
            }
            EndpointKind::Files(files) => {
                self.blobs
                    .handle_files(files, &request.method, remainder, request.body.clone())
                    .await
            }
        }
    }

    async fn handle_sql(
        &self,
        request: &IncomingRequest,
        record: &TokenRecord,
        settings: &EnvironmentSettings,
        endpoint: &Endpoint,
        sql: &SqlEndpoint,
        id: Option<IdLiteral>,
    ) -> Result<GatewayResponse, GatewayError> {
        match request.method.as_str() {
            "GET" => match id {
                Some(id) => {
                    let query = portway_odata::build_by_id_query(sql, &id).map_err(odata_error)?;
                    match self.sql.get_by_id(settings, &query).await? {
                        Some(row) => Ok(GatewayResponse::json(200, &row)),
                        None => Err(GatewayError::NotFound(format!(
                            "no {} with the requested id",
                            endpoint.name
                        ))),
                    }
                }
                None => {
                    let options = query_options(&request.query)?;
                    let query = portway_odata::build_collection_query(sql, &options, self.max_top)
                        .map_err(odata_error)?;
                    let result = self.sql.get_collection(settings, &query).await?;
                    let body = collection_body(&result, request, endpoint, &options);
                    Ok(GatewayResponse::json(200, &body))
                }
            },
            "POST" | "PUT" | "DELETE" => {
                if sql.procedure.is_none() {
                    return Err(GatewayError::MethodNotAllowed(request.method.to_string()));
                }
                let procedure_method = match request.method.as_str() {
                    "POST" => "INSERT",
                    "PUT" => "UPDATE",
                    _ => "DELETE",
                };

                let mut properties = if request.method == Method::DELETE {
                    Map::new()
                } else {
                    parse_object_body(&request.body)?
                };
                if let Some(id) = id {
                    properties.insert(sql.primary_key.clone(), id_to_json(&id));
                } else if request.method == Method::DELETE {
                    return Err(GatewayError::Validation(
                        "DELETE requires an id suffix".to_string(),
                    ));
                }

                let row = self
                    .sql
                    .execute_procedure(
                        settings,
                        sql,
                        procedure_method,
                        &record.username,
                        &properties,
                    )
                    .await?;
                Ok(GatewayResponse::json(
                    200,
                    &row.unwrap_or_else(|| json!({ "success": true })),
                ))
            }
            _ => Err(GatewayError::MethodNotAllowed(request.method.to_string())),
        }
    }

    async fn handle_webhook(
        &self,
        request: &IncomingRequest,
        settings: &EnvironmentSettings,
        webhook: &WebhookEndpoint,
        remainder: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        let webhook_id = remainder
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Validation("missing webhook id".to_string()))?;

        if !webhook.allowed_ids.iter().any(|id| id == webhook_id) {
            return Err(GatewayError::NotFound(format!(
                "webhook id '{webhook_id}' is not accepted"
            )));
        }

        let payload = std::str::from_utf8(&request.body)
            .map_err(|_| GatewayError::UnsupportedMediaType("body is not UTF-8".to_string()))?;
        if serde_json::from_str::<Value>(payload).is_err() {
            return Err(GatewayError::UnsupportedMediaType(
                "body is not valid JSON".to_string(),
            ));
        }

        let result = self
            .sql
            .ingest_webhook(settings, webhook, webhook_id, payload)
            .await?;
        Ok(GatewayResponse::json(200, &result))
    }

    /// Resolve and run one composite step against the in-process pipeline.
    /// Steps carry the authenticated principal; rate limits, auth, and
    /// scope were settled when the composite itself was admitted.
    async fn invoke_step(
        &self,
        ctx: &InternalInvoker<'_>,
        environment: &str,
        endpoint_ref: &str,
        method: &str,
        body: Value,
    ) -> Result<GatewayResponse, GatewayError> {
        if ctx.depth >= MAX_COMPOSITE_DEPTH {
            return Err(GatewayError::Validation(
                "composite nesting exceeds the supported depth".to_string(),
            ));
        }

        let (namespace, name) = endpoint_ref.split_once('/').unwrap_or(("", endpoint_ref));
        let snapshot = self.catalog.snapshot();
        let endpoint = snapshot.resolve(namespace, name).ok_or_else(|| {
            GatewayError::NotFound(format!("step target '{endpoint_ref}' not found"))
        })?;

        scope::check_endpoint_environment(&endpoint, environment)?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| GatewayError::MethodNotAllowed(method.to_string()))?;
        if !endpoint.allows_method(method.as_str()) {
            return Err(GatewayError::MethodNotAllowed(method.to_string()));
        }

        debug!(endpoint = %endpoint_ref, method = %method, depth = ctx.depth, "Composite step invocation");

        match &endpoint.kind {
            EndpointKind::Sql(sql) => {
                let settings = self.environment_settings(environment)?;
                match method.as_str() {
                    "GET" => {
                        let query = portway_odata::build_collection_query(
                            sql,
                            &QueryOptions::default(),
                            self.max_top,
                        )
                        .map_err(odata_error)?;
                        let result = self.sql.get_collection(&settings, &query).await?;
                        Ok(GatewayResponse::json(
                            200,
                            &json!({ "Count": result.rows.len(), "Value": result.rows }),
                        ))
                    }
                    _ => {
                        let procedure_method = match method.as_str() {
                            "POST" => "INSERT",
                            "PUT" => "UPDATE",
                            "DELETE" => "DELETE",
                            other => {
                                return Err(GatewayError::MethodNotAllowed(other.to_string()));
                            }
                        };
                        let properties = match body {
                            Value::Object(map) => map,
                            Value::Null => Map::new(),
                            _ => {
                                return Err(GatewayError::Validation(
                                    "step body must be a JSON object".to_string(),
                                ));
                            }
                        };
                        let row = self
                            .sql
                            .execute_procedure(
                                &settings,
                                sql,
                                procedure_method,
                                &ctx.username,
                                &properties,
                            )
                            .await?;
                        Ok(GatewayResponse::json(
                            200,
                            &row.unwrap_or_else(|| json!({ "success": true })),
                        ))
                    }
                }
            }
            EndpointKind::Proxy(proxy) => {
                let settings = self.environment_settings(environment)?;
                let payload = if body.is_null() {
                    Bytes::new()
                } else {
                    Bytes::from(serde_json::to_vec(&body)?)
                };
                let mut headers = HeaderMap::new();
                headers.insert(
                    "content-type",
                    http::HeaderValue::from_static("application/json"),
                );
                let proxy_request = ProxyRequest {
                    environment: environment.to_string(),
                    endpoint_name: endpoint.name.clone(),
                    upstream_url: proxy.upstream_url.clone(),
                    method,
                    remainder: String::new(),
                    query: String::new(),
                    headers,
                    body: payload,
                    env_headers: settings.headers.clone(),
                    request_scheme: ctx.scheme.clone(),
                    request_host: ctx.host.clone(),
                    cache_ttl: proxy.cache_ttl_secs.map(Duration::from_secs),
                    timeout: proxy.request_timeout_secs.map(Duration::from_secs),
                };
                self.proxy.forward(proxy_request).await
            }
            EndpointKind::Composite(composite) => {
                let deeper = InternalInvoker {
                    dispatcher: self,
                    scheme: ctx.scheme.clone(),
                    host: ctx.host.clone(),
                    username: ctx.username.clone(),
                    depth: ctx.depth + 1,
                };
                CompositeOrchestrator::execute(
                    &deeper,
                    composite,
                    environment,
                    &ctx.username,
                    &uuid::Uuid::new_v4().to_string(),
                    &body,
                )
                .await
            }
            _ => Err(GatewayError::Validation(format!(
                "endpoint '{endpoint_ref}' cannot be a composite step target"
            ))),
        }
    }

    fn environment_settings(
        &self,
        environment: &str,
    ) -> Result<EnvironmentSettings, GatewayError> {
        self.environments
            .get(environment)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Internal(format!("environment {environment} has no settings"))
            })
    }

    fn finish(
        &self,
        request: &IncomingRequest,
        started: Instant,
        info: RouteInfo,
        response: &GatewayResponse,
        deny_reason: &str,
    ) {
        let duration = started.elapsed();
        let kind = if info.kind.is_empty() { "unknown" } else { info.kind };
        self.metrics.record_request(
            kind,
            request.method.as_str(),
            response.status,
            duration.as_secs_f64(),
        );

        let mut entry = TrafficLogEntry::new(request.request_id.clone());
        entry.username = info.username;
        entry.environment = info.environment;
        entry.namespace = info.namespace;
        entry.endpoint = info.endpoint;
        entry.method = request.method.to_string();
        entry.path = format!("/api/{}", request.path);
        entry.status = response.status;
        entry.duration_ms = duration.as_secs_f64() * 1000.0;
        entry.client_ip = request.client_ip.clone();
        if !response.is_success() && !deny_reason.is_empty() {
            entry.deny(deny_reason);
        }
        self.traffic.record(entry);
    }
}

// ── Composite step invoker ───────────────────────────────────────────────────

struct InternalInvoker<'a> {
    dispatcher: &'a Dispatcher,
    scheme: String,
    host: String,
    username: String,
    depth: u32,
}

#[async_trait]
impl StepInvoker for InternalInvoker<'_> {
    async fn invoke(
        &self,
        environment: &str,
        endpoint: &str,
        method: &str,
        body: Value,
    ) -> Result<GatewayResponse, GatewayError> {
        self.dispatcher
            .invoke_step(self, environment, endpoint, method, body)
            .await
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}

fn odata_error(err: ODataError) -> GatewayError {
    GatewayError::InvalidQuery(err.to_string())
}

fn query_options(query: &str) -> Result<QueryOptions, GatewayError> {
    let mut options = QueryOptions::default();
    for (key, value) in path::parse_query(query) {
        match key.as_str() {
            "$top" => {
                options.top = Some(value.parse::<u32>().map_err(|_| {
                    GatewayError::InvalidQuery(format!("$top must be a non-negative integer, got '{value}'"))
                })?);
            }
            "$skip" => {
                options.skip = Some(value.parse::<u32>().map_err(|_| {
                    GatewayError::InvalidQuery(format!("$skip must be a non-negative integer, got '{value}'"))
                })?);
            }
            "$select" => options.select = Some(value),
            "$filter" => options.filter = Some(value),
            "$orderby" => options.orderby = Some(value),
            _ => {} // unknown query options are ignored
        }
    }
    Ok(options)
}

fn parse_object_body(body: &Bytes) -> Result<Map<String, Value>, GatewayError> {
    if body.is_empty() {
        return Err(GatewayError::Validation("request body is required".to_string()));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(GatewayError::Validation(
            "request body must be a JSON object".to_string(),
        )),
        Err(e) => Err(GatewayError::Validation(format!("invalid JSON body: {e}"))),
    }
}

fn id_to_json(id: &IdLiteral) -> Value {
    match id {
        IdLiteral::Int(n) => json!(n),
        IdLiteral::Str(s) => json!(s),
        IdLiteral::Guid(g) => json!(g.to_string()),
    }
}

/// Assemble `{ Count, Value, NextLink }` for a collection page.
fn collection_body(
    result: &CollectionResult,
    request: &IncomingRequest,
    endpoint: &Endpoint,
    options: &QueryOptions,
) -> Value {
    let next_link = if result.has_more {
        let mut link = String::from("/api/");
        link.push_str(request.path.split('/').next().unwrap_or_default());
        link.push('/');
        if !endpoint.namespace.is_empty() {
            link.push_str(&endpoint.namespace);
            link.push('/');
        }
        link.push_str(&endpoint.name);
        link.push_str(&format!(
            "?$top={}&$skip={}",
            result.top,
            result.skip + result.top
        ));
        if let Some(select) = &options.select {
            link.push_str(&format!("&$select={}", path::percent_encode(select)));
        }
        if let Some(filter) = &options.filter {
            link.push_str(&format!("&$filter={}", path::percent_encode(filter)));
        }
        if let Some(orderby) = &options.orderby {
            link.push_str(&format!("&$orderby={}", path::percent_encode(orderby)));
        }
        Value::String(link)
    } else {
        Value::Null
    };

    json!({
        "Count": result.rows.len(),
        "Value": result.rows,
        "NextLink": next_link,
    })
}

/// The 429 body: `{ error, retrytime, success: false }` with `Retry-After`
/// added by the header layer.
fn rate_limited_response(decision: &RateLimitDecision) -> GatewayResponse {
    let retry_secs = decision.retry_after_secs.unwrap_or(0);
    let retry_at = Utc::now() + chrono::Duration::seconds(retry_secs as i64);
    GatewayResponse::json(
        429,
        &json!({
            "error": "Rate limit exceeded",
            "retrytime": retry_at.to_rfc3339(),
            "success": false,
        }),
    )
}
