use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Namespaces that collide with gateway-owned URL space.
pub const RESERVED_NAMESPACES: &[&str] = &[
    "api", "docs", "swagger", "health", "admin", "system", "composite", "webhook", "files",
];

static NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

/// Check an endpoint or namespace identifier against the naming rule.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// A gateway endpoint, immutable after catalog load.
///
/// Uniqueness key is `(namespace, name)`; a missing namespace is the
/// empty string.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub namespace: String,
    pub display_name: Option<String>,
    /// Uppercase HTTP methods admitted by this endpoint.
    pub allowed_methods: Vec<String>,
    /// Environments admitted by this endpoint; empty = all globally-allowed.
    pub allowed_environments: Vec<String>,
    /// Private endpoints are reachable only through composite steps.
    pub is_private: bool,
    pub kind: EndpointKind,
}

/// Kind-specific endpoint payload.
#[derive(Debug, Clone)]
pub enum EndpointKind {
    Sql(SqlEndpoint),
    Proxy(ProxyEndpoint),
    Composite(CompositeEndpoint),
    Webhook(WebhookEndpoint),
    Static(StaticEndpoint),
    Files(FilesEndpoint),
}

impl EndpointKind {
    pub fn label(&self) -> &'static str {
        match self {
            EndpointKind::Sql(_) => "sql",
            EndpointKind::Proxy(_) => "proxy",
            EndpointKind::Composite(_) => "composite",
            EndpointKind::Webhook(_) => "webhook",
            EndpointKind::Static(_) => "static",
            EndpointKind::Files(_) => "files",
        }
    }

    /// Default method set applied when a descriptor omits `AllowedMethods`.
    pub fn default_methods(&self) -> Vec<String> {
        let methods: &[&str] = match self {
            EndpointKind::Sql(_) => &["GET", "POST", "PUT", "DELETE"],
            EndpointKind::Proxy(_) => &["GET", "POST", "PUT", "PATCH", "DELETE"],
            EndpointKind::Composite(_) => &["POST"],
            EndpointKind::Webhook(_) => &["POST"],
            EndpointKind::Static(_) => &["GET", "HEAD"],
            EndpointKind::Files(_) => &["GET", "POST", "DELETE"],
        };
        methods.iter().map(|m| m.to_string()).collect()
    }
}

impl Endpoint {
    /// The scope name this endpoint is matched under: `composite/<name>`
    /// and `webhook/<name>` for those kinds, the bare name otherwise.
    pub fn scope_name(&self) -> String {
        match self.kind {
            EndpointKind::Composite(_) => format!("composite/{}", self.name),
            EndpointKind::Webhook(_) => format!("webhook/{}", self.name),
            _ => self.name.clone(),
        }
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m == method)
    }

    /// Endpoint-level environment gate. An empty list admits every
    /// globally-allowed environment.
    pub fn allows_environment(&self, environment: &str) -> bool {
        self.allowed_environments.is_empty()
            || self.allowed_environments.iter().any(|e| e == environment)
    }
}

/// SQL endpoint: an OData-queried table/view, optionally writable
/// through a stored procedure.
#[derive(Debug, Clone)]
pub struct SqlEndpoint {
    pub schema: String,
    pub object_name: String,
    pub primary_key: String,
    /// External alias names, in declaration order.
    pub allowed_columns: Vec<String>,
    /// alias → database column. Inverse of `database_to_alias`.
    pub alias_to_database: HashMap<String, String>,
    /// database column → alias.
    pub database_to_alias: HashMap<String, String>,
    /// Stored procedure handling POST/PUT/DELETE; writes are rejected
    /// when absent.
    pub procedure: Option<String>,
    pub command_timeout_secs: u64,
}

impl SqlEndpoint {
    pub fn qualified_object(&self) -> String {
        format!("[{}].[{}]", self.schema, self.object_name)
    }

    pub fn is_column_allowed(&self, alias: &str) -> bool {
        self.alias_to_database.contains_key(alias)
    }
}

/// Reverse-proxied endpoint.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub upstream_url: String,
    /// Cache TTL override for GET responses (seconds); None = gateway default.
    pub cache_ttl_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

/// Composite endpoint: an ordered sequence of downstream calls. Steps
/// resolve purely by target endpoint name against the catalog.
#[derive(Debug, Clone)]
pub struct CompositeEndpoint {
    pub steps: Vec<CompositeStep>,
}

#[derive(Debug, Clone)]
pub struct CompositeStep {
    pub name: String,
    pub target_endpoint: String,
    pub method: String,
    /// Take `body[source_property]` as the step input.
    pub source_property: Option<String>,
    /// Execute once per element of `body[array_property]`.
    pub is_array: bool,
    pub array_property: Option<String>,
    pub depends_on: Option<String>,
    /// key → template expression ($guid, $requestid, $prev.<step>.<path>,
    /// $context.<var>, or a literal).
    pub template_transformations: HashMap<String, String>,
}

/// Webhook inbox endpoint. `allowed_ids` is the accepted webhook-id set.
#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
    pub schema: String,
    pub table_name: String,
    pub allowed_ids: Vec<String>,
}

/// Static content endpoint (served by the doc-surface collaborator).
#[derive(Debug, Clone)]
pub struct StaticEndpoint {
    pub content_type: String,
    pub content_file: String,
}

/// File storage endpoint (served by the blob-store collaborator).
#[derive(Debug, Clone)]
pub struct FilesEndpoint {
    pub base_directory: String,
    pub allowed_extensions: Vec<String>,
}

// ── Descriptor schemas (entity.json) ─────────────────────────────────────────

/// Fields shared by every descriptor kind.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonDescriptor {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_environments: Vec<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SqlDescriptor {
    #[serde(flatten)]
    pub common: CommonDescriptor,

    #[serde(default = "default_schema")]
    pub database_schema: String,
    pub database_object_name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Entries are `"Alias:DbColumn"` or a plain `"Name"` (alias == column).
    #[serde(default)]
    pub allowed_columns: Vec<String>,
    #[serde(default)]
    pub procedure: Option<String>,
    #[serde(default)]
    pub command_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyDescriptor {
    #[serde(flatten)]
    pub common: CommonDescriptor,

    pub url: String,
    /// "standard" (default) or "composite".
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub cache_duration_seconds: Option<u64>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
    /// Present when `Type` is "composite".
    #[serde(default)]
    pub steps: Vec<StepDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepDescriptor {
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_step_method")]
    pub method: String,
    #[serde(default)]
    pub source_property: Option<String>,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub array_property: Option<String>,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub template_transformations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompositeDescriptor {
    #[serde(flatten)]
    pub common: CommonDescriptor,

    pub steps: Vec<StepDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebhookDescriptor {
    #[serde(flatten)]
    pub common: CommonDescriptor,

    #[serde(default = "default_schema")]
    pub database_schema: String,
    #[serde(default = "default_webhook_table")]
    pub database_object_name: String,
    /// Interpreted as the set of accepted webhook ids.
    #[serde(default)]
    pub allowed_columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticDescriptor {
    #[serde(flatten)]
    pub common: CommonDescriptor,

    pub content_type: String,
    pub content_file: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilesDescriptor {
    #[serde(flatten)]
    pub common: CommonDescriptor,

    pub base_directory: String,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
}

fn default_schema() -> String {
    "dbo".to_string()
}

fn default_primary_key() -> String {
    "Id".to_string()
}

fn default_webhook_table() -> String {
    "WebhookData".to_string()
}

fn default_step_method() -> String {
    "POST".to_string()
}

/// Split an `AllowedColumns` entry into `(alias, database_column)`.
pub fn parse_column_entry(entry: &str) -> (String, String) {
    match entry.split_once(':') {
        Some((alias, column)) => (alias.trim().to_string(), column.trim().to_string()),
        None => (entry.trim().to_string(), entry.trim().to_string()),
    }
}
