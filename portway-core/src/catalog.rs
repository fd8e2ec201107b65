use crate::endpoint::{
    self, CommonDescriptor, CompositeDescriptor, CompositeEndpoint, CompositeStep, Endpoint,
    EndpointKind, FilesDescriptor, FilesEndpoint, ProxyDescriptor, ProxyEndpoint, SqlDescriptor,
    SqlEndpoint, StaticDescriptor, StaticEndpoint, StepDescriptor, WebhookDescriptor,
    WebhookEndpoint,
};
use anyhow::Context;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Kind subtrees recognised under the endpoints root.
const KIND_DIRS: &[&str] = &["SQL", "Proxy", "Composite", "Webhook", "Static", "Files"];

const DESCRIPTOR_FILE: &str = "entity.json";

/// The process-wide endpoint catalog.
///
/// Readers capture an immutable [`CatalogSnapshot`] and use it for the
/// whole request; `reload` builds a replacement from disk and swaps the
/// pointer atomically. A failed reload keeps the previous snapshot.
pub struct EndpointCatalog {
    root: PathBuf,
    inner: ArcSwap<CatalogSnapshot>,
}

/// Read-only view of every valid endpoint, keyed by `(namespace, name)`.
pub struct CatalogSnapshot {
    endpoints: HashMap<(String, String), Arc<Endpoint>>,
    pub loaded_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Catalog lookup with the legacy fallback: a miss under an explicit
    /// namespace retries against the empty namespace.
    pub fn resolve(&self, namespace: &str, name: &str) -> Option<Arc<Endpoint>> {
        self.get(namespace, name).or_else(|| {
            if namespace.is_empty() {
                None
            } else {
                self.get("", name)
            }
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.values()
    }
}

impl EndpointCatalog {
    /// Build the catalog from `<root>` (the directory containing the kind
    /// subtrees). A missing root is fatal; individual bad descriptors are
    /// logged and skipped.
    pub fn load(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let snapshot = build_snapshot(&root)?;
        info!(count = snapshot.len(), root = %root.display(), "Endpoint catalog loaded");
        Ok(Self {
            root,
            inner: ArcSwap::new(Arc::new(snapshot)),
        })
    }

    /// Rebuild from disk and publish atomically. Returns the new endpoint
    /// count; on failure the previous snapshot stays live.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let snapshot = build_snapshot(&self.root)?;
        let count = snapshot.len();
        self.inner.store(Arc::new(snapshot));
        info!(count, "Endpoint catalog reloaded");
        Ok(count)
    }

    /// Capture the current snapshot. Callers hold it across the request.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.inner.load_full()
    }
}

fn build_snapshot(root: &Path) -> anyhow::Result<CatalogSnapshot> {
    if !root.is_dir() {
        anyhow::bail!("endpoints root {} does not exist", root.display());
    }

    let mut endpoints: HashMap<(String, String), Arc<Endpoint>> = HashMap::new();

    for kind_dir in KIND_DIRS {
        let kind_root = root.join(kind_dir);
        if !kind_root.is_dir() {
            continue;
        }

        let mut descriptor_paths = Vec::new();
        collect_descriptors(&kind_root, &mut descriptor_paths);

        for path in descriptor_paths {
            match load_descriptor(kind_dir, &kind_root, &path) {
                Ok(endpoint) => {
                    let key = (endpoint.namespace.clone(), endpoint.name.clone());
                    if endpoints.contains_key(&key) {
                        warn!(
                            namespace = %key.0,
                            endpoint = %key.1,
                            path = %path.display(),
                            "Duplicate endpoint key, keeping the first definition"
                        );
                        continue;
                    }
                    endpoints.insert(key, Arc::new(endpoint));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid endpoint descriptor");
                }
            }
        }
    }

    Ok(CatalogSnapshot {
        endpoints,
        loaded_at: Utc::now(),
    })
}

fn collect_descriptors(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Unreadable directory in endpoints tree");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_descriptors(&path, out);
        } else if path.file_name().is_some_and(|n| n == DESCRIPTOR_FILE) {
            out.push(path);
        }
    }
}

/// Derive `(inferred_namespace, name)` from the descriptor's position:
/// the immediate parent names the endpoint, the directory above it (when
/// not the kind root) is the namespace.
fn infer_identity(kind_root: &Path, descriptor: &Path) -> anyhow::Result<(String, String)> {
    let endpoint_dir = descriptor
        .parent()
        .context("descriptor has no parent directory")?;
    let name = endpoint_dir
        .file_name()
        .context("endpoint directory has no name")?
        .to_string_lossy()
        .to_string();

    let namespace = match endpoint_dir.parent() {
        Some(parent) if parent != kind_root => parent
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        _ => String::new(),
    };

    Ok((namespace, name))
}

fn load_descriptor(kind: &str, kind_root: &Path, path: &Path) -> anyhow::Result<Endpoint> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let (inferred_namespace, name) = infer_identity(kind_root, path)?;

    let endpoint = match kind {
        "SQL" => {
            let desc: SqlDescriptor = serde_json::from_str(&raw)?;
            let sql = build_sql(&desc)?;
            assemble(name, inferred_namespace, desc.common, EndpointKind::Sql(sql))?
        }
        "Proxy" => {
            let desc: ProxyDescriptor = serde_json::from_str(&raw)?;
            if desc.r#type.as_deref() == Some("composite") {
                let composite = build_composite(&desc.steps)?;
                assemble(
                    name,
                    inferred_namespace,
                    desc.common,
                    EndpointKind::Composite(composite),
                )?
            } else {
                let proxy = ProxyEndpoint {
                    upstream_url: desc.url.clone(),
                    cache_ttl_secs: desc.cache_duration_seconds,
                    request_timeout_secs: desc.request_timeout_seconds,
                };
                assemble(name, inferred_namespace, desc.common, EndpointKind::Proxy(proxy))?
            }
        }
        "Composite" => {
            let desc: CompositeDescriptor = serde_json::from_str(&raw)?;
            let composite = build_composite(&desc.steps)?;
            assemble(
                name,
                inferred_namespace,
                desc.common,
                EndpointKind::Composite(composite),
            )?
        }
        "Webhook" => {
            let desc: WebhookDescriptor = serde_json::from_str(&raw)?;
            let webhook = WebhookEndpoint {
                schema: desc.database_schema.clone(),
                table_name: desc.database_object_name.clone(),
                allowed_ids: desc.allowed_columns.clone(),
            };
            assemble(
                name,
                inferred_namespace,
                desc.common,
                EndpointKind::Webhook(webhook),
            )?
        }
        "Static" => {
            let desc: StaticDescriptor = serde_json::from_str(&raw)?;
            let st = StaticEndpoint {
                content_type: desc.content_type.clone(),
                content_file: desc.content_file.clone(),
            };
            assemble(name, inferred_namespace, desc.common, EndpointKind::Static(st))?
        }
        "Files" => {
            let desc: FilesDescriptor = serde_json::from_str(&raw)?;
            let files = FilesEndpoint {
                base_directory: desc.base_directory.clone(),
                allowed_extensions: desc.allowed_extensions.clone(),
            };
            assemble(name, inferred_namespace, desc.common, EndpointKind::Files(files))?
        }
        other => anyhow::bail!("unknown endpoint kind directory {other}"),
    };

    Ok(endpoint)
}

fn assemble(
    name: String,
    inferred_namespace: String,
    common: CommonDescriptor,
    kind: EndpointKind,
) -> anyhow::Result<Endpoint> {
    if !endpoint::is_valid_name(&name) {
        anyhow::bail!("invalid endpoint name {name:?}");
    }

    // Explicit Namespace field wins over the directory-inferred one.
    let namespace = match common.namespace {
        Some(explicit) => {
            if !inferred_namespace.is_empty() && explicit != inferred_namespace {
                warn!(
                    endpoint = %name,
                    inferred = %inferred_namespace,
                    explicit = %explicit,
                    "Namespace conflict, explicit value wins"
                );
            }
            explicit
        }
        None => inferred_namespace,
    };

    if !namespace.is_empty() {
        if !endpoint::is_valid_name(&namespace) {
            anyhow::bail!("invalid namespace {namespace:?}");
        }
        if endpoint::RESERVED_NAMESPACES.contains(&namespace.to_ascii_lowercase().as_str()) {
            anyhow::bail!("namespace {namespace:?} is reserved");
        }
    }

    let allowed_methods = if common.allowed_methods.is_empty() {
        kind.default_methods()
    } else {
        common
            .allowed_methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect()
    };

    Ok(Endpoint {
        name,
        namespace,
        display_name: common.display_name,
        allowed_methods,
        allowed_environments: common.allowed_environments,
        is_private: common.is_private,
        kind,
    })
}

fn build_sql(desc: &SqlDescriptor) -> anyhow::Result<SqlEndpoint> {
    let mut allowed_columns = Vec::with_capacity(desc.allowed_columns.len());
    let mut alias_to_database = HashMap::new();
    let mut database_to_alias = HashMap::new();

    for entry in &desc.allowed_columns {
        let (alias, column) = endpoint::parse_column_entry(entry);
        if alias.is_empty() || column.is_empty() {
            anyhow::bail!("empty column mapping entry {entry:?}");
        }
        if alias_to_database.insert(alias.clone(), column.clone()).is_some() {
            anyhow::bail!("duplicate alias {alias:?}");
        }
        if database_to_alias.insert(column.clone(), alias.clone()).is_some() {
            anyhow::bail!("duplicate database column {column:?}");
        }
        allowed_columns.push(alias);
    }

    Ok(SqlEndpoint {
        schema: desc.database_schema.clone(),
        object_name: desc.database_object_name.clone(),
        primary_key: desc.primary_key.clone(),
        allowed_columns,
        alias_to_database,
        database_to_alias,
        procedure: desc.procedure.clone(),
        command_timeout_secs: desc.command_timeout_seconds.unwrap_or(30),
    })
}

fn build_composite(steps: &[StepDescriptor]) -> anyhow::Result<CompositeEndpoint> {
    if steps.is_empty() {
        anyhow::bail!("composite endpoint has no steps");
    }

    let mut seen: Vec<&str> = Vec::with_capacity(steps.len());
    let mut built = Vec::with_capacity(steps.len());

    for step in steps {
        if seen.contains(&step.name.as_str()) {
            anyhow::bail!("duplicate step name {:?}", step.name);
        }
        if let Some(dep) = &step.depends_on {
            if !seen.contains(&dep.as_str()) {
                anyhow::bail!(
                    "step {:?} depends on {:?} which is not an earlier step",
                    step.name,
                    dep
                );
            }
        }
        if step.is_array && step.array_property.is_none() {
            anyhow::bail!("array step {:?} is missing ArrayProperty", step.name);
        }
        seen.push(&step.name);
        built.push(CompositeStep {
            name: step.name.clone(),
            target_endpoint: step.endpoint.clone(),
            method: step.method.to_ascii_uppercase(),
            source_property: step.source_property.clone(),
            is_array: step.is_array,
            array_property: step.array_property.clone(),
            depends_on: step.depends_on.clone(),
            template_transformations: step.template_transformations.clone(),
        });
    }

    Ok(CompositeEndpoint { steps: built })
}
