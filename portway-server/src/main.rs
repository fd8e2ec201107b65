// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Portway — configuration-driven API gateway
//
//  Pipeline:  rate limit → token auth → scope gate → handler
//  Backends:  SQL Server (OData subset), HTTP upstreams, composites,
//             webhook inbox
//  Config:    endpoints/ + environments/ descriptor trees, SIGHUP reload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use portway_auth::TokenStore;
use portway_core::catalog::EndpointCatalog;
use portway_core::environment::EnvironmentRegistry;
use portway_core::policy::NetworkAccessPolicy;
use portway_core::settings::GatewaySettings;
use portway_gateway::dispatcher::{Dispatcher, NullBlobStore};
use portway_gateway::http::{self, AppState};
use portway_limit::RateLimiter;
use portway_observability::{GatewayMetrics, TrafficLog};
use portway_proxy::MemoryResponseCache;
use portway_proxy::engine::{EngineSettings, ProxyEngine};
use portway_sql::{EnvironmentPools, SqlExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "portway", version, about = "Portway — configuration-driven API gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit log lines as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    portway_observability::logger::init(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Portway starting");

    let settings = GatewaySettings::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(settings))
}

async fn run(settings: GatewaySettings) -> anyhow::Result<()> {
    // ── Configuration trees ──
    let catalog = Arc::new(EndpointCatalog::load(&settings.paths.endpoints_root)?);
    let environments = Arc::new(EnvironmentRegistry::load(&settings.paths.environments_root)?);
    let policy = Arc::new(NetworkAccessPolicy::load(
        &settings.paths.environments_root.join("network-access-policy.json"),
    ));
    info!(
        endpoints = catalog.snapshot().len(),
        environments = environments.len(),
        "Configuration loaded"
    );

    // ── Token store ──
    let tokens = Arc::new(TokenStore::open(&settings.paths.token_db).await?);
    info!(active = tokens.active_count().await?, "Token store ready");

    // ── Rate limiter ──
    let limiter = Arc::new(RateLimiter::new(
        settings.rate_limit.ip_limit,
        Duration::from_secs(settings.rate_limit.ip_window_secs),
        settings.rate_limit.token_limit,
        Duration::from_secs(settings.rate_limit.token_window_secs),
    ));

    // ── SQL executor ──
    let pools = EnvironmentPools::new(
        settings.sql.pool_min,
        settings.sql.pool_max,
        Duration::from_secs(settings.sql.command_timeout_secs),
    );
    let executor = Arc::new(SqlExecutor::new(
        pools,
        Duration::from_secs(settings.sql.command_timeout_secs),
    ));

    // ── Proxy engine ──
    let cache = Arc::new(MemoryResponseCache::new(
        settings.cache.max_entries_per_endpoint,
    ));
    let proxy = Arc::new(ProxyEngine::new(
        cache,
        Arc::clone(&policy),
        EngineSettings {
            default_cache_ttl: Duration::from_secs(settings.cache.default_ttl_secs),
            lock_wait: Duration::from_secs(settings.cache.lock_wait_secs),
            lock_lease: Duration::from_secs(settings.cache.lock_lease_secs),
            lock_retry: Duration::from_millis(settings.cache.lock_retry_ms),
            connect_timeout: Duration::from_secs(settings.proxy.connect_timeout_secs),
            request_timeout: Duration::from_secs(settings.proxy.request_timeout_secs),
        },
    )?);

    // ── Observability ──
    let metrics = Arc::new(GatewayMetrics::new()?);
    metrics.catalog_endpoints.set(catalog.snapshot().len() as i64);
    let traffic = if settings.traffic_log.enabled {
        TrafficLog::start(
            settings.traffic_log.file_path.clone(),
            settings.traffic_log.queue_capacity,
            settings.traffic_log.max_file_size_bytes,
            settings.traffic_log.max_rotated_files,
        )?
    } else {
        TrafficLog::disabled()
    };

    // ── Dispatcher ──
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&catalog),
        Arc::clone(&environments),
        tokens,
        limiter,
        executor,
        proxy,
        Arc::new(NullBlobStore),
        traffic.clone(),
        Arc::clone(&metrics),
        settings.sql.max_top,
    ));

    // ── Catalog reload on SIGHUP; failures keep the live snapshot ──
    {
        let catalog = Arc::clone(&catalog);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                warn!("SIGHUP handler unavailable, catalog reload disabled");
                return;
            };
            while hangup.recv().await.is_some() {
                match catalog.reload() {
                    Ok(count) => metrics.catalog_endpoints.set(count as i64),
                    Err(e) => error!(error = %e, "Catalog reload failed, keeping previous snapshot"),
                }
            }
        });
    }

    // ── Serve ──
    let state = Arc::new(AppState {
        dispatcher,
        catalog,
        environments,
        metrics,
        max_body_bytes: settings.listener.max_body_bytes,
    });

    http::serve(state, settings.listener.addr, shutdown_signal()).await?;

    traffic.shutdown();
    info!("Portway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
    }
}
