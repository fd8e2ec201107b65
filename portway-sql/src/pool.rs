use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use dashmap::DashMap;
use portway_core::environment::EnvironmentSettings;
use portway_core::error::GatewayError;
use std::time::Duration;
use tiberius::Config;
use tracing::{error, info};

/// One bounded Tiberius pool per environment, built lazily from the
/// environment's ADO.NET connection string.
pub struct EnvironmentPools {
    pools: DashMap<String, Pool<ConnectionManager>>,
    pool_min: u32,
    pool_max: u32,
    acquire_timeout: Duration,
}

impl EnvironmentPools {
    pub fn new(pool_min: u32, pool_max: u32, acquire_timeout: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            pool_min,
            pool_max,
            acquire_timeout,
        }
    }

    /// Get (building on first use) the pool for an environment.
    pub async fn get(
        &self,
        environment: &EnvironmentSettings,
    ) -> Result<Pool<ConnectionManager>, GatewayError> {
        if let Some(pool) = self.pools.get(&environment.name) {
            return Ok(pool.clone());
        }

        let config = Config::from_ado_string(&environment.connection_string).map_err(|e| {
            error!(environment = %environment.name, error = %e, "Invalid connection string");
            GatewayError::Internal(format!("connection configuration for {}", environment.name))
        })?;

        let manager = ConnectionManager::build(config).map_err(|e| {
            error!(environment = %environment.name, error = %e, "Failed to build connection manager");
            GatewayError::Internal(format!("connection manager for {}", environment.name))
        })?;

        let pool = Pool::builder()
            .min_idle(Some(self.pool_min))
            .max_size(self.pool_max)
            .connection_timeout(self.acquire_timeout)
            .build(manager)
            .await
            .map_err(|e| {
                error!(environment = %environment.name, error = %e, "Failed to build pool");
                GatewayError::UpstreamUnavailable
            })?;

        info!(
            environment = %environment.name,
            min = self.pool_min,
            max = self.pool_max,
            "SQL pool created"
        );

        // A concurrent builder may have won the race; keep whichever landed.
        Ok(self
            .pools
            .entry(environment.name.clone())
            .or_insert(pool)
            .clone())
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
