use std::sync::Arc;
use strata_core::config::HealthConfig;
use strata_core::health::parse_pool_status;
use strata_core::{CommandRunner, PoolHealth, StrataError};

/// Reads pool state and scan progress from `zpool`.
pub struct StorageHealthMonitor {
    runner: Arc<dyn CommandRunner>,
    config: HealthConfig,
}

impl StorageHealthMonitor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: HealthConfig) -> Self {
        Self { runner, config }
    }

    pub async fn pool_names(&self) -> Result<Vec<String>, StrataError> {
        let output = self.runner.run_checked("zpool", &["list", "-H", "-o", "name"]).await?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && self.config.wants(name))
            .map(str::to_string)
            .collect())
    }

    pub async fn pool_health(&self, pool: &str) -> Result<Option<PoolHealth>, StrataError> {
        let output = self
            .runner
            .run_checked("zpool", &["status", "-j", "--json-int", pool])
            .await?;

        Ok(parse_pool_status(&output.stdout)?
            .into_iter()
            .find(|health| health.name == pool))
    }

    /// One health snapshot per pool. A pool whose status can't be read is
    /// skipped with a warning.
    pub async fn poll(&self) -> Result<Vec<PoolHealth>, StrataError> {
        let mut report = Vec::new();

        for pool in self.pool_names().await? {
            match self.pool_health(&pool).await {
                Ok(Some(health)) => report.push(health),
                Ok(None) => log::warn!("zpool status did not report pool {}", pool),
                Err(e) => log::warn!("Couldn't read status of pool {}: {}", pool, e),
            }
        }

        Ok(report)
    }

    /// Poll once and log the result.
    pub async fn log_health(&self) -> Result<(), StrataError> {
        for pool in self.poll().await? {
            match (&pool.scan_function, pool.scan_progress()) {
                (Some(function), Some(progress)) => log::info!(
                    "Pool {} is {}, {} {}",
                    pool.name,
                    pool.state,
                    function.to_lowercase(),
                    progress
                ),
                _ => log::info!("Pool {} is {}", pool.name, pool.state),
            }
        }
        Ok(())
    }
}
