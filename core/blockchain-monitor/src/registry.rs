// core/blockchain-monitor/src/registry.rs
// Running monitors keyed by (tenant, coin), gated by tenant quotas

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use coinwatch_common::{
    monitor_id, validate_coin_symbol, validate_monitored_address, Capability, MetricsSink,
    ModuleSettings, MonitorSettings, MonitorStateRecord, MonitorStatus, NoopMetrics, Persistence,
    QuotaResource, QuotaStore, ServiceError, StoreError, TenancyError, TenancyGate, TenantId,
    ValidationError,
};
use coinwatch_node::{ConnectionPool, NodeApi, PoolSettings};

use crate::callback::TransactionCallback;
use crate::monitor::{Monitor, MonitorError, MonitorHandle, MonitorStats};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Coin not configured: {0}")]
    UnsupportedCoin(String),
    #[error("Monitor already running for tenant {tenant_id} on {coin}")]
    AlreadyRunning { tenant_id: TenantId, coin: String },
    #[error("No monitor running for tenant {tenant_id} on {coin}")]
    NotRunning { tenant_id: TenantId, coin: String },
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Tenancy(e) => e.into(),
            RegistryError::Store(e) => e.into(),
            RegistryError::Validation(e) | RegistryError::Monitor(MonitorError::Validation(e)) => {
                e.into()
            }
            RegistryError::Monitor(MonitorError::Store(e)) => e.into(),
            RegistryError::Monitor(e) => ServiceError::InternalError(e.to_string()),
            RegistryError::UnsupportedCoin(_) => ServiceError::ValidationError(err.to_string()),
            RegistryError::AlreadyRunning { .. } => ServiceError::Conflict(err.to_string()),
            RegistryError::NotRunning { .. } => ServiceError::NotFound(err.to_string()),
        }
    }
}

struct RunningMonitor {
    handle: MonitorHandle,
    task: JoinHandle<MonitorStatus>,
}

type MonitorKey = (TenantId, String);

/// Owns every running monitor and one connection pool per coin.
pub struct MonitorRegistry {
    settings: ModuleSettings,
    monitor_settings: MonitorSettings,
    store: Arc<dyn Persistence>,
    gate: TenancyGate,
    metrics: Arc<dyn MetricsSink>,
    callback: Option<Arc<dyn TransactionCallback>>,
    pools: HashMap<String, Arc<ConnectionPool>>,
    nodes: HashMap<String, Arc<dyn NodeApi>>,
    monitors: Mutex<HashMap<MonitorKey, RunningMonitor>>,
    shutdown: CancellationToken,
}

impl MonitorRegistry {
    pub fn new<S>(store: Arc<S>, settings: ModuleSettings) -> Self
    where
        S: Persistence + QuotaStore + 'static,
    {
        let pool_settings =
            PoolSettings::default().with_max_connections(settings.connection_pool_size);
        let pools = settings
            .coins
            .keys()
            .map(|symbol| {
                (
                    symbol.clone(),
                    Arc::new(ConnectionPool::new(pool_settings.clone())),
                )
            })
            .collect();

        let monitor_settings = MonitorSettings::default()
            .with_max_reconnect_attempts(settings.max_reconnect_attempts);
        let quota_store: Arc<dyn QuotaStore> = store.clone();

        Self {
            settings,
            monitor_settings,
            store,
            gate: TenancyGate::new(quota_store),
            metrics: Arc::new(NoopMetrics),
            callback: None,
            pools,
            nodes: HashMap::new(),
            monitors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn TransactionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_monitor_settings(mut self, settings: MonitorSettings) -> Self {
        self.monitor_settings = settings;
        self
    }

    /// Node used for the initial UTXO backfill of new monitors.
    pub fn with_node(mut self, node: Arc<dyn NodeApi>) -> Self {
        self.nodes.insert(node.coin().to_uppercase(), node);
        self
    }

    pub fn gate(&self) -> &TenancyGate {
        &self.gate
    }

    pub fn pool(&self, coin: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(&coin.to_uppercase()).cloned()
    }

    pub fn pools(&self) -> Vec<(String, Arc<ConnectionPool>)> {
        let mut pools: Vec<_> = self
            .pools
            .iter()
            .map(|(coin, pool)| (coin.clone(), pool.clone()))
            .collect();
        pools.sort_by(|a, b| a.0.cmp(&b.0));
        pools
    }

    fn coin_key(&self, coin: &str) -> Result<String, RegistryError> {
        validate_coin_symbol(coin)?;
        let symbol = coin.to_uppercase();
        if !self.settings.coins.contains_key(&symbol) {
            return Err(RegistryError::UnsupportedCoin(symbol));
        }
        Ok(symbol)
    }

    pub async fn start_monitor(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<MonitorHandle, RegistryError> {
        let coin = self.coin_key(coin)?;
        self.spawn_monitor(tenant_id, coin, true).await
    }

    /// Restarts every monitor last recorded as running. Quotas were checked
    /// when they were first started.
    pub async fn restore_running(&self) -> Result<usize, RegistryError> {
        let mut restored = 0;
        for state in self.store.get_running_monitors().await? {
            let coin = match self.coin_key(&state.coin) {
                Ok(coin) => coin,
                Err(e) => {
                    warn!(monitor_id = %state.monitor_id, error = %e, "Skipping monitor restore");
                    continue;
                }
            };
            match self.spawn_monitor(state.tenant_id, coin, false).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    error!(monitor_id = %state.monitor_id, error = %e, "Failed to restore monitor");
                }
            }
        }
        info!(restored, "Restored running monitors");
        Ok(restored)
    }

    async fn spawn_monitor(
        &self,
        tenant_id: TenantId,
        coin: String,
        check_quota: bool,
    ) -> Result<MonitorHandle, RegistryError> {
        let key = (tenant_id, coin.clone());
        let mut monitors = self.monitors.lock().await;

        if let Some(existing) = monitors.get(&key) {
            if !existing.task.is_finished() {
                return Err(RegistryError::AlreadyRunning { tenant_id, coin });
            }
            monitors.remove(&key);
        }

        if check_quota {
            self.gate
                .check_quota(tenant_id, QuotaResource::ConcurrentMonitors, 1)
                .await?;
        }

        let pool = self
            .pool(&coin)
            .ok_or_else(|| RegistryError::UnsupportedCoin(coin.clone()))?;

        let mut monitor = Monitor::new(tenant_id, self.settings.coin(&coin), self.store.clone())
            .with_pool(pool)
            .with_metrics(self.metrics.clone())
            .with_settings(self.monitor_settings.clone())
            .with_cancellation(self.shutdown.child_token());
        if let Some(callback) = &self.callback {
            monitor = monitor.with_callback(callback.clone());
        }
        let backfill = match self.nodes.get(&coin) {
            Some(node) => {
                monitor = monitor.with_node(node.clone());
                true
            }
            None => false,
        };

        if !monitor.initialize().await {
            warn!(tenant_id = %tenant_id, coin = %coin, "Monitor starting with an empty watch set");
        }

        self.save_state(tenant_id, &coin, MonitorStatus::Running)
            .await?;

        let handle = monitor.handle();
        let store = self.store.clone();
        let task_coin = coin.clone();
        let task = tokio::spawn(async move {
            if backfill {
                if let Err(e) = monitor.backfill().await {
                    warn!(tenant_id = %tenant_id, error = %e, "Backfill skipped");
                }
            }

            let status = monitor.start().await;
            // stop_monitor records explicit stops; shutdown leaves rows running for restore
            if status == MonitorStatus::Failed {
                let state = MonitorStateRecord {
                    tenant_id,
                    monitor_id: monitor_id(tenant_id, &task_coin),
                    coin: task_coin,
                    status,
                    last_active: Utc::now(),
                };
                if let Err(e) = store.save_monitor_state(&state).await {
                    error!(tenant_id = %tenant_id, error = %e, "Failed to record monitor failure");
                }
            }
            status
        });

        info!(tenant_id = %tenant_id, coin = %coin, "Monitor started");
        monitors.insert(
            key,
            RunningMonitor {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    async fn save_state(
        &self,
        tenant_id: TenantId,
        coin: &str,
        status: MonitorStatus,
    ) -> Result<(), StoreError> {
        self.store
            .save_monitor_state(&MonitorStateRecord {
                tenant_id,
                coin: coin.to_string(),
                monitor_id: monitor_id(tenant_id, coin),
                status,
                last_active: Utc::now(),
            })
            .await
    }

    pub async fn stop_monitor(&self, tenant_id: TenantId, coin: &str) -> Result<(), RegistryError> {
        let coin = coin.to_uppercase();
        let running = self
            .monitors
            .lock()
            .await
            .remove(&(tenant_id, coin.clone()))
            .ok_or_else(|| RegistryError::NotRunning {
                tenant_id,
                coin: coin.clone(),
            })?;

        running.handle.close().await;
        if let Err(e) = running.task.await {
            error!(tenant_id = %tenant_id, coin = %coin, error = %e, "Monitor task panicked");
        }

        self.save_state(tenant_id, &coin, MonitorStatus::Stopped)
            .await?;
        info!(tenant_id = %tenant_id, coin = %coin, "Monitor stopped");
        Ok(())
    }

    async fn handle_for(&self, tenant_id: TenantId, coin: &str) -> Option<MonitorHandle> {
        self.monitors
            .lock()
            .await
            .get(&(tenant_id, coin.to_string()))
            .filter(|running| !running.task.is_finished())
            .map(|running| running.handle.clone())
    }

    /// Adds through the running monitor, or straight to the store when none
    /// is running so the next start picks it up.
    pub async fn add_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
        label: Option<&str>,
    ) -> Result<(), RegistryError> {
        let coin = self.coin_key(coin)?;
        validate_monitored_address(address)?;

        self.gate
            .require_capability(tenant_id, Capability::CreateAddresses)
            .await?;
        self.gate
            .check_quota(tenant_id, QuotaResource::MonitoredAddresses, 1)
            .await?;

        match self.handle_for(tenant_id, &coin).await {
            Some(handle) => handle.add_address(address, label).await?,
            None => {
                self.store
                    .add_address(tenant_id, &coin, address, label)
                    .await?
            }
        }
        Ok(())
    }

    pub async fn remove_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
    ) -> Result<(), RegistryError> {
        let coin = self.coin_key(coin)?;
        validate_monitored_address(address)?;

        match self.handle_for(tenant_id, &coin).await {
            Some(handle) => handle.remove_address(address).await?,
            None => {
                self.store
                    .deactivate_address(tenant_id, &coin, address)
                    .await?
            }
        }
        Ok(())
    }

    pub async fn stats(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<MonitorStats, RegistryError> {
        let coin = coin.to_uppercase();
        let handle = self
            .handle_for(tenant_id, &coin)
            .await
            .ok_or_else(|| RegistryError::NotRunning {
                tenant_id,
                coin: coin.clone(),
            })?;
        Ok(handle.stats().await?)
    }

    pub async fn all_stats(&self) -> Vec<MonitorStats> {
        let handles: Vec<MonitorHandle> = self
            .monitors
            .lock()
            .await
            .values()
            .map(|running| running.handle.clone())
            .collect();

        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(s) = handle.stats().await {
                stats.push(s);
            }
        }
        stats.sort_by(|a, b| (a.tenant_id, &a.coin).cmp(&(b.tenant_id, &b.coin)));
        stats
    }

    pub async fn running_monitors(&self) -> Vec<(TenantId, String)> {
        let mut running: Vec<(TenantId, String)> = self
            .monitors
            .lock()
            .await
            .iter()
            .filter(|(_, running)| !running.task.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        running.sort();
        running
    }

    /// Cancels every monitor, waits for their tasks and closes the pools.
    pub async fn shutdown(&self) {
        info!("Shutting down monitor registry");
        self.shutdown.cancel();

        let running: Vec<(MonitorKey, RunningMonitor)> =
            self.monitors.lock().await.drain().collect();
        for ((tenant_id, coin), monitor) in running {
            if let Err(e) = monitor.task.await {
                error!(tenant_id = %tenant_id, coin = %coin, error = %e, "Monitor task panicked");
            }
        }

        for pool in self.pools.values() {
            pool.close().await;
        }
        info!("Monitor registry stopped");
    }
}
