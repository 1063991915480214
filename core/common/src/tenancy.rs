// core/common/src/tenancy.rs
// Per-tenant quota and capability checks

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Quota, TenantId};
use crate::persistence::{QuotaStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    MonitoredAddresses,
    DailyApiCalls,
    ConcurrentMonitors,
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuotaResource::MonitoredAddresses => "monitored addresses",
            QuotaResource::DailyApiCalls => "daily API calls",
            QuotaResource::ConcurrentMonitors => "concurrent monitors",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CollectFunds,
    CreateAddresses,
    ViewTransactions,
}

impl Capability {
    fn granted_by(&self, quota: &Quota) -> bool {
        match self {
            Capability::CollectFunds => quota.can_collect_funds,
            Capability::CreateAddresses => quota.can_create_addresses,
            Capability::ViewTransactions => quota.can_view_transactions,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::CollectFunds => "collect_funds",
            Capability::CreateAddresses => "create_addresses",
            Capability::ViewTransactions => "view_transactions",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("Quota exceeded for tenant {tenant_id}: {resource} {current} + {requested} > {limit}")]
    QuotaExceeded {
        tenant_id: TenantId,
        resource: QuotaResource,
        current: u64,
        requested: u64,
        limit: u64,
    },
    #[error("Permission denied for tenant {tenant_id}: missing {capability}")]
    PermissionDenied {
        tenant_id: TenantId,
        capability: Capability,
    },
    #[error("Unknown tenant: {0}")]
    UnknownTenant(TenantId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Quota and capability gate in front of every tenant-scoped operation.
#[derive(Clone)]
pub struct TenancyGate {
    store: Arc<dyn QuotaStore>,
}

impl TenancyGate {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    async fn quota(&self, tenant_id: TenantId) -> Result<Quota, TenancyError> {
        self.store
            .get_quota(tenant_id)
            .await?
            .ok_or(TenancyError::UnknownTenant(tenant_id))
    }

    /// Accepts iff `current + increment <= max`; never truncates a request.
    pub async fn check_quota(
        &self,
        tenant_id: TenantId,
        resource: QuotaResource,
        increment: u64,
    ) -> Result<(), TenancyError> {
        let quota = self.quota(tenant_id).await?;

        let (current, limit) = match resource {
            QuotaResource::MonitoredAddresses => (
                self.store.count_active_addresses(tenant_id).await?,
                quota.max_monitored_addresses as u64,
            ),
            QuotaResource::DailyApiCalls => (
                self.store.count_api_calls_today(tenant_id).await?,
                quota.max_daily_api_calls as u64,
            ),
            QuotaResource::ConcurrentMonitors => (
                self.store.count_active_monitors(tenant_id).await?,
                quota.max_concurrent_monitors as u64,
            ),
        };

        if current.saturating_add(increment) > limit {
            warn!(
                tenant_id = %tenant_id,
                resource = %resource,
                current,
                increment,
                limit,
                "Quota exceeded"
            );
            return Err(TenancyError::QuotaExceeded {
                tenant_id,
                resource,
                current,
                requested: increment,
                limit,
            });
        }

        debug!(tenant_id = %tenant_id, resource = %resource, current, limit, "Quota check passed");
        Ok(())
    }

    pub async fn require_capability(
        &self,
        tenant_id: TenantId,
        capability: Capability,
    ) -> Result<(), TenancyError> {
        let quota = self.quota(tenant_id).await?;
        if capability.granted_by(&quota) {
            Ok(())
        } else {
            warn!(tenant_id = %tenant_id, capability = %capability, "Permission denied");
            Err(TenancyError::PermissionDenied {
                tenant_id,
                capability,
            })
        }
    }

    /// Counts one call against today's quota, then logs it.
    pub async fn record_api_call(
        &self,
        tenant_id: TenantId,
        action: &str,
    ) -> Result<(), TenancyError> {
        self.check_quota(tenant_id, QuotaResource::DailyApiCalls, 1)
            .await?;
        self.store.log_api_call(tenant_id, action).await?;
        Ok(())
    }
}
