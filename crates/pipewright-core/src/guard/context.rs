//! Explicit tenant context.
//!
//! A [`TenantContext`] is resolved once per request from the
//! [`TenantDirectory`] and passed by value into everything that acts for the
//! tenant. Nothing reads a tenant from ambient state.

use std::collections::HashMap;
use std::sync::Arc;

use pipewright_types::config::{EngineConfig, TenantConfig};
use pipewright_types::tenant::TenantId;

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub config: Arc<TenantConfig>,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, config: Arc<TenantConfig>) -> Self {
        Self { tenant_id, config }
    }
}

/// Per-tenant configuration lookup, falling back to the defaults table.
#[derive(Debug, Clone)]
pub struct TenantDirectory {
    defaults: Arc<TenantConfig>,
    tenants: HashMap<String, Arc<TenantConfig>>,
}

impl TenantDirectory {
    pub fn new(defaults: TenantConfig) -> Self {
        Self {
            defaults: Arc::new(defaults),
            tenants: HashMap::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            defaults: Arc::new(config.defaults.clone()),
            tenants: config
                .tenants
                .iter()
                .map(|(id, cfg)| (id.clone(), Arc::new(cfg.clone())))
                .collect(),
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>, config: TenantConfig) -> Self {
        self.tenants.insert(tenant.into(), Arc::new(config));
        self
    }

    pub fn config_for(&self, tenant: &TenantId) -> Arc<TenantConfig> {
        self.tenants
            .get(tenant.as_str())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.defaults))
    }

    pub fn context(&self, tenant: &TenantId) -> TenantContext {
        TenantContext::new(tenant.clone(), self.config_for(tenant))
    }
}
