use std::io;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::Ms;

/// Color + pattern codes as the display firmware understands them
/// (0 = off/solid; colors: 1 green, 2 red, 3 amber; patterns: 1 blink,
/// 2 cross).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Look {
    pub color: u8,
    pub pattern: u8,
}

/// Per-tenant display configuration. Pure data — the state engine maps its
/// resolution onto one of these looks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPolicy {
    pub free: Look,
    pub occupied: Look,
    pub reserved: Look,
    pub unknown: Look,
    pub closed: Look,
    pub fport: u8,
    /// Admin overrides without an explicit expiry are cleared after this
    /// long; None = overrides persist until cleared.
    pub override_expiry_ms: Option<Ms>,
}

impl Default for DisplayPolicy {
    fn default() -> Self {
        Self {
            free: Look { color: 1, pattern: 0 },
            occupied: Look { color: 2, pattern: 0 },
            reserved: Look { color: 3, pattern: 0 },
            unknown: Look { color: 0, pattern: 1 },
            closed: Look { color: 2, pattern: 2 },
            fport: 10,
            override_expiry_ms: Some(24 * 3_600_000),
        }
    }
}

/// Display-policy store, consulted on every recompute.
pub trait PolicyStore: Send + Sync {
    fn policy_for(&self, tenant: &str) -> DisplayPolicy;
}

/// On-disk shape of the policy file: a default plus per-tenant overrides.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    default: DisplayPolicy,
    #[serde(default)]
    tenants: std::collections::HashMap<String, DisplayPolicy>,
}

/// In-memory policy store: a default policy plus per-tenant entries,
/// optionally loaded from a JSON file at startup.
pub struct StaticPolicyStore {
    default: DisplayPolicy,
    per_tenant: DashMap<String, DisplayPolicy>,
}

impl Default for StaticPolicyStore {
    fn default() -> Self {
        Self::new(DisplayPolicy::default())
    }
}

impl StaticPolicyStore {
    pub fn new(default: DisplayPolicy) -> Self {
        Self {
            default,
            per_tenant: DashMap::new(),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let data = std::fs::read(path)?;
        let file: PolicyFile = serde_json::from_slice(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let store = Self::new(file.default);
        for (tenant, policy) in file.tenants {
            store.per_tenant.insert(tenant, policy);
        }
        Ok(store)
    }

    pub fn set(&self, tenant: &str, policy: DisplayPolicy) {
        self.per_tenant.insert(tenant.to_string(), policy);
    }
}

impl PolicyStore for StaticPolicyStore {
    fn policy_for(&self, tenant: &str) -> DisplayPolicy {
        self.per_tenant
            .get(tenant)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| self.default.clone())
    }
}
