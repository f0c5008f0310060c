use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::ledger::Ledger;
use crate::limits::*;
use crate::reaper;
use crate::trigger::TriggerHub;

/// Manages per-tenant ledgers. Each tenant gets its own Ledger + WAL +
/// reaper; they all publish into the one shared trigger hub. Gateways and
/// the downlink queue stay global — tenancy ends at the ledger.
pub struct TenantManager {
    ledgers: DashMap<String, Arc<Ledger>>,
    data_dir: PathBuf,
    triggers: Arc<TriggerHub>,
    compact_threshold: u64,
    retention_ms: i64,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        triggers: Arc<TriggerHub>,
        compact_threshold: u64,
        retention_ms: i64,
    ) -> Self {
        Self {
            ledgers: DashMap::new(),
            data_dir,
            triggers,
            compact_threshold,
            retention_ms,
        }
    }

    /// Get or lazily create a ledger for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Ledger>> {
        if let Some(ledger) = self.ledgers.get(tenant) {
            return Ok(ledger.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.ledgers.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let ledger = Arc::new(Ledger::open(
            tenant.to_string(),
            wal_path,
            self.triggers.clone(),
        )?);

        // Spawn reaper + compactor for this tenant
        let reaper_ledger = ledger.clone();
        tokio::spawn(async move {
            reaper::run_reaper(reaper_ledger).await;
        });
        let compactor_ledger = ledger.clone();
        let threshold = self.compact_threshold;
        let retention = self.retention_ms;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_ledger, threshold, retention).await;
        });

        self.ledgers.insert(tenant.to_string(), ledger.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.ledgers.len() as f64);
        Ok(ledger)
    }
}
