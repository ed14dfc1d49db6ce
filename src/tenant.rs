use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant (one dairy) gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Strip everything but `[A-Za-z0-9_-]` so a tenant name can never escape the data directory.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let safe_name = sanitize(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Two names that sanitize alike share one WAL, so they must share one engine too.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                info!(tenant = %safe_name, "tenant loaded");
                e.insert(engine.clone());
                engine
            }
        };
        if safe_name != tenant {
            self.engines.insert(tenant.to_string(), engine.clone());
        }
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenant_count() as f64);
        Ok(engine)
    }

    /// Distinct loaded tenants (aliases that sanitize to the same name count once).
    pub fn tenant_count(&self) -> usize {
        self.engines
            .iter()
            .filter(|e| sanitize(e.key()).is_ok_and(|safe| safe == *e.key()))
            .count()
    }
}
