use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use atoll_common::{now_ms, ProvisionError, Tenant};
use atoll_meta::{keys, MetaStore};

/// Ownership record for one node port.
///
/// Lives under `/ports/{port}`; the unique-insert on that key is the
/// cross-process uniqueness constraint, so two tenants racing for the
/// same port fail one side cleanly instead of double-allocating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    pub tenant_id: String,
    pub service_type: String,
    pub namespace: String,
    pub allocated_at_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub start: u16,
    /// Inclusive.
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(30100, 30899)
    }
}

/// Reserves node ports per (tenant, service) out of one global range.
#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<dyn MetaStore>,
    range: PortRange,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn MetaStore>, range: PortRange) -> Self {
        Self { store, range }
    }

    /// Reserve one port per requested service for the tenant.
    ///
    /// Services the tenant already holds a port for keep that port, so
    /// re-deploys are idempotent. The request is atomic: if any service
    /// cannot be satisfied, every port reserved by this call is
    /// released before the error is returned.
    pub async fn allocate(
        &self,
        tenant: &Tenant,
        services: &[String],
    ) -> Result<BTreeMap<String, u16>, ProvisionError> {
        let mut out = BTreeMap::new();
        let mut missing = Vec::new();

        for service in services {
            match self.held_port(&tenant.id, service).await? {
                Some(port) => {
                    out.insert(service.clone(), port);
                }
                None => missing.push(service.clone()),
            }
        }

        if missing.is_empty() {
            return Ok(out);
        }

        let mut used = self.used_ports().await?;
        let mut reserved_here: Vec<(String, u16)> = Vec::new();

        for service in &missing {
            match self.reserve_lowest_free(tenant, service, &mut used).await {
                Ok(port) => {
                    out.insert(service.clone(), port);
                    reserved_here.push((service.clone(), port));
                }
                Err(e) => {
                    self.undo(&tenant.id, &reserved_here).await;
                    return Err(e);
                }
            }
        }

        Ok(out)
    }

    /// Verify `port` belongs to (tenant, service), reserving it if the
    /// record is gone. Used by rollback before reapplying an old
    /// manifest whose ports must still resolve to this tenant.
    pub async fn ensure_reserved(
        &self,
        tenant: &Tenant,
        service: &str,
        port: u16,
    ) -> Result<(), ProvisionError> {
        let key = keys::port(port);
        if let Some((bytes, _)) = self.store.get(&key).await? {
            let alloc: PortAllocation =
                serde_json::from_slice(&bytes).map_err(anyhow::Error::from)?;
            if alloc.tenant_id != tenant.id {
                return Err(ProvisionError::AlreadyAllocated {
                    port,
                    holder: alloc.tenant_id,
                });
            }
            return Ok(());
        }

        let record = self.record(tenant, service, port);
        let value = serde_json::to_vec(&record).map_err(anyhow::Error::from)?;
        if self.store.insert_unique(&key, value).await?.is_none() {
            // Lost a race while re-reserving; re-read to name the holder.
            let holder = match self.store.get(&key).await? {
                Some((bytes, _)) => serde_json::from_slice::<PortAllocation>(&bytes)
                    .map(|a| a.tenant_id)
                    .unwrap_or_default(),
                None => String::new(),
            };
            return Err(ProvisionError::AlreadyAllocated { port, holder });
        }
        self.store
            .put(
                &keys::allocation(&tenant.id, service),
                serde_json::to_vec(&port).map_err(anyhow::Error::from)?,
            )
            .await?;
        Ok(())
    }

    /// Release every port the tenant holds. Idempotent: a tenant
    /// holding nothing is a no-op.
    pub async fn release(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let prefix = keys::allocations_prefix(tenant_id);
        for (key, value, _) in self.store.list_prefix(&prefix).await? {
            if let Ok(port) = serde_json::from_slice::<u16>(&value) {
                self.store.delete(&keys::port(port)).await?;
            }
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    /// Ports the tenant currently holds, keyed by service type.
    pub async fn held(&self, tenant_id: &str) -> Result<BTreeMap<String, u16>, ProvisionError> {
        let prefix = keys::allocations_prefix(tenant_id);
        let mut out = BTreeMap::new();
        for (key, value, _) in self.store.list_prefix(&prefix).await? {
            let service = key.trim_start_matches(&prefix).to_string();
            if let Ok(port) = serde_json::from_slice::<u16>(&value) {
                out.insert(service, port);
            }
        }
        Ok(out)
    }

    async fn held_port(
        &self,
        tenant_id: &str,
        service: &str,
    ) -> Result<Option<u16>, ProvisionError> {
        let key = keys::allocation(tenant_id, service);
        match self.store.get(&key).await? {
            Some((bytes, _)) => Ok(serde_json::from_slice(&bytes).ok()),
            None => Ok(None),
        }
    }

    async fn used_ports(&self) -> Result<HashSet<u16>, ProvisionError> {
        let mut used = HashSet::new();
        for (_, value, _) in self.store.list_prefix(keys::PORTS_PREFIX).await? {
            if let Ok(alloc) = serde_json::from_slice::<PortAllocation>(&value) {
                used.insert(alloc.port);
            }
        }
        Ok(used)
    }

    /// Walk the range from the bottom and claim the first free port via
    /// unique-insert. A lost race just moves on to the next candidate.
    async fn reserve_lowest_free(
        &self,
        tenant: &Tenant,
        service: &str,
        used: &mut HashSet<u16>,
    ) -> Result<u16, ProvisionError> {
        for port in self.range.start..=self.range.end {
            if used.contains(&port) {
                continue;
            }
            let record = self.record(tenant, service, port);
            let value = serde_json::to_vec(&record).map_err(anyhow::Error::from)?;
            if self.store.insert_unique(&keys::port(port), value).await?.is_some() {
                used.insert(port);
                self.store
                    .put(
                        &keys::allocation(&tenant.id, service),
                        serde_json::to_vec(&port).map_err(anyhow::Error::from)?,
                    )
                    .await?;
                return Ok(port);
            }
            // Another allocator won this port since our scan.
            used.insert(port);
        }
        Err(ProvisionError::PortRangeExhausted {
            start: self.range.start,
            end: self.range.end,
            missing: 1,
        })
    }

    async fn undo(&self, tenant_id: &str, reserved: &[(String, u16)]) {
        for (service, port) in reserved {
            let _ = self.store.delete(&keys::port(*port)).await;
            let _ = self.store.delete(&keys::allocation(tenant_id, service)).await;
        }
    }

    fn record(&self, tenant: &Tenant, service: &str, port: u16) -> PortAllocation {
        PortAllocation {
            port,
            tenant_id: tenant.id.clone(),
            service_type: service.to_string(),
            namespace: tenant.namespace.clone(),
            allocated_at_ms: now_ms(),
        }
    }
}
