use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use atoll_cluster::ClusterApi;
use atoll_common::{
    now_ms, Deployment, DeploymentKind, DeploymentStatus, EventLevel, Manifest, ProvisionError,
    ResourceDescriptor, ResourceKind, ServiceSpec, Tenant, TenantStatus,
};
use atoll_meta::{keys, MetaStore};

use crate::events::EventHub;
use crate::ports::PortAllocator;
use crate::render;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Readiness poll interval.
    pub poll_interval: Duration,
    /// Wall-clock budget for one deployment attempt. Exceeding it is a
    /// failure, not a retry-forever condition.
    pub readiness_timeout: Duration,
    /// Apply attempts per resource before the attempt is declared failed.
    pub apply_attempts: u32,
    /// Base backoff between apply retries; doubles per retry.
    pub retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(300),
            apply_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Drives the deployment state machine for all tenants.
///
/// Each accepted deploy runs as its own tokio task; the per-tenant
/// `/active/{tenant}` marker keeps concurrent attempts for one tenant
/// out while tenants proceed fully in parallel.
pub struct Orchestrator {
    pub(crate) store: Arc<dyn MetaStore>,
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) events: Arc<EventHub>,
    pub(crate) ports: PortAllocator,
    pub(crate) cfg: OrchestratorConfig,
    cancels: DashMap<String, watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MetaStore>,
        cluster: Arc<dyn ClusterApi>,
        events: Arc<EventHub>,
        ports: PortAllocator,
        cfg: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cluster,
            events,
            ports,
            cfg,
            cancels: DashMap::new(),
        })
    }

    pub fn events(&self) -> Arc<EventHub> {
        self.events.clone()
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.ports
    }

    /// Accept a deploy request for a tenant.
    ///
    /// Port allocation and manifest rendering happen synchronously,
    /// before any cluster mutation; a failure there records the
    /// deployment as Failed immediately and leaves no partial side
    /// effects. On success the record is returned in `Deploying` and
    /// the apply/poll phase continues in the background.
    pub async fn deploy(
        self: &Arc<Self>,
        tenant_id: &str,
        services: Vec<String>,
        force: bool,
    ) -> Result<Deployment, ProvisionError> {
        let tenant = self.load_tenant(tenant_id).await?;

        let requested = if services.is_empty() {
            tenant.services.clone()
        } else {
            services
        };

        let id = Uuid::new_v4().to_string();
        if self
            .store
            .insert_unique(&keys::active(tenant_id), id.clone().into_bytes())
            .await?
            .is_none()
        {
            return Err(ProvisionError::DeploymentInProgress(tenant_id.to_string()));
        }

        let mut deployment = Deployment::new(
            id.clone(),
            tenant_id.to_string(),
            DeploymentKind::Deploy,
            requested.clone(),
            force,
            now_ms(),
        );
        if let Err(e) = self.save_deployment(&deployment).await {
            return self.fail_before_apply(deployment, e).await;
        }
        self.events
            .publish(
                &id,
                EventLevel::Info,
                format!("deploy accepted for tenant {} ({})", tenant.slug, requested.join(", ")),
            )
            .await;

        // Input errors are fatal to the attempt but still leave a Failed
        // record with the reason.
        if requested.is_empty() {
            let err = ProvisionError::InvalidServiceSpec("(empty service set)".into());
            return self.fail_before_apply(deployment, err).await;
        }
        let specs = match resolve_specs(&requested) {
            Ok(s) => s,
            Err(e) => return self.fail_before_apply(deployment, e).await,
        };

        let ports = match self.ports.allocate(&tenant, &requested).await {
            Ok(p) => p,
            Err(e) => return self.fail_before_apply(deployment, e).await,
        };
        self.events
            .publish(
                &id,
                EventLevel::Info,
                format!(
                    "ports reserved: {}",
                    ports
                        .iter()
                        .map(|(s, p)| format!("{s}={p}"))
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
            )
            .await;

        let manifest = match render::render(&tenant, &specs, &ports, &tenant.branding, &id, now_ms())
        {
            Ok(m) => m,
            Err(e) => return self.fail_before_apply(deployment, e).await,
        };
        let bytes = match serde_json::to_vec(&manifest) {
            Ok(b) => b,
            Err(e) => {
                return self
                    .fail_before_apply(deployment, anyhow::Error::from(e).into())
                    .await
            }
        };
        if let Err(e) = self.store.put(&keys::manifest(&id), bytes).await {
            return self.fail_before_apply(deployment, e.into()).await;
        }

        deployment.manifest_checksum = Some(manifest.checksum.clone());
        deployment.transition(DeploymentStatus::Deploying, "", now_ms());
        if let Err(e) = self.save_deployment(&deployment).await {
            return self.fail_before_apply(deployment, e).await;
        }
        self.events
            .publish(
                &id,
                EventLevel::Info,
                format!(
                    "manifest {} rendered ({} resources)",
                    &manifest.checksum[..12],
                    manifest.resources.len()
                ),
            )
            .await;

        info!(tenant = %tenant.slug, deployment = %id, force, "deployment started");
        self.spawn_run(tenant, specs, manifest, deployment.clone());
        Ok(deployment)
    }

    /// Cancel an in-flight deployment. Polling stops, the record moves
    /// to Failed with reason "cancelled", and resources created by the
    /// attempt are removed.
    pub fn cancel(&self, deployment_id: &str) -> Result<(), ProvisionError> {
        match self.cancels.get(deployment_id) {
            Some(tx) => {
                let _ = tx.send(true);
                Ok(())
            }
            None => Err(ProvisionError::DeploymentNotFound(deployment_id.to_string())),
        }
    }

    pub(crate) fn spawn_run(
        self: &Arc<Self>,
        tenant: Tenant,
        specs: Vec<ServiceSpec>,
        manifest: Manifest,
        deployment: Deployment,
    ) {
        let (tx, rx) = watch::channel(false);
        self.cancels.insert(deployment.id.clone(), tx);
        let orch = self.clone();
        tokio::spawn(async move {
            let result = orch
                .apply_and_wait(&tenant, &specs, &manifest, &deployment, rx)
                .await;
            orch.finish(tenant, deployment, result).await;
        });
    }

    async fn apply_and_wait(
        &self,
        tenant: &Tenant,
        specs: &[ServiceSpec],
        manifest: &Manifest,
        deployment: &Deployment,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), ProvisionError> {
        let id = &deployment.id;

        if deployment.force {
            self.events
                .publish(id, EventLevel::Info, "force redeploy: deleting existing resources")
                .await;
            if let Err(e) = self.cluster.delete_namespace(&tenant.namespace).await {
                return Err(ProvisionError::ClusterApply {
                    resource: tenant.namespace.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let mut applied: Vec<&ResourceDescriptor> = Vec::new();
        for resource in &manifest.resources {
            self.apply_with_retry(resource, id).await?;
            applied.push(resource);
        }
        self.events
            .publish(
                id,
                EventLevel::Info,
                format!("{} resources applied, waiting for readiness", applied.len()),
            )
            .await;

        let deadline = Instant::now() + self.cfg.readiness_timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                changed = cancel_rx.changed() => {
                    // A closed sender just falls through to a normal
                    // poll tick; the sender outlives the task.
                    if changed.is_ok() && *cancel_rx.borrow_and_update() {
                        self.events
                            .publish(id, EventLevel::Warn, "cancellation requested")
                            .await;
                        self.cleanup_partial(tenant, &applied, id).await;
                        return Err(ProvisionError::Cancelled);
                    }
                }
            }

            let mut ready = 0usize;
            for spec in specs {
                let selector = workload_selector(tenant, &spec.service_type);
                match self.cluster.workloads_ready(&tenant.namespace, &selector).await {
                    Ok(true) => ready += 1,
                    Ok(false) => {}
                    Err(e) => {
                        self.events
                            .publish(
                                id,
                                EventLevel::Warn,
                                format!("readiness query for {} failed: {e}", spec.service_type),
                            )
                            .await;
                    }
                }
            }
            self.events
                .publish(id, EventLevel::Info, format!("readiness {ready}/{}", specs.len()))
                .await;
            if ready == specs.len() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                self.events
                    .publish(
                        id,
                        EventLevel::Error,
                        format!(
                            "workloads not ready after {}s",
                            self.cfg.readiness_timeout.as_secs()
                        ),
                    )
                    .await;
                self.cleanup_partial(tenant, &applied, id).await;
                return Err(ProvisionError::ReadinessTimeout {
                    timeout_secs: self.cfg.readiness_timeout.as_secs(),
                });
            }
        }
    }

    async fn apply_with_retry(
        &self,
        resource: &ResourceDescriptor,
        deployment_id: &str,
    ) -> Result<(), ProvisionError> {
        let mut backoff = self.cfg.retry_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.cluster.apply(resource).await {
                Ok(()) => {
                    self.events
                        .publish(
                            deployment_id,
                            EventLevel::Info,
                            format!("applied {:?} {}", resource.kind, resource.name),
                        )
                        .await;
                    return Ok(());
                }
                Err(e) if attempt < self.cfg.apply_attempts => {
                    self.events
                        .publish(
                            deployment_id,
                            EventLevel::Warn,
                            format!(
                                "apply of {} failed (attempt {attempt}/{}): {e}",
                                resource.name, self.cfg.apply_attempts
                            ),
                        )
                        .await;
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    self.events
                        .publish(
                            deployment_id,
                            EventLevel::Error,
                            format!("apply of {} failed permanently: {e}", resource.name),
                        )
                        .await;
                    return Err(ProvisionError::ClusterApply {
                        resource: resource.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Timeout/cancel path: remove what this attempt created, in
    /// reverse apply order. The namespace itself only goes when the
    /// tenant has no completed deployment to preserve.
    async fn cleanup_partial(
        &self,
        tenant: &Tenant,
        applied: &[&ResourceDescriptor],
        deployment_id: &str,
    ) {
        self.events
            .publish(
                deployment_id,
                EventLevel::Info,
                "removing resources created by this attempt",
            )
            .await;
        for resource in applied.iter().rev() {
            if resource.kind == ResourceKind::Namespace {
                continue;
            }
            if let Err(e) = self
                .cluster
                .delete_resource(resource.kind, &resource.namespace, &resource.name)
                .await
            {
                self.events
                    .publish(
                        deployment_id,
                        EventLevel::Warn,
                        format!("failed to delete {}: {e}", resource.name),
                    )
                    .await;
            }
        }

        let has_prior = matches!(self.last_good_manifest(&tenant.id).await, Ok(Some(_)));
        if !has_prior {
            if let Err(e) = self.cluster.delete_namespace(&tenant.namespace).await {
                warn!(namespace = %tenant.namespace, error = %e, "namespace cleanup failed");
            }
        }
    }

    async fn finish(
        &self,
        tenant: Tenant,
        mut deployment: Deployment,
        result: Result<(), ProvisionError>,
    ) {
        let id = deployment.id.clone();
        match &result {
            Ok(()) => {
                deployment.transition(DeploymentStatus::Completed, "all workloads ready", now_ms());
                if let Err(e) = self.save_deployment(&deployment).await {
                    warn!(deployment = %id, error = %e, "failed to persist completed deployment");
                }
                if let Err(e) = self
                    .store
                    .put(&keys::last_good(&tenant.id), id.clone().into_bytes())
                    .await
                {
                    warn!(deployment = %id, error = %e, "failed to record last good deployment");
                }
                if deployment.kind == DeploymentKind::Rollback {
                    self.mark_failed_as_rolled_back(&tenant.id).await;
                }
                self.activate_tenant(tenant.clone()).await;
                self.events
                    .publish(&id, EventLevel::Info, "deployment completed")
                    .await;
                info!(tenant = %tenant.slug, deployment = %id, "deployment completed");
            }
            Err(e) => {
                deployment.transition(DeploymentStatus::Failed, &e.to_string(), now_ms());
                if let Err(err) = self.save_deployment(&deployment).await {
                    warn!(deployment = %id, error = %err, "failed to persist failed deployment");
                }
                self.events
                    .publish(&id, EventLevel::Error, format!("deployment failed: {e}"))
                    .await;
                warn!(tenant = %tenant.slug, deployment = %id, error = %e, "deployment failed");
            }
        }

        if let Err(e) = self.store.delete(&keys::active(&tenant.id)).await {
            warn!(tenant = %tenant.id, error = %e, "failed to clear active marker");
        }
        self.cancels.remove(&id);
        self.events.close(&id);
    }

    /// A successful rollback retroactively marks the newest Failed
    /// deployment of the tenant as RolledBack.
    async fn mark_failed_as_rolled_back(&self, tenant_id: &str) {
        let deployments = match self.list_deployments(tenant_id).await {
            Ok(d) => d,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "failed to list deployments for rollback bookkeeping");
                return;
            }
        };
        let newest_failed = deployments
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Failed && d.kind == DeploymentKind::Deploy)
            .max_by_key(|d| d.started_at_ms);
        if let Some(mut failed) = newest_failed {
            failed.transition(DeploymentStatus::RolledBack, "superseded by rollback", now_ms());
            if let Err(e) = self.save_deployment(&failed).await {
                warn!(deployment = %failed.id, error = %e, "failed to persist rolled-back status");
            }
        }
    }

    async fn activate_tenant(&self, mut tenant: Tenant) {
        if tenant.status != TenantStatus::Pending {
            return;
        }
        tenant.status = TenantStatus::Active;
        tenant.updated_at_ms = now_ms();
        if let Ok(bytes) = serde_json::to_vec(&tenant) {
            if let Err(e) = self.store.put(&keys::tenant(&tenant.id), bytes).await {
                warn!(tenant = %tenant.id, error = %e, "failed to activate tenant");
            }
        }
    }

    async fn fail_before_apply(
        &self,
        mut deployment: Deployment,
        err: ProvisionError,
    ) -> Result<Deployment, ProvisionError> {
        let id = deployment.id.clone();
        let tenant_id = deployment.tenant_id.clone();
        deployment.transition(DeploymentStatus::Failed, &err.to_string(), now_ms());
        if let Err(e) = self.save_deployment(&deployment).await {
            warn!(deployment = %id, error = %e, "failed to persist failed deployment");
        }
        self.events
            .publish(&id, EventLevel::Error, format!("deployment failed: {err}"))
            .await;
        if let Err(e) = self.store.delete(&keys::active(&tenant_id)).await {
            warn!(tenant = %tenant_id, error = %e, "failed to clear active marker");
        }
        self.events.close(&id);
        Err(err)
    }

    pub async fn load_tenant(&self, tenant_id: &str) -> Result<Tenant, ProvisionError> {
        match self.store.get(&keys::tenant(tenant_id)).await? {
            Some((bytes, _)) => {
                Ok(serde_json::from_slice(&bytes).map_err(anyhow::Error::from)?)
            }
            None => Err(ProvisionError::TenantNotFound(tenant_id.to_string())),
        }
    }

    pub async fn load_deployment(&self, deployment_id: &str) -> Result<Deployment, ProvisionError> {
        match self.store.get(&keys::deployment(deployment_id)).await? {
            Some((bytes, _)) => {
                Ok(serde_json::from_slice(&bytes).map_err(anyhow::Error::from)?)
            }
            None => Err(ProvisionError::DeploymentNotFound(deployment_id.to_string())),
        }
    }

    pub async fn load_manifest(&self, deployment_id: &str) -> Result<Manifest, ProvisionError> {
        match self.store.get(&keys::manifest(deployment_id)).await? {
            Some((bytes, _)) => {
                Ok(serde_json::from_slice(&bytes).map_err(anyhow::Error::from)?)
            }
            None => Err(ProvisionError::DeploymentNotFound(deployment_id.to_string())),
        }
    }

    /// All deployment records for a tenant, newest first.
    pub async fn list_deployments(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<Deployment>, ProvisionError> {
        let prefix = keys::tenant_deployments_prefix(tenant_id);
        let mut out = Vec::new();
        for (key, _, _) in self.store.list_prefix(&prefix).await? {
            let deployment_id = key.trim_start_matches(&prefix);
            if let Ok(d) = self.load_deployment(deployment_id).await {
                out.push(d);
            }
        }
        out.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms));
        Ok(out)
    }

    /// Manifest of the tenant's last completed deployment, if any.
    pub async fn last_good_manifest(
        &self,
        tenant_id: &str,
    ) -> Result<Option<Manifest>, ProvisionError> {
        let Some((bytes, _)) = self.store.get(&keys::last_good(tenant_id)).await? else {
            return Ok(None);
        };
        let deployment_id = String::from_utf8_lossy(&bytes).to_string();
        Ok(Some(self.load_manifest(&deployment_id).await?))
    }

    pub(crate) async fn save_deployment(&self, d: &Deployment) -> Result<(), ProvisionError> {
        let bytes = serde_json::to_vec(d).map_err(anyhow::Error::from)?;
        self.store.put(&keys::deployment(&d.id), bytes).await?;
        self.store
            .put(&keys::tenant_deployment(&d.tenant_id, &d.id), Vec::new())
            .await?;
        Ok(())
    }
}

fn resolve_specs(requested: &[String]) -> Result<Vec<ServiceSpec>, ProvisionError> {
    requested
        .iter()
        .map(|name| {
            ServiceSpec::lookup(name).ok_or_else(|| ProvisionError::InvalidServiceSpec(name.clone()))
        })
        .collect()
}

pub(crate) fn workload_selector(tenant: &Tenant, service_type: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), service_type.to_string());
    selector.insert("atoll.io/tenant".to_string(), tenant.slug.clone());
    selector
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_cluster::SimCluster;
    use atoll_common::DeployTarget;
    use atoll_meta::MemoryMetaStore;

    use crate::ports::PortRange;
    use crate::rollback::RollbackManager;

    struct Harness {
        store: Arc<dyn MetaStore>,
        cluster: Arc<SimCluster>,
        orch: Arc<Orchestrator>,
    }

    fn fast_cfg() -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_millis(10),
            readiness_timeout: Duration::from_millis(400),
            apply_attempts: 2,
            retry_backoff: Duration::from_millis(5),
        }
    }

    fn harness(range: PortRange, cluster: SimCluster) -> Harness {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let cluster = Arc::new(cluster);
        let events = Arc::new(EventHub::new(store.clone()));
        let ports = PortAllocator::new(store.clone(), range);
        let orch = Orchestrator::new(
            store.clone(),
            cluster.clone(),
            events,
            ports,
            fast_cfg(),
        );
        Harness {
            store,
            cluster,
            orch,
        }
    }

    async fn create_tenant(h: &Harness, slug: &str) -> Tenant {
        let t = Tenant::new(slug.to_string(), slug.to_string(), DeployTarget::Central, now_ms());
        h.store
            .put(&keys::tenant(&t.id), serde_json::to_vec(&t).unwrap())
            .await
            .unwrap();
        t
    }

    async fn wait_terminal(orch: &Arc<Orchestrator>, id: &str) -> Deployment {
        for _ in 0..400 {
            let d = orch.load_deployment(id).await.unwrap();
            if d.status.is_terminal() {
                return d;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("deployment {id} never reached a terminal state");
    }

    async fn wait_idle(h: &Harness, tenant_id: &str) {
        for _ in 0..400 {
            if h.store.get(&keys::active(tenant_id)).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("tenant {tenant_id} never returned to idle");
    }

    #[tokio::test]
    async fn two_service_deploy_reaches_completed() {
        let h = harness(PortRange::new(30100, 30101), SimCluster::new());
        let t = create_tenant(&h, "acme").await;

        let d = h
            .orch
            .deploy(&t.id, vec!["dashboard".into(), "eucloud".into()], false)
            .await
            .unwrap();
        assert_eq!(d.status, DeploymentStatus::Deploying);

        let done = wait_terminal(&h.orch, &d.id).await;
        assert_eq!(done.status, DeploymentStatus::Completed);
        assert!(done.duration_ms.is_some());

        let held = h.orch.allocator().held(&t.id).await.unwrap();
        assert_eq!(held["dashboard"], 30100);
        assert_eq!(held["eucloud"], 30101);

        let manifest = h.orch.load_manifest(&d.id).await.unwrap();
        let exposures = manifest
            .resources
            .iter()
            .filter(|r| r.kind == ResourceKind::Service)
            .count();
        assert_eq!(exposures, 2);
        assert!(h.orch.last_good_manifest(&t.id).await.unwrap().is_some());

        // First success activates the tenant.
        wait_idle(&h, &t.id).await;
        let tenant = h.orch.load_tenant(&t.id).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);

        let events = h.orch.events().history(&d.id).await.unwrap();
        assert_eq!(events[0].seq, 1);
        assert!(events.iter().any(|e| e.message == "deployment completed"));
    }

    #[tokio::test]
    async fn second_deploy_while_in_flight_is_rejected() {
        // A huge readiness ramp keeps the first deploy in Deploying.
        let h = harness(PortRange::default(), SimCluster::with_readiness_ramp(1_000_000));
        let t = create_tenant(&h, "acme").await;

        let first = h
            .orch
            .deploy(&t.id, vec!["dashboard".into()], false)
            .await
            .unwrap();

        let err = h
            .orch
            .deploy(&t.id, vec!["dashboard".into()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DeploymentInProgress(_)));

        // The original deployment is unaffected by the rejection.
        let current = h.orch.load_deployment(&first.id).await.unwrap();
        assert_eq!(current.status, DeploymentStatus::Deploying);

        h.orch.cancel(&first.id).unwrap();
        let done = wait_terminal(&h.orch, &first.id).await;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert_eq!(done.status_message, "deployment cancelled");
    }

    #[tokio::test]
    async fn apply_failure_names_offender_and_rollback_degrades() {
        let h = harness(PortRange::default(), SimCluster::new());
        let t = create_tenant(&h, "acme").await;
        h.cluster.fail_applies_for("eucloud");

        let d = h
            .orch
            .deploy(&t.id, vec!["dashboard".into(), "eucloud".into()], false)
            .await
            .unwrap();
        let done = wait_terminal(&h.orch, &d.id).await;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.status_message.contains("eucloud"));
        wait_idle(&h, &t.id).await;

        let rollback = RollbackManager::new(h.orch.clone());
        let err = rollback.rollback(&t.id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NoPriorManifest(_)));

        rollback.teardown(&t.id).await.unwrap();
        assert!(h.cluster.namespace_resources(&t.namespace).is_empty());
        assert!(h.orch.allocator().held(&t.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_redeploy_reuses_ports_and_checksum() {
        let h = harness(PortRange::new(30100, 30110), SimCluster::new());
        let t = create_tenant(&h, "acme").await;
        let services = vec!["dashboard".to_string(), "eucloud".to_string()];

        let first = h.orch.deploy(&t.id, services.clone(), false).await.unwrap();
        let first = wait_terminal(&h.orch, &first.id).await;
        assert_eq!(first.status, DeploymentStatus::Completed);
        wait_idle(&h, &t.id).await;
        let held_before = h.orch.allocator().held(&t.id).await.unwrap();

        let second = h.orch.deploy(&t.id, services, true).await.unwrap();
        let second = wait_terminal(&h.orch, &second.id).await;
        assert_eq!(second.status, DeploymentStatus::Completed);

        assert_eq!(h.orch.allocator().held(&t.id).await.unwrap(), held_before);
        // Unchanged config renders to an identical checksum, and the
        // live namespace matches it byte for byte.
        assert_eq!(second.manifest_checksum, first.manifest_checksum);
        let live = h.cluster.namespace_resources(&t.namespace);
        assert_eq!(
            Some(Manifest::checksum_of(&live)),
            second.manifest_checksum
        );
    }

    #[tokio::test]
    async fn exhausted_range_fails_before_any_cluster_mutation() {
        let h = harness(PortRange::new(30100, 30100), SimCluster::new());
        let t = create_tenant(&h, "acme").await;

        let err = h
            .orch
            .deploy(&t.id, vec!["dashboard".into(), "eucloud".into()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PortRangeExhausted { .. }));

        let records = h.orch.list_deployments(&t.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeploymentStatus::Failed);
        assert!(records[0].manifest_checksum.is_none());
        assert!(h.orch.load_manifest(&records[0].id).await.is_err());
        assert!(h.orch.allocator().held(&t.id).await.unwrap().is_empty());
        assert_eq!(h.cluster.apply_calls(), 0);
        // The guard marker is released, so the tenant can retry.
        assert!(h.store.get(&keys::active(&t.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readiness_timeout_cleans_up_partial_resources() {
        let h = harness(PortRange::default(), SimCluster::with_readiness_ramp(1_000_000));
        let t = create_tenant(&h, "acme").await;

        let d = h
            .orch
            .deploy(&t.id, vec!["dashboard".into()], false)
            .await
            .unwrap();
        let done = wait_terminal(&h.orch, &d.id).await;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.status_message.contains("not ready"));
        // No prior completed deployment, so the namespace goes too.
        assert!(h.cluster.namespace_resources(&t.namespace).is_empty());
    }

    #[tokio::test]
    async fn rollback_restores_last_completed_manifest() {
        let h = harness(PortRange::new(30100, 30110), SimCluster::new());
        let t = create_tenant(&h, "acme").await;
        let services = vec!["dashboard".to_string(), "eucloud".to_string()];

        let good = h.orch.deploy(&t.id, services.clone(), false).await.unwrap();
        let good = wait_terminal(&h.orch, &good.id).await;
        assert_eq!(good.status, DeploymentStatus::Completed);
        let good_checksum = good.manifest_checksum.clone().unwrap();
        wait_idle(&h, &t.id).await;

        // A force redeploy that dies mid-apply leaves the namespace
        // damaged: the old resources were deleted first.
        h.cluster.fail_applies_for("dashboard");
        let broken = h.orch.deploy(&t.id, services, true).await.unwrap();
        let broken = wait_terminal(&h.orch, &broken.id).await;
        assert_eq!(broken.status, DeploymentStatus::Failed);
        wait_idle(&h, &t.id).await;
        h.cluster.clear_failures();

        let rollback = RollbackManager::new(h.orch.clone());
        let rb = rollback.rollback(&t.id).await.unwrap();
        assert_eq!(rb.kind, DeploymentKind::Rollback);
        assert_eq!(rb.status, DeploymentStatus::Deploying);
        let rb = wait_terminal(&h.orch, &rb.id).await;
        assert_eq!(rb.status, DeploymentStatus::Completed);
        wait_idle(&h, &t.id).await;

        // Live resources are checksum-identical to the last good
        // manifest, and the failed attempt is marked rolled back.
        let live = h.cluster.namespace_resources(&t.namespace);
        assert_eq!(Manifest::checksum_of(&live), good_checksum);
        let failed = h.orch.load_deployment(&broken.id).await.unwrap();
        assert_eq!(failed.status, DeploymentStatus::RolledBack);
    }

    #[tokio::test]
    async fn unknown_service_records_failed_attempt() {
        let h = harness(PortRange::default(), SimCluster::new());
        let t = create_tenant(&h, "acme").await;

        let err = h
            .orch
            .deploy(&t.id, vec!["billing".into()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidServiceSpec(_)));

        // Input errors are recorded as Failed, not silently dropped.
        let records = h.orch.list_deployments(&t.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeploymentStatus::Failed);
        assert!(records[0].status_message.contains("billing"));
        assert_eq!(h.cluster.apply_calls(), 0);
        assert!(h.store.get(&keys::active(&t.id)).await.unwrap().is_none());
    }

    /// Store that rejects manifest writes, for exercising the abort
    /// path between guard acquisition and the apply phase.
    struct ManifestWriteFailStore {
        inner: MemoryMetaStore,
    }

    #[async_trait::async_trait]
    impl MetaStore for ManifestWriteFailStore {
        async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<u64> {
            if key.starts_with("/manifests/") {
                anyhow::bail!("injected store failure");
            }
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, u64)>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<u64> {
            self.inner.delete(key).await
        }

        async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>, u64)>> {
            self.inner.list_prefix(prefix).await
        }

        async fn insert_unique(&self, key: &str, value: Vec<u8>) -> anyhow::Result<Option<u64>> {
            self.inner.insert_unique(key, value).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_revision: u64,
            value: Vec<u8>,
        ) -> anyhow::Result<(bool, u64)> {
            self.inner.compare_and_swap(key, expected_revision, value).await
        }
    }

    #[tokio::test]
    async fn store_failure_mid_accept_releases_active_marker() {
        let store: Arc<dyn MetaStore> = Arc::new(ManifestWriteFailStore {
            inner: MemoryMetaStore::new(),
        });
        let cluster = Arc::new(SimCluster::new());
        let events = Arc::new(EventHub::new(store.clone()));
        let ports = PortAllocator::new(store.clone(), PortRange::default());
        let orch = Orchestrator::new(store.clone(), cluster.clone(), events, ports, fast_cfg());

        let t = Tenant::new("acme".into(), "acme".into(), DeployTarget::Central, now_ms());
        store
            .put(&keys::tenant(&t.id), serde_json::to_vec(&t).unwrap())
            .await
            .unwrap();

        let err = orch
            .deploy(&t.id, vec!["dashboard".into()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Store(_)));

        // The attempt is recorded Failed and the guard is released, so
        // the tenant is not wedged behind a deployment that never ran.
        let records = orch.list_deployments(&t.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeploymentStatus::Failed);
        assert!(store.get(&keys::active(&t.id)).await.unwrap().is_none());
        assert_eq!(cluster.apply_calls(), 0);

        let retry = orch
            .deploy(&t.id, vec!["dashboard".into()], false)
            .await
            .unwrap_err();
        assert!(!matches!(retry, ProvisionError::DeploymentInProgress(_)));
    }

    #[tokio::test]
    async fn rollback_port_conflict_releases_active_marker() {
        let h = harness(PortRange::new(30100, 30105), SimCluster::new());
        let t = create_tenant(&h, "acme").await;

        let d = h
            .orch
            .deploy(&t.id, vec!["dashboard".into()], false)
            .await
            .unwrap();
        let d = wait_terminal(&h.orch, &d.id).await;
        assert_eq!(d.status, DeploymentStatus::Completed);
        wait_idle(&h, &t.id).await;

        // Another tenant takes over the port acme's manifest references.
        h.orch.allocator().release(&t.id).await.unwrap();
        let other = create_tenant(&h, "beta").await;
        h.orch
            .allocator()
            .allocate(&other, &["dashboard".into()])
            .await
            .unwrap();

        let rollback = RollbackManager::new(h.orch.clone());
        let err = rollback.rollback(&t.id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::AlreadyAllocated { .. }));

        // The failed rollback is recorded and the guard is released.
        let records = h.orch.list_deployments(&t.id).await.unwrap();
        assert_eq!(records[0].kind, DeploymentKind::Rollback);
        assert_eq!(records[0].status, DeploymentStatus::Failed);
        assert!(h.store.get(&keys::active(&t.id)).await.unwrap().is_none());
    }
}
