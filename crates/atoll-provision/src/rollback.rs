use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use atoll_common::{
    now_ms, Deployment, DeploymentKind, DeploymentStatus, EventLevel, ProvisionError,
    ResourceKind, ServiceSpec,
};
use atoll_meta::keys;

use crate::orchestrator::Orchestrator;

/// Restores the last known-good manifest for a tenant.
///
/// A rollback is tracked as its own Deployment record with its own
/// event stream; it reuses the orchestrator's apply/poll machinery but
/// starts directly in Deploying since the manifest is already rendered.
pub struct RollbackManager {
    orch: Arc<Orchestrator>,
}

impl RollbackManager {
    pub fn new(orch: Arc<Orchestrator>) -> Self {
        Self { orch }
    }

    pub async fn rollback(&self, tenant_id: &str) -> Result<Deployment, ProvisionError> {
        let tenant = self.orch.load_tenant(tenant_id).await?;
        let prior = self
            .orch
            .last_good_manifest(tenant_id)
            .await?
            .ok_or_else(|| ProvisionError::NoPriorManifest(tenant_id.to_string()))?;

        let id = Uuid::new_v4().to_string();
        if self
            .orch
            .store
            .insert_unique(&keys::active(tenant_id), id.clone().into_bytes())
            .await?
            .is_none()
        {
            return Err(ProvisionError::DeploymentInProgress(tenant_id.to_string()));
        }

        let services: Vec<String> = prior
            .resources
            .iter()
            .filter(|r| r.kind == ResourceKind::Workload)
            .map(|r| r.name.clone())
            .collect();
        let specs: Vec<ServiceSpec> = services
            .iter()
            .filter_map(|s| ServiceSpec::lookup(s))
            .collect();

        let mut deployment = Deployment::new(
            id.clone(),
            tenant_id.to_string(),
            DeploymentKind::Rollback,
            services,
            false,
            now_ms(),
        );
        deployment.manifest_checksum = Some(prior.checksum.clone());
        if let Err(e) = self.orch.save_deployment(&deployment).await {
            return self.abort(deployment, e).await;
        }
        self.orch
            .events
            .publish(
                &id,
                EventLevel::Info,
                format!(
                    "rolling back to manifest {} (deployment {})",
                    &prior.checksum[..12],
                    prior.deployment_id
                ),
            )
            .await;

        // The old manifest's node ports must still resolve to this
        // tenant before anything touches the cluster.
        if let Err(e) = self.verify_ports(&tenant, &prior).await {
            return self.abort(deployment, e).await;
        }

        // Re-key the manifest under the rollback record so its yaml is
        // retrievable; the checksum stays that of the prior render.
        let mut manifest = prior;
        manifest.deployment_id = id.clone();
        let bytes = match serde_json::to_vec(&manifest) {
            Ok(b) => b,
            Err(e) => {
                return self
                    .abort(deployment, anyhow::Error::from(e).into())
                    .await
            }
        };
        if let Err(e) = self.orch.store.put(&keys::manifest(&id), bytes).await {
            return self.abort(deployment, e.into()).await;
        }

        info!(tenant = %tenant.slug, deployment = %id, "rollback started");
        self.orch
            .spawn_run(tenant, specs, manifest, deployment.clone());
        Ok(deployment)
    }

    /// Abort a rollback before the apply phase. Best-effort throughout:
    /// the active marker must come off even when the store is unwell,
    /// or the tenant stays wedged behind an attempt that never ran.
    async fn abort(
        &self,
        mut deployment: Deployment,
        err: ProvisionError,
    ) -> Result<Deployment, ProvisionError> {
        let id = deployment.id.clone();
        let tenant_id = deployment.tenant_id.clone();
        deployment.transition(DeploymentStatus::Failed, &err.to_string(), now_ms());
        if let Err(e) = self.orch.save_deployment(&deployment).await {
            warn!(deployment = %id, error = %e, "failed to persist failed rollback");
        }
        self.orch
            .events
            .publish(&id, EventLevel::Error, format!("rollback failed: {err}"))
            .await;
        if let Err(e) = self.orch.store.delete(&keys::active(&tenant_id)).await {
            warn!(tenant = %tenant_id, error = %e, "failed to clear active marker");
        }
        self.orch.events.close(&id);
        Err(err)
    }

    /// Degraded cleanup for tenants with no successful history: delete
    /// the namespace outright and release the tenant's ports.
    pub async fn teardown(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let tenant = self.orch.load_tenant(tenant_id).await?;
        self.orch
            .cluster
            .delete_namespace(&tenant.namespace)
            .await
            .map_err(|e| ProvisionError::ClusterApply {
                resource: tenant.namespace.clone(),
                reason: e.to_string(),
            })?;
        self.orch.ports.release(tenant_id).await?;
        info!(tenant = %tenant.slug, "tenant resources torn down");
        Ok(())
    }

    async fn verify_ports(
        &self,
        tenant: &atoll_common::Tenant,
        manifest: &atoll_common::Manifest,
    ) -> Result<(), ProvisionError> {
        for resource in &manifest.resources {
            if resource.kind != ResourceKind::Service {
                continue;
            }
            let Some(port) = resource.spec["node_port"].as_u64() else {
                continue;
            };
            self.orch
                .ports
                .ensure_reserved(tenant, &resource.name, port as u16)
                .await?;
        }
        Ok(())
    }
}
