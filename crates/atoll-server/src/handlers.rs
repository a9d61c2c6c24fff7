use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use atoll_common::{
    now_ms, BrandingConfig, DeployTarget, ProvisionError, Tenant, TenantStatus,
};
use atoll_meta::keys;

use crate::state::AppState;

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
            request_id: format!("req_{}", Uuid::new_v4()),
        },
    };
    (status, Json(body)).into_response()
}

fn provision_error(err: &ProvisionError) -> Response {
    let (status, code) = match err {
        ProvisionError::DeploymentInProgress(_) => (StatusCode::CONFLICT, "deployment_in_progress"),
        ProvisionError::NoPriorManifest(_) => (StatusCode::CONFLICT, "no_prior_manifest"),
        ProvisionError::AlreadyAllocated { .. } => (StatusCode::CONFLICT, "port_already_allocated"),
        ProvisionError::TenantNotFound(_) => (StatusCode::NOT_FOUND, "company_not_found"),
        ProvisionError::DeploymentNotFound(_) => (StatusCode::NOT_FOUND, "deployment_not_found"),
        ProvisionError::InvalidServiceSpec(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_service_spec")
        }
        ProvisionError::MissingPortAllocation(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "missing_port_allocation")
        }
        ProvisionError::PortRangeExhausted { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "port_range_exhausted")
        }
        ProvisionError::ClusterApply { .. } | ProvisionError::ReadinessTimeout { .. } => {
            (StatusCode::BAD_GATEWAY, "cluster_error")
        }
        ProvisionError::Cancelled => (StatusCode::CONFLICT, "cancelled"),
        ProvisionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
    };
    error_response(status, code, &err.to_string())
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
pub struct CreateCompanyRequest {
    pub slug: String,
    #[serde(default)]
    pub target: Option<DeployTarget>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub branding: Option<BrandingConfig>,
}

pub async fn create_company(
    State(st): State<AppState>,
    Json(req): Json<CreateCompanyRequest>,
) -> Response {
    if !Tenant::valid_slug(&req.slug) {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_slug",
            "slug must match [a-z0-9][a-z0-9-]* and be at most 40 chars",
        );
    }

    let mut tenant = Tenant::new(
        Uuid::new_v4().to_string(),
        req.slug,
        req.target.unwrap_or(DeployTarget::Central),
        now_ms(),
    );
    tenant.services = req.services;
    if let Some(branding) = req.branding {
        tenant.branding = branding;
    }
    if tenant.branding.display_name.is_empty() {
        tenant.branding.display_name = tenant.slug.clone();
    }

    // The slug key is the uniqueness constraint; two racing creates of
    // the same slug fail one side cleanly.
    match st
        .store
        .insert_unique(&keys::slug(&tenant.slug), tenant.id.clone().into_bytes())
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::CONFLICT,
                "slug_taken",
                &format!("slug {} is already in use", tenant.slug),
            )
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                &e.to_string(),
            )
        }
    }

    let bytes = match serde_json::to_vec(&tenant) {
        Ok(b) => b,
        Err(e) => {
            let _ = st.store.delete(&keys::slug(&tenant.slug)).await;
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "encode_error",
                &e.to_string(),
            );
        }
    };
    if let Err(e) = st.store.put(&keys::tenant(&tenant.id), bytes).await {
        let _ = st.store.delete(&keys::slug(&tenant.slug)).await;
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &e.to_string(),
        );
    }
    (StatusCode::CREATED, Json(tenant)).into_response()
}

pub async fn list_companies(State(st): State<AppState>) -> Response {
    let kvs = match st.store.list_prefix(keys::TENANTS_PREFIX).await {
        Ok(kvs) => kvs,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                &e.to_string(),
            )
        }
    };
    let mut tenants = Vec::new();
    for (_, value, _) in kvs {
        if let Ok(t) = serde_json::from_slice::<Tenant>(&value) {
            if t.status != TenantStatus::Deleted {
                tenants.push(t);
            }
        }
    }
    Json(tenants).into_response()
}

pub async fn get_company(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    match st.orch.load_tenant(&id).await {
        Ok(t) => Json(t).into_response(),
        Err(e) => provision_error(&e),
    }
}

/// Tear down a company's stack: refuse while a deployment is in
/// flight, delete the namespace, release ports, mark the record
/// deleted.
pub async fn delete_company(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    let mut tenant = match st.orch.load_tenant(&id).await {
        Ok(t) => t,
        Err(e) => return provision_error(&e),
    };

    // Hold the tenant's active marker for the whole teardown so a deploy
    // accepted in the meantime cannot race the namespace deletion.
    match st
        .store
        .insert_unique(&keys::active(&id), b"teardown".to_vec())
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            return provision_error(&ProvisionError::DeploymentInProgress(id));
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                &e.to_string(),
            )
        }
    }

    if let Err(e) = st.rollback.teardown(&id).await {
        let _ = st.store.delete(&keys::active(&id)).await;
        return provision_error(&e);
    }

    tenant.status = TenantStatus::Deleted;
    tenant.updated_at_ms = now_ms();
    let persisted = match serde_json::to_vec(&tenant) {
        Ok(bytes) => st.store.put(&keys::tenant(&id), bytes).await.map(|_| ()),
        Err(e) => Err(anyhow::Error::from(e)),
    };
    let _ = st.store.delete(&keys::slug(&tenant.slug)).await;
    let _ = st.store.delete(&keys::active(&id)).await;
    if let Err(e) = persisted {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &e.to_string(),
        );
    }
    Json(json!({"deleted": true})).into_response()
}

#[derive(Deserialize, Default)]
pub struct DeployRequest {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn deploy_company(
    State(st): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<DeployRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    match st.orch.deploy(&id, req.services, req.force).await {
        Ok(d) => (StatusCode::CREATED, Json(d)).into_response(),
        Err(e) => provision_error(&e),
    }
}

pub async fn list_company_deployments(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    // 404 for unknown companies rather than an empty list.
    if let Err(e) = st.orch.load_tenant(&id).await {
        return provision_error(&e);
    }
    match st.orch.list_deployments(&id).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => provision_error(&e),
    }
}

pub async fn get_deployment(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    match st.orch.load_deployment(&id).await {
        Ok(d) => Json(d).into_response(),
        Err(e) => provision_error(&e),
    }
}

pub async fn deployment_yaml(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    let manifest = match st.orch.load_manifest(&id).await {
        Ok(m) => m,
        Err(e) => return provision_error(&e),
    };
    match serde_yaml::to_string(&manifest.resources) {
        Ok(yaml) => Json(json!({ "yaml": yaml, "checksum": manifest.checksum })).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "encode_error",
            &e.to_string(),
        ),
    }
}

pub async fn deployment_logs(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    // Ensure the deployment exists so missing ids are 404, not [].
    if let Err(e) = st.orch.load_deployment(&id).await {
        return provision_error(&e);
    }
    match st.events.history(&id).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &e.to_string(),
        ),
    }
}

pub async fn cancel_deployment(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    match st.orch.cancel(&id) {
        Ok(()) => Json(json!({"cancelling": true})).into_response(),
        Err(e) => provision_error(&e),
    }
}

pub async fn rollback_company(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    match st.rollback.rollback(&id).await {
        Ok(d) => (StatusCode::CREATED, Json(d)).into_response(),
        Err(e) => provision_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use atoll_cluster::SimCluster;
    use atoll_meta::{MemoryMetaStore, MetaStore};
    use atoll_provision::{
        EventHub, Orchestrator, OrchestratorConfig, PortAllocator, PortRange, RollbackManager,
    };

    fn app_state() -> AppState {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let cluster = Arc::new(SimCluster::new());
        let events = Arc::new(EventHub::new(store.clone()));
        let ports = PortAllocator::new(store.clone(), PortRange::default());
        let orch = Orchestrator::new(
            store.clone(),
            cluster,
            events.clone(),
            ports,
            OrchestratorConfig {
                poll_interval: Duration::from_millis(10),
                readiness_timeout: Duration::from_millis(400),
                ..OrchestratorConfig::default()
            },
        );
        let rollback = Arc::new(RollbackManager::new(orch.clone()));
        AppState {
            store,
            orch,
            rollback,
            events,
        }
    }

    fn create_req(slug: &str) -> CreateCompanyRequest {
        CreateCompanyRequest {
            slug: slug.to_string(),
            target: None,
            services: Vec::new(),
            branding: None,
        }
    }

    async fn only_tenant(st: &AppState) -> Tenant {
        let kvs = st.store.list_prefix(keys::TENANTS_PREFIX).await.unwrap();
        assert_eq!(kvs.len(), 1);
        serde_json::from_slice(&kvs[0].1).unwrap()
    }

    #[tokio::test]
    async fn duplicate_slug_rejected_via_reserved_key() {
        let st = app_state();
        let first = create_company(State(st.clone()), Json(create_req("acme"))).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let dup = create_company(State(st.clone()), Json(create_req("acme"))).await;
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        // The slug key is what enforces uniqueness, so the check holds
        // even for writers that never ran the list scan.
        assert!(st.store.get(&keys::slug("acme")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_refused_while_deployment_active() {
        let st = app_state();
        let created = create_company(State(st.clone()), Json(create_req("acme"))).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let t = only_tenant(&st).await;

        // An in-flight deployment holds the active marker.
        st.store
            .insert_unique(&keys::active(&t.id), b"d1".to_vec())
            .await
            .unwrap();
        let refused = delete_company(State(st.clone()), Path(t.id.clone())).await;
        assert_eq!(refused.status(), StatusCode::CONFLICT);

        st.store.delete(&keys::active(&t.id)).await.unwrap();
        let deleted = delete_company(State(st.clone()), Path(t.id.clone())).await;
        assert_eq!(deleted.status(), StatusCode::OK);

        // Teardown released its own marker and freed the slug.
        assert!(st.store.get(&keys::active(&t.id)).await.unwrap().is_none());
        let again = create_company(State(st.clone()), Json(create_req("acme"))).await;
        assert_eq!(again.status(), StatusCode::CREATED);
    }
}
