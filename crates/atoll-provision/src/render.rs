use std::collections::BTreeMap;

use serde_json::json;

use atoll_common::{
    BrandingConfig, Manifest, ProvisionError, ResourceDescriptor, ResourceKind, ServiceSpec,
    Tenant,
};

/// Render the full descriptor set for one deployment attempt.
///
/// Pure and deterministic: identical inputs produce byte-identical
/// resources and an identical checksum. `version_ms` is the only
/// caller-supplied time value and stays outside the checksum domain.
pub fn render(
    tenant: &Tenant,
    services: &[ServiceSpec],
    ports: &BTreeMap<String, u16>,
    branding: &BrandingConfig,
    deployment_id: &str,
    version_ms: u64,
) -> Result<Manifest, ProvisionError> {
    let ns = tenant.namespace.clone();

    let mut resources = Vec::with_capacity(4 + services.len() * 2);
    resources.push(namespace_resource(tenant));
    resources.push(secret_resource(tenant, services));
    resources.push(pvc_resource(tenant));
    resources.push(branding_configmap(tenant, branding));

    for spec in services {
        if ServiceSpec::lookup(&spec.service_type).is_none() {
            return Err(ProvisionError::InvalidServiceSpec(spec.service_type.clone()));
        }
        let port = *ports
            .get(&spec.service_type)
            .ok_or_else(|| ProvisionError::MissingPortAllocation(spec.service_type.clone()))?;
        resources.push(workload_resource(tenant, spec));
        resources.push(exposure_resource(tenant, spec, port));
    }

    resources.sort_by(|a, b| (a.kind, a.name.clone()).cmp(&(b.kind, b.name.clone())));
    let checksum = Manifest::checksum_of(&resources);

    Ok(Manifest {
        deployment_id: deployment_id.to_string(),
        tenant_id: tenant.id.clone(),
        namespace: ns,
        version_ms,
        resources,
        checksum,
    })
}

fn base_labels(tenant: &Tenant) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("atoll.io/tenant".to_string(), tenant.slug.clone());
    labels
}

fn service_labels(tenant: &Tenant, service_type: &str) -> BTreeMap<String, String> {
    let mut labels = base_labels(tenant);
    labels.insert("app".to_string(), service_type.to_string());
    labels
}

fn namespace_resource(tenant: &Tenant) -> ResourceDescriptor {
    ResourceDescriptor {
        kind: ResourceKind::Namespace,
        name: tenant.namespace.clone(),
        namespace: tenant.namespace.clone(),
        labels: base_labels(tenant),
        spec: json!({}),
    }
}

/// Secret material is derived, not random: rendering must be
/// reproducible so re-renders checksum identically.
fn secret_resource(tenant: &Tenant, services: &[ServiceSpec]) -> ResourceDescriptor {
    let mut data = BTreeMap::new();
    for spec in services {
        let seed = format!("{}:{}", tenant.namespace, spec.service_type);
        data.insert(
            format!("{}-token", spec.service_type),
            blake3::hash(seed.as_bytes()).to_hex().to_string(),
        );
    }
    ResourceDescriptor {
        kind: ResourceKind::Secret,
        name: format!("{}-secrets", tenant.slug),
        namespace: tenant.namespace.clone(),
        labels: base_labels(tenant),
        spec: json!({ "data": data }),
    }
}

fn pvc_resource(tenant: &Tenant) -> ResourceDescriptor {
    ResourceDescriptor {
        kind: ResourceKind::PersistentVolumeClaim,
        name: format!("{}-data", tenant.slug),
        namespace: tenant.namespace.clone(),
        labels: base_labels(tenant),
        spec: json!({ "storage": "10Gi", "access_mode": "ReadWriteOnce" }),
    }
}

fn branding_configmap(tenant: &Tenant, branding: &BrandingConfig) -> ResourceDescriptor {
    let mut data = BTreeMap::new();
    data.insert("display_name".to_string(), branding.display_name.clone());
    data.insert("primary_color".to_string(), branding.primary_color.clone());
    if let Some(logo) = &branding.logo_url {
        data.insert("logo_url".to_string(), logo.clone());
    }
    if let Some(email) = &branding.support_email {
        data.insert("support_email".to_string(), email.clone());
    }
    ResourceDescriptor {
        kind: ResourceKind::ConfigMap,
        name: format!("{}-branding", tenant.slug),
        namespace: tenant.namespace.clone(),
        labels: base_labels(tenant),
        spec: json!({ "data": data }),
    }
}

fn workload_resource(tenant: &Tenant, spec: &ServiceSpec) -> ResourceDescriptor {
    ResourceDescriptor {
        kind: ResourceKind::Workload,
        name: spec.service_type.clone(),
        namespace: tenant.namespace.clone(),
        labels: service_labels(tenant, &spec.service_type),
        spec: json!({
            "image": spec.image,
            "replicas": spec.replicas,
            "container_port": spec.container_port,
            "resources": {
                "cpu": spec.cpu_request,
                "memory": spec.memory_request,
            },
            "volume_claim": format!("{}-data", tenant.slug),
            "config_map": format!("{}-branding", tenant.slug),
            "secret": format!("{}-secrets", tenant.slug),
        }),
    }
}

fn exposure_resource(tenant: &Tenant, spec: &ServiceSpec, node_port: u16) -> ResourceDescriptor {
    ResourceDescriptor {
        kind: ResourceKind::Service,
        name: spec.service_type.clone(),
        namespace: tenant.namespace.clone(),
        labels: service_labels(tenant, &spec.service_type),
        spec: json!({
            "selector": service_labels(tenant, &spec.service_type),
            "port": spec.container_port,
            "node_port": node_port,
        }),
    }
}
