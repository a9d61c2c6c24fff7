use serde::{Deserialize, Serialize};

/// A deployable application type with its default runtime requirements.
///
/// Tenants pick a subset of the built-in catalog; the orchestrator only
/// accepts service types the catalog knows about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Catalog key, e.g. "dashboard" or "eucloud".
    pub service_type: String,

    /// Container image (tag pinned by the platform release).
    pub image: String,

    /// Number of externally reachable ports this service needs.
    pub port_count: u32,

    pub replicas: u32,

    /// Resource requests in Kubernetes-style quantity strings.
    pub cpu_request: String,
    pub memory_request: String,

    /// Container port the workload listens on; the allocated node port
    /// is mapped onto this.
    pub container_port: u16,
}

impl ServiceSpec {
    fn new(
        service_type: &str,
        image: &str,
        replicas: u32,
        cpu_request: &str,
        memory_request: &str,
        container_port: u16,
    ) -> Self {
        Self {
            service_type: service_type.to_string(),
            image: image.to_string(),
            port_count: 1,
            replicas,
            cpu_request: cpu_request.to_string(),
            memory_request: memory_request.to_string(),
            container_port,
        }
    }

    /// The built-in application catalog.
    pub fn catalog() -> Vec<ServiceSpec> {
        vec![
            Self::new("dashboard", "atoll/dashboard:1.8", 1, "250m", "256Mi", 8080),
            Self::new("eucloud", "atoll/eucloud:27.1", 1, "500m", "1Gi", 8081),
            Self::new("mail", "atoll/mail:2.4", 1, "250m", "512Mi", 8082),
            Self::new("groups", "atoll/groups:1.2", 1, "100m", "128Mi", 8083),
            Self::new("docs", "atoll/docs:3.0", 2, "500m", "1Gi", 8084),
        ]
    }

    pub fn lookup(service_type: &str) -> Option<ServiceSpec> {
        Self::catalog()
            .into_iter()
            .find(|s| s.service_type == service_type)
    }
}
