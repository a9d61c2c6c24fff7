use serde::{Deserialize, Serialize};

/// Tenant-facing branding baked into the rendered config map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrandingConfig {
    pub display_name: String,
    pub primary_color: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_email: Option<String>,
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            primary_color: "#1a73e8".to_string(),
            logo_url: None,
            support_email: None,
        }
    }
}
