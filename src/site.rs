//! The tenant record served by the cache
//!
//! A `Site` is owned by the external data layer; this crate only stores it,
//! returns it, and reads the few fields the security pipeline needs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tenant site, cached by subdomain and by custom domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Site ID (primary key in the data layer)
    pub id: String,
    /// Subdomain label under the platform domain
    pub subdomain: String,
    /// Verified custom domain, if the tenant has one
    #[serde(default)]
    pub custom_domain: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Whether the site is published
    #[serde(default = "default_active")]
    pub active: bool,
    /// Site settings as key-value pairs
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl Site {
    pub fn new(id: impl Into<String>, subdomain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subdomain: subdomain.into(),
            custom_domain: None,
            name: String::new(),
            active: true,
            settings: HashMap::new(),
        }
    }

    pub fn with_custom_domain(mut self, domain: impl Into<String>) -> Self {
        self.custom_domain = Some(domain.into());
        self
    }

    /// Hosts this site answers on.
    pub fn hosts(&self, platform_domain: &str) -> Vec<String> {
        let mut hosts = vec![format!("{}.{}", self.subdomain, platform_domain)];
        if let Some(domain) = &self.custom_domain {
            hosts.push(domain.to_lowercase());
        }
        hosts
    }

    /// HTTPS origins this site answers on.
    pub fn origins(&self, platform_domain: &str) -> Vec<String> {
        self.hosts(platform_domain)
            .into_iter()
            .map(|host| format!("https://{}", host))
            .collect()
    }
}
