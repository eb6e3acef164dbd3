//! Host classification and cache-key policy
//!
//! Pure functions only; nothing here touches the network or the clock.

use std::fmt;
use std::time::Duration;

use crate::{ResolverConfig, Site};

/// How a Site was addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainType {
    Subdomain,
    CustomDomain,
}

impl DomainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Subdomain => "subdomain",
            DomainType::CustomDomain => "custom_domain",
        }
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified request host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainLookup {
    pub value: String,
    pub domain_type: DomainType,
}

/// Cache key and TTL policy for Site lookups
#[derive(Debug, Clone)]
pub struct DomainResolver {
    config: ResolverConfig,
}

impl DomainResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn platform_domain(&self) -> &str {
        &self.config.platform_domain
    }

    /// Lowercase, trim, and drop any port and trailing dot.
    pub fn normalize(value: &str) -> String {
        let value = value.trim();
        let host = value.split(':').next().unwrap_or(value);
        host.trim_end_matches('.').to_lowercase()
    }

    /// `site:subdomain:acme`, `site:custom_domain:shop.example.com`
    pub fn cache_key(&self, value: &str, domain_type: DomainType) -> String {
        format!(
            "{}{}:{}",
            self.config.key_prefix,
            domain_type.as_str(),
            Self::normalize(value)
        )
    }

    /// Custom domains change rarely and are cached longer.
    pub fn ttl_for(&self, domain_type: DomainType) -> Duration {
        match domain_type {
            DomainType::Subdomain => self.config.subdomain_ttl,
            DomainType::CustomDomain => self.config.custom_domain_ttl,
        }
    }

    /// Every key under which `site` may be cached
    pub fn invalidation_keys(&self, site: &Site) -> Vec<String> {
        let mut keys = vec![self.cache_key(&site.subdomain, DomainType::Subdomain)];
        if let Some(domain) = site.custom_domain.as_deref()
            && !domain.trim().is_empty()
        {
            keys.push(self.cache_key(domain, DomainType::CustomDomain));
        }
        keys
    }

    fn is_reserved(&self, label: &str) -> bool {
        self.config
            .reserved_subdomains
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(label))
    }

    /// Map a `Host` header to the lookup that finds its Site.
    ///
    /// Given platform domain `example-platform.com`:
    /// - `acme.example-platform.com` is subdomain `acme`
    /// - `example-platform.com`, `www.example-platform.com` and nested
    ///   labels like `a.b.example-platform.com` belong to no tenant
    /// - `www.shop.example.com` is custom domain `shop.example.com`
    pub fn classify_host(&self, host: &str) -> Option<DomainLookup> {
        let host = Self::normalize(host);
        if host.is_empty() {
            return None;
        }

        let platform = self.config.platform_domain.trim_start_matches('.');
        if host == platform {
            return None;
        }

        if let Some(label) = host
            .strip_suffix(platform)
            .and_then(|rest| rest.strip_suffix('.'))
        {
            if label.is_empty() || label.contains('.') || self.is_reserved(label) {
                return None;
            }
            return Some(DomainLookup {
                value: label.to_owned(),
                domain_type: DomainType::Subdomain,
            });
        }

        let domain = host.strip_prefix("www.").unwrap_or(&host);
        if !domain.contains('.') {
            return None;
        }
        Some(DomainLookup {
            value: domain.to_owned(),
            domain_type: DomainType::CustomDomain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> DomainResolver {
        DomainResolver::new(ResolverConfig {
            platform_domain: "example-platform.com".into(),
            ..ResolverConfig::default()
        })
    }

    fn subdomain(value: &str) -> Option<DomainLookup> {
        Some(DomainLookup {
            value: value.into(),
            domain_type: DomainType::Subdomain,
        })
    }

    fn custom(value: &str) -> Option<DomainLookup> {
        Some(DomainLookup {
            value: value.into(),
            domain_type: DomainType::CustomDomain,
        })
    }

    #[test]
    fn test_cache_keys() {
        let resolver = resolver();
        assert_eq!(
            resolver.cache_key("acme", DomainType::Subdomain),
            "site:subdomain:acme"
        );
        assert_eq!(
            resolver.cache_key(" Shop.Example.com:443 ", DomainType::CustomDomain),
            "site:custom_domain:shop.example.com"
        );
        assert_eq!(
            resolver.cache_key("shop.example.com.", DomainType::CustomDomain),
            "site:custom_domain:shop.example.com"
        );
    }

    #[test]
    fn test_ttl_policy() {
        let resolver = resolver();
        assert_eq!(resolver.ttl_for(DomainType::Subdomain), Duration::from_secs(300));
        assert_eq!(
            resolver.ttl_for(DomainType::CustomDomain),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_invalidation_keys() {
        let resolver = resolver();
        let site = Site::new("s1", "acme");
        assert_eq!(resolver.invalidation_keys(&site), vec!["site:subdomain:acme"]);

        let site = site.with_custom_domain("Shop.Example.com");
        assert_eq!(
            resolver.invalidation_keys(&site),
            vec!["site:subdomain:acme", "site:custom_domain:shop.example.com"]
        );
    }

    #[test]
    fn test_classify_subdomain() {
        let resolver = resolver();
        assert_eq!(resolver.classify_host("acme.example-platform.com"), subdomain("acme"));
        // With port and mixed case
        assert_eq!(
            resolver.classify_host("ACME.example-platform.com:8443"),
            subdomain("acme")
        );
    }

    #[test]
    fn test_classify_no_tenant() {
        let resolver = resolver();
        // Bare platform domain
        assert_eq!(resolver.classify_host("example-platform.com"), None);
        // Reserved labels
        assert_eq!(resolver.classify_host("www.example-platform.com"), None);
        assert_eq!(resolver.classify_host("api.example-platform.com"), None);
        // Nested subdomain
        assert_eq!(resolver.classify_host("a.b.example-platform.com"), None);
        // Single-label host
        assert_eq!(resolver.classify_host("localhost"), None);
        assert_eq!(resolver.classify_host(""), None);
    }

    #[test]
    fn test_classify_custom_domain() {
        let resolver = resolver();
        assert_eq!(resolver.classify_host("shop.example.com"), custom("shop.example.com"));
        assert_eq!(resolver.classify_host("www.shop.example.com"), custom("shop.example.com"));
        // A lookalike suffix is not a platform subdomain
        assert_eq!(
            resolver.classify_host("evilexample-platform.com"),
            custom("evilexample-platform.com")
        );
    }
}
