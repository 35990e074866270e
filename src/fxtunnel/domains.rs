use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// An operator-verified external hostname mapped onto a subdomain tunnel.
/// Verified entries override wildcard matching in the HTTP router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDomain {
    pub domain: String,
    pub target_subdomain: String,
    pub verified: bool,
    pub owner: String,
}

/// In-memory view of the custom-domain list. The authoritative store and the
/// verification workflow live in the admin service; the core only consumes
/// a mapping of `host → subdomain label`.
#[derive(Debug, Default)]
pub struct CustomDomains {
    by_host: RwLock<HashMap<String, CustomDomain>>,
}

impl CustomDomains {
    pub fn new(entries: Vec<CustomDomain>) -> Self {
        let d = Self::default();
        d.replace(entries);
        d
    }

    /// Swap in a fresh snapshot (config reload / admin push).
    pub fn replace(&self, entries: Vec<CustomDomain>) {
        let mut map = HashMap::with_capacity(entries.len());
        for e in entries {
            let host = e.domain.trim().to_ascii_lowercase();
            if host.is_empty() || !e.verified {
                continue;
            }
            map.insert(host, e);
        }
        *self.by_host.write().unwrap_or_else(|e| e.into_inner()) = map;
    }

    /// Resolve a lowercased host to its target subdomain label.
    pub fn resolve(&self, host: &str) -> Option<String> {
        let map = self.by_host.read().unwrap_or_else(|e| e.into_inner());
        map.get(host).map(|d| d.target_subdomain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_verified_domains_resolve() {
        let d = CustomDomains::new(vec![
            CustomDomain {
                domain: "App.Example.COM".into(),
                target_subdomain: "app".into(),
                verified: true,
                owner: "user1".into(),
            },
            CustomDomain {
                domain: "pending.example.com".into(),
                target_subdomain: "other".into(),
                verified: false,
                owner: "user1".into(),
            },
        ]);

        assert_eq!(d.resolve("app.example.com").as_deref(), Some("app"));
        assert_eq!(d.resolve("pending.example.com"), None);
    }
}
