//! Regional ceremony policy
//!
//! A region decides whether user verification and attestation are mandatory.
//! Policies are resolved once per request and passed down as plain values.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionalPolicy {
    pub require_user_verification: bool,
    pub require_attestation: bool,
}

#[async_trait]
pub trait RegionalPolicyLookup: Send + Sync {
    /// Policy for a region; `None` when the region has no specific policy
    async fn policy_for(&self, region: &str) -> Result<Option<RegionalPolicy>, StoreError>;
}

/// Lookup backed by the `regions` table of the settings
#[derive(Debug, Clone, Default)]
pub struct SettingsPolicyLookup {
    regions: HashMap<String, RegionalPolicy>,
}

impl SettingsPolicyLookup {
    #[must_use]
    pub fn new(regions: HashMap<String, RegionalPolicy>) -> Self {
        Self { regions }
    }
}

#[async_trait]
impl RegionalPolicyLookup for SettingsPolicyLookup {
    async fn policy_for(&self, region: &str) -> Result<Option<RegionalPolicy>, StoreError> {
        Ok(self.regions.get(region).copied())
    }
}

/// Caches policy lookups for a fixed time
pub struct CachedPolicyResolver {
    lookup: Arc<dyn RegionalPolicyLookup>,
    default_policy: RegionalPolicy,
    ttl: Duration,
    cache: DashMap<String, (RegionalPolicy, Instant)>,
}

impl std::fmt::Debug for CachedPolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPolicyResolver")
            .field("default_policy", &self.default_policy)
            .field("ttl", &self.ttl)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl CachedPolicyResolver {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    #[must_use]
    pub fn new(lookup: Arc<dyn RegionalPolicyLookup>, default_policy: RegionalPolicy) -> Self {
        Self {
            lookup,
            default_policy,
            ttl: Self::DEFAULT_TTL,
            cache: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolve the policy for a region
    ///
    /// Requests without a region, and regions without a specific policy, get
    /// the default policy.
    ///
    /// # Errors
    /// `Internal` if the lookup fails and nothing usable is cached
    pub async fn resolve(&self, region: Option<&str>) -> CoreResult<RegionalPolicy> {
        let Some(region) = region else {
            return Ok(self.default_policy);
        };

        if let Some(entry) = self.cache.get(region) {
            let (policy, fetched_at) = *entry;
            if fetched_at.elapsed() < self.ttl {
                return Ok(policy);
            }
        }

        let policy = self
            .lookup
            .policy_for(region)
            .await
            .map_err(|e| CoreError::internal(format!("regional policy lookup for {region}"), e))?
            .unwrap_or(self.default_policy);
        self.cache
            .insert(region.to_string(), (policy, Instant::now()));
        Ok(policy)
    }

    /// Drop every cached policy
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        calls: AtomicUsize,
        inner: SettingsPolicyLookup,
    }

    #[async_trait]
    impl RegionalPolicyLookup for CountingLookup {
        async fn policy_for(&self, region: &str) -> Result<Option<RegionalPolicy>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.policy_for(region).await
        }
    }

    struct BrokenLookup;

    #[async_trait]
    impl RegionalPolicyLookup for BrokenLookup {
        async fn policy_for(&self, _region: &str) -> Result<Option<RegionalPolicy>, StoreError> {
            Err(StoreError::Backend("unavailable".to_string()))
        }
    }

    fn strict() -> RegionalPolicy {
        RegionalPolicy {
            require_user_verification: true,
            require_attestation: true,
        }
    }

    #[tokio::test]
    async fn test_resolve_uses_cache() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
            inner: SettingsPolicyLookup::new(HashMap::from([("eu".to_string(), strict())])),
        });
        let resolver = CachedPolicyResolver::new(lookup.clone(), RegionalPolicy::default());

        assert_eq!(resolver.resolve(Some("eu")).await.unwrap(), strict());
        assert_eq!(resolver.resolve(Some("eu")).await.unwrap(), strict());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            resolver.resolve(Some("us")).await.unwrap(),
            RegionalPolicy::default()
        );
        assert_eq!(resolver.resolve(None).await.unwrap(), RegionalPolicy::default());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);

        resolver.invalidate();
        resolver.resolve(Some("eu")).await.unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_internal() {
        let resolver = CachedPolicyResolver::new(Arc::new(BrokenLookup), strict());
        assert!(matches!(
            resolver.resolve(Some("eu")).await,
            Err(CoreError::Internal { .. })
        ));
        // No region never touches the lookup
        assert_eq!(resolver.resolve(None).await.unwrap(), strict());
    }
}
