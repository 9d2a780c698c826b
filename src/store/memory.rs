//! In-memory stores
//!
//! `DashMap` backed implementations of every storage contract. Atomicity comes
//! from holding the shard lock for the duration of each compare-and-swap or
//! remove.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    AccessObservation, AuthenticatorMetadata, ChallengeStore, CredentialStore, MetadataLookup,
    RiskSignalSource, StoreError, UsageUpdate,
};
use crate::challenge::{Challenge, ChallengePurpose};
use crate::credential::{Credential, CredentialStatus};
use crate::risk::GeoPoint;

/// Longest window the risk analyzers count attempts over; older attempts are
/// dropped as new ones arrive
const ATTEMPT_RETENTION_HOURS: i64 = 1;

/// Credentials keyed by ID with a unique (tenant, external ID) index
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: DashMap<Uuid, Credential>,
    external_index: DashMap<(String, String), Uuid>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored credentials in any status
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl std::fmt::Debug for InMemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCredentialStore")
            .field("credentials", &self.credentials.len())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, id: Uuid) -> Result<Option<Credential>, StoreError> {
        Ok(self.credentials.get(&id).map(|c| c.clone()))
    }

    async fn get_by_external_id(
        &self,
        tenant_id: &str,
        external_credential_id: &str,
    ) -> Result<Option<Credential>, StoreError> {
        let key = (tenant_id.to_string(), external_credential_id.to_string());
        let Some(id) = self.external_index.get(&key).map(|id| *id) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn get_all_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<Credential>, StoreError> {
        let mut found: Vec<Credential> = self
            .credentials
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.owner_user_id == user_id)
            .map(|c| c.clone())
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn count_active_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<usize, StoreError> {
        Ok(self
            .credentials
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.owner_user_id == user_id && c.is_active())
            .count())
    }

    async fn create(&self, credential: &Credential) -> Result<(), StoreError> {
        let key = (
            credential.tenant_id.clone(),
            credential.external_credential_id.clone(),
        );
        match self.external_index.entry(key) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(
                credential.external_credential_id.clone(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(credential.id);
                self.credentials.insert(credential.id, credential.clone());
                Ok(())
            }
        }
    }

    async fn update_usage(&self, id: Uuid, update: &UsageUpdate) -> Result<bool, StoreError> {
        let Some(mut credential) = self.credentials.get_mut(&id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        if !credential.is_active() || credential.sign_count != update.expected_counter {
            return Ok(false);
        }
        credential.sign_count = update.new_counter;
        credential.last_used_at = Some(update.used_at);
        credential.last_ip.clone_from(&update.ip);
        credential.last_user_agent.clone_from(&update.user_agent);
        credential.last_risk_score = Some(update.risk_score);
        Ok(true)
    }

    async fn set_status(
        &self,
        id: Uuid,
        expected: CredentialStatus,
        status: CredentialStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let Some(mut credential) = self.credentials.get_mut(&id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        if credential.status != expected {
            return Ok(false);
        }
        credential.status = status;
        match status {
            CredentialStatus::Suspended => {
                credential.suspension_reason = reason.map(ToString::to_string);
            }
            CredentialStatus::Active => credential.suspension_reason = None,
            CredentialStatus::Deleted => {}
        }
        Ok(true)
    }
}

/// Challenges keyed by (challenge, purpose)
#[derive(Default)]
pub struct InMemoryChallengeStore {
    challenges: DashMap<(String, ChallengePurpose), Challenge>,
}

impl InMemoryChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove challenges that expired before `now`
    pub fn cleanup_expired(&self, now: DateTime<Utc>) {
        self.challenges.retain(|_, c| !c.is_expired(now));
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.challenges.len()
    }
}

impl std::fmt::Debug for InMemoryChallengeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChallengeStore")
            .field("challenges", &self.challenges.len())
            .finish()
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn put(&self, challenge: &Challenge) -> Result<(), StoreError> {
        self.challenges.insert(
            (challenge.key.clone(), challenge.purpose),
            challenge.clone(),
        );
        Ok(())
    }

    async fn take(
        &self,
        key: &str,
        purpose: ChallengePurpose,
    ) -> Result<Option<Challenge>, StoreError> {
        Ok(self
            .challenges
            .remove(&(key.to_string(), purpose))
            .map(|(_, challenge)| challenge))
    }

    async fn delete(&self, key: &str, purpose: ChallengePurpose) -> Result<(), StoreError> {
        self.challenges.remove(&(key.to_string(), purpose));
        Ok(())
    }
}

/// Authenticator metadata keyed by model ID
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    entries: DashMap<String, AuthenticatorMetadata>,
}

impl InMemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, metadata: AuthenticatorMetadata) {
        self.entries.insert(metadata.model_id.clone(), metadata);
    }
}

#[async_trait]
impl MetadataLookup for InMemoryMetadataStore {
    async fn get_by_model_id(
        &self,
        model_id: &str,
    ) -> Result<Option<AuthenticatorMetadata>, StoreError> {
        Ok(self.entries.get(model_id).map(|m| m.clone()))
    }
}

#[derive(Debug, Default, Clone)]
struct UserHistory {
    habitual_location: Option<GeoPoint>,
    address_counts: HashMap<String, usize>,
    devices: BTreeSet<String>,
    attempts: Vec<DateTime<Utc>>,
}

/// Per-user access history
#[derive(Debug, Default)]
pub struct InMemoryRiskSignals {
    history: DashMap<(String, String), UserHistory>,
}

impl InMemoryRiskSignals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_habitual_location(&self, tenant_id: &str, user_id: &str, location: GeoPoint) {
        self.history
            .entry(key(tenant_id, user_id))
            .or_default()
            .habitual_location = Some(location);
    }

    pub fn add_known_device(&self, tenant_id: &str, user_id: &str, fingerprint: &str) {
        self.history
            .entry(key(tenant_id, user_id))
            .or_default()
            .devices
            .insert(fingerprint.to_string());
    }

    pub fn add_address(&self, tenant_id: &str, user_id: &str, ip: &str, times: usize) {
        *self
            .history
            .entry(key(tenant_id, user_id))
            .or_default()
            .address_counts
            .entry(ip.to_string())
            .or_insert(0) += times;
    }
}

fn key(tenant_id: &str, user_id: &str) -> (String, String) {
    (tenant_id.to_string(), user_id.to_string())
}

#[async_trait]
impl RiskSignalSource for InMemoryRiskSignals {
    async fn habitual_location(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<GeoPoint>, StoreError> {
        Ok(self
            .history
            .get(&key(tenant_id, user_id))
            .and_then(|h| h.habitual_location))
    }

    async fn frequent_addresses(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let Some(history) = self.history.get(&key(tenant_id, user_id)) else {
            return Ok(Vec::new());
        };
        let mut counted: Vec<(&String, &usize)> = history.address_counts.iter().collect();
        counted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        Ok(counted
            .into_iter()
            .take(limit)
            .map(|(ip, _)| ip.clone())
            .collect())
    }

    async fn known_devices(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .history
            .get(&key(tenant_id, user_id))
            .map(|h| h.devices.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn recent_attempts(
        &self,
        tenant_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        Ok(self
            .history
            .get(&key(tenant_id, user_id))
            .map_or(0, |h| h.attempts.iter().filter(|at| **at >= since).count()))
    }

    async fn record_attempt(
        &self,
        tenant_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let cutoff = at - chrono::Duration::hours(ATTEMPT_RETENTION_HOURS);
        let mut history = self.history.entry(key(tenant_id, user_id)).or_default();
        history.attempts.retain(|seen| *seen >= cutoff);
        history.attempts.push(at);
        Ok(())
    }

    async fn record_success(
        &self,
        tenant_id: &str,
        user_id: &str,
        observation: &AccessObservation,
    ) -> Result<(), StoreError> {
        let mut history = self.history.entry(key(tenant_id, user_id)).or_default();
        if let Some(ip) = &observation.ip {
            *history.address_counts.entry(ip.clone()).or_insert(0) += 1;
        }
        if let Some(device) = &observation.device_fingerprint {
            history.devices.insert(device.clone());
        }
        if history.habitual_location.is_none() {
            history.habitual_location = observation.location;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeContext;
    use crate::testing::fixtures::sample_credential;

    #[tokio::test]
    async fn test_challenge_take_is_single_use() {
        let store = InMemoryChallengeStore::new();
        let challenge = Challenge::issue(
            ChallengePurpose::Authentication,
            ChallengeContext::default(),
            chrono::Duration::seconds(60),
        )
        .unwrap();
        store.put(&challenge).await.unwrap();

        // Wrong purpose does not consume it
        assert!(store
            .take(&challenge.key, ChallengePurpose::Registration)
            .await
            .unwrap()
            .is_none());

        let taken = store
            .take(&challenge.key, ChallengePurpose::Authentication)
            .await
            .unwrap();
        assert_eq!(taken, Some(challenge.clone()));
        assert!(store
            .take(&challenge.key, ChallengePurpose::Authentication)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_concurrent_take_succeeds_once() {
        let store = std::sync::Arc::new(InMemoryChallengeStore::new());
        let challenge = Challenge::issue(
            ChallengePurpose::Registration,
            ChallengeContext::default(),
            chrono::Duration::seconds(60),
        )
        .unwrap();
        store.put(&challenge).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = challenge.key.clone();
            tasks.spawn(async move {
                store
                    .take(&key, ChallengePurpose::Registration)
                    .await
                    .unwrap()
                    .is_some()
            });
        }
        let mut successes = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired_keeps_live_challenges() {
        let store = InMemoryChallengeStore::new();
        let live = Challenge::issue(
            ChallengePurpose::Registration,
            ChallengeContext::default(),
            chrono::Duration::seconds(60),
        )
        .unwrap();
        let stale = Challenge::issue(
            ChallengePurpose::Registration,
            ChallengeContext::default(),
            chrono::Duration::seconds(-1),
        )
        .unwrap();
        store.put(&live).await.unwrap();
        store.put(&stale).await.unwrap();

        store.cleanup_expired(Utc::now());
        assert_eq!(store.pending(), 1);
        assert!(store
            .take(&live.key, ChallengePurpose::Registration)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_external_id_rejected_per_tenant() {
        let store = InMemoryCredentialStore::new();
        let first = sample_credential("tenant-a", "user-1", "cred-1");
        store.create(&first).await.unwrap();

        let duplicate = sample_credential("tenant-a", "user-2", "cred-1");
        assert!(matches!(
            store.create(&duplicate).await,
            Err(StoreError::Duplicate(_))
        ));

        let other_tenant = sample_credential("tenant-b", "user-1", "cred-1");
        store.create(&other_tenant).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_update_usage_compare_and_swap() {
        let store = InMemoryCredentialStore::new();
        let mut credential = sample_credential("tenant-a", "user-1", "cred-1");
        credential.sign_count = 5;
        store.create(&credential).await.unwrap();

        let update = UsageUpdate {
            expected_counter: 5,
            new_counter: 6,
            used_at: Utc::now(),
            ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            risk_score: 0.2,
        };
        assert!(store.update_usage(credential.id, &update).await.unwrap());
        // Same expectation again is stale now
        assert!(!store.update_usage(credential.id, &update).await.unwrap());

        let stored = store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.sign_count, 6);
        assert_eq!(stored.last_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(stored.last_risk_score, Some(0.2));
    }

    #[tokio::test]
    async fn test_count_active_ignores_suspended() {
        let store = InMemoryCredentialStore::new();
        let a = sample_credential("t", "u", "a");
        let b = sample_credential("t", "u", "b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        assert!(store
            .set_status(
                b.id,
                CredentialStatus::Active,
                CredentialStatus::Suspended,
                Some("test")
            )
            .await
            .unwrap());

        assert_eq!(store.count_active_for_user("t", "u").await.unwrap(), 1);
        assert_eq!(store.get_all_for_user("t", "u").await.unwrap().len(), 2);
        let suspended = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(suspended.suspension_reason.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn test_set_status_compare_and_swap() {
        let store = InMemoryCredentialStore::new();
        let credential = sample_credential("t", "u", "a");
        store.create(&credential).await.unwrap();

        assert!(store
            .set_status(
                credential.id,
                CredentialStatus::Active,
                CredentialStatus::Deleted,
                Some("user request")
            )
            .await
            .unwrap());
        // A writer still expecting `active` must not resurrect it
        assert!(!store
            .set_status(
                credential.id,
                CredentialStatus::Active,
                CredentialStatus::Suspended,
                Some("late")
            )
            .await
            .unwrap());

        let stored = store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Deleted);
        assert!(stored.suspension_reason.is_none());
    }

    #[tokio::test]
    async fn test_attempts_older_than_an_hour_are_pruned() {
        let signals = InMemoryRiskSignals::new();
        let start = Utc::now() - chrono::Duration::hours(3);
        for offset in [0, 90, 120] {
            signals
                .record_attempt("t", "u", start + chrono::Duration::minutes(offset))
                .await
                .unwrap();
        }

        let retained = signals.history.get(&key("t", "u")).unwrap().attempts.len();
        assert_eq!(retained, 2);
        assert_eq!(signals.recent_attempts("t", "u", start).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_frequent_addresses_ordering() {
        let signals = InMemoryRiskSignals::new();
        signals.add_address("t", "u", "10.0.0.2", 1);
        signals.add_address("t", "u", "10.0.0.1", 5);
        signals.add_address("t", "u", "10.0.0.3", 3);

        let top = signals.frequent_addresses("t", "u", 2).await.unwrap();
        assert_eq!(top, vec!["10.0.0.1".to_string(), "10.0.0.3".to_string()]);
    }
}
