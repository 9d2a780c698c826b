//! Storage collaborator contracts
//!
//! The core keeps no state between requests. Credentials, challenges,
//! authenticator metadata and risk history live behind these traits. The
//! in-memory implementations in [`memory`] back development and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::challenge::{Challenge, ChallengePurpose};
use crate::credential::{Credential, CredentialStatus};
use crate::risk::GeoPoint;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate credential id {0}")]
    Duplicate(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Fields written after a successful authentication
#[derive(Debug, Clone, PartialEq)]
pub struct UsageUpdate {
    /// Counter the caller read; the update applies only if it is still current
    pub expected_counter: u32,
    pub new_counter: u32,
    pub used_at: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub risk_score: f64,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Credential>, StoreError>;

    async fn get_by_external_id(
        &self,
        tenant_id: &str,
        external_credential_id: &str,
    ) -> Result<Option<Credential>, StoreError>;

    async fn get_all_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<Credential>, StoreError>;

    async fn count_active_for_user(&self, tenant_id: &str, user_id: &str)
        -> Result<usize, StoreError>;

    /// Insert a new credential
    ///
    /// # Errors
    /// `StoreError::Duplicate` if the external ID already exists in the tenant
    async fn create(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Compare-and-swap the signature counter and record usage
    ///
    /// Returns `false` without writing when the stored counter no longer
    /// equals `update.expected_counter` or the credential is not active.
    async fn update_usage(&self, id: Uuid, update: &UsageUpdate) -> Result<bool, StoreError>;

    /// Compare-and-swap the lifecycle status
    ///
    /// Returns `false` without writing when the stored status is no longer
    /// `expected`.
    async fn set_status(
        &self,
        id: Uuid,
        expected: CredentialStatus,
        status: CredentialStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Store a challenge until its expiry
    async fn put(&self, challenge: &Challenge) -> Result<(), StoreError>;

    /// Atomically fetch and remove a challenge
    ///
    /// Expired challenges are still returned so the caller can tell
    /// "expired" from "never issued".
    async fn take(
        &self,
        key: &str,
        purpose: ChallengePurpose,
    ) -> Result<Option<Challenge>, StoreError>;

    async fn delete(&self, key: &str, purpose: ChallengePurpose) -> Result<(), StoreError>;
}

/// Security tier assigned to an authenticator model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityTier {
    Low,
    Medium,
    High,
}

/// Trust metadata for an authenticator model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorMetadata {
    pub model_id: String,
    pub description: String,
    /// DER encoded root certificates
    pub trusted_root_certificates: Vec<Vec<u8>>,
    pub security_tier: SecurityTier,
}

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn get_by_model_id(
        &self,
        model_id: &str,
    ) -> Result<Option<AuthenticatorMetadata>, StoreError>;
}

/// What was observed on one successful authentication
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessObservation {
    pub ip: Option<String>,
    pub device_fingerprint: Option<String>,
    pub location: Option<GeoPoint>,
    pub at: DateTime<Utc>,
}

/// Read-mostly history feeding the risk analyzers; staleness is tolerated
#[async_trait]
pub trait RiskSignalSource: Send + Sync {
    async fn habitual_location(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<GeoPoint>, StoreError>;

    /// Most frequently used addresses, most frequent first
    async fn frequent_addresses(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    async fn known_devices(&self, tenant_id: &str, user_id: &str)
        -> Result<Vec<String>, StoreError>;

    /// Attempts since `since`, including failed ones
    async fn recent_attempts(
        &self,
        tenant_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn record_attempt(
        &self,
        tenant_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_success(
        &self,
        tenant_id: &str,
        user_id: &str,
        observation: &AccessObservation,
    ) -> Result<(), StoreError>;
}
