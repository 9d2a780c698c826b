//! Test fixtures providing pre-built test objects
//!
//! Common settings, credentials and a harness wiring the orchestrator to
//! in-memory collaborators that tests can inspect afterwards.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::InMemoryAuditSink;
use crate::credential::{Credential, CredentialStatus, TrustLevel};
use crate::metrics::InMemoryMetrics;
use crate::orchestrator::{
    Collaborators, PasskeyOrchestrator, RegionalPolicy, SettingsPolicyLookup, UserIdentity,
};
use crate::settings::CoreSettings;
use crate::store::memory::{
    InMemoryChallengeStore, InMemoryCredentialStore, InMemoryMetadataStore, InMemoryRiskSignals,
};
use crate::webauthn::AuthenticatorTransport;

pub const TENANT: &str = "tenant-test";
pub const RP_ID: &str = "example.com";
pub const ORIGIN: &str = "https://example.com";

/// Settings for the `example.com` relying party
#[must_use]
pub fn test_settings() -> CoreSettings {
    let mut settings = CoreSettings::default();
    settings.relying_party.rp_id = RP_ID.to_string();
    settings.relying_party.rp_name = "Example".to_string();
    settings.relying_party.allowed_origins = vec![ORIGIN.to_string()];
    settings
}

#[must_use]
pub fn user(user_id: &str) -> UserIdentity {
    UserIdentity {
        user_id: user_id.to_string(),
        name: format!("{user_id}@example.com"),
        display_name: user_id.to_string(),
    }
}

/// An active credential with a zero counter
#[must_use]
pub fn sample_credential(tenant_id: &str, user_id: &str, external_id: &str) -> Credential {
    Credential {
        id: Uuid::new_v4(),
        owner_user_id: user_id.to_string(),
        tenant_id: tenant_id.to_string(),
        external_credential_id: external_id.to_string(),
        public_key: Vec::new(),
        sign_count: 0,
        authenticator_model_id: Uuid::nil().to_string(),
        attestation_format: "none".to_string(),
        user_verified: true,
        backup_eligible: false,
        backup_state: false,
        transports: BTreeSet::from([AuthenticatorTransport::Usb]),
        authenticator_attachment: None,
        status: CredentialStatus::Active,
        trust_level: TrustLevel::Aal3,
        risk_score_at_registration: 0.1,
        last_risk_score: None,
        created_at: Utc::now(),
        last_used_at: None,
        last_ip: None,
        last_user_agent: None,
        suspension_reason: None,
    }
}

/// Orchestrator wiring backed by inspectable in-memory collaborators
pub struct TestHarness {
    pub settings: CoreSettings,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub challenges: Arc<InMemoryChallengeStore>,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub signals: Arc<InMemoryRiskSignals>,
    pub audit: Arc<InMemoryAuditSink>,
    pub metrics: Arc<InMemoryMetrics>,
    pub regions: HashMap<String, RegionalPolicy>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    #[must_use]
    pub fn with_settings(settings: CoreSettings) -> Self {
        Self {
            regions: settings.regions.clone(),
            settings,
            credentials: Arc::new(InMemoryCredentialStore::new()),
            challenges: Arc::new(InMemoryChallengeStore::new()),
            metadata: Arc::new(InMemoryMetadataStore::new()),
            signals: Arc::new(InMemoryRiskSignals::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            metrics: Arc::new(InMemoryMetrics::new()),
        }
    }

    /// Add a regional policy served by the policy lookup
    #[must_use]
    pub fn with_region(mut self, region: &str, policy: RegionalPolicy) -> Self {
        self.regions.insert(region.to_string(), policy);
        self
    }

    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            credentials: self.credentials.clone(),
            challenges: self.challenges.clone(),
            metadata: self.metadata.clone(),
            risk_signals: self.signals.clone(),
            policies: Arc::new(SettingsPolicyLookup::new(self.regions.clone())),
            audit_sink: self.audit.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Build an orchestrator; must be called inside a Tokio runtime
    ///
    /// # Panics
    /// If the harness settings do not validate
    #[must_use]
    pub fn orchestrator(&self) -> PasskeyOrchestrator {
        PasskeyOrchestrator::new(self.settings.clone(), self.collaborators())
            .expect("test settings are valid")
    }
}
