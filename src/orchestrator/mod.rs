//! Challenge orchestrator
//!
//! Binds the pieces of a ceremony together: challenges are issued and
//! consumed here, responses are checked against them, attestation and risk
//! are evaluated and the credential lifecycle is driven. The orchestrator
//! keeps no state of its own between requests.

mod authentication;
mod context;
mod policy;
mod registration;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

pub use context::{AuthenticationOutcome, RequestContext, UserIdentity};
pub use policy::{CachedPolicyResolver, RegionalPolicy, RegionalPolicyLookup, SettingsPolicyLookup};

use crate::audit::{AuditEmitter, AuditSink};
use crate::challenge::{Challenge, ChallengePurpose};
use crate::credential::{Credential, CredentialLifecycle};
use crate::error::{CoreError, CoreResult};
use crate::metrics::MetricsSink;
use crate::risk::{AuthenticatorProfile, RiskContext, RiskEngine, RiskOperation};
use crate::settings::CoreSettings;
use crate::store::{
    AccessObservation, ChallengeStore, CredentialStore, MetadataLookup, RiskSignalSource,
};
use crate::webauthn::{crypto, AttestationVerifier, AuthenticatorData};

/// External services the orchestrator depends on
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub metadata: Arc<dyn MetadataLookup>,
    pub risk_signals: Arc<dyn RiskSignalSource>,
    pub policies: Arc<dyn RegionalPolicyLookup>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct PasskeyOrchestrator {
    settings: CoreSettings,
    credentials: Arc<dyn CredentialStore>,
    challenges: Arc<dyn ChallengeStore>,
    risk_signals: Arc<dyn RiskSignalSource>,
    metrics: Arc<dyn MetricsSink>,
    verifier: AttestationVerifier,
    risk: RiskEngine,
    lifecycle: CredentialLifecycle,
    policies: CachedPolicyResolver,
    audit: AuditEmitter,
}

impl std::fmt::Debug for PasskeyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasskeyOrchestrator")
            .field("rp_id", &self.settings.relying_party.rp_id)
            .field("verifier", &self.verifier)
            .field("risk", &self.risk)
            .finish_non_exhaustive()
    }
}

impl PasskeyOrchestrator {
    /// Build an orchestrator
    ///
    /// Spawns the audit forwarding task, so this must run inside a Tokio
    /// runtime.
    ///
    /// # Errors
    /// `Configuration` if the settings do not validate
    pub fn new(settings: CoreSettings, collaborators: Collaborators) -> CoreResult<Self> {
        settings
            .validate()
            .map_err(|e| CoreError::Configuration(e.to_string()))?;

        let audit = AuditEmitter::spawn(collaborators.audit_sink, settings.audit.queue_capacity);
        let verifier = AttestationVerifier::new(
            Arc::clone(&collaborators.metadata),
            Arc::clone(&collaborators.metrics),
        );
        let risk = RiskEngine::new(
            &settings.risk,
            Arc::clone(&collaborators.risk_signals),
            Arc::clone(&collaborators.metadata),
        );
        let lifecycle = CredentialLifecycle::new(Arc::clone(&collaborators.credentials), audit.clone());
        let policies = CachedPolicyResolver::new(collaborators.policies, settings.default_policy);

        log::info!(
            "Passkey orchestrator ready for rp_id={} ({} regional policies)",
            settings.relying_party.rp_id,
            settings.regions.len()
        );

        Ok(Self {
            settings,
            credentials: collaborators.credentials,
            challenges: collaborators.challenges,
            risk_signals: collaborators.risk_signals,
            metrics: collaborators.metrics,
            verifier,
            risk,
            lifecycle,
            policies,
            audit,
        })
    }

    /// Replace the attestation verifier (e.g. to add format trust roots)
    #[must_use]
    pub fn with_attestation_verifier(mut self, verifier: AttestationVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Replace the risk engine
    #[must_use]
    pub fn with_risk_engine(mut self, risk: RiskEngine) -> Self {
        self.risk = risk;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    #[must_use]
    pub fn audit(&self) -> &AuditEmitter {
        &self.audit
    }

    /// Suspend a credential on administrative request
    ///
    /// # Errors
    /// `CredentialNotFoundOrInactive` for unknown credentials,
    /// `InvalidStateTransition` for deleted ones
    pub async fn suspend_credential(
        &self,
        credential_id: Uuid,
        reason: &str,
        context: &RequestContext,
    ) -> CoreResult<()> {
        let result = match self.credential_in_tenant(credential_id, context).await {
            Ok(credential) => {
                self.lifecycle
                    .suspend(
                        &credential,
                        reason,
                        serde_json::json!({ "initiatedBy": "administrator" }),
                        &context.correlation_id,
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        self.log_outcome("Credential suspend", context, result)
    }

    /// Reactivate a suspended credential
    ///
    /// # Errors
    /// `CredentialNotFoundOrInactive` for unknown credentials,
    /// `InvalidStateTransition` unless the credential is suspended
    pub async fn reactivate_credential(
        &self,
        credential_id: Uuid,
        reason: &str,
        context: &RequestContext,
    ) -> CoreResult<()> {
        let result = match self.credential_in_tenant(credential_id, context).await {
            Ok(credential) => {
                self.lifecycle
                    .reactivate(&credential, reason, &context.correlation_id)
                    .await
            }
            Err(err) => Err(err),
        };
        self.log_outcome("Credential reactivate", context, result)
    }

    /// Mark a credential deleted
    ///
    /// # Errors
    /// `CredentialNotFoundOrInactive` for unknown credentials,
    /// `InvalidStateTransition` if already deleted
    pub async fn delete_credential(
        &self,
        credential_id: Uuid,
        reason: &str,
        context: &RequestContext,
    ) -> CoreResult<()> {
        let result = match self.credential_in_tenant(credential_id, context).await {
            Ok(credential) => {
                self.lifecycle
                    .delete(&credential, reason, &context.correlation_id)
                    .await
            }
            Err(err) => Err(err),
        };
        self.log_outcome("Credential delete", context, result)
    }

    async fn credential_in_tenant(
        &self,
        credential_id: Uuid,
        context: &RequestContext,
    ) -> CoreResult<Credential> {
        self.credentials
            .get(credential_id)
            .await?
            .filter(|c| c.tenant_id == context.tenant_id)
            .ok_or(CoreError::CredentialNotFoundOrInactive)
    }

    /// Log a failure with the request's correlation and tenant before it surfaces
    fn log_outcome<T>(
        &self,
        operation: &str,
        context: &RequestContext,
        result: CoreResult<T>,
    ) -> CoreResult<T> {
        if let Err(err) = &result {
            log::warn!(
                "{operation} failed: {err} (correlation_id={}, tenant_id={})",
                context.correlation_id,
                context.tenant_id
            );
        }
        result
    }

    /// Atomically consume a challenge for this tenant
    async fn consume_challenge(
        &self,
        key: &str,
        purpose: ChallengePurpose,
        context: &RequestContext,
    ) -> CoreResult<Challenge> {
        let challenge = self
            .challenges
            .take(key, purpose)
            .await?
            .ok_or(CoreError::ChallengeNotFound)?;

        if challenge.context.tenant_id != context.tenant_id {
            log::warn!(
                "Challenge presented by another tenant (correlation_id={}, tenant_id={})",
                context.correlation_id,
                context.tenant_id
            );
            return Err(CoreError::ChallengeNotFound);
        }
        if challenge.is_expired(Utc::now()) {
            return Err(CoreError::ChallengeExpired);
        }
        Ok(challenge)
    }

    /// Checks shared by both ceremonies; returns the reason for rejection
    fn check_authenticator_data(
        &self,
        auth_data: &AuthenticatorData,
        policy: RegionalPolicy,
    ) -> Result<(), &'static str> {
        if auth_data.rp_id_hash != crypto::sha256(self.settings.relying_party.rp_id.as_bytes()) {
            return Err("rpIdHash does not match the relying party");
        }
        if !auth_data.flags.user_present() {
            return Err("user presence flag not set");
        }
        if policy.require_user_verification && !auth_data.flags.user_verified() {
            return Err("user verification required by regional policy");
        }
        Ok(())
    }

    fn risk_context(
        context: &RequestContext,
        user_id: &str,
        operation: RiskOperation,
        authenticator: AuthenticatorProfile,
    ) -> RiskContext {
        RiskContext {
            tenant_id: context.tenant_id.clone(),
            user_id: user_id.to_string(),
            operation,
            ip: context.ip.clone(),
            user_agent: context.user_agent.clone(),
            device_fingerprint: context.device_fingerprint.clone(),
            country_code: context.country_code.clone(),
            location: context.location,
            proxy_detected: context.proxy_detected,
            session_duration: context.session_duration,
            at: context.received_at,
            authenticator,
        }
    }

    async fn record_attempt(&self, context: &RequestContext, user_id: &str) {
        if let Err(err) = self
            .risk_signals
            .record_attempt(&context.tenant_id, user_id, context.received_at)
            .await
        {
            log::warn!(
                "Failed to record attempt: {err} (correlation_id={}, tenant_id={})",
                context.correlation_id,
                context.tenant_id
            );
        }
    }

    async fn record_success(&self, context: &RequestContext, user_id: &str) {
        let observation = AccessObservation {
            ip: context.ip.clone(),
            device_fingerprint: context.device_fingerprint.clone(),
            location: context.location,
            at: context.received_at,
        };
        if let Err(err) = self
            .risk_signals
            .record_success(&context.tenant_id, user_id, &observation)
            .await
        {
            log::warn!(
                "Failed to record access history: {err} (correlation_id={}, tenant_id={})",
                context.correlation_id,
                context.tenant_id
            );
        }
    }

    fn record_outcome(&self, ceremony: &str, result: Result<(), &CoreError>) {
        let outcome = match result {
            Ok(()) => "success",
            Err(err) => err.code(),
        };
        self.metrics
            .increment_counter(ceremony, &[("outcome", outcome)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialStatus;
    use crate::testing::fixtures::{sample_credential, TestHarness};

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let mut settings = CoreSettings::default();
        settings.relying_party.rp_id = String::new();
        let harness = TestHarness::new();
        assert!(matches!(
            PasskeyOrchestrator::new(settings, harness.collaborators()),
            Err(CoreError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_admin_transitions() {
        let harness = TestHarness::new();
        let orchestrator = harness.orchestrator();
        let credential = sample_credential("tenant-a", "user-1", "cred-1");
        harness.credentials.create(&credential).await.unwrap();
        let context = RequestContext::new("tenant-a");

        orchestrator
            .suspend_credential(credential.id, "lost device", &context)
            .await
            .unwrap();
        let stored = harness.credentials.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Suspended);

        orchestrator
            .reactivate_credential(credential.id, "found it", &context)
            .await
            .unwrap();
        orchestrator
            .delete_credential(credential.id, "user request", &context)
            .await
            .unwrap();
        assert!(matches!(
            orchestrator
                .delete_credential(credential.id, "again", &context)
                .await,
            Err(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_admin_cannot_cross_tenants() {
        let harness = TestHarness::new();
        let orchestrator = harness.orchestrator();
        let credential = sample_credential("tenant-a", "user-1", "cred-1");
        harness.credentials.create(&credential).await.unwrap();

        let other = RequestContext::new("tenant-b");
        assert!(matches!(
            orchestrator
                .suspend_credential(credential.id, "nope", &other)
                .await,
            Err(CoreError::CredentialNotFoundOrInactive)
        ));
    }
}
