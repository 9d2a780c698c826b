//! Credential lifecycle state machine
//!
//! ```text
//! active ──suspend──▶ suspended ──reactivate──▶ active
//!   │                     │
//!   └──────delete─────────┴──────▶ deleted (terminal)
//! ```
//!
//! Every transition is written to the store first and then announced on the
//! audit emitter. Writes are conditional on the status the caller read, so a
//! transition decided on a stale copy never lands (a deleted credential stays
//! deleted).

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::model::{Credential, CredentialStatus};
use crate::audit::{AuditEmitter, AuditEvent, AuditEventType, AuditSeverity};
use crate::error::{CoreError, CoreResult};
use crate::store::{CredentialStore, UsageUpdate};

/// Suspension reason recorded when clone detection trips
pub const SIGN_COUNT_ANOMALY: &str = "SIGN_COUNT_ANOMALY";

/// Check a status transition without performing it
///
/// # Errors
/// `InvalidStateTransition` for anything the state machine does not allow.
/// Suspending an already suspended credential is allowed (it is a no-op).
pub fn check_transition(from: CredentialStatus, to: CredentialStatus) -> CoreResult<()> {
    use CredentialStatus::{Active, Deleted, Suspended};
    match (from, to) {
        (Active | Suspended, Suspended) | (Suspended, Active) | (Active | Suspended, Deleted) => {
            Ok(())
        }
        _ => Err(CoreError::InvalidStateTransition { from, to }),
    }
}

/// Clone detection rule
///
/// A counter that fails to advance is an anomaly, except when the stored
/// counter is still zero (authenticators without a counter always report 0).
///
/// # Errors
/// `SignCountAnomaly` carrying both counters
pub fn check_sign_count(stored: u32, received: u32) -> CoreResult<()> {
    if stored > 0 && received <= stored {
        return Err(CoreError::SignCountAnomaly {
            expected: stored,
            received,
        });
    }
    Ok(())
}

/// Usage recorded with a successful authentication
#[derive(Debug, Clone, Default)]
pub struct AuthenticationUsage {
    pub new_counter: u32,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub risk_score: f64,
}

#[derive(Clone)]
pub struct CredentialLifecycle {
    store: Arc<dyn CredentialStore>,
    audit: AuditEmitter,
}

impl CredentialLifecycle {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, audit: AuditEmitter) -> Self {
        Self { store, audit }
    }

    /// Persist a freshly registered credential as `active`
    ///
    /// # Errors
    /// `RegistrationVerificationFailed` for a duplicate external ID, `Internal`
    /// for other store failures
    pub async fn create(
        &self,
        mut credential: Credential,
        correlation_id: &str,
    ) -> CoreResult<Credential> {
        credential.status = CredentialStatus::Active;
        credential.suspension_reason = None;

        if let Err(err) = self.store.create(&credential).await {
            return Err(match err {
                crate::store::StoreError::Duplicate(_) => CoreError::RegistrationVerificationFailed(
                    "credential already registered".to_string(),
                ),
                other => other.into(),
            });
        }

        self.audit.emit(
            AuditEvent::builder(
                AuditEventType::CredentialRegistered,
                &credential.tenant_id,
                correlation_id,
            )
            .user(&credential.owner_user_id)
            .credential(credential.id)
            .detail("attestationFormat", credential.attestation_format.as_str())
            .detail("authenticatorModelId", credential.authenticator_model_id.as_str())
            .detail("trustLevel", credential.trust_level.to_string())
            .detail("riskScore", credential.risk_score_at_registration)
            .build(),
        );
        Ok(credential)
    }

    /// Apply a verified assertion to a credential
    ///
    /// On a counter anomaly the credential is suspended, a critical audit
    /// event is emitted and the attempt fails.
    ///
    /// # Errors
    /// `CredentialNotFoundOrInactive`, `SignCountAnomaly`, or
    /// `AuthenticationVerificationFailed` when a concurrent authentication
    /// moved the counter first
    pub async fn authenticate(
        &self,
        credential: &Credential,
        usage: AuthenticationUsage,
        correlation_id: &str,
    ) -> CoreResult<Credential> {
        if !credential.is_active() {
            return Err(CoreError::CredentialNotFoundOrInactive);
        }

        if let Err(anomaly) = check_sign_count(credential.sign_count, usage.new_counter) {
            match self
                .swap_status(credential, CredentialStatus::Suspended, SIGN_COUNT_ANOMALY)
                .await
            {
                Ok(()) => {}
                // Suspended or deleted since it was read
                Err(CoreError::InvalidStateTransition { .. }) => {
                    return Err(CoreError::CredentialNotFoundOrInactive);
                }
                Err(err) => return Err(err),
            }
            log::warn!(
                "Possible cloned authenticator: credential {} counter {} -> {} (tenant_id={}, correlation_id={correlation_id})",
                credential.id,
                credential.sign_count,
                usage.new_counter,
                credential.tenant_id
            );
            self.audit.emit(
                AuditEvent::builder(
                    AuditEventType::SignCountAnomaly,
                    &credential.tenant_id,
                    correlation_id,
                )
                .severity(AuditSeverity::Critical)
                .user(&credential.owner_user_id)
                .credential(credential.id)
                .detail("expectedCounter", credential.sign_count)
                .detail("receivedCounter", usage.new_counter)
                .detail("newStatus", CredentialStatus::Suspended.to_string())
                .detail("reason", SIGN_COUNT_ANOMALY)
                .build(),
            );
            return Err(anomaly);
        }

        let update = UsageUpdate {
            expected_counter: credential.sign_count,
            new_counter: usage.new_counter,
            used_at: Utc::now(),
            ip: usage.ip,
            user_agent: usage.user_agent,
            risk_score: usage.risk_score,
        };
        if !self.store.update_usage(credential.id, &update).await? {
            log::warn!(
                "Counter for credential {} changed concurrently (tenant_id={}, correlation_id={correlation_id})",
                credential.id,
                credential.tenant_id
            );
            return Err(CoreError::AuthenticationVerificationFailed);
        }

        let mut updated = credential.clone();
        updated.sign_count = update.new_counter;
        updated.last_used_at = Some(update.used_at);
        updated.last_ip = update.ip;
        updated.last_user_agent = update.user_agent;
        updated.last_risk_score = Some(update.risk_score);
        Ok(updated)
    }

    /// Suspend a credential; a no-op when it is already suspended
    ///
    /// # Errors
    /// `InvalidStateTransition` for a deleted credential
    pub async fn suspend(
        &self,
        credential: &Credential,
        reason: &str,
        details: serde_json::Value,
        correlation_id: &str,
    ) -> CoreResult<()> {
        check_transition(credential.status, CredentialStatus::Suspended)?;
        if credential.status == CredentialStatus::Suspended {
            log::debug!("Credential {} already suspended", credential.id);
            return Ok(());
        }

        match self.swap_status(credential, CredentialStatus::Suspended, reason).await {
            Err(CoreError::InvalidStateTransition {
                from: CredentialStatus::Suspended,
                ..
            }) => {
                log::debug!("Credential {} was suspended concurrently", credential.id);
                return Ok(());
            }
            other => other?,
        }
        self.emit_transition(
            AuditEventType::CredentialSuspended,
            AuditSeverity::High,
            credential,
            CredentialStatus::Suspended,
            reason,
            details,
            correlation_id,
        );
        Ok(())
    }

    /// Move a suspended credential back to `active`
    ///
    /// # Errors
    /// `InvalidStateTransition` unless the credential is suspended
    pub async fn reactivate(
        &self,
        credential: &Credential,
        reason: &str,
        correlation_id: &str,
    ) -> CoreResult<()> {
        if credential.status != CredentialStatus::Suspended {
            return Err(CoreError::InvalidStateTransition {
                from: credential.status,
                to: CredentialStatus::Active,
            });
        }

        self.swap_status(credential, CredentialStatus::Active, reason).await?;
        self.emit_transition(
            AuditEventType::CredentialReactivated,
            AuditSeverity::Warning,
            credential,
            CredentialStatus::Active,
            reason,
            json!({}),
            correlation_id,
        );
        Ok(())
    }

    /// Mark a credential deleted
    ///
    /// # Errors
    /// `InvalidStateTransition` if it is already deleted
    pub async fn delete(
        &self,
        credential: &Credential,
        reason: &str,
        correlation_id: &str,
    ) -> CoreResult<()> {
        check_transition(credential.status, CredentialStatus::Deleted)?;

        self.swap_status(credential, CredentialStatus::Deleted, reason).await?;
        self.emit_transition(
            AuditEventType::CredentialDeleted,
            AuditSeverity::Warning,
            credential,
            CredentialStatus::Deleted,
            reason,
            json!({}),
            correlation_id,
        );
        Ok(())
    }

    /// Write `to` only if the stored status still equals `credential.status`
    async fn swap_status(
        &self,
        credential: &Credential,
        to: CredentialStatus,
        reason: &str,
    ) -> CoreResult<()> {
        if self
            .store
            .set_status(credential.id, credential.status, to, Some(reason))
            .await?
        {
            return Ok(());
        }
        let current = self
            .store
            .get(credential.id)
            .await?
            .map_or(credential.status, |stored| stored.status);
        log::warn!(
            "Credential {} changed to {current} concurrently; refusing {} -> {to} (tenant_id={})",
            credential.id,
            credential.status,
            credential.tenant_id
        );
        Err(CoreError::InvalidStateTransition { from: current, to })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_transition(
        &self,
        event_type: AuditEventType,
        severity: AuditSeverity,
        credential: &Credential,
        to: CredentialStatus,
        reason: &str,
        details: serde_json::Value,
        correlation_id: &str,
    ) {
        self.audit.emit(
            AuditEvent::builder(event_type, &credential.tenant_id, correlation_id)
                .severity(severity)
                .user(&credential.owner_user_id)
                .credential(credential.id)
                .detail("previousStatus", credential.status.to_string())
                .detail("newStatus", to.to_string())
                .detail("reason", reason)
                .detail("details", details)
                .build(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::store::memory::InMemoryCredentialStore;
    use crate::testing::fixtures::sample_credential;

    struct Harness {
        store: Arc<InMemoryCredentialStore>,
        sink: Arc<InMemoryAuditSink>,
        audit: AuditEmitter,
        lifecycle: CredentialLifecycle,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryCredentialStore::new());
        let sink = Arc::new(InMemoryAuditSink::new());
        let audit = AuditEmitter::spawn(sink.clone(), 64);
        let lifecycle = CredentialLifecycle::new(store.clone(), audit.clone());
        Harness {
            store,
            sink,
            audit,
            lifecycle,
        }
    }

    fn usage(counter: u32) -> AuthenticationUsage {
        AuthenticationUsage {
            new_counter: counter,
            ip: Some("192.0.2.1".to_string()),
            user_agent: Some("test".to_string()),
            risk_score: 0.1,
        }
    }

    #[test]
    fn test_transition_table() {
        use CredentialStatus::{Active, Deleted, Suspended};
        assert!(check_transition(Active, Suspended).is_ok());
        assert!(check_transition(Suspended, Suspended).is_ok());
        assert!(check_transition(Suspended, Active).is_ok());
        assert!(check_transition(Active, Deleted).is_ok());
        assert!(check_transition(Suspended, Deleted).is_ok());
        assert!(check_transition(Deleted, Active).is_err());
        assert!(check_transition(Deleted, Suspended).is_err());
        assert!(check_transition(Deleted, Deleted).is_err());
        assert!(check_transition(Active, Active).is_err());
    }

    #[test]
    fn test_sign_count_rule() {
        assert!(check_sign_count(0, 0).is_ok());
        assert!(check_sign_count(0, 7).is_ok());
        assert!(check_sign_count(5, 6).is_ok());
        assert!(matches!(
            check_sign_count(5, 5),
            Err(CoreError::SignCountAnomaly {
                expected: 5,
                received: 5
            })
        ));
        assert!(check_sign_count(5, 3).is_err());
    }

    #[tokio::test]
    async fn test_counter_regression_suspends_and_audits() {
        let h = harness();
        let credential = h
            .lifecycle
            .create(sample_credential("t", "u", "c"), "corr")
            .await
            .unwrap();

        let credential = h
            .lifecycle
            .authenticate(&credential, usage(5), "corr-1")
            .await
            .unwrap();
        assert_eq!(credential.sign_count, 5);

        let err = h
            .lifecycle
            .authenticate(&credential, usage(3), "corr-2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::SignCountAnomaly {
                expected: 5,
                received: 3
            }
        ));

        let stored = h.store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Suspended);
        assert_eq!(stored.suspension_reason.as_deref(), Some(SIGN_COUNT_ANOMALY));
        assert_eq!(stored.sign_count, 5);

        h.audit.flush().await;
        let anomalies = h.sink.events_of_type(AuditEventType::SignCountAnomaly);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, AuditSeverity::Critical);
        assert_eq!(anomalies[0].details["expectedCounter"], 5);
        assert_eq!(anomalies[0].details["receivedCounter"], 3);
    }

    #[tokio::test]
    async fn test_counter_never_decreases_across_authentications() {
        let h = harness();
        let mut credential = h
            .lifecycle
            .create(sample_credential("t", "u", "c"), "corr")
            .await
            .unwrap();

        for counter in [1, 2, 10, 11] {
            credential = h
                .lifecycle
                .authenticate(&credential, usage(counter), "corr")
                .await
                .unwrap();
            let stored = h.store.get(credential.id).await.unwrap().unwrap();
            assert_eq!(stored.sign_count, counter);
        }
    }

    #[tokio::test]
    async fn test_stale_counter_loses_race() {
        let h = harness();
        let credential = h
            .lifecycle
            .create(sample_credential("t", "u", "c"), "corr")
            .await
            .unwrap();

        // Two authentications read the same stored counter
        let first = h.lifecycle.authenticate(&credential, usage(1), "a").await;
        let second = h.lifecycle.authenticate(&credential, usage(2), "b").await;
        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(CoreError::AuthenticationVerificationFailed)
        ));
    }

    #[tokio::test]
    async fn test_deleted_credential_cannot_be_revived_from_stale_copy() {
        let h = harness();
        let credential = h
            .lifecycle
            .create(sample_credential("t", "u", "c"), "corr")
            .await
            .unwrap();
        h.lifecycle
            .suspend(&credential, "lost device", json!({}), "corr")
            .await
            .unwrap();

        // Two admins read the suspended credential; one deletes it
        let stale = h.store.get(credential.id).await.unwrap().unwrap();
        let fresh = stale.clone();
        h.lifecycle.delete(&fresh, "user request", "corr").await.unwrap();

        assert!(matches!(
            h.lifecycle.reactivate(&stale, "found device", "corr").await,
            Err(CoreError::InvalidStateTransition {
                from: CredentialStatus::Deleted,
                to: CredentialStatus::Active
            })
        ));
        let stored = h.store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Deleted);

        h.audit.flush().await;
        assert!(h
            .sink
            .events_of_type(AuditEventType::CredentialReactivated)
            .is_empty());
    }

    #[tokio::test]
    async fn test_counter_regression_on_deleted_credential_does_not_suspend() {
        let h = harness();
        let credential = h
            .lifecycle
            .create(sample_credential("t", "u", "c"), "corr")
            .await
            .unwrap();
        let stale = h
            .lifecycle
            .authenticate(&credential, usage(5), "corr")
            .await
            .unwrap();
        h.lifecycle.delete(&stale, "user request", "corr").await.unwrap();

        assert!(matches!(
            h.lifecycle.authenticate(&stale, usage(3), "corr").await,
            Err(CoreError::CredentialNotFoundOrInactive)
        ));
        let stored = h.store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Deleted);
        assert!(stored.suspension_reason.is_none());

        h.audit.flush().await;
        assert!(h
            .sink
            .events_of_type(AuditEventType::SignCountAnomaly)
            .is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_suspend_is_a_no_op() {
        let h = harness();
        let credential = h
            .lifecycle
            .create(sample_credential("t", "u", "c"), "corr")
            .await
            .unwrap();
        h.lifecycle
            .suspend(&credential, "first", json!({}), "corr")
            .await
            .unwrap();
        // Second caller still holds the active copy
        h.lifecycle
            .suspend(&credential, "second", json!({}), "corr")
            .await
            .unwrap();

        let stored = h.store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(stored.suspension_reason.as_deref(), Some("first"));
        h.audit.flush().await;
        assert_eq!(
            h.sink
                .events_of_type(AuditEventType::CredentialSuspended)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_suspend_reactivate_delete() {
        let h = harness();
        let credential = h
            .lifecycle
            .create(sample_credential("t", "u", "c"), "corr")
            .await
            .unwrap();

        h.lifecycle
            .suspend(&credential, "lost device", json!({"ticket": 42}), "corr")
            .await
            .unwrap();
        let suspended = h.store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(suspended.status, CredentialStatus::Suspended);

        // Idempotent: no second event
        h.lifecycle
            .suspend(&suspended, "again", json!({}), "corr")
            .await
            .unwrap();

        // Suspended credentials cannot authenticate
        assert!(matches!(
            h.lifecycle.authenticate(&suspended, usage(1), "corr").await,
            Err(CoreError::CredentialNotFoundOrInactive)
        ));

        h.lifecycle
            .reactivate(&suspended, "found device", "corr")
            .await
            .unwrap();
        let active = h.store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(active.status, CredentialStatus::Active);
        assert!(active.suspension_reason.is_none());

        assert!(h
            .lifecycle
            .reactivate(&active, "not suspended", "corr")
            .await
            .is_err());

        h.lifecycle.delete(&active, "user request", "corr").await.unwrap();
        let deleted = h.store.get(credential.id).await.unwrap().unwrap();
        assert_eq!(deleted.status, CredentialStatus::Deleted);
        assert!(matches!(
            h.lifecycle.delete(&deleted, "again", "corr").await,
            Err(CoreError::InvalidStateTransition { .. })
        ));
        assert!(h
            .lifecycle
            .suspend(&deleted, "x", json!({}), "corr")
            .await
            .is_err());

        h.audit.flush().await;
        assert_eq!(
            h.sink
                .events_of_type(AuditEventType::CredentialSuspended)
                .len(),
            1
        );
        assert_eq!(
            h.sink
                .events_of_type(AuditEventType::CredentialReactivated)
                .len(),
            1
        );
        assert_eq!(
            h.sink.events_of_type(AuditEventType::CredentialDeleted).len(),
            1
        );
    }
}
