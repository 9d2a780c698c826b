//! Authentication ceremony

use super::{AuthenticationOutcome, PasskeyOrchestrator, RequestContext};
use crate::audit::{AuditEvent, AuditEventType, AuditSeverity};
use crate::challenge::{Challenge, ChallengeContext, ChallengePurpose};
use crate::credential::{AuthenticationUsage, Credential, CredentialStatus, TrustLevel};
use crate::error::{CoreError, CoreResult};
use crate::risk::{AuthenticatorProfile, RiskOperation};
use crate::webauthn::client_data::{decode_client_data, verify_client_data, CEREMONY_GET};
use crate::webauthn::{
    crypto, AuthenticationOptions, AuthenticationResponse, AuthenticatorData, CoseKey,
    PublicKeyCredentialDescriptor, UserVerificationRequirement, PUBLIC_KEY_CREDENTIAL_TYPE,
};

const METRIC_AUTHENTICATION: &str = "passkey_authentication";

impl PasskeyOrchestrator {
    /// Issue an authentication challenge
    ///
    /// With a user ID the client is restricted to that user's active
    /// credentials; without one the flow is usernameless and any discoverable
    /// credential of the tenant may answer.
    ///
    /// # Errors
    /// `Internal` if the challenge cannot be generated or stored
    pub async fn start_authentication(
        &self,
        user_id: Option<&str>,
        context: &RequestContext,
    ) -> CoreResult<AuthenticationOptions> {
        let result = self.authentication_options(user_id, context).await;
        self.log_outcome("Authentication start", context, result)
    }

    async fn authentication_options(
        &self,
        user_id: Option<&str>,
        context: &RequestContext,
    ) -> CoreResult<AuthenticationOptions> {
        let policy = self.policies.resolve(context.region.as_deref()).await?;

        let allow_credentials: Vec<PublicKeyCredentialDescriptor> = match user_id {
            Some(user_id) => self
                .credentials
                .get_all_for_user(&context.tenant_id, user_id)
                .await?
                .into_iter()
                .filter(Credential::is_active)
                .map(|c| PublicKeyCredentialDescriptor {
                    r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
                    id: c.external_credential_id,
                    transports: c.transports.into_iter().collect(),
                })
                .collect(),
            None => Vec::new(),
        };

        let challenge = Challenge::issue(
            ChallengePurpose::Authentication,
            ChallengeContext {
                user_id: user_id.map(str::to_string),
                tenant_id: context.tenant_id.clone(),
                region: context.region.clone(),
                credential_ids: allow_credentials.iter().map(|d| d.id.clone()).collect(),
            },
            self.settings.challenge_ttl(),
        )?;
        self.challenges.put(&challenge).await?;

        let rp = &self.settings.relying_party;
        log::debug!(
            "Issued authentication challenge {} for {} credential(s) (correlation_id={}, tenant_id={})",
            challenge.nonce,
            allow_credentials.len(),
            context.correlation_id,
            context.tenant_id
        );

        Ok(AuthenticationOptions {
            challenge: challenge.key,
            timeout: rp.timeout_millis(),
            rp_id: rp.rp_id.clone(),
            allow_credentials,
            user_verification: if policy.require_user_verification {
                UserVerificationRequirement::Required
            } else {
                rp.user_verification
            },
        })
    }

    /// Verify an assertion and update the credential
    ///
    /// `credential_id` is the base64url external ID when the caller already
    /// knows it; otherwise the response's `rawId` is used.
    ///
    /// # Errors
    /// `ChallengeNotFound`/`ChallengeExpired` for an unusable challenge,
    /// `CredentialNotFoundOrInactive`, `AuthenticationVerificationFailed`,
    /// or `SignCountAnomaly` when the counter went backwards
    pub async fn finish_authentication(
        &self,
        response: &AuthenticationResponse,
        credential_id: Option<&str>,
        context: &RequestContext,
    ) -> CoreResult<AuthenticationOutcome> {
        let result = self
            .complete_authentication(response, credential_id, context)
            .await;
        self.record_outcome(METRIC_AUTHENTICATION, result.as_ref().map(|_| ()));

        match &result {
            Ok(outcome) => {
                log::info!(
                    "Authenticated user {} with credential {} at {} (risk {:.2}, correlation_id={}, tenant_id={})",
                    outcome.user_id,
                    outcome.credential_id,
                    outcome.trust_level,
                    outcome.risk_score,
                    context.correlation_id,
                    context.tenant_id
                );
                self.audit.emit(
                    AuditEvent::builder(
                        AuditEventType::AuthenticationSucceeded,
                        &context.tenant_id,
                        &context.correlation_id,
                    )
                    .severity(if outcome.high_risk {
                        AuditSeverity::High
                    } else {
                        AuditSeverity::Info
                    })
                    .user(&outcome.user_id)
                    .credential(outcome.credential_id)
                    .detail("trustLevel", outcome.trust_level.to_string())
                    .detail("riskScore", outcome.risk_score)
                    .detail("highRisk", outcome.high_risk)
                    .build(),
                );
            }
            // The lifecycle already raised a critical event for this one
            Err(CoreError::SignCountAnomaly { .. }) => {}
            Err(err) => {
                if matches!(err, CoreError::Internal { .. }) {
                    log::error!(
                        "Authentication failed: {err} (correlation_id={}, tenant_id={})",
                        context.correlation_id,
                        context.tenant_id
                    );
                } else {
                    log::warn!(
                        "Authentication rejected: {err} (correlation_id={}, tenant_id={})",
                        context.correlation_id,
                        context.tenant_id
                    );
                }
                self.audit.emit(
                    AuditEvent::builder(
                        AuditEventType::AuthenticationFailed,
                        &context.tenant_id,
                        &context.correlation_id,
                    )
                    .severity(AuditSeverity::Warning)
                    .detail("reason", err.code())
                    .build(),
                );
            }
        }
        result
    }

    async fn complete_authentication(
        &self,
        response: &AuthenticationResponse,
        credential_id: Option<&str>,
        context: &RequestContext,
    ) -> CoreResult<AuthenticationOutcome> {
        let (client_data_raw, client_data) =
            decode_client_data(&response.response.client_data_json)
                .map_err(|_| CoreError::AuthenticationVerificationFailed)?;

        let challenge = self
            .consume_challenge(&client_data.challenge, ChallengePurpose::Authentication, context)
            .await?;

        let external_id = credential_id.unwrap_or(&response.raw_id);
        let credential = self
            .credentials
            .get_by_external_id(&context.tenant_id, external_id)
            .await?
            .filter(|c| c.status == CredentialStatus::Active)
            .ok_or(CoreError::CredentialNotFoundOrInactive)?;
        self.record_attempt(context, &credential.owner_user_id).await;

        if let Some(expected_user) = &challenge.context.user_id {
            if *expected_user != credential.owner_user_id {
                return Err(CoreError::AuthenticationVerificationFailed);
            }
        }
        if !challenge.context.credential_ids.is_empty()
            && !challenge
                .context
                .credential_ids
                .contains(&credential.external_credential_id)
        {
            return Err(CoreError::AuthenticationVerificationFailed);
        }

        verify_client_data(
            &client_data,
            CEREMONY_GET,
            &challenge.key,
            &self.settings.relying_party.allowed_origins,
        )
        .map_err(|mismatch| {
            log::debug!(
                "Client data rejected: {mismatch} (correlation_id={})",
                context.correlation_id
            );
            CoreError::AuthenticationVerificationFailed
        })?;

        let auth_data_raw = crypto::base64url_decode(&response.response.authenticator_data)
            .map_err(|_| CoreError::AuthenticationVerificationFailed)?;
        let auth_data = AuthenticatorData::parse(&auth_data_raw)
            .map_err(|_| CoreError::AuthenticationVerificationFailed)?;

        let region = challenge.context.region.as_deref().or(context.region.as_deref());
        let policy = self.policies.resolve(region).await?;
        self.check_authenticator_data(&auth_data, policy)
            .map_err(|reason| {
                log::debug!(
                    "Authenticator data rejected: {reason} (correlation_id={})",
                    context.correlation_id
                );
                CoreError::AuthenticationVerificationFailed
            })?;

        if let Some(handle) = &response.response.user_handle {
            let handle = crypto::base64url_decode(handle)
                .map_err(|_| CoreError::AuthenticationVerificationFailed)?;
            if handle != credential.owner_user_id.as_bytes() {
                return Err(CoreError::AuthenticationVerificationFailed);
            }
        }

        self.verify_assertion_signature(&credential, &auth_data, &client_data_raw, response)?;

        let assessment = self
            .risk
            .assess(Self::risk_context(
                context,
                &credential.owner_user_id,
                RiskOperation::Authentication,
                AuthenticatorProfile {
                    model_id: Some(credential.authenticator_model_id.clone()),
                    user_verified: auth_data.flags.user_verified(),
                    backup_eligible: auth_data.flags.backup_eligible(),
                    last_used_at: credential.last_used_at,
                },
            ))
            .await;

        let updated = self
            .lifecycle
            .authenticate(
                &credential,
                AuthenticationUsage {
                    new_counter: auth_data.sign_count,
                    ip: context.ip.clone(),
                    user_agent: context.user_agent.clone(),
                    risk_score: assessment.score,
                },
                &context.correlation_id,
            )
            .await?;

        let trust_level = TrustLevel::classify(
            updated.authenticator_attachment,
            &updated.transports,
            auth_data.flags.user_verified(),
        );
        self.record_success(context, &updated.owner_user_id).await;

        Ok(AuthenticationOutcome {
            user_id: updated.owner_user_id,
            tenant_id: updated.tenant_id,
            credential_id: updated.id,
            trust_level,
            risk_score: assessment.score,
            high_risk: self.risk.is_high_risk(&assessment),
        })
    }

    /// Check the assertion signature over `authData || SHA-256(clientDataJSON)`
    fn verify_assertion_signature(
        &self,
        credential: &Credential,
        auth_data: &AuthenticatorData,
        client_data_raw: &[u8],
        response: &AuthenticationResponse,
    ) -> CoreResult<()> {
        let key = CoseKey::parse(&credential.public_key)
            .map_err(|e| CoreError::internal("stored credential key", e))?;
        let algorithm = key
            .algorithm()
            .ok_or(CoreError::AuthenticationVerificationFailed)?;
        let public_key = key
            .to_public_key()
            .map_err(|e| CoreError::internal("stored credential key", e))?;
        let signature = crypto::base64url_decode(&response.response.signature)
            .map_err(|_| CoreError::AuthenticationVerificationFailed)?;

        let mut signed = auth_data.as_bytes().to_vec();
        signed.extend_from_slice(&crypto::sha256(client_data_raw));

        match crypto::verify_signature(&public_key, algorithm, &signed, &signature) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::AuthenticationVerificationFailed),
            Err(err) => {
                log::debug!(
                    "Signature check errored for credential {}: {err}",
                    credential.id
                );
                Err(CoreError::AuthenticationVerificationFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::authenticator::SoftAuthenticator;
    use crate::testing::fixtures::{user, TestHarness, ORIGIN, TENANT};

    #[tokio::test]
    async fn test_allow_list_lists_active_credentials() {
        let harness = TestHarness::new();
        let orchestrator = harness.orchestrator();
        let context = RequestContext::new(TENANT);
        let authenticator = SoftAuthenticator::new().unwrap();

        let options = orchestrator.start_registration(&user("carol"), &context).await.unwrap();
        let response = authenticator.register(&options, ORIGIN).unwrap();
        let credential = orchestrator.finish_registration(&response, &context).await.unwrap();

        let options = orchestrator
            .start_authentication(Some("carol"), &context)
            .await
            .unwrap();
        assert_eq!(options.allow_credentials.len(), 1);

        orchestrator
            .suspend_credential(credential.id, "lost", &context)
            .await
            .unwrap();
        let options = orchestrator
            .start_authentication(Some("carol"), &context)
            .await
            .unwrap();
        assert!(options.allow_credentials.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let harness = TestHarness::new();
        let orchestrator = harness.orchestrator();
        let context = RequestContext::new(TENANT);
        let mut authenticator = SoftAuthenticator::new().unwrap();

        let options = orchestrator.start_registration(&user("dave"), &context).await.unwrap();
        let response = authenticator.register(&options, ORIGIN).unwrap();
        orchestrator.finish_registration(&response, &context).await.unwrap();

        let options = orchestrator
            .start_authentication(Some("dave"), &context)
            .await
            .unwrap();
        let mut assertion = authenticator.assert(&options, ORIGIN, "dave").unwrap();
        let mut signature = crypto::base64url_decode(&assertion.response.signature).unwrap();
        let last = signature.len() - 1;
        signature[last] ^= 0x01;
        assertion.response.signature = crypto::base64url_encode(&signature);

        assert!(matches!(
            orchestrator.finish_authentication(&assertion, None, &context).await,
            Err(CoreError::AuthenticationVerificationFailed)
        ));
    }
}
