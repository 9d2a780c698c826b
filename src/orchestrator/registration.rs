//! Registration ceremony

use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;

use super::{PasskeyOrchestrator, RequestContext, UserIdentity};
use crate::audit::{AuditEvent, AuditEventType, AuditSeverity};
use crate::challenge::{Challenge, ChallengeContext, ChallengePurpose};
use crate::credential::{Credential, CredentialStatus, TrustLevel};
use crate::error::{CoreError, CoreResult};
use crate::risk::{AuthenticatorProfile, RiskOperation};
use crate::webauthn::client_data::{decode_client_data, verify_client_data, CEREMONY_CREATE};
use crate::webauthn::{
    crypto, AttestationContext, AttestationObject, AuthenticatorSelectionCriteria, CoseAlgorithm,
    CoseKey, PublicKeyCredentialDescriptor, PublicKeyCredentialParameters, RegistrationOptions,
    RegistrationResponse, RelyingParty, UserEntity, UserVerificationRequirement,
    PUBLIC_KEY_CREDENTIAL_TYPE,
};

const METRIC_REGISTRATION: &str = "passkey_registration";

fn rejected(reason: impl std::fmt::Display) -> CoreError {
    CoreError::RegistrationVerificationFailed(reason.to_string())
}

impl PasskeyOrchestrator {
    /// Issue a registration challenge and the options for the client
    ///
    /// # Errors
    /// `Internal` if the challenge cannot be generated or stored
    pub async fn start_registration(
        &self,
        user: &UserIdentity,
        context: &RequestContext,
    ) -> CoreResult<RegistrationOptions> {
        let result = self.registration_options(user, context).await;
        self.log_outcome("Registration start", context, result)
    }

    async fn registration_options(
        &self,
        user: &UserIdentity,
        context: &RequestContext,
    ) -> CoreResult<RegistrationOptions> {
        let policy = self.policies.resolve(context.region.as_deref()).await?;
        let existing = self
            .credentials
            .get_all_for_user(&context.tenant_id, &user.user_id)
            .await?;
        let exclude_credentials: Vec<PublicKeyCredentialDescriptor> = existing
            .iter()
            .filter(|c| c.status != CredentialStatus::Deleted)
            .map(|c| PublicKeyCredentialDescriptor {
                r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
                id: c.external_credential_id.clone(),
                transports: c.transports.iter().copied().collect(),
            })
            .collect();

        let challenge = Challenge::issue(
            ChallengePurpose::Registration,
            ChallengeContext {
                user_id: Some(user.user_id.clone()),
                tenant_id: context.tenant_id.clone(),
                region: context.region.clone(),
                credential_ids: exclude_credentials.iter().map(|d| d.id.clone()).collect(),
            },
            self.settings.challenge_ttl(),
        )?;
        self.challenges.put(&challenge).await?;

        let rp = &self.settings.relying_party;
        let user_verification = if policy.require_user_verification {
            UserVerificationRequirement::Required
        } else {
            rp.user_verification
        };

        log::debug!(
            "Issued registration challenge {} (correlation_id={}, tenant_id={})",
            challenge.nonce,
            context.correlation_id,
            context.tenant_id
        );

        Ok(RegistrationOptions {
            challenge: challenge.key,
            rp: RelyingParty {
                id: rp.rp_id.clone(),
                name: rp.rp_name.clone(),
            },
            user: UserEntity {
                id: crypto::base64url_encode(user.user_id.as_bytes()),
                name: user.name.clone(),
                display_name: user.display_name.clone(),
            },
            pub_key_cred_params: CoseAlgorithm::ALLOWED
                .iter()
                .map(|alg| PublicKeyCredentialParameters {
                    r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
                    alg: alg.identifier(),
                })
                .collect(),
            timeout: rp.timeout_millis(),
            exclude_credentials,
            attestation: rp.attestation,
            authenticator_selection: AuthenticatorSelectionCriteria {
                authenticator_attachment: rp.authenticator_attachment,
                require_resident_key: false,
                user_verification,
            },
        })
    }

    /// Verify a registration response and persist the new credential
    ///
    /// # Errors
    /// `ChallengeNotFound`/`ChallengeExpired` for an unusable challenge,
    /// `RegistrationVerificationFailed` for a response that does not check
    /// out, `MaxCredentialsExceeded` when the user is at the ceiling,
    /// `AttestationVerificationFailed` when required attestation is rejected
    pub async fn finish_registration(
        &self,
        response: &RegistrationResponse,
        context: &RequestContext,
    ) -> CoreResult<Credential> {
        let result = self.complete_registration(response, context).await;
        self.record_outcome(METRIC_REGISTRATION, result.as_ref().map(|_| ()));

        match &result {
            Ok(credential) => log::info!(
                "Registered credential {} for user {} at {} (correlation_id={}, tenant_id={})",
                credential.id,
                credential.owner_user_id,
                credential.trust_level,
                context.correlation_id,
                context.tenant_id
            ),
            Err(err) => {
                if matches!(err, CoreError::Internal { .. }) {
                    log::error!(
                        "Registration failed: {err} (correlation_id={}, tenant_id={})",
                        context.correlation_id,
                        context.tenant_id
                    );
                } else {
                    log::warn!(
                        "Registration rejected: {err} (correlation_id={}, tenant_id={})",
                        context.correlation_id,
                        context.tenant_id
                    );
                }
                self.audit.emit(
                    AuditEvent::builder(
                        AuditEventType::RegistrationFailed,
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

    async fn complete_registration(
        &self,
        response: &RegistrationResponse,
        context: &RequestContext,
    ) -> CoreResult<Credential> {
        let (client_data_raw, client_data) =
            decode_client_data(&response.response.client_data_json).map_err(rejected)?;

        let challenge = self
            .consume_challenge(&client_data.challenge, ChallengePurpose::Registration, context)
            .await?;
        let user_id = challenge
            .context
            .user_id
            .clone()
            .ok_or_else(|| rejected("challenge is not bound to a user"))?;
        self.record_attempt(context, &user_id).await;

        verify_client_data(
            &client_data,
            CEREMONY_CREATE,
            &challenge.key,
            &self.settings.relying_party.allowed_origins,
        )
        .map_err(rejected)?;

        let attestation_bytes =
            crypto::base64url_decode(&response.response.attestation_object).map_err(rejected)?;
        let attestation = AttestationObject::decode(&attestation_bytes).map_err(rejected)?;
        let auth_data = &attestation.auth_data;

        let region = challenge.context.region.as_deref().or(context.region.as_deref());
        let policy = self.policies.resolve(region).await?;
        self.check_authenticator_data(auth_data, policy)
            .map_err(rejected)?;

        let attested = auth_data
            .attested_credential_data
            .as_ref()
            .ok_or_else(|| rejected("no attested credential data"))?;
        if crypto::base64url_decode(&response.raw_id).ok().as_deref()
            != Some(attested.credential_id.as_slice())
        {
            return Err(rejected("rawId does not match the attested credential"));
        }
        let key = CoseKey::parse(&attested.credential_public_key).map_err(rejected)?;
        if key.algorithm().is_none() {
            return Err(rejected("credential key algorithm is not allowed"));
        }
        key.to_public_key().map_err(rejected)?;

        let limit = self.settings.registration.max_credentials_per_user;
        let active = self
            .credentials
            .count_active_for_user(&context.tenant_id, &user_id)
            .await?;
        if active >= limit {
            return Err(CoreError::MaxCredentialsExceeded { limit });
        }

        let model_id = attested.model_id();
        if policy.require_attestation {
            let attestation_context = AttestationContext {
                client_data_json: &client_data_raw,
                now: Utc::now(),
            };
            let verified = self
                .verifier
                .verify_attestation(&attestation_bytes, &model_id, &attestation_context)
                .await
                .map_err(|e| CoreError::internal("attestation verification", e))?;
            if !verified {
                return Err(CoreError::AttestationVerificationFailed);
            }
        }

        let external_credential_id = crypto::base64url_encode(&attested.credential_id);
        if challenge.context.credential_ids.contains(&external_credential_id)
            || self
                .credentials
                .get_by_external_id(&context.tenant_id, &external_credential_id)
                .await?
                .is_some()
        {
            return Err(rejected("credential already registered"));
        }

        let flags = auth_data.flags;
        let assessment = self
            .risk
            .assess(Self::risk_context(
                context,
                &user_id,
                RiskOperation::Registration,
                AuthenticatorProfile {
                    model_id: Some(model_id.clone()),
                    user_verified: flags.user_verified(),
                    backup_eligible: flags.backup_eligible(),
                    last_used_at: None,
                },
            ))
            .await;

        let transports: BTreeSet<_> = response.response.transports.iter().copied().collect();
        let trust_level = TrustLevel::classify(
            response.authenticator_attachment,
            &transports,
            flags.user_verified(),
        );

        let credential = Credential {
            id: Uuid::new_v4(),
            owner_user_id: user_id,
            tenant_id: context.tenant_id.clone(),
            external_credential_id,
            public_key: attested.credential_public_key.clone(),
            sign_count: auth_data.sign_count,
            authenticator_model_id: model_id,
            attestation_format: attestation.format_tag.clone(),
            user_verified: flags.user_verified(),
            backup_eligible: flags.backup_eligible(),
            backup_state: flags.backup_state(),
            transports,
            authenticator_attachment: response.authenticator_attachment,
            status: CredentialStatus::Active,
            trust_level,
            risk_score_at_registration: assessment.score,
            last_risk_score: None,
            created_at: Utc::now(),
            last_used_at: None,
            last_ip: context.ip.clone(),
            last_user_agent: context.user_agent.clone(),
            suspension_reason: None,
        };

        let owner = credential.owner_user_id.clone();
        let created = self
            .lifecycle
            .create(credential, &context.correlation_id)
            .await?;
        self.record_success(context, &owner).await;
        Ok(created)
    }
}
