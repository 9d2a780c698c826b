use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::webauthn::{AuthenticatorAttachment, AuthenticatorTransport};

/// Lifecycle status of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Suspended,
    /// Terminal; credentials are never physically removed
    Deleted,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialStatus::Active => write!(f, "active"),
            CredentialStatus::Suspended => write!(f, "suspended"),
            CredentialStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Authentication assurance level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    #[serde(rename = "AAL1")]
    Aal1,
    #[serde(rename = "AAL2")]
    Aal2,
    #[serde(rename = "AAL3")]
    Aal3,
}

impl TrustLevel {
    /// Classify an authenticator
    ///
    /// A roaming hardware authenticator with user verification is AAL3. User
    /// verification alone, or a platform-bound authenticator, is AAL2.
    /// Everything else is AAL1.
    #[must_use]
    pub fn classify(
        attachment: Option<AuthenticatorAttachment>,
        transports: &BTreeSet<AuthenticatorTransport>,
        user_verified: bool,
    ) -> Self {
        let hardware = attachment == Some(AuthenticatorAttachment::CrossPlatform)
            || transports.iter().any(|t| t.is_hardware());
        let platform = attachment == Some(AuthenticatorAttachment::Platform)
            || transports.contains(&AuthenticatorTransport::Internal);

        if hardware && user_verified {
            TrustLevel::Aal3
        } else if user_verified || platform {
            TrustLevel::Aal2
        } else {
            TrustLevel::Aal1
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustLevel::Aal1 => write!(f, "AAL1"),
            TrustLevel::Aal2 => write!(f, "AAL2"),
            TrustLevel::Aal3 => write!(f, "AAL3"),
        }
    }
}

/// A registered public-key credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: Uuid,
    pub owner_user_id: String,
    pub tenant_id: String,
    /// Base64url credential ID as presented by the authenticator; unique per tenant
    pub external_credential_id: String,
    /// COSE encoded public key
    pub public_key: Vec<u8>,
    pub sign_count: u32,
    /// AAGUID of the authenticator model
    pub authenticator_model_id: String,
    pub attestation_format: String,
    pub user_verified: bool,
    pub backup_eligible: bool,
    pub backup_state: bool,
    pub transports: BTreeSet<AuthenticatorTransport>,
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    pub status: CredentialStatus,
    pub trust_level: TrustLevel,
    pub risk_score_at_registration: f64,
    pub last_risk_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_ip: Option<String>,
    pub last_user_agent: Option<String>,
    pub suspension_reason: Option<String>,
}

impl Credential {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }
}
