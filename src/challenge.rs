//! Single-use challenges
//!
//! A challenge binds one registration or authentication ceremony to the
//! context it was issued in. It is consumed exactly once.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::webauthn::{crypto, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePurpose {
    Registration,
    Authentication,
}

impl fmt::Display for ChallengePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengePurpose::Registration => write!(f, "registration"),
            ChallengePurpose::Authentication => write!(f, "authentication"),
        }
    }
}

/// Context captured when the challenge was issued
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeContext {
    /// Absent for usernameless authentication
    pub user_id: Option<String>,
    pub tenant_id: String,
    pub region: Option<String>,
    /// Registration: credential IDs the client was told to exclude.
    /// Authentication: credential IDs the client was allowed to use.
    pub credential_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Base64url challenge, also the storage key
    pub key: String,
    /// Random nonce identifying this issuance in logs
    pub nonce: String,
    pub purpose: ChallengePurpose,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub context: ChallengeContext,
}

impl Challenge {
    /// Issue a fresh challenge
    ///
    /// # Errors
    /// Returns an error if the system random source fails
    pub fn issue(
        purpose: ChallengePurpose,
        context: ChallengeContext,
        ttl: Duration,
    ) -> Result<Self, PipelineError> {
        let issued_at = Utc::now();
        Ok(Self {
            key: crypto::generate_challenge()?,
            nonce: uuid::Uuid::new_v4().to_string(),
            purpose,
            issued_at,
            expires_at: issued_at + ttl,
            context,
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
