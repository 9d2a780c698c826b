//! Core error taxonomy
//!
//! Every externally observable failure of the orchestrator is one of these
//! variants. Authentication failures collapse to a single public class so a
//! caller cannot tell a missing credential from a bad signature.

use thiserror::Error;

use crate::credential::CredentialStatus;
use crate::store::StoreError;
use crate::webauthn::PipelineError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("challenge not found")]
    ChallengeNotFound,

    #[error("challenge expired")]
    ChallengeExpired,

    #[error("registration verification failed: {0}")]
    RegistrationVerificationFailed(String),

    #[error("authentication verification failed")]
    AuthenticationVerificationFailed,

    #[error("credential not found or inactive")]
    CredentialNotFoundOrInactive,

    #[error("maximum of {limit} credentials per user exceeded")]
    MaxCredentialsExceeded { limit: usize },

    #[error("signature counter anomaly: expected more than {expected}, received {received}")]
    SignCountAnomaly { expected: u32, received: u32 },

    #[error("attestation verification failed")]
    AttestationVerificationFailed,

    #[error("invalid credential state transition from {from} to {to}")]
    InvalidStateTransition {
        from: CredentialStatus,
        to: CredentialStatus,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation failed: {context}")]
    Internal {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// What a caller is allowed to see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicErrorKind {
    /// Restart the flow with a fresh challenge
    ChallengeInvalid,
    /// Generic authentication failure
    VerificationFailed,
    RegistrationRejected,
    LimitExceeded,
    OperationFailed,
}

impl CoreError {
    /// Wrap an unexpected failure, keeping the cause
    pub fn internal(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        CoreError::Internal {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Client-facing classification
    #[must_use]
    pub fn public_kind(&self) -> PublicErrorKind {
        match self {
            CoreError::ChallengeNotFound | CoreError::ChallengeExpired => {
                PublicErrorKind::ChallengeInvalid
            }
            CoreError::AuthenticationVerificationFailed
            | CoreError::CredentialNotFoundOrInactive
            | CoreError::SignCountAnomaly { .. } => PublicErrorKind::VerificationFailed,
            CoreError::RegistrationVerificationFailed(_)
            | CoreError::AttestationVerificationFailed
            | CoreError::InvalidStateTransition { .. } => PublicErrorKind::RegistrationRejected,
            CoreError::MaxCredentialsExceeded { .. } => PublicErrorKind::LimitExceeded,
            CoreError::Configuration(_) | CoreError::Internal { .. } => {
                PublicErrorKind::OperationFailed
            }
        }
    }

    /// Stable machine-readable code for logs and audit details
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ChallengeNotFound => "CHALLENGE_NOT_FOUND",
            CoreError::ChallengeExpired => "CHALLENGE_EXPIRED",
            CoreError::RegistrationVerificationFailed(_) => "REGISTRATION_VERIFICATION_FAILED",
            CoreError::AuthenticationVerificationFailed => "AUTHENTICATION_VERIFICATION_FAILED",
            CoreError::CredentialNotFoundOrInactive => "CREDENTIAL_NOT_FOUND_OR_INACTIVE",
            CoreError::MaxCredentialsExceeded { .. } => "MAX_CREDENTIALS_EXCEEDED",
            CoreError::SignCountAnomaly { .. } => "SIGN_COUNT_ANOMALY",
            CoreError::AttestationVerificationFailed => "ATTESTATION_VERIFICATION_FAILED",
            CoreError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            CoreError::Configuration(_) => "CONFIGURATION_ERROR",
            CoreError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::internal("credential or challenge store", err)
    }
}

impl From<PipelineError> for CoreError {
    fn from(err: PipelineError) -> Self {
        CoreError::internal("webauthn pipeline", err)
    }
}

/// Result alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_authentication_failures_collapse() {
        let failures = [
            CoreError::AuthenticationVerificationFailed,
            CoreError::CredentialNotFoundOrInactive,
            CoreError::SignCountAnomaly {
                expected: 5,
                received: 3,
            },
        ];
        for failure in failures {
            assert_eq!(failure.public_kind(), PublicErrorKind::VerificationFailed);
        }
    }

    #[test]
    fn test_internal_keeps_source() {
        let err = CoreError::from(StoreError::Backend("connection reset".to_string()));
        assert_eq!(err.public_kind(), PublicErrorKind::OperationFailed);
        assert!(err.source().unwrap().to_string().contains("connection reset"));
    }

    #[test]
    fn test_messages() {
        let err = CoreError::MaxCredentialsExceeded { limit: 10 };
        assert_eq!(err.to_string(), "maximum of 10 credentials per user exceeded");
        assert_eq!(err.code(), "MAX_CREDENTIALS_EXCEEDED");

        let err = CoreError::InvalidStateTransition {
            from: CredentialStatus::Deleted,
            to: CredentialStatus::Active,
        };
        assert_eq!(
            err.to_string(),
            "invalid credential state transition from deleted to active"
        );
    }
}
