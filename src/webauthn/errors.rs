//! Attestation pipeline error types
//!
//! A single typed error for everything that can go wrong *inside* the
//! verification pipeline. A verifier that simply rejects its input returns
//! `Ok(false)`; a `PipelineError` means the pipeline itself could not reach a
//! decision.

use std::fmt;

/// Errors raised while decoding or verifying `WebAuthn` data
#[derive(Debug)]
pub enum PipelineError {
    /// Malformed envelope, base64, CBOR or JSON
    EncodingError(String),

    /// Attestation statement is missing a required field or has the wrong shape
    StatementError(String),

    /// Certificate could not be parsed
    CertificateError(String),

    /// Public key material could not be interpreted
    KeyError(String),

    /// The cryptographic backend failed
    CryptoError(String),

    /// Authenticator metadata lookup failed
    MetadataError(String),
}

impl PipelineError {
    /// Whether this error was caused by the untrusted input rather than by the
    /// pipeline. Input errors are rejected (fail closed), the rest propagate.
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::EncodingError(_)
                | PipelineError::StatementError(_)
                | PipelineError::CertificateError(_)
                | PipelineError::KeyError(_)
        )
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::EncodingError(msg) => write!(f, "Encoding error: {msg}"),
            PipelineError::StatementError(msg) => write!(f, "Attestation statement error: {msg}"),
            PipelineError::CertificateError(msg) => write!(f, "Certificate error: {msg}"),
            PipelineError::KeyError(msg) => write!(f, "Key error: {msg}"),
            PipelineError::CryptoError(msg) => write!(f, "Crypto backend error: {msg}"),
            PipelineError::MetadataError(msg) => write!(f, "Metadata lookup error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<openssl::error::ErrorStack> for PipelineError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        PipelineError::CryptoError(err.to_string())
    }
}

impl From<base64::DecodeError> for PipelineError {
    fn from(err: base64::DecodeError) -> Self {
        PipelineError::EncodingError(format!("Invalid base64: {err}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::EncodingError(format!("Invalid JSON: {err}"))
    }
}
