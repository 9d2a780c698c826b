//! `WebAuthn` implementation
//!
//! Decoding and verification of `WebAuthn` ceremonies: authenticator data,
//! COSE keys, attestation statements and their certificate chains, and client
//! data. Nothing here touches storage; the orchestrator drives these pieces.

pub mod attestation;
pub mod cbor;
pub mod chain;
pub mod client_data;
pub mod cose;
pub mod crypto;
mod errors;
mod settings;
pub mod statement;
pub mod tpm;
mod types;

// Re-exports for public use
pub use attestation::{AttestationContext, AttestationVerifier};
pub use cbor::{AttestationObject, AuthenticatorData, AuthenticatorFlags};
pub use chain::{CertificateChainValidator, NoRevocationCheck, RevocationChecker};
pub use cose::{CoseAlgorithm, CoseKey};
pub use errors::PipelineError;
pub use settings::RelyingPartySettings;
pub use statement::{AttestationFormat, AttestationStatement};
pub use types::*;
