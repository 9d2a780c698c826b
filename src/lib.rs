#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

//! Passwordless authentication core
//!
//! Verifies `WebAuthn` attestation, scores the risk of each ceremony, tracks
//! credentials through their lifecycle and orchestrates single-use
//! challenges. Storage, metadata, audit and metrics are collaborators behind
//! traits; in-memory implementations are provided.

/// Version of the passkey-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod audit;
pub mod challenge;
pub mod credential;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod risk;
pub mod settings;
pub mod store;
pub mod webauthn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use credential::{Credential, CredentialStatus, TrustLevel};
pub use error::{CoreError, CoreResult, PublicErrorKind};
pub use orchestrator::{
    AuthenticationOutcome, Collaborators, PasskeyOrchestrator, RequestContext, UserIdentity,
};
pub use risk::{RiskAssessment, RiskEngine};
pub use settings::CoreSettings;
pub use webauthn::{AttestationVerifier, PipelineError};
