//! Testing utilities for passkey-core
//!
//! Helpers that build real cryptographic evidence instead of mocking the
//! verifier, so tests exercise the same code paths production traffic does.
//!
//! ## Organization
//!
//! - [`fixtures`] - Settings, sample credentials and an orchestrator harness
//! - [`builders`] - Attestation objects, TPM structures and SafetyNet tokens
//! - [`certificates`] - Throwaway certificate authorities
//! - [`authenticator`] - A software authenticator driving full ceremonies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use passkey_core::testing::authenticator::SoftAuthenticator;
//! use passkey_core::testing::fixtures::{user, TestHarness, ORIGIN, TENANT};
//!
//! let harness = TestHarness::new();
//! let orchestrator = harness.orchestrator();
//! let context = RequestContext::new(TENANT);
//! let options = orchestrator.start_registration(&user("alice"), &context).await?;
//! let response = SoftAuthenticator::new()?.register(&options, ORIGIN)?;
//! let credential = orchestrator.finish_registration(&response, &context).await?;
//! ```

pub mod authenticator;
pub mod builders;
pub mod certificates;
pub mod fixtures;

pub use authenticator::SoftAuthenticator;
pub use builders::AttestationObjectBuilder;
pub use certificates::{LeafOptions, TestCertificateAuthority};
pub use fixtures::TestHarness;
