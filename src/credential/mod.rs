//! Credentials and their security lifecycle

mod lifecycle;
mod model;

pub use lifecycle::{
    check_sign_count, check_transition, AuthenticationUsage, CredentialLifecycle,
    SIGN_COUNT_ANOMALY,
};
pub use model::{Credential, CredentialStatus, TrustLevel};
