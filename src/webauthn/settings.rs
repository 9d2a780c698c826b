//! Relying party settings
//!
//! Settings for `WebAuthn` ceremonies that are independent of tenant or
//! regional policy.

use serde::{Deserialize, Serialize};

use super::types::{AttestationConveyance, AuthenticatorAttachment, UserVerificationRequirement};

/// Relying party settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelyingPartySettings {
    /// Relying Party ID (usually the domain)
    pub rp_id: String,
    /// Relying Party name (displayed to user)
    pub rp_name: String,
    /// Origins accepted in client data (e.g., <https://example.com>)
    pub allowed_origins: Vec<String>,
    /// Ceremony timeout advertised to the client
    pub timeout_seconds: u64,
    pub user_verification: UserVerificationRequirement,
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    pub attestation: AttestationConveyance,
}

impl Default for RelyingPartySettings {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            rp_name: "Passkey Core".to_string(),
            allowed_origins: vec!["https://localhost".to_string()],
            timeout_seconds: 60,
            user_verification: UserVerificationRequirement::Preferred,
            authenticator_attachment: None,
            attestation: AttestationConveyance::Direct,
        }
    }
}

impl RelyingPartySettings {
    /// Timeout in milliseconds as sent to the client
    #[must_use]
    pub fn timeout_millis(&self) -> u32 {
        u32::try_from(self.timeout_seconds.saturating_mul(1000)).unwrap_or(u32::MAX)
    }

    /// Check that the relying party can be served safely
    ///
    /// # Errors
    /// Returns a message describing the first problem found
    pub fn validate(&self) -> Result<(), String> {
        if self.rp_id.trim().is_empty() {
            return Err("rp_id must not be empty".to_string());
        }
        if self.allowed_origins.is_empty() {
            return Err("at least one allowed origin is required".to_string());
        }
        for origin in &self.allowed_origins {
            let parsed = url::Url::parse(origin)
                .map_err(|e| format!("invalid origin '{origin}': {e}"))?;
            let is_local = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1"));
            if parsed.scheme() != "https" && !is_local {
                return Err(format!("origin '{origin}' must use https"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert!(RelyingPartySettings::default().validate().is_ok());
        assert_eq!(RelyingPartySettings::default().timeout_millis(), 60_000);
    }

    #[test]
    fn test_plain_http_rejected_except_localhost() {
        let mut settings = RelyingPartySettings {
            allowed_origins: vec!["http://example.com".to_string()],
            ..RelyingPartySettings::default()
        };
        assert!(settings.validate().is_err());

        settings.allowed_origins = vec!["http://localhost:8080".to_string()];
        assert!(settings.validate().is_ok());

        settings.rp_id = "  ".to_string();
        assert!(settings.validate().is_err());
    }
}
