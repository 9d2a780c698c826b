//! `WebAuthn` core types
//!
//! This module defines the client-facing `WebAuthn` data structures: the
//! options handed to the browser and the already-decoded responses it sends
//! back. Binary fields travel as base64url strings.

use serde::{Deserialize, Serialize};

/// Credential type string used throughout `WebAuthn`
pub const PUBLIC_KEY_CREDENTIAL_TYPE: &str = "public-key";

/// User verification requirement
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserVerificationRequirement {
    Required,
    #[default]
    Preferred,
    Discouraged,
}

/// Authenticator attachment modality
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthenticatorAttachment {
    Platform,
    CrossPlatform,
}

/// Attestation conveyance preference
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttestationConveyance {
    #[default]
    None,
    Indirect,
    Direct,
    Enterprise,
}

/// Transport hints reported by authenticators
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticatorTransport {
    Usb,
    Nfc,
    Ble,
    Internal,
    Hybrid,
}

impl AuthenticatorTransport {
    /// Roaming hardware transports (security keys)
    #[must_use]
    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            AuthenticatorTransport::Usb | AuthenticatorTransport::Nfc | AuthenticatorTransport::Ble
        )
    }
}

/// `WebAuthn` registration options sent to the client
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOptions {
    pub challenge: String,
    pub rp: RelyingParty,
    pub user: UserEntity,
    pub pub_key_cred_params: Vec<PublicKeyCredentialParameters>,
    /// Timeout in milliseconds
    pub timeout: u32,
    pub exclude_credentials: Vec<PublicKeyCredentialDescriptor>,
    pub attestation: AttestationConveyance,
    pub authenticator_selection: AuthenticatorSelectionCriteria,
}

/// `WebAuthn` authentication options sent to the client
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationOptions {
    pub challenge: String,
    /// Timeout in milliseconds
    pub timeout: u32,
    pub rp_id: String,
    /// Empty for usernameless (discoverable credential) flows
    pub allow_credentials: Vec<PublicKeyCredentialDescriptor>,
    pub user_verification: UserVerificationRequirement,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelyingParty {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    /// Base64url user handle
    pub id: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialParameters {
    #[serde(rename = "type")]
    pub r#type: String,
    pub alg: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorSelectionCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    pub require_resident_key: bool,
    pub user_verification: UserVerificationRequirement,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyCredentialDescriptor {
    #[serde(rename = "type")]
    pub r#type: String,
    /// Base64url credential ID
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transports: Vec<AuthenticatorTransport>,
}

/// Registration response from client
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: String,
    pub raw_id: String,
    pub response: AuthenticatorAttestationResponse,
    #[serde(default)]
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    #[serde(default)]
    pub client_extension_results: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub r#type: String,
}

/// Authentication response from client
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResponse {
    pub id: String,
    pub raw_id: String,
    pub response: AuthenticatorAssertionResponse,
    #[serde(default)]
    pub authenticator_attachment: Option<AuthenticatorAttachment>,
    #[serde(default)]
    pub client_extension_results: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub r#type: String,
}

/// Authenticator attestation response during registration
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAttestationResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub attestation_object: String,
    #[serde(default)]
    pub transports: Vec<AuthenticatorTransport>,
}

/// Authenticator assertion response during authentication
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorAssertionResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub authenticator_data: String,
    pub signature: String,
    #[serde(default)]
    pub user_handle: Option<String>,
}

/// Client data collected by the browser
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollectedClientData {
    #[serde(rename = "type")]
    pub r#type: String,
    pub challenge: String,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_origin: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_response_wire_names() {
        let json = serde_json::json!({
            "id": "abc",
            "rawId": "abc",
            "type": "public-key",
            "authenticatorAttachment": "cross-platform",
            "response": {
                "clientDataJSON": "e30",
                "attestationObject": "oA",
                "transports": ["usb", "nfc"]
            }
        });
        let response: RegistrationResponse = serde_json::from_value(json).unwrap();
        assert_eq!(
            response.authenticator_attachment,
            Some(AuthenticatorAttachment::CrossPlatform)
        );
        assert_eq!(
            response.response.transports,
            vec![AuthenticatorTransport::Usb, AuthenticatorTransport::Nfc]
        );
    }

    #[test]
    fn test_options_serialize_camel_case() {
        let options = AuthenticationOptions {
            challenge: "c".to_string(),
            timeout: 60_000,
            rp_id: "example.com".to_string(),
            allow_credentials: vec![],
            user_verification: UserVerificationRequirement::Required,
        };
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["rpId"], "example.com");
        assert_eq!(value["userVerification"], "required");
        assert!(value["allowCredentials"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_hardware_transports() {
        assert!(AuthenticatorTransport::Usb.is_hardware());
        assert!(AuthenticatorTransport::Ble.is_hardware());
        assert!(!AuthenticatorTransport::Internal.is_hardware());
        assert!(!AuthenticatorTransport::Hybrid.is_hardware());
    }
}
