//! Client data verification
//!
//! Checks the `clientDataJSON` the browser signed over: ceremony type,
//! challenge and origin.

use url::Url;

use super::crypto;
use super::errors::PipelineError;
use super::types::CollectedClientData;

pub const CEREMONY_CREATE: &str = "webauthn.create";
pub const CEREMONY_GET: &str = "webauthn.get";

/// Why client data was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientDataMismatch {
    Type,
    Challenge,
    Origin,
}

impl std::fmt::Display for ClientDataMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientDataMismatch::Type => write!(f, "ceremony type mismatch"),
            ClientDataMismatch::Challenge => write!(f, "challenge mismatch"),
            ClientDataMismatch::Origin => write!(f, "origin not allowed"),
        }
    }
}

/// Decode base64url `clientDataJSON` into raw bytes and the parsed structure
///
/// The raw bytes are what gets hashed into the signed data.
///
/// # Errors
/// Returns an `EncodingError` if the data is not base64url JSON
pub fn decode_client_data(
    client_data_json_b64: &str,
) -> Result<(Vec<u8>, CollectedClientData), PipelineError> {
    let raw = crypto::base64url_decode(client_data_json_b64)?;
    let parsed: CollectedClientData = serde_json::from_slice(&raw)?;
    Ok((raw, parsed))
}

/// Verify type, challenge and origin
///
/// # Arguments
/// * `client_data` - Parsed client data
/// * `expected_type` - `webauthn.create` or `webauthn.get`
/// * `expected_challenge` - The base64url challenge that was issued
/// * `allowed_origins` - Origin allow-list
///
/// # Errors
/// Returns the first mismatch found
pub fn verify_client_data(
    client_data: &CollectedClientData,
    expected_type: &str,
    expected_challenge: &str,
    allowed_origins: &[String],
) -> Result<(), ClientDataMismatch> {
    if client_data.r#type != expected_type {
        return Err(ClientDataMismatch::Type);
    }

    // Browsers never pad, but tolerate it on either side
    if client_data.challenge.trim_end_matches('=') != expected_challenge.trim_end_matches('=') {
        return Err(ClientDataMismatch::Challenge);
    }

    if !origin_allowed(&client_data.origin, allowed_origins) {
        return Err(ClientDataMismatch::Origin);
    }

    Ok(())
}

/// Whether `origin` matches one of the allowed origins
///
/// Web origins are compared after URL normalization (scheme and host case,
/// default ports). Non-URL origins such as `android:apk-key-hash:...` must
/// match exactly.
#[must_use]
pub fn origin_allowed(origin: &str, allowed_origins: &[String]) -> bool {
    let normalized = normalize_origin(origin);
    allowed_origins.iter().any(|allowed| {
        allowed == origin
            || (normalized.is_some() && normalize_origin(allowed) == normalized)
    })
}

fn normalize_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url.origin().ascii_serialization()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_data(kind: &str, challenge: &str, origin: &str) -> CollectedClientData {
        CollectedClientData {
            r#type: kind.to_string(),
            challenge: challenge.to_string(),
            origin: origin.to_string(),
            cross_origin: None,
        }
    }

    fn origins() -> Vec<String> {
        vec!["https://login.example.com".to_string()]
    }

    #[test]
    fn test_valid_client_data() {
        let data = client_data(CEREMONY_CREATE, "abc", "https://login.example.com");
        assert!(verify_client_data(&data, CEREMONY_CREATE, "abc", &origins()).is_ok());
    }

    #[test]
    fn test_type_challenge_origin_mismatches() {
        let data = client_data(CEREMONY_GET, "abc", "https://login.example.com");
        assert_eq!(
            verify_client_data(&data, CEREMONY_CREATE, "abc", &origins()),
            Err(ClientDataMismatch::Type)
        );

        let data = client_data(CEREMONY_CREATE, "abd", "https://login.example.com");
        assert_eq!(
            verify_client_data(&data, CEREMONY_CREATE, "abc", &origins()),
            Err(ClientDataMismatch::Challenge)
        );

        let data = client_data(CEREMONY_CREATE, "abc", "https://evil.example.com");
        assert_eq!(
            verify_client_data(&data, CEREMONY_CREATE, "abc", &origins()),
            Err(ClientDataMismatch::Origin)
        );
    }

    #[test]
    fn test_origin_normalization() {
        assert!(origin_allowed("https://LOGIN.example.com:443", &origins()));
        assert!(!origin_allowed("http://login.example.com", &origins()));
        assert!(!origin_allowed("https://login.example.com.evil.io", &origins()));

        let android = vec!["android:apk-key-hash:abc".to_string()];
        assert!(origin_allowed("android:apk-key-hash:abc", &android));
        assert!(!origin_allowed("android:apk-key-hash:abd", &android));
    }

    #[test]
    fn test_decode_client_data() {
        let json = br#"{"type":"webauthn.get","challenge":"xyz","origin":"https://a.example"}"#;
        let encoded = crypto::base64url_encode(json);
        let (raw, parsed) = decode_client_data(&encoded).unwrap();
        assert_eq!(raw, json.to_vec());
        assert_eq!(parsed.challenge, "xyz");
        assert!(decode_client_data("bm90IGpzb24").is_err());
    }
}
