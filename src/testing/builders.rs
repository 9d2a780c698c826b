//! Fluent builders for attestation test data
//!
//! These assemble the binary structures authenticators emit (attestation
//! objects, TPM certify structures, SafetyNet tokens) so each format can be
//! exercised with valid and deliberately broken evidence.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ciborium::value::Value;
use openssl::ecdsa::EcdsaSig;
use openssl::pkey::{PKey, Private};

use super::authenticator::SoftAuthenticator;
use crate::webauthn::tpm::{
    TPM_ALG_ECC, TPM_ALG_NULL, TPM_ALG_SHA256, TPM_ECC_NIST_P256, TPM_GENERATED_VALUE,
    TPM_ST_ATTEST_CERTIFY,
};
use crate::webauthn::{crypto, CoseKey, PipelineError};

/// Builder for CBOR attestation objects
pub struct AttestationObjectBuilder {
    format: String,
    auth_data: Vec<u8>,
    statement: Vec<(Value, Value)>,
}

impl AttestationObjectBuilder {
    #[must_use]
    pub fn new(format: &str, auth_data: &[u8]) -> Self {
        Self {
            format: format.to_string(),
            auth_data: auth_data.to_vec(),
            statement: Vec::new(),
        }
    }

    /// `none` attestation with an empty statement
    #[must_use]
    pub fn none(auth_data: &[u8]) -> Self {
        Self::new("none", auth_data)
    }

    #[must_use]
    pub fn int(mut self, key: &str, value: i64) -> Self {
        self.statement
            .push((Value::Text(key.to_string()), Value::Integer(value.into())));
        self
    }

    #[must_use]
    pub fn text(mut self, key: &str, value: &str) -> Self {
        self.statement
            .push((Value::Text(key.to_string()), Value::Text(value.to_string())));
        self
    }

    #[must_use]
    pub fn bytes(mut self, key: &str, value: Vec<u8>) -> Self {
        self.statement
            .push((Value::Text(key.to_string()), Value::Bytes(value)));
        self
    }

    /// Set `x5c`, leaf first
    #[must_use]
    pub fn chain(mut self, certificates: Vec<Vec<u8>>) -> Self {
        self.statement.push((
            Value::Text("x5c".to_string()),
            Value::Array(certificates.into_iter().map(Value::Bytes).collect()),
        ));
        self
    }

    /// Encode the attestation object
    ///
    /// # Panics
    /// Never in practice; encoding into a `Vec` cannot fail
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let object = Value::Map(vec![
            (Value::Text("fmt".to_string()), Value::Text(self.format)),
            (Value::Text("attStmt".to_string()), Value::Map(self.statement)),
            (Value::Text("authData".to_string()), Value::Bytes(self.auth_data)),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&object, &mut out).expect("CBOR encoding into a Vec");
        out
    }
}

fn tpm2b(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let len = u16::try_from(data.len())
        .map_err(|_| PipelineError::EncodingError("TPM2B value too long".to_string()))?;
    let mut out = len.to_be_bytes().to_vec();
    out.extend_from_slice(data);
    Ok(out)
}

/// `TPMT_PUBLIC` for a P-256 credential key, SHA-256 name algorithm
///
/// # Errors
/// Returns an error if the key is not an EC2 P-256 key
pub fn tpm_ecc_pub_area(credential_key: &CoseKey) -> Result<Vec<u8>, PipelineError> {
    let CoseKey::Ec2 { x, y, .. } = credential_key else {
        return Err(PipelineError::KeyError("expected an EC2 key".to_string()));
    };
    let mut out = Vec::new();
    out.extend_from_slice(&TPM_ALG_ECC.to_be_bytes());
    out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
    out.extend_from_slice(&0x0006_0472u32.to_be_bytes());
    out.extend_from_slice(&tpm2b(&[])?);
    out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
    out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
    out.extend_from_slice(&TPM_ECC_NIST_P256.to_be_bytes());
    out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
    out.extend_from_slice(&tpm2b(x)?);
    out.extend_from_slice(&tpm2b(y)?);
    Ok(out)
}

/// `TPMS_ATTEST` certifying `attested_name` with the given `extraData`
///
/// # Errors
/// Returns an error if a field is too long
pub fn tpm_cert_info(
    magic: u32,
    extra_data: &[u8],
    attested_name: &[u8],
) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    out.extend_from_slice(&magic.to_be_bytes());
    out.extend_from_slice(&TPM_ST_ATTEST_CERTIFY.to_be_bytes());
    out.extend_from_slice(&tpm2b(b"test-signer")?);
    out.extend_from_slice(&tpm2b(extra_data)?);
    out.extend_from_slice(&1u64.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(1);
    out.extend_from_slice(&0x2020_0101u64.to_be_bytes());
    out.extend_from_slice(&tpm2b(attested_name)?);
    out.extend_from_slice(&tpm2b(&[])?);
    Ok(out)
}

/// `TPMS_ATTEST` with the generated magic value
///
/// # Errors
/// Returns an error if a field is too long
pub fn tpm_generated_cert_info(
    extra_data: &[u8],
    attested_name: &[u8],
) -> Result<Vec<u8>, PipelineError> {
    tpm_cert_info(TPM_GENERATED_VALUE, extra_data, attested_name)
}

/// Builder for SafetyNet compact JWS responses
pub struct SafetyNetTokenBuilder {
    nonce: String,
    timestamp_ms: i64,
    cts_profile_match: Option<bool>,
    chain: Vec<Vec<u8>>,
}

impl SafetyNetTokenBuilder {
    /// Token whose nonce covers `auth_data`
    #[must_use]
    pub fn for_auth_data(auth_data: &[u8]) -> Self {
        Self {
            nonce: STANDARD.encode(crypto::sha256(auth_data)),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            cts_profile_match: Some(true),
            chain: Vec::new(),
        }
    }

    #[must_use]
    pub fn nonce(mut self, nonce: &str) -> Self {
        self.nonce = nonce.to_string();
        self
    }

    #[must_use]
    pub fn timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    #[must_use]
    pub fn cts_profile_match(mut self, matched: Option<bool>) -> Self {
        self.cts_profile_match = matched;
        self
    }

    /// DER certificates for the `x5c` header, leaf first
    #[must_use]
    pub fn chain(mut self, chain: Vec<Vec<u8>>) -> Self {
        self.chain = chain;
        self
    }

    /// Sign as ES256 with the leaf key (raw `r || s` signature)
    ///
    /// # Errors
    /// Returns an error if serialization or signing fails
    pub fn sign_es256(self, leaf_key: &PKey<Private>) -> Result<Vec<u8>, PipelineError> {
        let header = serde_json::json!({
            "alg": "ES256",
            "x5c": self.chain.iter().map(|c| STANDARD.encode(c)).collect::<Vec<_>>(),
        });
        let mut payload = serde_json::json!({
            "nonce": self.nonce,
            "timestampMs": self.timestamp_ms,
            "apkPackageName": "com.google.android.gms",
            "basicIntegrity": true,
        });
        if let Some(matched) = self.cts_profile_match {
            payload["ctsProfileMatch"] = serde_json::Value::Bool(matched);
        }

        let signing_input = format!(
            "{}.{}",
            crypto::base64url_encode(&serde_json::to_vec(&header)?),
            crypto::base64url_encode(&serde_json::to_vec(&payload)?)
        );
        let der = SoftAuthenticator::sign_with(leaf_key, signing_input.as_bytes())?;
        let sig = EcdsaSig::from_der(&der)?;
        let mut raw = sig.r().to_vec_padded(32)?;
        raw.extend_from_slice(&sig.s().to_vec_padded(32)?);

        Ok(format!("{signing_input}.{}", crypto::base64url_encode(&raw)).into_bytes())
    }
}
