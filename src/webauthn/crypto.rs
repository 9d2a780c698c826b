//! `WebAuthn` cryptography operations
//!
//! This module provides the cryptographic operations needed for `WebAuthn`
//! such as challenge generation, hashing and signature verification.
//! Randomness and SHA-256 come from `ring`; signature verification against
//! certificate and COSE keys goes through `OpenSSL`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKeyRef, Public};
use openssl::sign::Verifier;
use ring::digest;
use ring::rand::SecureRandom;

use super::cose::CoseAlgorithm;
use super::errors::PipelineError;

/// Challenge length in bytes (256 bits)
pub const CHALLENGE_LENGTH: usize = 32;

/// Generate a secure random challenge
///
/// # Errors
/// Returns an error if the system random source is unavailable
pub fn generate_challenge() -> Result<String, PipelineError> {
    let mut bytes = [0u8; CHALLENGE_LENGTH];
    ring::rand::SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| PipelineError::CryptoError("Failed to generate random challenge".into()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash data using SHA-256
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
    out
}

/// Hash data with an `OpenSSL` message digest
///
/// # Errors
/// Returns an error if the digest backend fails
pub fn hash_with(md: MessageDigest, data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    Ok(openssl::hash::hash(md, data)?.to_vec())
}

/// Decode base64url data, tolerating trailing padding
///
/// # Errors
/// Returns an error if the input is not valid base64url
pub fn base64url_decode(data: &str) -> Result<Vec<u8>, PipelineError> {
    Ok(URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))?)
}

/// Encode bytes as unpadded base64url
#[must_use]
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Verify a `WebAuthn` signature
///
/// ECDSA signatures are expected DER encoded, RSA signatures as PKCS#1 v1.5.
/// A signature the backend cannot even parse is reported as invalid, not as
/// an error.
///
/// # Errors
/// `KeyError` when the key cannot be used with `alg` (wrong key type, or a
/// key such as Ed25519 that takes no digest). Keys reach this function from
/// client-supplied certificates and COSE structures.
pub fn verify_signature(
    public_key: &PKeyRef<Public>,
    alg: CoseAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, PipelineError> {
    let expected = if alg.is_ecdsa() { Id::EC } else { Id::RSA };
    if public_key.id() != expected {
        return Err(PipelineError::KeyError(format!(
            "{alg:?} cannot be verified with a {:?} key",
            public_key.id()
        )));
    }
    let mut verifier = Verifier::new(alg.message_digest(), public_key)
        .map_err(|err| PipelineError::KeyError(format!("Unusable key for {alg:?}: {err}")))?;
    verifier.update(data)?;
    match verifier.verify(signature) {
        Ok(valid) => Ok(valid),
        Err(err) => {
            log::debug!("Signature rejected by backend: {err}");
            Ok(false)
        }
    }
}

/// Convert a raw `r || s` ECDSA signature (as used by JWS) into DER
///
/// # Errors
/// Returns an error if the signature length is odd or the backend fails
pub fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, PipelineError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(PipelineError::EncodingError(
            "Raw ECDSA signature has invalid length".into(),
        ));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let sig = EcdsaSig::from_private_components(
        openssl::bn::BigNum::from_slice(r)?,
        openssl::bn::BigNum::from_slice(s)?,
    )?;
    Ok(sig.to_der()?)
}
