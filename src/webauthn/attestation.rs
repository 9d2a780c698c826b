//! `WebAuthn` attestation verification
//!
//! This module verifies the attestation statement an authenticator produces
//! at registration. Each format has its own strategy; the decoded statement
//! enum is matched exhaustively so a new format cannot be silently accepted.
//!
//! Outcomes:
//! * `Ok(true)` - the statement verified
//! * `Ok(false)` - the statement was rejected (including malformed input)
//! * `Err(PipelineError)` - the pipeline itself could not reach a decision

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::nid::Nid;
use openssl::x509::X509;
use serde::Deserialize;

use super::cbor::{AttestationObject, AuthenticatorData};
use super::chain::{certificate_key, parse_chain, CertificateChainValidator};
use super::cose::{CoseAlgorithm, CoseKey};
use super::crypto;
use super::errors::PipelineError;
use super::statement::{
    AndroidKeyStatement, AndroidSafetyNetStatement, AppleStatement, AttestationFormat,
    AttestationStatement, FidoU2fStatement, PackedStatement, TpmStatement,
};
use super::tpm::{self, CertInfo, PubArea};
use crate::metrics::MetricsSink;
use crate::store::MetadataLookup;

/// Android key attestation extension
pub const ANDROID_KEY_ATTESTATION_OID: &str = "1.3.6.1.4.1.11129.2.1.17";
/// Hostname the SafetyNet signing certificate must be issued to
pub const SAFETYNET_HOSTNAME: &str = "attest.android.com";
/// Maximum clock skew tolerated for SafetyNet timestamps
const SAFETYNET_MAX_FUTURE_SKEW_MS: i64 = 60_000;

const METRIC_OUTCOME: &str = "attestation_verification";
const METRIC_DURATION: &str = "attestation_verification_duration_ms";

/// Per-call inputs that are not part of the attestation object
#[derive(Debug, Clone, Copy)]
pub struct AttestationContext<'a> {
    /// Raw `clientDataJSON` bytes as received
    pub client_data_json: &'a [u8],
    pub now: DateTime<Utc>,
}

/// Attestation verifier
pub struct AttestationVerifier {
    metadata: Arc<dyn MetadataLookup>,
    metrics: Arc<dyn MetricsSink>,
    chain_validator: CertificateChainValidator,
    format_roots: HashMap<AttestationFormat, Vec<Vec<u8>>>,
}

impl std::fmt::Debug for AttestationVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationVerifier")
            .field("format_roots", &self.format_roots.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AttestationVerifier {
    #[must_use]
    pub fn new(metadata: Arc<dyn MetadataLookup>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            metadata,
            metrics,
            chain_validator: CertificateChainValidator::default(),
            format_roots: HashMap::new(),
        }
    }

    /// Use a specific chain validator (e.g. with a revocation checker)
    #[must_use]
    pub fn with_chain_validator(mut self, validator: CertificateChainValidator) -> Self {
        self.chain_validator = validator;
        self
    }

    /// Trust anchors that apply to every authenticator of a format, such as
    /// the Apple WebAuthn root
    #[must_use]
    pub fn with_format_roots(mut self, format: AttestationFormat, roots: Vec<Vec<u8>>) -> Self {
        self.format_roots.entry(format).or_default().extend(roots);
        self
    }

    /// Verify an attestation object
    ///
    /// # Arguments
    /// * `attestation_object` - CBOR attestation object bytes
    /// * `authenticator_model_id` - AAGUID used to look up trust anchors
    /// * `context` - client data and verification time
    ///
    /// # Errors
    /// Returns a `PipelineError` only when the verifier could not reach a
    /// decision (crypto backend or metadata failure). Malformed or
    /// unsupported input is `Ok(false)`.
    pub async fn verify_attestation(
        &self,
        attestation_object: &[u8],
        authenticator_model_id: &str,
        context: &AttestationContext<'_>,
    ) -> Result<bool, PipelineError> {
        let started = Instant::now();

        let (format_label, result) = match AttestationObject::decode(attestation_object) {
            Ok(decoded) => {
                let label = decoded
                    .statement
                    .format()
                    .map_or("unsupported", AttestationFormat::as_str);
                let result = self
                    .verify_decoded(&decoded, authenticator_model_id, context)
                    .await;
                (label, result)
            }
            Err(err) => ("malformed", Err(err)),
        };

        let result = match result {
            Err(err) if err.is_input_error() => {
                log::warn!("Rejecting {format_label} attestation: {err}");
                Ok(false)
            }
            other => other,
        };

        let outcome = match &result {
            Ok(true) => "valid",
            Ok(false) => "invalid",
            Err(err) => {
                log::error!("Attestation pipeline error ({format_label}): {err}");
                "error"
            }
        };
        self.metrics.increment_counter(
            METRIC_OUTCOME,
            &[("format", format_label), ("outcome", outcome)],
        );
        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = started.elapsed().as_micros() as f64 / 1000.0;
        self.metrics
            .record_histogram(METRIC_DURATION, elapsed_ms, &[("format", format_label)]);

        result
    }

    async fn verify_decoded(
        &self,
        decoded: &AttestationObject,
        model_id: &str,
        context: &AttestationContext<'_>,
    ) -> Result<bool, PipelineError> {
        let auth_data = &decoded.auth_data;
        let mut verification_data = auth_data.as_bytes().to_vec();
        verification_data.extend_from_slice(&crypto::sha256(context.client_data_json));

        let Some(format) = decoded.statement.format() else {
            if let AttestationStatement::Unsupported(tag) = &decoded.statement {
                log::warn!("Unsupported attestation format '{tag}'");
            }
            return Ok(false);
        };
        if format == AttestationFormat::None {
            return Ok(matches!(&decoded.statement, AttestationStatement::None(s) if s.field_count == 0));
        }

        let anchors = self.trust_anchors(format, model_id).await?;
        let check = Verification {
            auth_data,
            verification_data: &verification_data,
            anchors: &anchors,
            now: context.now,
            chain_validator: &self.chain_validator,
        };

        match &decoded.statement {
            AttestationStatement::Packed(s) => check.packed(s),
            AttestationStatement::Tpm(s) => check.tpm(s),
            AttestationStatement::AndroidKey(s) => check.android_key(s),
            AttestationStatement::AndroidSafetyNet(s) => check.android_safetynet(s),
            AttestationStatement::FidoU2f(s) => check.fido_u2f(s),
            AttestationStatement::Apple(s) => check.apple(s),
            AttestationStatement::None(_) | AttestationStatement::Unsupported(_) => Ok(false),
        }
    }

    /// Metadata roots for the model plus roots configured for the format
    async fn trust_anchors(
        &self,
        format: AttestationFormat,
        model_id: &str,
    ) -> Result<Vec<Vec<u8>>, PipelineError> {
        let mut anchors = self
            .metadata
            .get_by_model_id(model_id)
            .await
            .map_err(|e| PipelineError::MetadataError(e.to_string()))?
            .map(|m| m.trusted_root_certificates)
            .unwrap_or_default();
        if let Some(roots) = self.format_roots.get(&format) {
            anchors.extend(roots.iter().cloned());
        }
        Ok(anchors)
    }
}

/// Inputs shared by every format strategy
struct Verification<'a> {
    auth_data: &'a AuthenticatorData,
    verification_data: &'a [u8],
    anchors: &'a [Vec<u8>],
    now: DateTime<Utc>,
    chain_validator: &'a CertificateChainValidator,
}

impl Verification<'_> {
    fn credential_key(&self) -> Result<CoseKey, PipelineError> {
        let attested = self
            .auth_data
            .attested_credential_data
            .as_ref()
            .ok_or_else(|| {
                PipelineError::EncodingError("Missing attested credential data".to_string())
            })?;
        CoseKey::parse(&attested.credential_public_key)
    }

    fn chain(&self, der_chain: &[Vec<u8>]) -> Result<Option<Vec<X509>>, PipelineError> {
        let chain = parse_chain(der_chain)?;
        if self.chain_validator.validate(&chain, self.anchors, self.now)? {
            Ok(Some(chain))
        } else {
            Ok(None)
        }
    }

    fn leaf_signature(
        chain: &[X509],
        alg: CoseAlgorithm,
        data: &[u8],
        sig: &[u8],
    ) -> Result<bool, PipelineError> {
        let Some(leaf) = chain.first() else {
            return Ok(false);
        };
        crypto::verify_signature(&*certificate_key(leaf)?, alg, data, sig)
    }

    fn packed(&self, s: &PackedStatement) -> Result<bool, PipelineError> {
        let Some(alg) = CoseAlgorithm::from_identifier(s.alg) else {
            log::debug!("packed: algorithm {} not allowed", s.alg);
            return Ok(false);
        };

        if let Some(x5c) = &s.x5c {
            let Some(chain) = self.chain(x5c)? else {
                return Ok(false);
            };
            return Self::leaf_signature(&chain, alg, self.verification_data, &s.sig);
        }

        if s.ecdaa_key_id.is_some() {
            log::debug!("packed: ECDAA attestation is not supported");
            return Ok(false);
        }

        // Self attestation: signed by the credential key itself
        let key = self.credential_key()?;
        if key.algorithm() != Some(alg) {
            log::debug!("packed: self attestation algorithm does not match the credential key");
            return Ok(false);
        }
        crypto::verify_signature(&*key.to_public_key()?, alg, self.verification_data, &s.sig)
    }

    fn tpm(&self, s: &TpmStatement) -> Result<bool, PipelineError> {
        if s.ver != "2.0" {
            log::debug!("tpm: unsupported version {}", s.ver);
            return Ok(false);
        }
        if s.x5c.is_empty() || s.cert_info.is_empty() || s.pub_area.is_empty() {
            return Ok(false);
        }
        let Some(alg) = CoseAlgorithm::from_identifier(s.alg) else {
            return Ok(false);
        };

        let Some(chain) = self.chain(&s.x5c)? else {
            return Ok(false);
        };
        if !Self::leaf_signature(&chain, alg, &s.cert_info, &s.sig)? {
            log::debug!("tpm: certInfo signature invalid");
            return Ok(false);
        }

        let cert_info = CertInfo::parse(&s.cert_info)?;
        if cert_info.magic != tpm::TPM_GENERATED_VALUE
            || cert_info.attest_type != tpm::TPM_ST_ATTEST_CERTIFY
        {
            log::debug!("tpm: certInfo is not a TPM generated certify structure");
            return Ok(false);
        }

        let expected_extra = crypto::hash_with(alg.message_digest(), self.verification_data)?;
        if cert_info.extra_data != expected_extra {
            log::debug!("tpm: extraData does not cover the verification data");
            return Ok(false);
        }

        let pub_area = PubArea::parse(&s.pub_area)?;
        if cert_info.attested_name != tpm::compute_name(pub_area.name_alg, &s.pub_area)? {
            log::debug!("tpm: attested name does not match pubArea");
            return Ok(false);
        }

        if !pub_area.matches(&self.credential_key()?) {
            log::debug!("tpm: pubArea key differs from the credential key");
            return Ok(false);
        }
        Ok(true)
    }

    fn android_key(&self, s: &AndroidKeyStatement) -> Result<bool, PipelineError> {
        let Some(alg) = CoseAlgorithm::from_identifier(s.alg) else {
            return Ok(false);
        };
        let Some(leaf_der) = s.x5c.first() else {
            return Ok(false);
        };

        if !has_android_key_extension(leaf_der)? {
            log::debug!("android-key: leaf lacks the key attestation extension");
            return Ok(false);
        }

        let Some(chain) = self.chain(&s.x5c)? else {
            return Ok(false);
        };

        let credential_key = self.credential_key()?.to_public_key()?;
        if !certificate_key(&chain[0])?.public_eq(&credential_key) {
            log::debug!("android-key: leaf key differs from the credential key");
            return Ok(false);
        }

        Self::leaf_signature(&chain, alg, self.verification_data, &s.sig)
    }

    fn android_safetynet(&self, s: &AndroidSafetyNetStatement) -> Result<bool, PipelineError> {
        let token = std::str::from_utf8(&s.response)
            .map_err(|_| PipelineError::StatementError("SafetyNet response is not UTF-8".into()))?;
        let jws = CompactJws::parse(token)?;

        let x5c = jws
            .header
            .x5c
            .iter()
            .map(|c| STANDARD.decode(c))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(leaf_der) = x5c.first() else {
            return Ok(false);
        };

        let expected_nonce = STANDARD.encode(crypto::sha256(self.auth_data.as_bytes()));
        if jws.payload.nonce != expected_nonce {
            log::debug!("android-safetynet: nonce mismatch");
            return Ok(false);
        }
        if jws.payload.cts_profile_match == Some(false) {
            log::debug!("android-safetynet: ctsProfileMatch is false");
            return Ok(false);
        }
        if jws.payload.timestamp_ms > self.now.timestamp_millis() + SAFETYNET_MAX_FUTURE_SKEW_MS {
            log::debug!("android-safetynet: timestamp is in the future");
            return Ok(false);
        }

        let leaf = X509::from_der(leaf_der)
            .map_err(|e| PipelineError::CertificateError(format!("Invalid certificate: {e}")))?;
        let issued_to = leaf
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|cn| cn.to_string());
        if issued_to.as_deref() != Some(SAFETYNET_HOSTNAME) {
            log::debug!("android-safetynet: signing certificate not issued to {SAFETYNET_HOSTNAME}");
            return Ok(false);
        }

        let signature = crypto::base64url_decode(&jws.signature)?;
        let (alg, signature) = match jws.header.alg.as_str() {
            "RS256" => (CoseAlgorithm::RS256, signature),
            "ES256" => (CoseAlgorithm::ES256, crypto::ecdsa_raw_to_der(&signature)?),
            other => {
                log::debug!("android-safetynet: JWS algorithm {other} not allowed");
                return Ok(false);
            }
        };
        let leaf_key = certificate_key(&leaf)?;
        if !crypto::verify_signature(&leaf_key, alg, jws.signing_input.as_bytes(), &signature)? {
            log::debug!("android-safetynet: JWS signature invalid");
            return Ok(false);
        }

        Ok(self.chain(&x5c)?.is_some())
    }

    fn fido_u2f(&self, s: &FidoU2fStatement) -> Result<bool, PipelineError> {
        if s.x5c.len() != 1 {
            log::debug!("fido-u2f: expected exactly one certificate, got {}", s.x5c.len());
            return Ok(false);
        }

        let attested = self
            .auth_data
            .attested_credential_data
            .as_ref()
            .ok_or_else(|| {
                PipelineError::EncodingError("Missing attested credential data".to_string())
            })?;
        let key = CoseKey::parse(&attested.credential_public_key)?;
        let Some(raw_key) = key.x962_raw_p256() else {
            log::debug!("fido-u2f: credential key is not P-256");
            return Ok(false);
        };

        let Some(chain) = self.chain(&s.x5c)? else {
            return Ok(false);
        };
        let leaf_key = certificate_key(&chain[0])?;
        let leaf_is_p256 = leaf_key
            .ec_key()
            .ok()
            .and_then(|ec| ec.group().curve_name())
            == Some(Nid::X9_62_PRIME256V1);
        if !leaf_is_p256 {
            log::debug!("fido-u2f: attestation certificate key is not P-256");
            return Ok(false);
        }

        // 0x00 || rpIdHash || clientDataHash || keyHandle || publicKey
        let client_data_hash = &self.verification_data[self.auth_data.as_bytes().len()..];
        let mut signed = Vec::with_capacity(1 + 32 + 32 + attested.credential_id.len() + 65);
        signed.push(0x00);
        signed.extend_from_slice(&self.auth_data.rp_id_hash);
        signed.extend_from_slice(client_data_hash);
        signed.extend_from_slice(&attested.credential_id);
        signed.extend_from_slice(&raw_key);

        crypto::verify_signature(&leaf_key, CoseAlgorithm::ES256, &signed, &s.sig)
    }

    fn apple(&self, s: &AppleStatement) -> Result<bool, PipelineError> {
        if s.x5c.is_empty() {
            return Ok(false);
        }
        if self.anchors.is_empty() {
            log::warn!("apple: no Apple root configured, cannot establish trust");
            return Ok(false);
        }
        Ok(self.chain(&s.x5c)?.is_some())
    }
}

fn has_android_key_extension(leaf_der: &[u8]) -> Result<bool, PipelineError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|e| PipelineError::CertificateError(format!("Invalid certificate: {e}")))?;
    Ok(cert
        .extensions()
        .iter()
        .any(|ext| ext.oid.to_id_string() == ANDROID_KEY_ATTESTATION_OID))
}

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    x5c: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SafetyNetPayload {
    nonce: String,
    timestamp_ms: i64,
    #[allow(dead_code)]
    apk_package_name: String,
    #[serde(default)]
    cts_profile_match: Option<bool>,
}

struct CompactJws {
    header: JwsHeader,
    payload: SafetyNetPayload,
    signing_input: String,
    signature: String,
}

impl CompactJws {
    fn parse(token: &str) -> Result<Self, PipelineError> {
        let parts: Vec<&str> = token.split('.').collect();
        let [header, payload, signature] = parts.as_slice() else {
            return Err(PipelineError::StatementError(
                "SafetyNet response is not a compact JWS".to_string(),
            ));
        };
        Ok(Self {
            header: serde_json::from_slice(&crypto::base64url_decode(header)?)?,
            payload: serde_json::from_slice(&crypto::base64url_decode(payload)?)?,
            signing_input: format!("{header}.{payload}"),
            signature: (*signature).to_string(),
        })
    }
}
