//! Certificate chain validation
//!
//! Chains are ordered leaf first, as they appear in `x5c`. A chain is valid
//! when every certificate is inside its validity window, each certificate is
//! signed by the next one, nothing is revoked and, when trust anchors are
//! supplied, the chain terminates in one of them.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::pkey::{PKey, Public};
use openssl::x509::{X509Ref, X509};

use super::errors::PipelineError;

/// Revocation extension point
pub trait RevocationChecker: Send + Sync {
    /// Whether the certificate has been revoked
    ///
    /// # Errors
    /// Returns an error if revocation status could not be determined
    fn is_revoked(&self, certificate: &X509Ref) -> Result<bool, PipelineError>;
}

/// Treats every certificate as not revoked
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRevocationCheck;

impl RevocationChecker for NoRevocationCheck {
    fn is_revoked(&self, _certificate: &X509Ref) -> Result<bool, PipelineError> {
        Ok(false)
    }
}

/// Public key of an untrusted certificate
///
/// # Errors
/// `CertificateError` when the subject public key cannot be decoded
pub fn certificate_key(certificate: &X509Ref) -> Result<PKey<Public>, PipelineError> {
    certificate
        .public_key()
        .map_err(|e| PipelineError::CertificateError(format!("Unreadable public key: {e}")))
}

/// Parse a DER encoded chain
///
/// # Errors
/// Returns a `CertificateError` if any entry is not a DER certificate
pub fn parse_chain(der_chain: &[Vec<u8>]) -> Result<Vec<X509>, PipelineError> {
    der_chain
        .iter()
        .map(|der| {
            X509::from_der(der)
                .map_err(|e| PipelineError::CertificateError(format!("Invalid certificate: {e}")))
        })
        .collect()
}

#[derive(Clone)]
pub struct CertificateChainValidator {
    revocation: Arc<dyn RevocationChecker>,
}

impl Default for CertificateChainValidator {
    fn default() -> Self {
        Self::new(Arc::new(NoRevocationCheck))
    }
}

impl std::fmt::Debug for CertificateChainValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateChainValidator").finish_non_exhaustive()
    }
}

impl CertificateChainValidator {
    #[must_use]
    pub fn new(revocation: Arc<dyn RevocationChecker>) -> Self {
        Self { revocation }
    }

    /// Validate a leaf-first chain at `now`
    ///
    /// An empty `trust_anchors` slice skips anchor matching.
    ///
    /// # Errors
    /// Returns an error if an anchor cannot be parsed or the crypto backend or
    /// revocation checker fails
    pub fn validate(
        &self,
        chain: &[X509],
        trust_anchors: &[Vec<u8>],
        now: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let Some(last) = chain.last() else {
            log::debug!("Empty certificate chain");
            return Ok(false);
        };

        let now = Asn1Time::from_unix(now.timestamp())?;
        for (index, cert) in chain.iter().enumerate() {
            if !within_validity(cert, &now)? {
                log::debug!("Certificate {index} in chain is outside its validity window");
                return Ok(false);
            }
        }

        for (index, pair) in chain.windows(2).enumerate() {
            let issuer_key = certificate_key(&pair[1])?;
            if !pair[0].verify(&issuer_key).unwrap_or(false) {
                log::debug!("Certificate {index} is not signed by its successor");
                return Ok(false);
            }
        }

        for cert in chain {
            if self.revocation.is_revoked(cert)? {
                log::warn!("Revoked certificate in attestation chain");
                return Ok(false);
            }
        }

        if trust_anchors.is_empty() {
            return Ok(true);
        }

        let last_der = last.to_der()?;
        for anchor_der in trust_anchors {
            if *anchor_der == last_der {
                return Ok(true);
            }
            let anchor = X509::from_der(anchor_der).map_err(|e| {
                PipelineError::CertificateError(format!("Invalid trust anchor: {e}"))
            })?;
            let anchor_key = anchor.public_key()?;
            if last.verify(&anchor_key).unwrap_or(false) && within_validity(&anchor, &now)? {
                return Ok(true);
            }
        }

        log::debug!("Certificate chain does not terminate in a trusted root");
        Ok(false)
    }
}

fn within_validity(cert: &X509Ref, now: &Asn1Time) -> Result<bool, PipelineError> {
    let started = cert.not_before().compare(now)? != Ordering::Greater;
    let not_expired = cert.not_after().compare(now)? != Ordering::Less;
    Ok(started && not_expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::certificates::{LeafOptions, TestCertificateAuthority};
    use chrono::Duration;

    struct RevokeEverything;

    impl RevocationChecker for RevokeEverything {
        fn is_revoked(&self, _certificate: &X509Ref) -> Result<bool, PipelineError> {
            Ok(true)
        }
    }

    #[test]
    fn test_valid_chain_with_and_without_anchor() {
        let ca = TestCertificateAuthority::new("Test Root").unwrap();
        let leaf = ca.issue_leaf(&LeafOptions::default()).unwrap();
        let chain = vec![leaf.certificate.clone()];
        let validator = CertificateChainValidator::default();

        assert!(validator.validate(&chain, &[], Utc::now()).unwrap());
        assert!(validator
            .validate(&chain, &[ca.root_der().unwrap()], Utc::now())
            .unwrap());

        // Root included in the chain and byte-matching the anchor
        let full = vec![leaf.certificate, ca.root().clone()];
        assert!(validator
            .validate(&full, &[ca.root_der().unwrap()], Utc::now())
            .unwrap());
    }

    #[test]
    fn test_rejects_foreign_anchor() {
        let ca = TestCertificateAuthority::new("Test Root").unwrap();
        let other = TestCertificateAuthority::new("Other Root").unwrap();
        let leaf = ca.issue_leaf(&LeafOptions::default()).unwrap();

        let validator = CertificateChainValidator::default();
        assert!(!validator
            .validate(&[leaf.certificate], &[other.root_der().unwrap()], Utc::now())
            .unwrap());
    }

    #[test]
    fn test_rejects_expired_and_future_use() {
        let ca = TestCertificateAuthority::new("Test Root").unwrap();
        let leaf = ca.issue_leaf(&LeafOptions::default()).unwrap();
        let validator = CertificateChainValidator::default();

        let far_future = Utc::now() + Duration::days(365 * 20);
        assert!(!validator
            .validate(&[leaf.certificate.clone()], &[], far_future)
            .unwrap());

        let expired = ca
            .issue_leaf(&LeafOptions {
                expired: true,
                ..LeafOptions::default()
            })
            .unwrap();
        assert!(!validator
            .validate(&[expired.certificate], &[], Utc::now())
            .unwrap());
    }

    #[test]
    fn test_broken_linkage_and_revocation() {
        let ca = TestCertificateAuthority::new("Test Root").unwrap();
        let other = TestCertificateAuthority::new("Other Root").unwrap();
        let leaf = ca.issue_leaf(&LeafOptions::default()).unwrap();

        let validator = CertificateChainValidator::default();
        let broken = vec![leaf.certificate.clone(), other.root().clone()];
        assert!(!validator.validate(&broken, &[], Utc::now()).unwrap());

        let revoking = CertificateChainValidator::new(Arc::new(RevokeEverything));
        assert!(!revoking
            .validate(&[leaf.certificate], &[], Utc::now())
            .unwrap());
    }

    #[test]
    fn test_empty_chain_is_invalid() {
        let validator = CertificateChainValidator::default();
        assert!(!validator.validate(&[], &[], Utc::now()).unwrap());
        assert!(parse_chain(&[vec![1, 2, 3]]).is_err());
    }
}
