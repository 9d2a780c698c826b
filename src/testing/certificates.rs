//! Throwaway certificate authorities for attestation tests
//!
//! Every authority generates a fresh P-256 root; leaves are issued on demand
//! with whatever key, subject and extensions a test needs.

use chrono::{Duration, Utc};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Extension, X509Name, X509NameBuilder, X509};

use crate::webauthn::attestation::ANDROID_KEY_ATTESTATION_OID;
use crate::webauthn::PipelineError;

const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Options for [`TestCertificateAuthority::issue_leaf`]
#[derive(Clone)]
pub struct LeafOptions {
    /// Key to certify; a fresh P-256 key when absent
    pub key: Option<PKey<Private>>,
    pub common_name: String,
    /// Validity window entirely in the past
    pub expired: bool,
    /// Add the Android key attestation extension
    pub android_key_extension: bool,
}

impl Default for LeafOptions {
    fn default() -> Self {
        Self {
            key: None,
            common_name: "Test Attestation".to_string(),
            expired: false,
            android_key_extension: false,
        }
    }
}

/// An issued leaf and its private key
pub struct IssuedCertificate {
    pub certificate: X509,
    pub key: PKey<Private>,
}

impl IssuedCertificate {
    /// DER encoding of the certificate
    ///
    /// # Errors
    /// Returns an error if encoding fails
    pub fn der(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(self.certificate.to_der()?)
    }
}

pub struct TestCertificateAuthority {
    key: PKey<Private>,
    root: X509,
}

impl TestCertificateAuthority {
    /// Create a self-signed root
    ///
    /// # Errors
    /// Returns an error if key generation or signing fails
    pub fn new(common_name: &str) -> Result<Self, PipelineError> {
        let key = Self::generate_p256()?;
        let name = subject(common_name)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*serial()?.to_asn1_integer()?)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&*time_offset(Duration::days(-1))?)?;
        builder.set_not_after(&*time_offset(Duration::days(ROOT_VALIDITY_DAYS))?)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            key,
            root: builder.build(),
        })
    }

    /// Fresh P-256 key pair
    ///
    /// # Errors
    /// Returns an error if key generation fails
    pub fn generate_p256() -> Result<PKey<Private>, PipelineError> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
    }

    #[must_use]
    pub fn root(&self) -> &X509 {
        &self.root
    }

    /// DER encoding of the root, usable as a trust anchor
    ///
    /// # Errors
    /// Returns an error if encoding fails
    pub fn root_der(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(self.root.to_der()?)
    }

    /// Issue a leaf certificate signed by this root
    ///
    /// # Errors
    /// Returns an error if key generation or signing fails
    pub fn issue_leaf(&self, options: &LeafOptions) -> Result<IssuedCertificate, PipelineError> {
        let key = match &options.key {
            Some(key) => key.clone(),
            None => Self::generate_p256()?,
        };

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*serial()?.to_asn1_integer()?)?;
        builder.set_subject_name(&*subject(&options.common_name)?)?;
        builder.set_issuer_name(self.root.subject_name())?;
        builder.set_pubkey(&key)?;
        if options.expired {
            builder.set_not_before(&*time_offset(Duration::days(-30))?)?;
            builder.set_not_after(&*time_offset(Duration::days(-1))?)?;
        } else {
            builder.set_not_before(&*time_offset(Duration::days(-1))?)?;
            builder.set_not_after(&*time_offset(Duration::days(LEAF_VALIDITY_DAYS))?)?;
        }
        if options.android_key_extension {
            let oid = Asn1Object::from_str(ANDROID_KEY_ATTESTATION_OID)?;
            // Empty SEQUENCE; only the presence of the extension is checked
            let contents = Asn1OctetString::new_from_bytes(&[0x30, 0x00])?;
            builder.append_extension(X509Extension::new_from_der(&oid, false, &contents)?)?;
        }
        builder.sign(&self.key, MessageDigest::sha256())?;

        Ok(IssuedCertificate {
            certificate: builder.build(),
            key,
        })
    }
}

fn subject(common_name: &str) -> Result<X509Name, PipelineError> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Passkey Core Tests")?;
    Ok(name.build())
}

fn serial() -> Result<BigNum, PipelineError> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

fn time_offset(offset: Duration) -> Result<Asn1Time, PipelineError> {
    Ok(Asn1Time::from_unix((Utc::now() + offset).timestamp())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_is_signed_by_root() {
        let ca = TestCertificateAuthority::new("Root").unwrap();
        let leaf = ca.issue_leaf(&LeafOptions::default()).unwrap();
        let root_key = ca.root().public_key().unwrap();
        assert!(leaf.certificate.verify(&root_key).unwrap());
        assert!(leaf
            .certificate
            .public_key()
            .unwrap()
            .public_eq(&leaf.key));
    }

    #[test]
    fn test_leaf_common_name() {
        let ca = TestCertificateAuthority::new("Root").unwrap();
        let leaf = ca
            .issue_leaf(&LeafOptions {
                common_name: "attest.android.com".to_string(),
                ..LeafOptions::default()
            })
            .unwrap();
        let cn = leaf
            .certificate
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "attest.android.com");
    }
}
