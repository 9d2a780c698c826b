//! TPM 2.0 attestation structures
//!
//! Just enough of `TPMS_ATTEST` (certInfo) and `TPMT_PUBLIC` (pubArea) to link
//! a TPM attestation to the credential it vouches for. All integers are big
//! endian; `TPM2B` values are a u16 length followed by that many bytes.

use openssl::hash::MessageDigest;

use super::cose::{CoseKey, EcCurve};
use super::errors::PipelineError;

/// `TPM_GENERATED_VALUE`
pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;
/// `TPM_ST_ATTEST_CERTIFY`
pub const TPM_ST_ATTEST_CERTIFY: u16 = 0x8017;

pub const TPM_ALG_RSA: u16 = 0x0001;
pub const TPM_ALG_SHA1: u16 = 0x0004;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_SHA384: u16 = 0x000C;
pub const TPM_ALG_SHA512: u16 = 0x000D;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_ECC: u16 = 0x0023;

pub const TPM_ECC_NIST_P256: u16 = 0x0003;
pub const TPM_ECC_NIST_P384: u16 = 0x0004;
pub const TPM_ECC_NIST_P521: u16 = 0x0005;

const RSA_DEFAULT_EXPONENT: u32 = 65_537;

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], PipelineError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| PipelineError::StatementError(format!("TPM structure truncated at {what}")))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self, what: &str) -> Result<u16, PipelineError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, PipelineError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &str) -> Result<u64, PipelineError> {
        let b = self.take(8, what)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    fn tpm2b(&mut self, what: &str) -> Result<Vec<u8>, PipelineError> {
        let len = usize::from(self.u16(what)?);
        Ok(self.take(len, what)?.to_vec())
    }

    fn finished(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// `TPMS_ATTEST` for a certify operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub magic: u32,
    pub attest_type: u16,
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
    pub firmware_version: u64,
    /// `TPMS_CERTIFY_INFO.name`: nameAlg followed by the digest of pubArea
    pub attested_name: Vec<u8>,
    pub attested_qualified_name: Vec<u8>,
}

impl CertInfo {
    /// Parse a `TPMS_ATTEST` structure
    ///
    /// # Errors
    /// Returns a `StatementError` if the structure is truncated or has trailing bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, PipelineError> {
        let mut r = Reader::new(bytes);
        let info = CertInfo {
            magic: r.u32("magic")?,
            attest_type: r.u16("type")?,
            qualified_signer: r.tpm2b("qualifiedSigner")?,
            extra_data: r.tpm2b("extraData")?,
            clock: r.u64("clock")?,
            reset_count: r.u32("resetCount")?,
            restart_count: r.u32("restartCount")?,
            safe: r.take(1, "safe")?[0] != 0,
            firmware_version: r.u64("firmwareVersion")?,
            attested_name: r.tpm2b("attested.name")?,
            attested_qualified_name: r.tpm2b("attested.qualifiedName")?,
        };
        if !r.finished() {
            return Err(PipelineError::StatementError(
                "Trailing bytes in certInfo".to_string(),
            ));
        }
        Ok(info)
    }
}

/// Public key carried in `TPMT_PUBLIC.unique`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmPublicKey {
    Rsa { modulus: Vec<u8>, exponent: u32 },
    Ecc { curve_id: u16, x: Vec<u8>, y: Vec<u8> },
}

/// `TPMT_PUBLIC`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubArea {
    pub object_type: u16,
    pub name_alg: u16,
    pub object_attributes: u32,
    pub auth_policy: Vec<u8>,
    pub key: TpmPublicKey,
}

impl PubArea {
    /// Parse a `TPMT_PUBLIC` structure for an RSA or ECC key
    ///
    /// # Errors
    /// Returns a `StatementError` for truncated data, unknown object types or
    /// symmetric/KDF parameters this parser does not handle
    pub fn parse(bytes: &[u8]) -> Result<Self, PipelineError> {
        let mut r = Reader::new(bytes);
        let object_type = r.u16("type")?;
        let name_alg = r.u16("nameAlg")?;
        let object_attributes = r.u32("objectAttributes")?;
        let auth_policy = r.tpm2b("authPolicy")?;

        if r.u16("symmetric")? != TPM_ALG_NULL {
            return Err(PipelineError::StatementError(
                "Attestation keys must not carry a symmetric algorithm".to_string(),
            ));
        }
        // A non-null scheme is followed by its hash algorithm
        if r.u16("scheme")? != TPM_ALG_NULL {
            r.u16("scheme.hashAlg")?;
        }

        let key = match object_type {
            TPM_ALG_RSA => {
                let _key_bits = r.u16("keyBits")?;
                let exponent = match r.u32("exponent")? {
                    0 => RSA_DEFAULT_EXPONENT,
                    e => e,
                };
                let modulus = r.tpm2b("unique.rsa")?;
                TpmPublicKey::Rsa { modulus, exponent }
            }
            TPM_ALG_ECC => {
                let curve_id = r.u16("curveID")?;
                if r.u16("kdf")? != TPM_ALG_NULL {
                    r.u16("kdf.hashAlg")?;
                }
                let x = r.tpm2b("unique.ecc.x")?;
                let y = r.tpm2b("unique.ecc.y")?;
                TpmPublicKey::Ecc { curve_id, x, y }
            }
            other => {
                return Err(PipelineError::StatementError(format!(
                    "Unsupported TPM object type {other:#06x}"
                )))
            }
        };

        if !r.finished() {
            return Err(PipelineError::StatementError(
                "Trailing bytes in pubArea".to_string(),
            ));
        }

        Ok(Self {
            object_type,
            name_alg,
            object_attributes,
            auth_policy,
            key,
        })
    }

    /// Whether this public area describes the same key as a COSE credential key
    #[must_use]
    pub fn matches(&self, cose: &CoseKey) -> bool {
        match (&self.key, cose) {
            (TpmPublicKey::Rsa { modulus, exponent }, CoseKey::Rsa { n, e, .. }) => {
                modulus == n && exponent_value(e) == Some(*exponent)
            }
            (TpmPublicKey::Ecc { curve_id, x, y }, CoseKey::Ec2 { curve, x: cx, y: cy, .. }) => {
                let curve_matches = matches!(
                    (curve, *curve_id),
                    (EcCurve::P256, TPM_ECC_NIST_P256)
                        | (EcCurve::P384, TPM_ECC_NIST_P384)
                        | (EcCurve::P521, TPM_ECC_NIST_P521)
                );
                curve_matches && x == cx && y == cy
            }
            _ => false,
        }
    }
}

fn exponent_value(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Digest for a TPM name algorithm
#[must_use]
pub fn name_digest(name_alg: u16) -> Option<MessageDigest> {
    match name_alg {
        TPM_ALG_SHA1 => Some(MessageDigest::sha1()),
        TPM_ALG_SHA256 => Some(MessageDigest::sha256()),
        TPM_ALG_SHA384 => Some(MessageDigest::sha384()),
        TPM_ALG_SHA512 => Some(MessageDigest::sha512()),
        _ => None,
    }
}

/// Compute the TPM name of a public area: `nameAlg || H_nameAlg(pubArea)`
///
/// # Errors
/// Returns an error for unknown name algorithms or a digest backend failure
pub fn compute_name(name_alg: u16, pub_area: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let md = name_digest(name_alg).ok_or_else(|| {
        PipelineError::StatementError(format!("Unsupported TPM name algorithm {name_alg:#06x}"))
    })?;
    let mut name = name_alg.to_be_bytes().to_vec();
    name.extend_from_slice(&openssl::hash::hash(md, pub_area)?);
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpm2b(data: &[u8]) -> Vec<u8> {
        let mut out = u16::try_from(data.len()).unwrap().to_be_bytes().to_vec();
        out.extend_from_slice(data);
        out
    }

    fn ecc_pub_area(x: &[u8], y: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_ALG_ECC.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        out.extend_from_slice(&0x0006_0472u32.to_be_bytes());
        out.extend_from_slice(&tpm2b(&[]));
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        out.extend_from_slice(&TPM_ECC_NIST_P256.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        out.extend_from_slice(&tpm2b(x));
        out.extend_from_slice(&tpm2b(y));
        out
    }

    #[test]
    fn test_parse_ecc_pub_area_and_match() {
        let x = vec![1u8; 32];
        let y = vec![2u8; 32];
        let area = PubArea::parse(&ecc_pub_area(&x, &y)).unwrap();
        assert_eq!(area.name_alg, TPM_ALG_SHA256);

        let cose = CoseKey::Ec2 {
            alg: None,
            curve: EcCurve::P256,
            x: x.clone(),
            y: y.clone(),
        };
        assert!(area.matches(&cose));

        let other = CoseKey::Ec2 {
            alg: None,
            curve: EcCurve::P256,
            x,
            y: vec![3u8; 32],
        };
        assert!(!area.matches(&other));
    }

    #[test]
    fn test_parse_cert_info() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&TPM_GENERATED_VALUE.to_be_bytes());
        bytes.extend_from_slice(&TPM_ST_ATTEST_CERTIFY.to_be_bytes());
        bytes.extend_from_slice(&tpm2b(b"signer"));
        bytes.extend_from_slice(&tpm2b(&[9u8; 32]));
        bytes.extend_from_slice(&[0u8; 17]);
        bytes.extend_from_slice(&7u64.to_be_bytes());
        bytes.extend_from_slice(&tpm2b(&[0x00, 0x0B, 0xAA]));
        bytes.extend_from_slice(&tpm2b(&[]));

        let info = CertInfo::parse(&bytes).unwrap();
        assert_eq!(info.magic, TPM_GENERATED_VALUE);
        assert_eq!(info.attest_type, TPM_ST_ATTEST_CERTIFY);
        assert_eq!(info.extra_data, vec![9u8; 32]);
        assert_eq!(info.firmware_version, 7);
        assert_eq!(info.attested_name, vec![0x00, 0x0B, 0xAA]);

        bytes.push(0);
        assert!(CertInfo::parse(&bytes).is_err());
        assert!(CertInfo::parse(&bytes[..10]).is_err());
    }

    #[test]
    fn test_compute_name_prefixes_algorithm() {
        let name = compute_name(TPM_ALG_SHA256, b"area").unwrap();
        assert_eq!(&name[..2], &[0x00, 0x0B]);
        assert_eq!(name.len(), 34);
        assert!(compute_name(0x0099, b"area").is_err());
    }
}
