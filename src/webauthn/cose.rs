//! COSE key handling
//!
//! Credential public keys arrive COSE encoded (RFC 8152) inside the attested
//! credential data. Only the EC2 and RSA key types are accepted.

use ciborium::value::Value;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::rsa::Rsa;
use serde::{Deserialize, Serialize};

use super::errors::PipelineError;

const COSE_KTY: i128 = 1;
const COSE_ALG: i128 = 3;
const COSE_EC2_CRV: i128 = -1;
const COSE_EC2_X: i128 = -2;
const COSE_EC2_Y: i128 = -3;
const COSE_RSA_N: i128 = -1;
const COSE_RSA_E: i128 = -2;

const COSE_KTY_EC2: i128 = 2;
const COSE_KTY_RSA: i128 = 3;

/// Signature algorithms on the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoseAlgorithm {
    ES256,
    ES384,
    ES512,
    RS256,
    RS384,
    RS512,
}

impl CoseAlgorithm {
    /// Every algorithm the verifier accepts, in preference order
    pub const ALLOWED: [CoseAlgorithm; 6] = [
        CoseAlgorithm::ES256,
        CoseAlgorithm::ES384,
        CoseAlgorithm::ES512,
        CoseAlgorithm::RS256,
        CoseAlgorithm::RS384,
        CoseAlgorithm::RS512,
    ];

    /// Resolve a COSE algorithm identifier; anything off the allow-list is `None`
    #[must_use]
    pub fn from_identifier(id: i64) -> Option<Self> {
        match id {
            -7 => Some(CoseAlgorithm::ES256),
            -35 => Some(CoseAlgorithm::ES384),
            -36 => Some(CoseAlgorithm::ES512),
            -257 => Some(CoseAlgorithm::RS256),
            -258 => Some(CoseAlgorithm::RS384),
            -259 => Some(CoseAlgorithm::RS512),
            _ => None,
        }
    }

    #[must_use]
    pub fn identifier(self) -> i64 {
        match self {
            CoseAlgorithm::ES256 => -7,
            CoseAlgorithm::ES384 => -35,
            CoseAlgorithm::ES512 => -36,
            CoseAlgorithm::RS256 => -257,
            CoseAlgorithm::RS384 => -258,
            CoseAlgorithm::RS512 => -259,
        }
    }

    #[must_use]
    pub fn message_digest(self) -> MessageDigest {
        match self {
            CoseAlgorithm::ES256 | CoseAlgorithm::RS256 => MessageDigest::sha256(),
            CoseAlgorithm::ES384 | CoseAlgorithm::RS384 => MessageDigest::sha384(),
            CoseAlgorithm::ES512 | CoseAlgorithm::RS512 => MessageDigest::sha512(),
        }
    }

    #[must_use]
    pub fn is_ecdsa(self) -> bool {
        matches!(
            self,
            CoseAlgorithm::ES256 | CoseAlgorithm::ES384 | CoseAlgorithm::ES512
        )
    }
}

/// Elliptic curves usable with EC2 keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    fn from_identifier(id: i128) -> Option<Self> {
        match id {
            1 => Some(EcCurve::P256),
            2 => Some(EcCurve::P384),
            3 => Some(EcCurve::P521),
            _ => None,
        }
    }

    #[must_use]
    pub fn identifier(self) -> i64 {
        match self {
            EcCurve::P256 => 1,
            EcCurve::P384 => 2,
            EcCurve::P521 => 3,
        }
    }

    fn nid(self) -> Nid {
        match self {
            EcCurve::P256 => Nid::X9_62_PRIME256V1,
            EcCurve::P384 => Nid::SECP384R1,
            EcCurve::P521 => Nid::SECP521R1,
        }
    }

    fn coordinate_len(self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
            EcCurve::P521 => 66,
        }
    }
}

/// A decoded credential public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoseKey {
    Ec2 {
        alg: Option<CoseAlgorithm>,
        curve: EcCurve,
        x: Vec<u8>,
        y: Vec<u8>,
    },
    Rsa {
        alg: Option<CoseAlgorithm>,
        n: Vec<u8>,
        e: Vec<u8>,
    },
}

impl CoseKey {
    /// Parse a CBOR encoded COSE key
    ///
    /// # Errors
    /// Returns an error if the bytes are not a COSE map or use an unsupported key type
    pub fn parse(bytes: &[u8]) -> Result<Self, PipelineError> {
        let value: Value = ciborium::de::from_reader(bytes)
            .map_err(|e| PipelineError::KeyError(format!("Invalid COSE key CBOR: {e}")))?;
        let Some(entries) = value.as_map() else {
            return Err(PipelineError::KeyError("COSE key is not a map".into()));
        };

        let int_label = |label: i128| -> Option<&Value> {
            entries.iter().find_map(|(k, v)| {
                k.as_integer()
                    .filter(|i| i128::from(*i) == label)
                    .map(|_| v)
            })
        };
        let int_value = |label: i128| -> Option<i128> {
            int_label(label)
                .and_then(Value::as_integer)
                .map(i128::from)
        };
        let bytes_value = |label: i128, name: &str| -> Result<Vec<u8>, PipelineError> {
            int_label(label)
                .and_then(Value::as_bytes)
                .cloned()
                .ok_or_else(|| PipelineError::KeyError(format!("COSE key missing {name}")))
        };

        let alg = int_value(COSE_ALG)
            .and_then(|a| i64::try_from(a).ok())
            .and_then(CoseAlgorithm::from_identifier);

        match int_value(COSE_KTY) {
            Some(COSE_KTY_EC2) => {
                let curve = int_value(COSE_EC2_CRV)
                    .and_then(EcCurve::from_identifier)
                    .ok_or_else(|| PipelineError::KeyError("Unsupported EC2 curve".into()))?;
                let x = bytes_value(COSE_EC2_X, "x coordinate")?;
                let y = bytes_value(COSE_EC2_Y, "y coordinate")?;
                if x.len() != curve.coordinate_len() || y.len() != curve.coordinate_len() {
                    return Err(PipelineError::KeyError(
                        "EC2 coordinate length does not match curve".into(),
                    ));
                }
                Ok(CoseKey::Ec2 { alg, curve, x, y })
            }
            Some(COSE_KTY_RSA) => {
                let n = bytes_value(COSE_RSA_N, "modulus")?;
                let e = bytes_value(COSE_RSA_E, "exponent")?;
                Ok(CoseKey::Rsa { alg, n, e })
            }
            other => Err(PipelineError::KeyError(format!(
                "Unsupported COSE key type: {other:?}"
            ))),
        }
    }

    /// The algorithm the key declares, if any
    #[must_use]
    pub fn algorithm(&self) -> Option<CoseAlgorithm> {
        match self {
            CoseKey::Ec2 { alg, .. } | CoseKey::Rsa { alg, .. } => *alg,
        }
    }

    /// Build an `OpenSSL` public key
    ///
    /// # Errors
    /// Returns an error if the coordinates do not describe a valid key
    pub fn to_public_key(&self) -> Result<PKey<Public>, PipelineError> {
        match self {
            CoseKey::Ec2 { curve, x, y, .. } => {
                let group = EcGroup::from_curve_name(curve.nid())?;
                let key = EcKey::from_public_key_affine_coordinates(
                    &group,
                    &*BigNum::from_slice(x)?,
                    &*BigNum::from_slice(y)?,
                )
                .map_err(|e| PipelineError::KeyError(format!("Invalid EC point: {e}")))?;
                key.check_key()
                    .map_err(|e| PipelineError::KeyError(format!("Invalid EC key: {e}")))?;
                Ok(PKey::from_ec_key(key)?)
            }
            CoseKey::Rsa { n, e, .. } => {
                let rsa = Rsa::from_public_components(BigNum::from_slice(n)?, BigNum::from_slice(e)?)?;
                Ok(PKey::from_rsa(rsa)?)
            }
        }
    }

    /// Raw ANSI X9.62 uncompressed point (`0x04 || x || y`), P-256 only
    #[must_use]
    pub fn x962_raw_p256(&self) -> Option<Vec<u8>> {
        match self {
            CoseKey::Ec2 {
                curve: EcCurve::P256,
                x,
                y,
                ..
            } => {
                let mut raw = Vec::with_capacity(65);
                raw.push(0x04);
                raw.extend_from_slice(x);
                raw.extend_from_slice(y);
                Some(raw)
            }
            _ => None,
        }
    }

    /// Encode an EC public key as a COSE key
    ///
    /// # Errors
    /// Returns an error if the key is not on a supported curve
    pub fn encode_ec_public_key(
        key: &EcKey<impl openssl::pkey::HasPublic>,
        alg: CoseAlgorithm,
    ) -> Result<Vec<u8>, PipelineError> {
        let curve = match key.group().curve_name() {
            Some(Nid::X9_62_PRIME256V1) => EcCurve::P256,
            Some(Nid::SECP384R1) => EcCurve::P384,
            Some(Nid::SECP521R1) => EcCurve::P521,
            _ => return Err(PipelineError::KeyError("Unsupported curve".into())),
        };
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        key.public_key()
            .affine_coordinates_gfp(key.group(), &mut x, &mut y, &mut ctx)?;
        let len = i32::try_from(curve.coordinate_len()).unwrap_or(32);
        let value = Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(2.into())),
            (Value::Integer(3.into()), Value::Integer(alg.identifier().into())),
            (Value::Integer((-1).into()), Value::Integer(curve.identifier().into())),
            (Value::Integer((-2).into()), Value::Bytes(x.to_vec_padded(len)?)),
            (Value::Integer((-3).into()), Value::Bytes(y.to_vec_padded(len)?)),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&value, &mut out)
            .map_err(|e| PipelineError::EncodingError(format!("COSE encoding failed: {e}")))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p256_key() -> EcKey<openssl::pkey::Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        EcKey::generate(&group).unwrap()
    }

    #[test]
    fn test_algorithm_allow_list() {
        for alg in CoseAlgorithm::ALLOWED {
            assert_eq!(CoseAlgorithm::from_identifier(alg.identifier()), Some(alg));
        }
        // EdDSA and PS256 are not on the allow-list
        assert_eq!(CoseAlgorithm::from_identifier(-8), None);
        assert_eq!(CoseAlgorithm::from_identifier(-37), None);
    }

    #[test]
    fn test_ec2_key_parses_and_converts() {
        let key = p256_key();
        let encoded = CoseKey::encode_ec_public_key(&key, CoseAlgorithm::ES256).unwrap();
        let cose = CoseKey::parse(&encoded).unwrap();

        assert_eq!(cose.algorithm(), Some(CoseAlgorithm::ES256));
        let raw = cose.x962_raw_p256().unwrap();
        assert_eq!(raw.len(), 65);
        assert_eq!(raw[0], 0x04);

        let public = cose.to_public_key().unwrap();
        assert!(public.public_eq(&PKey::from_ec_key(key).unwrap()));
    }

    #[test]
    fn test_rejects_non_map_and_unknown_kty() {
        let mut not_map = Vec::new();
        ciborium::ser::into_writer(&Value::Text("key".into()), &mut not_map).unwrap();
        assert!(CoseKey::parse(&not_map).is_err());

        let okp = Value::Map(vec![(Value::Integer(1.into()), Value::Integer(1.into()))]);
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&okp, &mut encoded).unwrap();
        assert!(matches!(
            CoseKey::parse(&encoded),
            Err(PipelineError::KeyError(_))
        ));
    }

    #[test]
    fn test_rejects_short_coordinates() {
        let value = Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(2.into())),
            (Value::Integer((-1).into()), Value::Integer(1.into())),
            (Value::Integer((-2).into()), Value::Bytes(vec![1; 31])),
            (Value::Integer((-3).into()), Value::Bytes(vec![1; 32])),
        ]);
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&value, &mut encoded).unwrap();
        assert!(CoseKey::parse(&encoded).is_err());
    }
}
