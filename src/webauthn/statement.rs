//! Attestation statement records
//!
//! Each attestation format gets its own strictly typed statement. Required
//! fields are checked once, when the statement is decoded, so verifiers never
//! deal with missing values.

use std::fmt;

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use super::cbor::{map_bytes, map_bytes_array, map_get, map_int};
use super::errors::PipelineError;

/// Supported attestation statement formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttestationFormat {
    Packed,
    Tpm,
    AndroidKey,
    AndroidSafetynet,
    FidoU2f,
    Apple,
    None,
}

impl AttestationFormat {
    /// Resolve a format tag; unknown tags have no format
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "packed" => Some(AttestationFormat::Packed),
            "tpm" => Some(AttestationFormat::Tpm),
            "android-key" => Some(AttestationFormat::AndroidKey),
            "android-safetynet" => Some(AttestationFormat::AndroidSafetynet),
            "fido-u2f" => Some(AttestationFormat::FidoU2f),
            "apple" => Some(AttestationFormat::Apple),
            "none" => Some(AttestationFormat::None),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AttestationFormat::Packed => "packed",
            AttestationFormat::Tpm => "tpm",
            AttestationFormat::AndroidKey => "android-key",
            AttestationFormat::AndroidSafetynet => "android-safetynet",
            AttestationFormat::FidoU2f => "fido-u2f",
            AttestationFormat::Apple => "apple",
            AttestationFormat::None => "none",
        }
    }
}

impl fmt::Display for AttestationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedStatement {
    pub alg: i64,
    pub sig: Vec<u8>,
    pub x5c: Option<Vec<Vec<u8>>>,
    pub ecdaa_key_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmStatement {
    pub ver: String,
    pub alg: i64,
    pub x5c: Vec<Vec<u8>>,
    pub sig: Vec<u8>,
    pub cert_info: Vec<u8>,
    pub pub_area: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidKeyStatement {
    pub alg: i64,
    pub sig: Vec<u8>,
    pub x5c: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidSafetyNetStatement {
    pub ver: String,
    /// Compact JWS as raw bytes
    pub response: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FidoU2fStatement {
    pub sig: Vec<u8>,
    pub x5c: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppleStatement {
    pub x5c: Vec<Vec<u8>>,
}

/// `none` carries no evidence; any key present is recorded so it can be rejected
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NoneStatement {
    pub field_count: usize,
}

/// Attestation statement, one variant per format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationStatement {
    Packed(PackedStatement),
    Tpm(TpmStatement),
    AndroidKey(AndroidKeyStatement),
    AndroidSafetyNet(AndroidSafetyNetStatement),
    FidoU2f(FidoU2fStatement),
    Apple(AppleStatement),
    None(NoneStatement),
    /// A format tag this crate does not know; never verifies
    Unsupported(String),
}

impl AttestationStatement {
    /// Decode the `attStmt` map for a known format
    ///
    /// # Errors
    /// Returns a `StatementError` if a required field is missing or mistyped
    pub fn decode(
        format: AttestationFormat,
        entries: &[(Value, Value)],
    ) -> Result<Self, PipelineError> {
        let statement = match format {
            AttestationFormat::Packed => AttestationStatement::Packed(PackedStatement {
                alg: required_int(entries, "alg")?,
                sig: required_bytes(entries, "sig")?,
                x5c: map_bytes_array(entries, "x5c")?,
                ecdaa_key_id: map_bytes(entries, "ecdaaKeyId"),
            }),
            AttestationFormat::Tpm => AttestationStatement::Tpm(TpmStatement {
                ver: required_text(entries, "ver")?,
                alg: required_int(entries, "alg")?,
                x5c: required_chain(entries)?,
                sig: required_bytes(entries, "sig")?,
                cert_info: required_bytes(entries, "certInfo")?,
                pub_area: required_bytes(entries, "pubArea")?,
            }),
            AttestationFormat::AndroidKey => AttestationStatement::AndroidKey(AndroidKeyStatement {
                alg: required_int(entries, "alg")?,
                sig: required_bytes(entries, "sig")?,
                x5c: required_chain(entries)?,
            }),
            AttestationFormat::AndroidSafetynet => {
                AttestationStatement::AndroidSafetyNet(AndroidSafetyNetStatement {
                    ver: required_text(entries, "ver")?,
                    response: required_bytes(entries, "response")?,
                })
            }
            AttestationFormat::FidoU2f => AttestationStatement::FidoU2f(FidoU2fStatement {
                sig: required_bytes(entries, "sig")?,
                x5c: required_chain(entries)?,
            }),
            AttestationFormat::Apple => AttestationStatement::Apple(AppleStatement {
                x5c: required_chain(entries)?,
            }),
            AttestationFormat::None => AttestationStatement::None(NoneStatement {
                field_count: entries.len(),
            }),
        };
        Ok(statement)
    }

    /// The format of this statement, `None` for unsupported tags
    #[must_use]
    pub fn format(&self) -> Option<AttestationFormat> {
        match self {
            AttestationStatement::Packed(_) => Some(AttestationFormat::Packed),
            AttestationStatement::Tpm(_) => Some(AttestationFormat::Tpm),
            AttestationStatement::AndroidKey(_) => Some(AttestationFormat::AndroidKey),
            AttestationStatement::AndroidSafetyNet(_) => Some(AttestationFormat::AndroidSafetynet),
            AttestationStatement::FidoU2f(_) => Some(AttestationFormat::FidoU2f),
            AttestationStatement::Apple(_) => Some(AttestationFormat::Apple),
            AttestationStatement::None(_) => Some(AttestationFormat::None),
            AttestationStatement::Unsupported(_) => None,
        }
    }
}

fn required_bytes(entries: &[(Value, Value)], key: &str) -> Result<Vec<u8>, PipelineError> {
    map_bytes(entries, key)
        .ok_or_else(|| PipelineError::StatementError(format!("Missing or invalid {key}")))
}

fn required_int(entries: &[(Value, Value)], key: &str) -> Result<i64, PipelineError> {
    map_int(entries, key)
        .ok_or_else(|| PipelineError::StatementError(format!("Missing or invalid {key}")))
}

fn required_text(entries: &[(Value, Value)], key: &str) -> Result<String, PipelineError> {
    map_get(entries, key)
        .and_then(Value::as_text)
        .map(ToString::to_string)
        .ok_or_else(|| PipelineError::StatementError(format!("Missing or invalid {key}")))
}

fn required_chain(entries: &[(Value, Value)]) -> Result<Vec<Vec<u8>>, PipelineError> {
    map_bytes_array(entries, "x5c")?
        .ok_or_else(|| PipelineError::StatementError("Missing x5c".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_format_tags() {
        for tag in [
            "packed",
            "tpm",
            "android-key",
            "android-safetynet",
            "fido-u2f",
            "apple",
            "none",
        ] {
            let format = AttestationFormat::from_tag(tag).unwrap();
            assert_eq!(format.as_str(), tag);
            assert_eq!(
                serde_json::to_value(format).unwrap(),
                serde_json::Value::String(tag.to_string())
            );
        }
        assert!(AttestationFormat::from_tag("Packed").is_none());
    }

    #[test]
    fn test_packed_requires_sig() {
        let entries = vec![(text("alg"), Value::Integer((-7).into()))];
        let err = AttestationStatement::decode(AttestationFormat::Packed, &entries).unwrap_err();
        assert!(matches!(err, PipelineError::StatementError(_)));
    }

    #[test]
    fn test_packed_optional_chain() {
        let entries = vec![
            (text("alg"), Value::Integer((-7).into())),
            (text("sig"), Value::Bytes(vec![1, 2, 3])),
        ];
        let statement = AttestationStatement::decode(AttestationFormat::Packed, &entries).unwrap();
        let AttestationStatement::Packed(packed) = statement else {
            panic!("expected packed statement");
        };
        assert_eq!(packed.alg, -7);
        assert!(packed.x5c.is_none());
        assert!(packed.ecdaa_key_id.is_none());
    }

    #[test]
    fn test_chain_entries_must_be_bytes() {
        let entries = vec![
            (text("sig"), Value::Bytes(vec![1])),
            (text("x5c"), Value::Array(vec![text("not a cert")])),
        ];
        assert!(AttestationStatement::decode(AttestationFormat::FidoU2f, &entries).is_err());
    }

    #[test]
    fn test_none_counts_fields() {
        let statement = AttestationStatement::decode(AttestationFormat::None, &[]).unwrap();
        assert_eq!(
            statement,
            AttestationStatement::None(NoneStatement { field_count: 0 })
        );

        let entries = vec![(text("sig"), Value::Bytes(vec![1]))];
        let statement = AttestationStatement::decode(AttestationFormat::None, &entries).unwrap();
        assert_eq!(
            statement,
            AttestationStatement::None(NoneStatement { field_count: 1 })
        );
        assert_eq!(statement.format(), Some(AttestationFormat::None));
    }
}
