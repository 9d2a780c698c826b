//! CBOR processing for `WebAuthn`
//!
//! This module handles the CBOR (Concise Binary Object Representation)
//! processing needed for `WebAuthn` attestation objects and the binary
//! authenticator data they carry.
//!
//! Authenticator data layout:
//! - 32 bytes: RP ID hash
//! - 1 byte: flags
//! - 4 bytes: signature counter (big endian)
//! - variable: attested credential data (if the AT flag is set)
//!   - 16 bytes: AAGUID
//!   - 2 bytes: credential ID length (L)
//!   - L bytes: credential ID
//!   - variable: COSE public key
//! - variable: extensions (if the ED flag is set)

use std::io::Cursor;

use ciborium::de::from_reader;
use ciborium::value::Value;

use super::errors::PipelineError;
use super::statement::{AttestationFormat, AttestationStatement};

const RP_ID_HASH_LEN: usize = 32;
const FLAGS_OFFSET: usize = 32;
const COUNTER_OFFSET: usize = 33;
/// Minimum authenticator data length (rpIdHash + flags + counter)
pub const AUTH_DATA_MIN_LEN: usize = 37;
const AAGUID_LEN: usize = 16;

/// Authenticator data flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatorFlags(u8);

impl AuthenticatorFlags {
    pub const USER_PRESENT: u8 = 0x01;
    pub const USER_VERIFIED: u8 = 0x04;
    pub const BACKUP_ELIGIBLE: u8 = 0x08;
    pub const BACKUP_STATE: u8 = 0x10;
    pub const ATTESTED_CREDENTIAL_DATA: u8 = 0x40;
    pub const EXTENSION_DATA: u8 = 0x80;

    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn user_present(self) -> bool {
        self.0 & Self::USER_PRESENT != 0
    }

    #[must_use]
    pub fn user_verified(self) -> bool {
        self.0 & Self::USER_VERIFIED != 0
    }

    #[must_use]
    pub fn backup_eligible(self) -> bool {
        self.0 & Self::BACKUP_ELIGIBLE != 0
    }

    #[must_use]
    pub fn backup_state(self) -> bool {
        self.0 & Self::BACKUP_STATE != 0
    }

    #[must_use]
    pub fn attested_credential_data(self) -> bool {
        self.0 & Self::ATTESTED_CREDENTIAL_DATA != 0
    }

    #[must_use]
    pub fn extension_data(self) -> bool {
        self.0 & Self::EXTENSION_DATA != 0
    }
}

/// Attested credential data embedded in registration authenticator data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; AAGUID_LEN],
    pub credential_id: Vec<u8>,
    /// COSE encoded credential public key, byte-exact as received
    pub credential_public_key: Vec<u8>,
}

impl AttestedCredentialData {
    /// Authenticator model identifier (the AAGUID in UUID form)
    #[must_use]
    pub fn model_id(&self) -> String {
        uuid::Uuid::from_bytes(self.aaguid).to_string()
    }
}

/// Parsed authenticator data
///
/// The raw bytes are retained because signatures are computed over them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorData {
    raw: Vec<u8>,
    pub rp_id_hash: [u8; RP_ID_HASH_LEN],
    pub flags: AuthenticatorFlags,
    pub sign_count: u32,
    pub attested_credential_data: Option<AttestedCredentialData>,
    pub extensions: Option<Vec<u8>>,
}

impl AuthenticatorData {
    /// Parse binary authenticator data
    ///
    /// # Errors
    /// Returns an `EncodingError` if the data is truncated, the COSE key is
    /// not valid CBOR, or bytes remain that no flag accounts for
    pub fn parse(bytes: &[u8]) -> Result<Self, PipelineError> {
        if bytes.len() < AUTH_DATA_MIN_LEN {
            return Err(PipelineError::EncodingError(
                "Auth data too short".to_string(),
            ));
        }

        let mut rp_id_hash = [0u8; RP_ID_HASH_LEN];
        rp_id_hash.copy_from_slice(&bytes[..RP_ID_HASH_LEN]);
        let flags = AuthenticatorFlags::from_bits(bytes[FLAGS_OFFSET]);
        let sign_count = u32::from_be_bytes([
            bytes[COUNTER_OFFSET],
            bytes[COUNTER_OFFSET + 1],
            bytes[COUNTER_OFFSET + 2],
            bytes[COUNTER_OFFSET + 3],
        ]);

        let mut pos = AUTH_DATA_MIN_LEN;
        let attested_credential_data = if flags.attested_credential_data() {
            let (data, consumed) = parse_attested_credential_data(&bytes[pos..])?;
            pos += consumed;
            Some(data)
        } else {
            None
        };

        let extensions = if flags.extension_data() {
            if pos >= bytes.len() {
                return Err(PipelineError::EncodingError(
                    "Extension flag set but no extension data".to_string(),
                ));
            }
            let ext = bytes[pos..].to_vec();
            let _: Value = from_reader(&ext[..]).map_err(|_| {
                PipelineError::EncodingError("Invalid CBOR extension data".to_string())
            })?;
            pos = bytes.len();
            Some(ext)
        } else {
            None
        };

        if pos != bytes.len() {
            return Err(PipelineError::EncodingError(
                "Trailing bytes in auth data".to_string(),
            ));
        }

        Ok(Self {
            raw: bytes.to_vec(),
            rp_id_hash,
            flags,
            sign_count,
            attested_credential_data,
            extensions,
        })
    }

    /// The exact bytes this structure was parsed from
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

fn parse_attested_credential_data(
    bytes: &[u8],
) -> Result<(AttestedCredentialData, usize), PipelineError> {
    if bytes.len() < AAGUID_LEN + 2 {
        return Err(PipelineError::EncodingError(
            "Auth data too short for credential ID length".to_string(),
        ));
    }

    let mut aaguid = [0u8; AAGUID_LEN];
    aaguid.copy_from_slice(&bytes[..AAGUID_LEN]);
    let mut pos = AAGUID_LEN;

    let id_len = usize::from(u16::from_be_bytes([bytes[pos], bytes[pos + 1]]));
    pos += 2;

    if bytes.len() < pos + id_len {
        return Err(PipelineError::EncodingError(
            "Auth data too short for credential ID".to_string(),
        ));
    }
    let credential_id = bytes[pos..pos + id_len].to_vec();
    pos += id_len;

    if bytes.len() <= pos {
        return Err(PipelineError::EncodingError(
            "Auth data too short for public key".to_string(),
        ));
    }

    // The COSE key is self-delimiting; the reader position tells us where it ends
    let mut cursor = Cursor::new(&bytes[pos..]);
    let _: Value = from_reader(&mut cursor)
        .map_err(|_| PipelineError::EncodingError("Invalid CBOR public key".to_string()))?;
    let key_len = usize::try_from(cursor.position())
        .map_err(|_| PipelineError::EncodingError("Public key too large".to_string()))?;
    let credential_public_key = bytes[pos..pos + key_len].to_vec();
    pos += key_len;

    Ok((
        AttestedCredentialData {
            aaguid,
            credential_id,
            credential_public_key,
        },
        pos,
    ))
}

/// A decoded attestation object
#[derive(Debug, Clone)]
pub struct AttestationObject {
    /// Format tag exactly as received
    pub format_tag: String,
    pub statement: AttestationStatement,
    pub auth_data: AuthenticatorData,
}

impl AttestationObject {
    /// Decode a CBOR attestation object envelope
    ///
    /// Unknown format tags decode successfully into
    /// [`AttestationStatement::Unsupported`]; a known format whose statement
    /// lacks a required field is a decode error.
    ///
    /// # Errors
    /// Returns an error if the envelope or authenticator data is malformed
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        let attestation: Value = from_reader(bytes).map_err(|_| {
            PipelineError::EncodingError("Invalid CBOR attestation format".to_string())
        })?;
        let Some(entries) = attestation.as_map() else {
            return Err(PipelineError::EncodingError(
                "Attestation object is not a map".to_string(),
            ));
        };

        let format_tag = map_get(entries, "fmt")
            .and_then(Value::as_text)
            .ok_or_else(|| PipelineError::EncodingError("Missing fmt in attestation".to_string()))?
            .to_string();
        let statement_map = map_get(entries, "attStmt")
            .and_then(Value::as_map)
            .ok_or_else(|| {
                PipelineError::EncodingError("Missing attStmt in attestation".to_string())
            })?;
        let auth_data = map_get(entries, "authData")
            .and_then(Value::as_bytes)
            .ok_or_else(|| {
                PipelineError::EncodingError("Missing authData in attestation".to_string())
            })?;

        let statement = match AttestationFormat::from_tag(&format_tag) {
            Some(format) => AttestationStatement::decode(format, statement_map)?,
            None => AttestationStatement::Unsupported(format_tag.clone()),
        };

        Ok(Self {
            format_tag,
            statement,
            auth_data: AuthenticatorData::parse(auth_data)?,
        })
    }
}

/// Look up a text key in a CBOR map
pub(crate) fn map_get<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Look up a byte-string field
pub(crate) fn map_bytes(entries: &[(Value, Value)], key: &str) -> Option<Vec<u8>> {
    map_get(entries, key).and_then(Value::as_bytes).cloned()
}

/// Look up an array of byte strings (certificate chains)
pub(crate) fn map_bytes_array(
    entries: &[(Value, Value)],
    key: &str,
) -> Result<Option<Vec<Vec<u8>>>, PipelineError> {
    let Some(value) = map_get(entries, key) else {
        return Ok(None);
    };
    let array = value
        .as_array()
        .ok_or_else(|| PipelineError::StatementError(format!("{key} is not an array")))?;
    array
        .iter()
        .map(|item| {
            item.as_bytes()
                .cloned()
                .ok_or_else(|| PipelineError::StatementError(format!("{key} entry is not bytes")))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Look up an integer field
pub(crate) fn map_int(entries: &[(Value, Value)], key: &str) -> Option<i64> {
    map_get(entries, key)
        .and_then(Value::as_integer)
        .and_then(|i| i64::try_from(i).ok())
}
