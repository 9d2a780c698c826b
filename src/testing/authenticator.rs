//! Software authenticator
//!
//! Produces authenticator data, attestation objects and assertions with a
//! real P-256 key so ceremonies can be driven end to end in tests.

use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;

use super::builders::AttestationObjectBuilder;
use super::certificates::TestCertificateAuthority;
use crate::webauthn::cbor::AuthenticatorFlags;
use crate::webauthn::client_data::{CEREMONY_CREATE, CEREMONY_GET};
use crate::webauthn::{
    crypto, AuthenticationOptions, AuthenticationResponse, AuthenticatorAssertionResponse,
    AuthenticatorAttestationResponse, CollectedClientData, CoseAlgorithm, CoseKey, PipelineError,
    RegistrationOptions, RegistrationResponse, PUBLIC_KEY_CREDENTIAL_TYPE,
};

const CREDENTIAL_ID_LEN: usize = 16;

pub struct SoftAuthenticator {
    key: PKey<Private>,
    credential_id: Vec<u8>,
    aaguid: [u8; 16],
    counter: u32,
    user_verified: bool,
}

impl SoftAuthenticator {
    /// New authenticator with a fresh key, random credential ID and user verification
    ///
    /// # Errors
    /// Returns an error if key generation fails
    pub fn new() -> Result<Self, PipelineError> {
        let mut credential_id = vec![0u8; CREDENTIAL_ID_LEN];
        openssl::rand::rand_bytes(&mut credential_id)?;
        Ok(Self {
            key: TestCertificateAuthority::generate_p256()?,
            credential_id,
            aaguid: [0u8; 16],
            counter: 0,
            user_verified: true,
        })
    }

    #[must_use]
    pub fn with_aaguid(mut self, aaguid: [u8; 16]) -> Self {
        self.aaguid = aaguid;
        self
    }

    #[must_use]
    pub fn with_user_verification(mut self, user_verified: bool) -> Self {
        self.user_verified = user_verified;
        self
    }

    #[must_use]
    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Base64url credential ID
    #[must_use]
    pub fn credential_id(&self) -> String {
        crypto::base64url_encode(&self.credential_id)
    }

    #[must_use]
    pub fn model_id(&self) -> String {
        uuid::Uuid::from_bytes(self.aaguid).to_string()
    }

    #[must_use]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    /// COSE encoding of the credential public key
    ///
    /// # Errors
    /// Returns an error if the key cannot be encoded
    pub fn cose_key(&self) -> Result<Vec<u8>, PipelineError> {
        let ec: EcKey<Private> = self.key.ec_key()?;
        CoseKey::encode_ec_public_key(&ec, CoseAlgorithm::ES256)
    }

    fn flags(&self, attested: bool) -> u8 {
        let mut flags = AuthenticatorFlags::USER_PRESENT;
        if self.user_verified {
            flags |= AuthenticatorFlags::USER_VERIFIED;
        }
        if attested {
            flags |= AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA;
        }
        flags
    }

    /// Authenticator data with attested credential data
    ///
    /// # Errors
    /// Returns an error if the key cannot be encoded
    pub fn registration_auth_data(&self, rp_id: &str, counter: u32) -> Result<Vec<u8>, PipelineError> {
        let mut data = crypto::sha256(rp_id.as_bytes()).to_vec();
        data.push(self.flags(true));
        data.extend_from_slice(&counter.to_be_bytes());
        data.extend_from_slice(&self.aaguid);
        let id_len = u16::try_from(self.credential_id.len())
            .map_err(|_| PipelineError::EncodingError("credential ID too long".to_string()))?;
        data.extend_from_slice(&id_len.to_be_bytes());
        data.extend_from_slice(&self.credential_id);
        data.extend_from_slice(&self.cose_key()?);
        Ok(data)
    }

    /// Authenticator data for an assertion
    #[must_use]
    pub fn assertion_auth_data(&self, rp_id: &str, counter: u32) -> Vec<u8> {
        let mut data = crypto::sha256(rp_id.as_bytes()).to_vec();
        data.push(self.flags(false));
        data.extend_from_slice(&counter.to_be_bytes());
        data
    }

    /// Sign with the credential key
    ///
    /// # Errors
    /// Returns an error if signing fails
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, PipelineError> {
        Self::sign_with(&self.key, data)
    }

    /// SHA-256 signature with an arbitrary key (DER for ECDSA)
    ///
    /// # Errors
    /// Returns an error if signing fails
    pub fn sign_with(key: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    /// `packed` attestation object signed by the credential key itself
    ///
    /// # Errors
    /// Returns an error if encoding or signing fails
    pub fn packed_self_attestation(
        &self,
        rp_id: &str,
        client_data_json: &[u8],
    ) -> Result<Vec<u8>, PipelineError> {
        let auth_data = self.registration_auth_data(rp_id, self.counter)?;
        let mut signed = auth_data.clone();
        signed.extend_from_slice(&crypto::sha256(client_data_json));
        Ok(AttestationObjectBuilder::new("packed", &auth_data)
            .int("alg", CoseAlgorithm::ES256.identifier())
            .bytes("sig", self.sign(&signed)?)
            .build())
    }

    /// Serialized client data for a ceremony
    ///
    /// # Errors
    /// Returns an error if serialization fails
    pub fn client_data_json(
        ceremony: &str,
        challenge: &str,
        origin: &str,
    ) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(&CollectedClientData {
            r#type: ceremony.to_string(),
            challenge: challenge.to_string(),
            origin: origin.to_string(),
            cross_origin: None,
        })?)
    }

    /// Wrap an attestation object and client data into a response
    #[must_use]
    pub fn registration_response(
        &self,
        client_data_json: &[u8],
        attestation_object: &[u8],
    ) -> RegistrationResponse {
        let id = self.credential_id();
        RegistrationResponse {
            id: id.clone(),
            raw_id: id,
            response: AuthenticatorAttestationResponse {
                client_data_json: crypto::base64url_encode(client_data_json),
                attestation_object: crypto::base64url_encode(attestation_object),
                transports: Vec::new(),
            },
            authenticator_attachment: None,
            client_extension_results: None,
            r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
        }
    }

    /// Answer registration options with a `none` attestation
    ///
    /// # Errors
    /// Returns an error if encoding fails
    pub fn register(
        &self,
        options: &RegistrationOptions,
        origin: &str,
    ) -> Result<RegistrationResponse, PipelineError> {
        let client_data = Self::client_data_json(CEREMONY_CREATE, &options.challenge, origin)?;
        let auth_data = self.registration_auth_data(&options.rp.id, self.counter)?;
        let object = AttestationObjectBuilder::none(&auth_data).build();
        Ok(self.registration_response(&client_data, &object))
    }

    /// Answer registration options with a self-signed `packed` attestation
    ///
    /// # Errors
    /// Returns an error if encoding or signing fails
    pub fn register_packed(
        &self,
        options: &RegistrationOptions,
        origin: &str,
    ) -> Result<RegistrationResponse, PipelineError> {
        let client_data = Self::client_data_json(CEREMONY_CREATE, &options.challenge, origin)?;
        let object = self.packed_self_attestation(&options.rp.id, &client_data)?;
        Ok(self.registration_response(&client_data, &object))
    }

    /// Produce an assertion, advancing the signature counter
    ///
    /// # Errors
    /// Returns an error if signing fails
    pub fn assert(
        &mut self,
        options: &AuthenticationOptions,
        origin: &str,
        user_id: &str,
    ) -> Result<AuthenticationResponse, PipelineError> {
        self.counter += 1;
        self.assert_with_counter(options, origin, user_id, self.counter)
    }

    /// Produce an assertion reporting an explicit counter
    ///
    /// # Errors
    /// Returns an error if signing fails
    pub fn assert_with_counter(
        &self,
        options: &AuthenticationOptions,
        origin: &str,
        user_id: &str,
        counter: u32,
    ) -> Result<AuthenticationResponse, PipelineError> {
        let client_data = Self::client_data_json(CEREMONY_GET, &options.challenge, origin)?;
        let auth_data = self.assertion_auth_data(&options.rp_id, counter);
        let mut signed = auth_data.clone();
        signed.extend_from_slice(&crypto::sha256(&client_data));

        let id = self.credential_id();
        Ok(AuthenticationResponse {
            id: id.clone(),
            raw_id: id,
            response: AuthenticatorAssertionResponse {
                client_data_json: crypto::base64url_encode(&client_data),
                authenticator_data: crypto::base64url_encode(&auth_data),
                signature: crypto::base64url_encode(&self.sign(&signed)?),
                user_handle: Some(crypto::base64url_encode(user_id.as_bytes())),
            },
            authenticator_attachment: None,
            client_extension_results: None,
            r#type: PUBLIC_KEY_CREDENTIAL_TYPE.to_string(),
        })
    }
}
