use crate::error::Error;
use crate::session::NativeSession;
use fleetlink_model::MessageFault;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use p256::pkcs8::DecodePrivateKey as _;
use p256::{PublicKey, SecretKey, ecdh};
use rand_core::CryptoRngCore;
use std::fmt;

/// Capability handle over a static ECDH private key on P-256.
pub trait PrivateKey: Send + Sync {
    /// Derives the shared session with the peer holding `peer_public`
    /// (uncompressed SEC1 bytes). Off-curve and identity points are
    /// rejected.
    fn exchange(&self, peer_public: &[u8]) -> Result<NativeSession, Error>;

    /// The local public key as an uncompressed SEC1 point (65 bytes).
    fn public_bytes(&self) -> Vec<u8>;

    /// Schnorr signature over `message`. Interactive commands never use
    /// this; it exists for the JWS signing helper.
    fn schnorr_sign(&self, message: &[u8]) -> Result<Vec<u8>, Error>;
}

/// An in-process software key.
pub struct SoftwareKey {
    secret: SecretKey,
    public_bytes: Vec<u8>,
}

impl SoftwareKey {
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        Self::from_secret(SecretKey::random(rng))
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, Error> {
        SecretKey::from_pkcs8_pem(pem)
            .map(Self::from_secret)
            .map_err(|_| Error::new(MessageFault::Decoding))
    }

    pub fn from_sec1_pem(pem: &str) -> Result<Self, Error> {
        SecretKey::from_sec1_pem(pem)
            .map(Self::from_secret)
            .map_err(|_| Error::new(MessageFault::Decoding))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public_bytes = secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        Self {
            secret,
            public_bytes,
        }
    }
}

impl PrivateKey for SoftwareKey {
    fn exchange(&self, peer_public: &[u8]) -> Result<NativeSession, Error> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|_| Error::new(MessageFault::BadParameter))?;

        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        Ok(NativeSession::new(
            shared.raw_secret_bytes().as_slice(),
            self.public_bytes.clone(),
        ))
    }

    fn public_bytes(&self) -> Vec<u8> {
        self.public_bytes.clone()
    }

    fn schnorr_sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        super::schnorr::sign(&self.secret, message)
    }
}

impl fmt::Debug for SoftwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The scalar stays out of logs.
        f.debug_tuple("SoftwareKey")
            .field(&hex::encode(&self.public_bytes))
            .finish()
    }
}
