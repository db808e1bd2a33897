//! The derived per-peer session: one shared AES-128-GCM key plus labeled
//! HMAC subkeys, all rooted in a single ECDH agreement.

use crate::error::Error;
use crate::metadata::{HmacSha256, Metadata, SignatureType, Tag};
use fleetlink_model::MessageFault;
use hmac::Mac as _;
use rand::RngCore as _;
use rand::rngs::OsRng;
use sha1::{Digest as _, Sha1};

use aes_gcm::aead::AeadInPlace as _;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce, Tag as GcmTag};

/// Key label for the session-info authentication subkey.
pub const SESSION_INFO_LABEL: &[u8] = b"session info";

/// Key label for the HMAC-personalized message mode.
pub const AUTHENTICATED_COMMAND_LABEL: &[u8] = b"authenticated command";

pub const NONCE_LENGTH: usize = 12;
pub const GCM_TAG_LENGTH: usize = 16;

/// What a session can do.
///
/// Deliberately a capability set rather than a key: consumers can seal,
/// open and authenticate, but never observe the shared secret. The single
/// production implementation is [`NativeSession`].
pub trait Session: Send + Sync {
    /// Seals `plaintext` under a fresh random nonce.
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Sealed, Error>;

    /// Opens a sealed message. Any AEAD failure, including malformed nonce
    /// or tag lengths, reports an invalid signature.
    fn decrypt(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Authentication tag over encoded session info, bound to the
    /// verifier id and the requester's challenge.
    fn session_info_hmac(
        &self,
        verifier_id: &[u8],
        challenge: &[u8],
        encoded_info: &[u8],
    ) -> [u8; 32];

    /// An HMAC context keyed by `HMAC(shared_key, label)`.
    fn message_hmac(&self, label: &[u8]) -> HmacSha256;

    /// The local party's uncompressed SEC1 public key.
    fn local_public_bytes(&self) -> &[u8];
}

/// Output of [`Session::encrypt`]; nonce and tag travel in the signature
/// data, not in the ciphertext.
pub struct Sealed {
    pub nonce: [u8; NONCE_LENGTH],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; GCM_TAG_LENGTH],
}

pub struct NativeSession {
    shared_key: [u8; 16],
    cipher: Aes128Gcm,
    local_public: Vec<u8>,
}

impl std::fmt::Debug for NativeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeSession")
            .field("local_public", &self.local_public)
            .finish_non_exhaustive()
    }
}

impl NativeSession {
    /// `shared_x` is the X coordinate of the ECDH shared point. The AES
    /// key is SHA-1 of it, truncated; SHA-1 here is mandated by deployed
    /// vehicles and appears nowhere else in the protocol.
    pub(crate) fn new(shared_x: &[u8], local_public: Vec<u8>) -> Self {
        let digest = Sha1::digest(shared_x);
        let mut shared_key = [0u8; 16];
        shared_key.copy_from_slice(&digest[..16]);

        let cipher = Aes128Gcm::new_from_slice(&shared_key).expect("16 bytes is a valid AES key");

        Self {
            shared_key,
            cipher,
            local_public,
        }
    }

    fn subkey(&self, label: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(&self.shared_key)
            .expect("HMAC can take key of any size");
        mac.update(label);
        let key = mac.finalize().into_bytes();

        <HmacSha256 as KeyInit>::new_from_slice(&key).expect("HMAC can take key of any size")
    }
}

impl Session for NativeSession {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Sealed, Error> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|_| Error::new(MessageFault::Internal))?;

        let mut ciphertext = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), associated_data, &mut ciphertext)
            .map_err(|_| Error::new(MessageFault::Internal))?;

        let mut tag_bytes = [0u8; GCM_TAG_LENGTH];
        tag_bytes.copy_from_slice(&tag);

        Ok(Sealed {
            nonce,
            ciphertext,
            tag: tag_bytes,
        })
    }

    fn decrypt(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if nonce.len() != NONCE_LENGTH || tag.len() != GCM_TAG_LENGTH {
            return Err(Error::new(MessageFault::InvalidSignature));
        }

        let mut plaintext = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                associated_data,
                &mut plaintext,
                GcmTag::from_slice(tag),
            )
            .map_err(|_| Error::new(MessageFault::InvalidSignature))?;

        Ok(plaintext)
    }

    fn session_info_hmac(
        &self,
        verifier_id: &[u8],
        challenge: &[u8],
        encoded_info: &[u8],
    ) -> [u8; 32] {
        let mut meta = Metadata::keyed(self.subkey(SESSION_INFO_LABEL));
        meta.add(
            Tag::SignatureType,
            &[SignatureType::SessionInfoTag as u8],
        );
        meta.add(Tag::Personalization, verifier_id);
        meta.add(Tag::Challenge, challenge);

        meta.checksum(encoded_info)
    }

    fn message_hmac(&self, label: &[u8]) -> HmacSha256 {
        self.subkey(label)
    }

    fn local_public_bytes(&self) -> &[u8] {
        &self.local_public
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> NativeSession {
        NativeSession::new(&[0x42u8; 32], vec![4u8; 65])
    }

    #[test]
    fn seal_open_round_trip() {
        let session = session();

        let sealed = session.encrypt(b"flash hazards", b"aad").unwrap();
        let opened = session
            .decrypt(&sealed.nonce, &sealed.ciphertext, b"aad", &sealed.tag)
            .unwrap();

        assert_eq!(opened, b"flash hazards");
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let session = session();

        let a = session.encrypt(b"x", b"").unwrap();
        let b = session.encrypt(b"x", b"").unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_associated_data_is_an_invalid_signature() {
        let session = session();

        let sealed = session.encrypt(b"unlock", b"aad").unwrap();
        let err = session
            .decrypt(&sealed.nonce, &sealed.ciphertext, b"bad", &sealed.tag)
            .unwrap_err();

        assert_eq!(err.fault(), MessageFault::InvalidSignature);
    }

    #[test]
    fn malformed_nonce_is_an_invalid_signature() {
        let session = session();
        let sealed = session.encrypt(b"unlock", b"").unwrap();

        let err = session
            .decrypt(&[0u8; 4], &sealed.ciphertext, b"", &sealed.tag)
            .unwrap_err();

        assert_eq!(err.fault(), MessageFault::InvalidSignature);
    }

    #[test]
    fn key_schedule_matches_the_deployed_kdf() {
        // SHA-1 truncated to 16 bytes over the shared X coordinate; two
        // sessions from the same X agree on everything.
        let a = NativeSession::new(&[7u8; 32], vec![]);
        let b = NativeSession::new(&[7u8; 32], vec![]);

        let sealed = a.encrypt(b"honk", b"meta").unwrap();
        assert_eq!(
            b.decrypt(&sealed.nonce, &sealed.ciphertext, b"meta", &sealed.tag)
                .unwrap(),
            b"honk"
        );

        assert_eq!(
            a.session_info_hmac(b"vin", b"challenge", b"info"),
            b.session_info_hmac(b"vin", b"challenge", b"info"),
        );
    }
}
