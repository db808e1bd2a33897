//! The client-side end of a session: stamps outgoing commands with epoch,
//! counter and expiry, and (re)synchronizes from verifier-signed session
//! info.

use crate::crypto::PrivateKey;
use crate::error::Error;
use crate::metadata::{CommandContext, Metadata, SignatureType};
use crate::peer::{EPOCH_ID_LENGTH, EPOCH_LENGTH, Peer};
use crate::session::AUTHENTICATED_COMMAND_LABEL;
use crate::wire;
use crate::wire::{RoutedMessage, SessionInfo};
use fleetlink_model::MessageFault;
use prost::Message as _;
use std::time::{Duration, Instant, SystemTime};
use subtle::ConstantTimeEq as _;

pub struct Signer {
    peer: Peer,
    /// The verifier key this session was established against. Session info
    /// naming any other key is not ours to apply.
    verifier_public: Vec<u8>,
    /// The verifier clock snapshot most recently adopted; stale session
    /// info (an older snapshot within the same epoch) must not roll the
    /// counter back.
    set_time: u32,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("verifier_public", &self.verifier_public)
            .field("set_time", &self.set_time)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new_from_session_info(
        private_key: &dyn PrivateKey,
        verifier_id: &[u8],
        info: &SessionInfo,
        now: Instant,
    ) -> Result<Self, Error> {
        Self::from_info(private_key, verifier_id, info, Duration::ZERO, now)
    }

    /// Builds a signer from encoded session info after checking its HMAC
    /// against `challenge` in constant time.
    pub fn new_authenticated(
        private_key: &dyn PrivateKey,
        verifier_id: &[u8],
        challenge: &[u8],
        encoded_info: &[u8],
        tag: &[u8],
        now: Instant,
    ) -> Result<Self, Error> {
        let info =
            SessionInfo::decode(encoded_info).map_err(|_| Error::new(MessageFault::Decoding))?;
        let signer = Self::from_info(private_key, verifier_id, &info, Duration::ZERO, now)?;

        let expected = signer
            .peer
            .session
            .session_info_hmac(verifier_id, challenge, encoded_info);
        if !bool::from(expected.ct_eq(tag)) {
            return Err(Error::new(MessageFault::InvalidSignature));
        }

        Ok(signer)
    }

    /// Restores a signer from session info exported at `generated_at`,
    /// advancing the epoch clock by the wall time elapsed since.
    pub fn import(
        private_key: &dyn PrivateKey,
        verifier_id: &[u8],
        encoded_info: &[u8],
        generated_at: SystemTime,
        now: Instant,
        wall: SystemTime,
    ) -> Result<Self, Error> {
        let info =
            SessionInfo::decode(encoded_info).map_err(|_| Error::new(MessageFault::Decoding))?;
        let age = wall.duration_since(generated_at).unwrap_or(Duration::ZERO);

        Self::from_info(private_key, verifier_id, &info, age, now)
    }

    fn from_info(
        private_key: &dyn PrivateKey,
        verifier_id: &[u8],
        info: &SessionInfo,
        age: Duration,
        now: Instant,
    ) -> Result<Self, Error> {
        let session = private_key.exchange(&info.public_key)?;
        let epoch: [u8; EPOCH_ID_LENGTH] = info
            .epoch
            .as_slice()
            .try_into()
            .map_err(|_| Error::new(MessageFault::Decoding))?;

        let clock_offset = Duration::from_secs(u64::from(info.clock_time)) + age;
        let peer = Peer::new(
            verifier_id,
            epoch,
            info.counter,
            now,
            clock_offset,
            Box::new(session),
        )?;

        Ok(Self {
            peer,
            verifier_public: info.public_key.clone(),
            set_time: info.clock_time,
        })
    }

    /// Serializes the current state so a cache can resume the session
    /// without a handshake round trip.
    pub fn export_session_info(&self, now: Instant) -> Vec<u8> {
        SessionInfo {
            counter: self.peer.counter,
            public_key: self.verifier_public.clone(),
            epoch: self.peer.epoch.to_vec(),
            clock_time: self.peer.seconds_at(now),
            status: wire::SessionInfoStatus::Ok as i32,
        }
        .encode_to_vec()
    }

    /// Applies encoded session info after checking its HMAC against
    /// `challenge` in constant time.
    pub fn update_signed_session_info(
        &mut self,
        challenge: &[u8],
        encoded_info: &[u8],
        tag: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let expected =
            self.peer
                .session
                .session_info_hmac(&self.peer.verifier_id, challenge, encoded_info);
        if !bool::from(expected.ct_eq(tag)) {
            return Err(Error::new(MessageFault::InvalidSignature));
        }

        let info =
            SessionInfo::decode(encoded_info).map_err(|_| Error::new(MessageFault::Decoding))?;

        self.update_session_info(&info, now)
    }

    /// Adopts the verifier's snapshot.
    ///
    /// A new epoch is a fresh counter space and is adopted wholesale.
    /// Within the current epoch, only snapshots at least as recent as the
    /// last one applied are honored, and the counter never moves backward.
    pub fn update_session_info(&mut self, info: &SessionInfo, now: Instant) -> Result<(), Error> {
        if info.public_key != self.verifier_public {
            return Err(Error::new(MessageFault::UnknownKeyId));
        }

        let epoch: [u8; EPOCH_ID_LENGTH] = info
            .epoch
            .as_slice()
            .try_into()
            .map_err(|_| Error::new(MessageFault::Decoding))?;

        if epoch != self.peer.epoch {
            tracing::debug!("Adopting new epoch from session info");
            self.peer.counter = info.counter;
        } else if self.set_time <= info.clock_time {
            self.peer.counter = self.peer.counter.max(info.counter);
        } else {
            return Ok(());
        }

        self.peer.epoch = epoch;
        self.peer.time_zero = now;
        self.peer.clock_offset = Duration::from_secs(u64::from(info.clock_time));
        self.set_time = info.clock_time;

        Ok(())
    }

    /// Seals `message`'s command payload under AES-GCM.
    pub fn encrypt(
        &mut self,
        message: &mut RoutedMessage,
        expires_in: Duration,
        now: Instant,
    ) -> Result<(), Error> {
        self.seal(message, expires_in, now, SignatureType::AesGcmPersonalized)
    }

    /// Authenticates `message` without encrypting it, for paths where an
    /// intermediary must inspect the command.
    pub fn authorize_hmac(
        &mut self,
        message: &mut RoutedMessage,
        expires_in: Duration,
        now: Instant,
    ) -> Result<(), Error> {
        self.seal(message, expires_in, now, SignatureType::HmacPersonalized)
    }

    fn seal(
        &mut self,
        message: &mut RoutedMessage,
        expires_in: Duration,
        now: Instant,
        signature_type: SignatureType,
    ) -> Result<(), Error> {
        if expires_in > EPOCH_LENGTH {
            return Err(Error::new(MessageFault::BadParameter));
        }
        if self.peer.counter == u32::MAX {
            // Counter space exhausted; only fresh session info helps.
            return Err(Error::new(MessageFault::InvalidTokenOrCounter));
        }

        let domain = message
            .to_domain()
            .ok_or_else(|| Error::new(MessageFault::BadParameter))?;
        let payload = message
            .command()
            .ok_or_else(|| Error::new(MessageFault::BadParameter))?
            .to_vec();

        let counter = self.peer.counter + 1;
        let expires_at = self
            .peer
            .seconds_at(now)
            .saturating_add(expires_in.as_secs().min(u64::from(u32::MAX)) as u32);

        let context = CommandContext {
            signature_type,
            domain,
            verifier_id: &self.peer.verifier_id,
            epoch: &self.peer.epoch,
            expires_at,
            counter,
            flags: message.flags,
        };

        let signature = match signature_type {
            SignatureType::AesGcmPersonalized => {
                let mut meta = Metadata::new();
                context.fill(&mut meta);
                let associated_data = meta.checksum(&[]);

                let sealed = self.peer.session.encrypt(&payload, &associated_data)?;

                message.payload = Some(wire::Payload::Command(sealed.ciphertext));

                wire::SigType::AesGcmPersonalized(wire::AesGcmPersonalizedSignature {
                    epoch: self.peer.epoch.to_vec(),
                    nonce: sealed.nonce.to_vec(),
                    counter,
                    expires_at,
                    tag: sealed.tag.to_vec(),
                })
            }
            SignatureType::HmacPersonalized => {
                let mut meta = Metadata::keyed(
                    self.peer.session.message_hmac(AUTHENTICATED_COMMAND_LABEL),
                );
                context.fill(&mut meta);
                let tag = meta.checksum(&payload);

                // The payload stays in the clear.
                wire::SigType::HmacPersonalized(wire::HmacPersonalizedSignature {
                    epoch: self.peer.epoch.to_vec(),
                    counter,
                    expires_at,
                    tag: tag.to_vec(),
                })
            }
            SignatureType::SessionInfoTag => unreachable!("not a command scheme"),
        };

        message.signature_data = Some(wire::SignatureData {
            signer_identity: Some(wire::KeyIdentity {
                identity_type: Some(wire::IdentityType::PublicKey(
                    self.peer.session.local_public_bytes().to_vec(),
                )),
            }),
            sig_type: Some(signature),
        });

        self.peer.counter = counter;

        Ok(())
    }

    pub fn counter(&self) -> u32 {
        self.peer.counter
    }

    pub fn epoch(&self) -> &[u8; 16] {
        &self.peer.epoch
    }

    // Should only be used for unit-testing.
    pub fn force_counter(&mut self, counter: u32) {
        self.peer.counter = counter;
    }
}
