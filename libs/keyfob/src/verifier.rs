//! The vehicle-side end of a session: holds the authoritative epoch,
//! counter and replay window, and validates incoming commands.

use crate::crypto::PrivateKey;
use crate::error::{Error, SignedSessionInfo};
use crate::metadata::{CommandContext, Metadata, SignatureType};
use crate::peer::{
    EPOCH_ID_LENGTH, EPOCH_LENGTH, MAX_SECONDS_WITHOUT_COUNTER, Peer,
};
use crate::session::{AUTHENTICATED_COMMAND_LABEL, Session};
use crate::window::ReplayWindow;
use crate::wire;
use crate::wire::RoutedMessage;
use fleetlink_model::{Domain, MessageFault};
use prost::Message as _;
use rand_core::CryptoRngCore;
use std::time::{Duration, Instant, SystemTime};
use subtle::ConstantTimeEq as _;

/// Wall/monotonic divergence beyond this means the clock is not merely
/// drifting but broken; start a fresh epoch instead of compensating.
const MAX_CLOCK_DRIFT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Divergence below this is measurement noise, not a suspension.
const SUSPEND_GRACE: Duration = Duration::from_secs(1);

pub struct Verifier {
    peer: Peer,
    domain: Domain,
    window: ReplayWindow,
    /// Wall-clock timestamp of `peer.time_zero`, for suspension detection.
    wall_zero: SystemTime,
    rng: Box<dyn CryptoRngCore + Send>,
    /// Set when the RNG fails; the verifier refuses everything from then on.
    locked: bool,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("domain", &self.domain)
            .field("wall_zero", &self.wall_zero)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl Verifier {
    /// Derives the session with the signer holding `signer_public` and
    /// starts a fresh epoch.
    pub fn new(
        private_key: &dyn PrivateKey,
        verifier_id: &[u8],
        domain: Domain,
        signer_public: &[u8],
        now: Instant,
        wall: SystemTime,
    ) -> Result<Self, Error> {
        let session = private_key.exchange(signer_public)?;

        Self::with_rng(
            Box::new(rand::rngs::OsRng),
            Box::new(session),
            verifier_id,
            domain,
            now,
            wall,
        )
    }

    pub(crate) fn with_rng(
        mut rng: Box<dyn CryptoRngCore + Send>,
        session: Box<dyn Session>,
        verifier_id: &[u8],
        domain: Domain,
        now: Instant,
        wall: SystemTime,
    ) -> Result<Self, Error> {
        let mut epoch = [0u8; EPOCH_ID_LENGTH];
        rng.try_fill_bytes(&mut epoch)
            .map_err(|_| Error::new(MessageFault::Internal))?;

        let peer = Peer::new(verifier_id, epoch, 0, now, Duration::ZERO, session)?;

        Ok(Self {
            peer,
            domain,
            window: ReplayWindow::default(),
            wall_zero: wall,
            rng,
            locked: false,
        })
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn epoch(&self) -> &[u8; 16] {
        &self.peer.epoch
    }

    pub fn counter(&self) -> u32 {
        self.peer.counter
    }

    /// The current session snapshot, deterministically encoded.
    pub fn session_info(&self, now: Instant) -> Vec<u8> {
        wire::SessionInfo {
            counter: self.peer.counter,
            public_key: self.peer.session.local_public_bytes().to_vec(),
            epoch: self.peer.epoch.to_vec(),
            clock_time: self.peer.seconds_at(now),
            status: wire::SessionInfoStatus::Ok as i32,
        }
        .encode_to_vec()
    }

    /// The snapshot plus its HMAC, bound to the requester's `challenge`.
    pub fn signed_session_info(&self, challenge: &[u8], now: Instant) -> SignedSessionInfo {
        let encoded_info = self.session_info(now);
        let tag =
            self.peer
                .session
                .session_info_hmac(&self.peer.verifier_id, challenge, &encoded_info);

        SignedSessionInfo { encoded_info, tag }
    }

    /// Attaches authenticated session info to an outbound reply envelope.
    pub fn set_session_info(&self, challenge: &[u8], message: &mut RoutedMessage, now: Instant) {
        let info = self.signed_session_info(challenge, now);

        message.payload = Some(wire::Payload::SessionInfo(info.encoded_info));
        message.signature_data = Some(wire::SignatureData {
            signer_identity: None,
            sig_type: Some(wire::SigType::SessionInfoTag(wire::HmacSignature {
                tag: info.tag.to_vec(),
            })),
        });
    }

    /// Starts a new epoch now, discarding the counter space. Callers use
    /// this after an external clock anomaly; internally it also runs on
    /// counter exhaustion and epoch expiry.
    pub fn force_rotate(&mut self, now: Instant, wall: SystemTime) -> Result<(), Error> {
        self.rotate(now, wall)
    }

    /// Validates `message` and returns its plaintext.
    ///
    /// State only advances on success. Rejections that may stem from the
    /// signer holding a stale view of the session carry fresh signed
    /// session info over the message uuid.
    pub fn verify(
        &mut self,
        message: &RoutedMessage,
        now: Instant,
        wall: SystemTime,
    ) -> Result<Vec<u8>, Error> {
        if self.locked {
            return Err(Error::new(MessageFault::Internal));
        }

        self.adjust_clock(now, wall)?;
        if self.peer.counter == u32::MAX
            || u64::from(self.peer.seconds_at(now)) >= EPOCH_LENGTH.as_secs()
        {
            self.rotate(now, wall)?;
        }

        let challenge = message.uuid.as_slice();

        let signature_data = message
            .signature_data
            .as_ref()
            .ok_or_else(|| Error::new(MessageFault::BadParameter))?;

        let (signature_type, epoch, counter, expires_at) = match &signature_data.sig_type {
            Some(wire::SigType::AesGcmPersonalized(data)) => (
                SignatureType::AesGcmPersonalized,
                data.epoch.as_slice(),
                data.counter,
                data.expires_at,
            ),
            Some(wire::SigType::HmacPersonalized(data)) => (
                SignatureType::HmacPersonalized,
                data.epoch.as_slice(),
                data.counter,
                data.expires_at,
            ),
            Some(wire::SigType::SessionInfoTag(_)) | None => {
                return Err(Error::new(MessageFault::BadParameter));
            }
        };

        let routed_domain = match message.to.as_ref().and_then(wire::Destination::as_domain) {
            Some(domain) => domain,
            // Commands target domains; a routing address here is a
            // misrouted reply, not something we can authenticate.
            None => return Err(Error::new(MessageFault::InvalidDomains)),
        };
        if self.domain != Domain::Broadcast && routed_domain != self.domain {
            return Err(Error::new(MessageFault::InvalidDomains));
        }

        if !bool::from(epoch.ct_eq(&self.peer.epoch)) {
            return Err(self.desync(MessageFault::IncorrectEpoch, challenge, now));
        }

        let now_seconds = self.peer.seconds_at(now);
        if u64::from(expires_at) > EPOCH_LENGTH.as_secs() {
            return Err(Error::new(MessageFault::BadParameter));
        }
        if expires_at != 0 && expires_at < now_seconds {
            return Err(self.desync(MessageFault::TimeExpired, challenge, now));
        }

        // Messages that bypass or trail the replay counter get a short
        // leash instead: they must expire within a few seconds.
        if counter == 0 || counter < self.peer.counter {
            let time_to_live = expires_at.saturating_sub(now_seconds);
            if time_to_live == 0 || time_to_live > MAX_SECONDS_WITHOUT_COUNTER {
                return Err(self.desync(MessageFault::TimeToLiveTooLong, challenge, now));
            }
        }

        let payload = message
            .command()
            .ok_or_else(|| Error::new(MessageFault::BadParameter))?;

        let context = CommandContext {
            signature_type,
            domain: routed_domain,
            verifier_id: &self.peer.verifier_id,
            epoch,
            expires_at,
            counter,
            flags: message.flags,
        };

        let plaintext = match &signature_data.sig_type {
            Some(wire::SigType::AesGcmPersonalized(data)) => {
                let mut meta = Metadata::new();
                context.fill(&mut meta);
                let associated_data = meta.checksum(&[]);

                self.peer
                    .session
                    .decrypt(&data.nonce, payload, &associated_data, &data.tag)
                    .map_err(|_| self.desync(MessageFault::InvalidSignature, challenge, now))?
            }
            Some(wire::SigType::HmacPersonalized(data)) => {
                let mut meta = Metadata::keyed(
                    self.peer.session.message_hmac(AUTHENTICATED_COMMAND_LABEL),
                );
                context.fill(&mut meta);
                let expected = meta.checksum(payload);

                if !bool::from(expected.ct_eq(data.tag.as_slice())) {
                    return Err(self.desync(MessageFault::InvalidSignature, challenge, now));
                }

                payload.to_vec()
            }
            Some(wire::SigType::SessionInfoTag(_)) | None => unreachable!("checked above"),
        };

        if counter > 0 {
            let mut window = self.window;
            if window.update(counter).is_err() {
                return Err(self.desync(MessageFault::InvalidTokenOrCounter, challenge, now));
            }

            self.window = window;
            self.peer.counter = window.high_watermark();
        }

        Ok(plaintext)
    }

    fn desync(&self, fault: MessageFault, challenge: &[u8], now: Instant) -> Error {
        Error::desync(fault, self.signed_session_info(challenge, now))
    }

    fn rotate(&mut self, now: Instant, wall: SystemTime) -> Result<(), Error> {
        let mut epoch = [0u8; EPOCH_ID_LENGTH];
        if self.rng.try_fill_bytes(&mut epoch).is_err() {
            // Without randomness we can never mint a usable epoch again.
            self.locked = true;
            self.peer.counter = u32::MAX;
            return Err(Error::new(MessageFault::Internal));
        }

        tracing::debug!(domain = %self.domain, "Starting new epoch");

        self.peer.epoch = epoch;
        self.peer.counter = 0;
        self.peer.time_zero = now;
        self.peer.clock_offset = Duration::ZERO;
        self.wall_zero = wall;
        self.window = ReplayWindow::default();

        Ok(())
    }

    /// Reconciles the wall clock with the monotonic epoch clock.
    ///
    /// A suspension freezes the monotonic clock while the wall clock runs
    /// on; compensating advances the epoch clock by the gap so pending
    /// expiries fire early. Never compensate the other direction: whoever
    /// controls NTP must only be able to shorten a command's life, not
    /// extend it.
    fn adjust_clock(&mut self, now: Instant, wall: SystemTime) -> Result<(), Error> {
        // What the epoch clock reads, including earlier compensations.
        let epoch_clock =
            self.peer.clock_offset + now.saturating_duration_since(self.peer.time_zero);

        match wall.duration_since(self.wall_zero) {
            Ok(elapsed) if elapsed > epoch_clock + MAX_CLOCK_DRIFT => self.rotate(now, wall),
            Ok(elapsed) if epoch_clock > elapsed + MAX_CLOCK_DRIFT => self.rotate(now, wall),
            Ok(elapsed) if elapsed > epoch_clock + SUSPEND_GRACE => {
                let gap = elapsed - epoch_clock;
                tracing::debug!(?gap, "Compensating for process suspension");
                self.peer.clock_offset += gap;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(behind) if behind.duration() + epoch_clock > MAX_CLOCK_DRIFT => {
                self.rotate(now, wall)
            }
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NativeSession;
    use rand::rngs::OsRng;

    struct FailingRng;

    impl rand_core::RngCore for FailingRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, _: &mut [u8]) {
            unimplemented!("only the fallible path is exercised")
        }

        fn try_fill_bytes(&mut self, _: &mut [u8]) -> Result<(), rand_core::Error> {
            Err(rand_core::Error::new("entropy source went away"))
        }
    }

    impl rand_core::CryptoRng for FailingRng {}

    fn session() -> Box<dyn Session> {
        Box::new(NativeSession::new(&[9u8; 32], vec![4u8; 65]))
    }

    #[test]
    fn construction_requires_entropy() {
        let err = Verifier::with_rng(
            Box::new(FailingRng),
            session(),
            b"testVIN-1234",
            Domain::VehicleSecurity,
            Instant::now(),
            SystemTime::now(),
        )
        .unwrap_err();

        assert_eq!(err.fault(), MessageFault::Internal);
    }

    #[test]
    fn rng_failure_after_construction_locks_the_verifier() {
        let now = Instant::now();
        let wall = SystemTime::now();

        let mut verifier = Verifier::with_rng(
            Box::new(OsRng),
            session(),
            b"testVIN-1234",
            Domain::VehicleSecurity,
            now,
            wall,
        )
        .unwrap();
        verifier.rng = Box::new(FailingRng);

        assert_eq!(
            verifier.force_rotate(now, wall).unwrap_err().fault(),
            MessageFault::Internal
        );

        // Locked for good, even for well-formed messages.
        let message = RoutedMessage::default();
        assert_eq!(
            verifier.verify(&message, now, wall).unwrap_err().fault(),
            MessageFault::Internal
        );
        assert_eq!(verifier.counter(), u32::MAX);
    }

    #[test]
    fn oversized_verifier_id_is_rejected() {
        let err = Verifier::with_rng(
            Box::new(OsRng),
            session(),
            &[0u8; 256],
            Domain::VehicleSecurity,
            Instant::now(),
            SystemTime::now(),
        )
        .unwrap_err();

        assert_eq!(err.fault(), MessageFault::BadParameter);
    }
}
