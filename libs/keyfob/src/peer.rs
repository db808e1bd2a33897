//! State shared by both ends of a session.

use crate::error::Error;
use crate::session::Session;
use fleetlink_model::MessageFault;
use std::time::{Duration, Instant};

/// Upper bound on an epoch's lifetime. Rotation is primarily
/// counter-driven; the bound keeps `expires_at` arithmetic inside a u32.
pub(crate) const EPOCH_LENGTH: Duration = Duration::from_secs(1 << 30);

/// TTL ceiling for messages that opt out of the replay counter.
pub(crate) const MAX_SECONDS_WITHOUT_COUNTER: u32 = 30;

/// Verifier ids must fit a metadata length byte.
pub(crate) const MAX_VERIFIER_ID_LENGTH: usize = 255;

pub(crate) const EPOCH_ID_LENGTH: usize = 16;

pub(crate) struct Peer {
    pub verifier_id: Vec<u8>,
    pub epoch: [u8; EPOCH_ID_LENGTH],
    pub counter: u32,
    /// Local monotonic reference for the epoch clock.
    pub time_zero: Instant,
    /// What the epoch clock already read at `time_zero`. Zero on the
    /// verifier at rotation; the signer seeds it from session info, and
    /// suspension compensation only ever grows it.
    pub clock_offset: Duration,
    pub session: Box<dyn Session>,
}

impl Peer {
    pub fn new(
        verifier_id: &[u8],
        epoch: [u8; EPOCH_ID_LENGTH],
        counter: u32,
        time_zero: Instant,
        clock_offset: Duration,
        session: Box<dyn Session>,
    ) -> Result<Self, Error> {
        if verifier_id.len() > MAX_VERIFIER_ID_LENGTH {
            return Err(Error::new(MessageFault::BadParameter));
        }

        Ok(Self {
            verifier_id: verifier_id.to_vec(),
            epoch,
            counter,
            time_zero,
            clock_offset,
            session,
        })
    }

    /// Seconds since the epoch started, saturating at the ends.
    pub fn seconds_at(&self, now: Instant) -> u32 {
        let elapsed = self.clock_offset + now.saturating_duration_since(self.time_zero);

        elapsed.as_secs().min(u64::from(u32::MAX)) as u32
    }
}
