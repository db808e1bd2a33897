//! Shared vocabulary between the protocol core and the dispatcher.
//!
//! Everything in here is wire-stable: the numeric values of [`Domain`] and
//! [`MessageFault`] appear inside signed metadata and must never be reused
//! for a different meaning.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A logical subsystem inside a vehicle.
///
/// Each domain maintains an independent authentication session; a message
/// routed to one domain is meaningless to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Domain {
    Broadcast = 0,
    VehicleSecurity = 2,
    Infotainment = 3,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Broadcast => write!(f, "broadcast"),
            Domain::VehicleSecurity => write!(f, "vehicle-security"),
            Domain::Infotainment => write!(f, "infotainment"),
        }
    }
}

/// 16-byte identifier of a peer, used as an alternative to a [`Domain`] in
/// routing destinations.
///
/// A client's address is derived from its public key so that two clients
/// sharing one transport cannot observe each other's replies by accident.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingAddress([u8; 16]);

impl RoutingAddress {
    pub const LEN: usize = 16;

    /// Derives the address of the peer holding `public_key` (uncompressed
    /// SEC1 bytes): the first 16 bytes of SHA-256 over the key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut address = [0u8; Self::LEN];
        address.copy_from_slice(&digest[..Self::LEN]);

        Self(address)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for RoutingAddress {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for RoutingAddress {
    type Error = InvalidAddress;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| InvalidAddress { len: bytes.len() })?;

        Ok(Self(bytes))
    }
}

impl fmt::Display for RoutingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RoutingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("routing addresses are 16 bytes, got {len}")]
pub struct InvalidAddress {
    pub len: usize,
}

/// The VIN of a vehicle; doubles as the verifier id that gets mixed into
/// every signed message and as the session-cache key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(vin: impl Into<String>) -> Self {
        Self(vin.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for VehicleId {
    fn from(vin: &str) -> Self {
        Self(vin.to_owned())
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// Wire-level rejection codes.
///
/// The vehicle reports these inside a signed-message status; locally we
/// reuse the same vocabulary so that a fault observed by the verifier and
/// a fault surfaced to the caller are the same value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageFault {
    None = 0,
    Busy = 1,
    Timeout = 2,
    UnknownKeyId = 3,
    InactiveKey = 4,
    InvalidSignature = 5,
    InvalidTokenOrCounter = 6,
    InsufficientPrivileges = 7,
    InvalidDomains = 8,
    InvalidCommand = 9,
    Decoding = 10,
    Internal = 11,
    WrongPersonalization = 12,
    BadParameter = 13,
    KeychainIsFull = 14,
    IncorrectEpoch = 15,
    TimeExpired = 17,
    TimeToLiveTooLong = 18,
}

impl MessageFault {
    /// Faults that may merely mean the signer's view of the session is
    /// stale. The carrier includes fresh session info; applying it and
    /// retrying once is expected to succeed.
    pub fn is_session_desync(&self) -> bool {
        matches!(
            self,
            MessageFault::InvalidSignature
                | MessageFault::InvalidTokenOrCounter
                | MessageFault::IncorrectEpoch
                | MessageFault::TimeExpired
                | MessageFault::TimeToLiveTooLong
        )
    }

    /// Faults that end a handshake for good; retrying cannot help until
    /// the key is (re-)enrolled on the vehicle.
    pub fn is_fatal_to_handshake(&self) -> bool {
        matches!(self, MessageFault::UnknownKeyId | MessageFault::InactiveKey)
    }

    /// Transport-side congestion; retried by the dispatcher.
    pub fn is_transient(&self) -> bool {
        matches!(self, MessageFault::Busy | MessageFault::Timeout)
    }
}

impl fmt::Display for MessageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageFault::None => "none",
            MessageFault::Busy => "busy",
            MessageFault::Timeout => "timeout",
            MessageFault::UnknownKeyId => "unknown key id",
            MessageFault::InactiveKey => "inactive key",
            MessageFault::InvalidSignature => "invalid signature",
            MessageFault::InvalidTokenOrCounter => "invalid token or counter",
            MessageFault::InsufficientPrivileges => "insufficient privileges",
            MessageFault::InvalidDomains => "invalid domains",
            MessageFault::InvalidCommand => "invalid command",
            MessageFault::Decoding => "decoding failure",
            MessageFault::Internal => "internal error",
            MessageFault::WrongPersonalization => "wrong personalization",
            MessageFault::BadParameter => "bad parameter",
            MessageFault::KeychainIsFull => "keychain is full",
            MessageFault::IncorrectEpoch => "incorrect epoch",
            MessageFault::TimeExpired => "time expired",
            MessageFault::TimeToLiveTooLong => "time to live too long",
        };

        write!(f, "{name}")
    }
}
