//! Peer-to-peer command authentication between a client (the signer) and a
//! vehicle subsystem (the verifier).
//!
//! The protocol provides confidentiality, integrity, replay protection and
//! expiry over untrusted transports. Sessions are rooted in a static ECDH
//! agreement; within a session, a random 16-byte epoch bounds a strictly
//! increasing 32-bit counter, and every message authenticates its routing
//! metadata alongside the payload.
//!
//! This crate is sans-IO: nothing here touches the network or reads a
//! clock. Callers pass `Instant`/`SystemTime` in, which is also what makes
//! the time-dependent behavior testable.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod crypto;
pub mod wire;

mod error;
mod metadata;
mod peer;
mod session;
mod signer;
mod verifier;
mod window;

pub use error::{Error, SignedSessionInfo};
pub use metadata::{HmacSha256, Metadata, SignatureType, Tag};
pub use session::{
    AUTHENTICATED_COMMAND_LABEL, GCM_TAG_LENGTH, NONCE_LENGTH, NativeSession, SESSION_INFO_LABEL,
    Sealed, Session,
};
pub use signer::Signer;
pub use verifier::Verifier;
pub use window::{CounterError, ReplayWindow};
