//! Key material capabilities.
//!
//! The private key is a capability handle: consumers derive sessions and
//! request signatures but can never observe the scalar, which keeps an
//! HSM-backed implementation possible behind the same trait.

mod key;
pub mod schnorr;

pub use key::{PrivateKey, SoftwareKey};
