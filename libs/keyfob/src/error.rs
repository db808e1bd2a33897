use fleetlink_model::MessageFault;
use std::fmt;

/// A verifier-signed snapshot of session state.
///
/// Attached to desynchronization faults so the signer can resynchronize
/// from the rejection itself, without another round trip. The HMAC covers
/// the exact encoding in `encoded_info`, which is why it is kept as raw
/// bytes here.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedSessionInfo {
    pub encoded_info: Vec<u8>,
    pub tag: [u8; 32],
}

impl fmt::Debug for SignedSessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedSessionInfo")
            .field("encoded_info", &hex::encode(&self.encoded_info))
            .field("tag", &hex::encode(self.tag))
            .finish()
    }
}

/// Why a protocol operation was rejected.
///
/// Carries the wire-level fault so callers can map a local rejection and a
/// vehicle-reported rejection onto the same vocabulary. Faults that may
/// stem from the peer holding a stale view of the session carry fresh
/// [`SignedSessionInfo`].
#[derive(Debug, thiserror::Error)]
#[error("{fault}")]
pub struct Error {
    fault: MessageFault,
    resync: Option<SignedSessionInfo>,
}

impl Error {
    pub(crate) fn new(fault: MessageFault) -> Self {
        Self {
            fault,
            resync: None,
        }
    }

    pub(crate) fn desync(fault: MessageFault, resync: SignedSessionInfo) -> Self {
        Self {
            fault,
            resync: Some(resync),
        }
    }

    pub fn fault(&self) -> MessageFault {
        self.fault
    }

    /// Fresh session info to resynchronize from, if the fault carries any.
    pub fn resync(&self) -> Option<&SignedSessionInfo> {
        self.resync.as_ref()
    }

    pub fn into_resync(self) -> Option<SignedSessionInfo> {
        self.resync
    }

    pub fn is_session_desync(&self) -> bool {
        self.fault.is_session_desync()
    }
}
