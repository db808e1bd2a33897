//! Wire messages exchanged with the vehicle.
//!
//! Hand-derived prost structs rather than generated code: the schema is
//! small, stable, and the session-info HMAC covers exact encodings, so the
//! message definitions live next to the code that authenticates them.

use fleetlink_model::{Domain, MessageFault, RoutingAddress};

/// The routing envelope. Everything that crosses a transport is one of
/// these, length-framed by the transport itself.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoutedMessage {
    #[prost(message, optional, tag = "1")]
    pub to: Option<Destination>,
    #[prost(message, optional, tag = "2")]
    pub from: Option<Destination>,
    #[prost(oneof = "Payload", tags = "3, 4, 5")]
    pub payload: Option<Payload>,
    #[prost(message, optional, tag = "6")]
    pub signature_data: Option<SignatureData>,
    /// 16 random bytes identifying this message.
    #[prost(bytes = "vec", tag = "7")]
    pub uuid: Vec<u8>,
    /// On responses: the `uuid` of the message being answered.
    #[prost(bytes = "vec", tag = "8")]
    pub request_uuid: Vec<u8>,
    #[prost(message, optional, tag = "9")]
    pub status: Option<MessageStatus>,
    #[prost(uint32, tag = "10")]
    pub flags: u32,
}

impl RoutedMessage {
    pub fn to_domain(&self) -> Option<Domain> {
        self.to.as_ref()?.as_domain()
    }

    pub fn from_domain(&self) -> Option<Domain> {
        self.from.as_ref()?.as_domain()
    }

    /// The fault reported by the peer, if the status carries one.
    pub fn fault(&self) -> Option<MessageFault> {
        let status = self.status.as_ref()?;
        let fault = MessageFault::try_from(status.signed_message_fault).ok()?;

        (fault != MessageFault::None).then_some(fault)
    }

    pub fn command(&self) -> Option<&[u8]> {
        match &self.payload {
            Some(Payload::Command(bytes)) => Some(bytes),
            Some(Payload::SessionInfo(_) | Payload::SessionInfoRequest(_)) | None => None,
        }
    }

    pub fn session_info(&self) -> Option<&[u8]> {
        match &self.payload {
            Some(Payload::SessionInfo(bytes)) => Some(bytes),
            Some(Payload::Command(_) | Payload::SessionInfoRequest(_)) | None => None,
        }
    }

    /// The session-info HMAC, when the payload is authenticated session info.
    pub fn session_info_tag(&self) -> Option<&[u8]> {
        match &self.signature_data.as_ref()?.sig_type {
            Some(SigType::SessionInfoTag(hmac)) => Some(&hmac.tag),
            Some(SigType::AesGcmPersonalized(_) | SigType::HmacPersonalized(_)) | None => None,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    /// An opaque (possibly encrypted) command for the destination domain.
    #[prost(bytes = "vec", tag = "3")]
    Command(Vec<u8>),
    /// Encoded [`SessionInfo`]. Kept as raw bytes: the authentication tag
    /// covers this exact encoding.
    #[prost(bytes = "vec", tag = "4")]
    SessionInfo(Vec<u8>),
    #[prost(message, tag = "5")]
    SessionInfoRequest(SessionInfoRequest),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionInfoRequest {
    /// Uncompressed SEC1 public key of the requesting client.
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
}

/// Either a domain inside the vehicle or a client's routing address.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Destination {
    #[prost(oneof = "SubDestination", tags = "1, 2")]
    pub sub_destination: Option<SubDestination>,
}

impl Destination {
    pub fn domain(domain: Domain) -> Self {
        Self {
            sub_destination: Some(SubDestination::Domain(domain as i32)),
        }
    }

    pub fn address(address: RoutingAddress) -> Self {
        Self {
            sub_destination: Some(SubDestination::RoutingAddress(
                address.as_bytes().to_vec(),
            )),
        }
    }

    pub fn as_domain(&self) -> Option<Domain> {
        match self.sub_destination {
            Some(SubDestination::Domain(raw)) => Domain::try_from(raw).ok(),
            Some(SubDestination::RoutingAddress(_)) | None => None,
        }
    }

    pub fn as_address(&self) -> Option<RoutingAddress> {
        match &self.sub_destination {
            Some(SubDestination::RoutingAddress(bytes)) => {
                RoutingAddress::try_from(bytes.as_slice()).ok()
            }
            Some(SubDestination::Domain(_)) | None => None,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum SubDestination {
    #[prost(enumeration = "Domain", tag = "1")]
    Domain(i32),
    #[prost(bytes = "vec", tag = "2")]
    RoutingAddress(Vec<u8>),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignatureData {
    #[prost(message, optional, tag = "1")]
    pub signer_identity: Option<KeyIdentity>,
    #[prost(oneof = "SigType", tags = "5, 6, 8")]
    pub sig_type: Option<SigType>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum SigType {
    #[prost(message, tag = "5")]
    AesGcmPersonalized(AesGcmPersonalizedSignature),
    #[prost(message, tag = "6")]
    SessionInfoTag(HmacSignature),
    #[prost(message, tag = "8")]
    HmacPersonalized(HmacPersonalizedSignature),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyIdentity {
    #[prost(oneof = "IdentityType", tags = "1")]
    pub identity_type: Option<IdentityType>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum IdentityType {
    #[prost(bytes = "vec", tag = "1")]
    PublicKey(Vec<u8>),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AesGcmPersonalizedSignature {
    #[prost(bytes = "vec", tag = "1")]
    pub epoch: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub counter: u32,
    /// Seconds relative to the start of the epoch.
    #[prost(uint32, tag = "4")]
    pub expires_at: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub tag: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HmacPersonalizedSignature {
    #[prost(bytes = "vec", tag = "1")]
    pub epoch: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub counter: u32,
    #[prost(uint32, tag = "3")]
    pub expires_at: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub tag: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HmacSignature {
    #[prost(bytes = "vec", tag = "1")]
    pub tag: Vec<u8>,
}

/// The verifier's authenticated snapshot of session state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionInfo {
    /// Highest counter the verifier has accepted.
    #[prost(uint32, tag = "1")]
    pub counter: u32,
    /// The verifier's uncompressed SEC1 public key.
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub epoch: Vec<u8>,
    /// Seconds since the epoch started, by the verifier's clock.
    #[prost(uint32, tag = "4")]
    pub clock_time: u32,
    #[prost(enumeration = "SessionInfoStatus", tag = "5")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SessionInfoStatus {
    Ok = 0,
    KeyNotOnWhitelist = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageStatus {
    #[prost(enumeration = "OperationStatus", tag = "1")]
    pub operation_status: i32,
    #[prost(enumeration = "MessageFault", tag = "2")]
    pub signed_message_fault: i32,
}

impl MessageStatus {
    pub fn fault(fault: MessageFault) -> Self {
        Self {
            operation_status: OperationStatus::Error as i32,
            signed_message_fault: fault as i32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OperationStatus {
    Ok = 0,
    Wait = 1,
    Error = 2,
}
