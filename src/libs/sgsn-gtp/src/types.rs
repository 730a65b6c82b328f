//! Boundary types shared between the emulator core and the protocol engine

use std::net::Ipv4Addr;

use crate::error::GtpError;

/// Cause value signalling "request accepted"
pub const CAUSE_REQUEST_ACCEPTED: u8 = 128;

/// Opaque token identifying a protocol-layer context.
///
/// Replaces the untyped peer back-pointer attached to a context object:
/// the engine hands it out on request creation and echoes it back in
/// every confirmation, and the caller resolves it through its own
/// session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Protocol-defined status value on a confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CauseCode(pub u8);

impl CauseCode {
    /// Whether the request was accepted by the peer
    pub fn is_accepted(self) -> bool {
        self.0 == CAUSE_REQUEST_ACCEPTED
    }
}

impl std::fmt::Display for CauseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// GTPv1-C signalling message types consumed at this boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GtpcMessageType {
    EchoRequest = 1,
    EchoResponse = 2,
    CreatePdpContextRequest = 16,
    CreatePdpContextResponse = 17,
    DeletePdpContextRequest = 20,
    DeletePdpContextResponse = 21,
    GPdu = 255,
}

impl TryFrom<u8> for GtpcMessageType {
    type Error = GtpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(GtpcMessageType::EchoRequest),
            2 => Ok(GtpcMessageType::EchoResponse),
            16 => Ok(GtpcMessageType::CreatePdpContextRequest),
            17 => Ok(GtpcMessageType::CreatePdpContextResponse),
            20 => Ok(GtpcMessageType::DeletePdpContextRequest),
            21 => Ok(GtpcMessageType::DeletePdpContextResponse),
            255 => Ok(GtpcMessageType::GPdu),
            _ => Err(GtpError::InvalidMessageType(value)),
        }
    }
}

/// End user address IE payload.
///
/// IPv4 form is 6 bytes: organisation 0xf1 (IETF), type 0x21, then the
/// four address octets. The two-byte form with no address requests
/// dynamic allocation from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eua(Vec<u8>);

/// PDP type organisation IETF (low nibble of the first EUA octet)
const EUA_ORG_IETF: u8 = 0x01;

/// PDP type number IPv4
const EUA_TYPE_IPV4: u8 = 0x21;

impl Eua {
    /// Request a dynamically assigned address
    pub fn dynamic() -> Self {
        Eua(vec![0xf0 | EUA_ORG_IETF, EUA_TYPE_IPV4])
    }

    /// Wrap raw IE payload bytes as received from the engine
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Eua(bytes)
    }

    /// Encode an IPv4 address
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        let mut v = vec![0xf0 | EUA_ORG_IETF, EUA_TYPE_IPV4];
        v.extend_from_slice(&addr.octets());
        Eua(v)
    }

    /// Translate into the local address representation.
    ///
    /// Returns `None` for anything that is not a well-formed IETF IPv4
    /// end user address; the caller treats that as a failed attempt.
    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        if self.0.len() != 6 {
            return None;
        }
        if self.0[0] & 0x0f != EUA_ORG_IETF || self.0[1] != EUA_TYPE_IPV4 {
            return None;
        }
        Some(Ipv4Addr::new(self.0[2], self.0[3], self.0[4], self.0[5]))
    }

    /// Raw IE payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Parameter block for a create-context request
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Subscriber identity, BCD packed
    pub imsi: u64,
    /// Network service access point, distinguishes parallel contexts of
    /// one subscriber
    pub nsapi: u8,
    /// Access point name, length-prefixed
    pub apn: Vec<u8>,
    /// Subscriber number, TBCD with type-of-number prefix
    pub msisdn: Vec<u8>,
    /// Quality of service profile blob
    pub qos: Vec<u8>,
    /// Protocol configuration options (carries authentication)
    pub pco: Vec<u8>,
    /// APN selection mode
    pub selection_mode: u8,
    /// Requested end user address (dynamic unless provisioning a fixed one)
    pub eua: Option<Eua>,
}

/// One decapsulated unit of work from the protocol engine.
///
/// Tagged variants replace the numeric (message type, cause) dispatch
/// switch; confirmations are delivered strictly in the order they were
/// decapsulated from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GtpEvent {
    /// Echo (health-check) confirmation; `None` means the request timed
    /// out in the retransmission engine
    EchoConfirm { cause: Option<CauseCode> },
    /// Create-context confirmation
    CreateConfirm {
        handle: SessionHandle,
        cause: CauseCode,
        eua: Option<Eua>,
    },
    /// Delete-context confirmation
    DeleteConfirm {
        handle: SessionHandle,
        cause: CauseCode,
    },
    /// Tunnelled user payload for an established context
    Payload {
        handle: SessionHandle,
        data: Vec<u8>,
    },
}
