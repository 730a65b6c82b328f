//! GTP protocol-engine boundary
//!
//! The emulator core drives a protocol engine through [`GtpEngine`] and
//! consumes its confirmations as [`GtpEvent`] values. The engine owns
//! the socket, sequencing and retransmission; the core owns session
//! state and address bookkeeping. [`wire`] carries the small GTPv1-C
//! framing subset a concrete engine needs.

pub mod error;
pub mod types;
pub mod wire;

pub use error::{GtpError, GtpResult};
pub use types::{
    CauseCode, Eua, GtpEvent, GtpcMessageType, SessionHandle, SessionRequest,
    CAUSE_REQUEST_ACCEPTED,
};

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Driving interface of a GTP protocol engine.
///
/// Request methods return as soon as the message is handed to the
/// engine; outcomes arrive later as [`GtpEvent`] values from
/// [`decaps`](GtpEngine::decaps) or [`retrans`](GtpEngine::retrans),
/// in decapsulation order.
pub trait GtpEngine {
    /// Pollable descriptor of the engine's signalling socket
    fn fd(&self) -> RawFd;

    /// Issue a create-context request; the returned handle tags the
    /// eventual [`GtpEvent::CreateConfirm`]
    fn create_context(&mut self, req: &SessionRequest) -> GtpResult<SessionHandle>;

    /// Issue a delete-context request for an established context
    fn delete_context(&mut self, handle: SessionHandle) -> GtpResult<()>;

    /// Issue a peer health-check request
    fn echo_request(&mut self, peer: Ipv4Addr) -> GtpResult<()>;

    /// Encapsulate user payload onto an established context
    fn send_gpdu(&mut self, handle: SessionHandle, data: &[u8]) -> GtpResult<()>;

    /// Time until the earliest pending retransmission, if any
    fn retrans_timeout(&self, now: Instant) -> Option<Duration>;

    /// Run retransmissions due at `now`; requests that exhausted their
    /// attempts surface as timed-out confirmations
    fn retrans(&mut self, now: Instant) -> Vec<GtpEvent>;

    /// Drain the socket and decode everything readable
    fn decaps(&mut self) -> std::io::Result<Vec<GtpEvent>>;
}
