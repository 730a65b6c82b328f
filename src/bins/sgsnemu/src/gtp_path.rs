//! Socket-side protocol engine
//!
//! Owns the signalling socket, sequence numbering and the pending
//! request table. Requests are retransmitted on a fixed interval until
//! a response with a matching sequence number arrives or the attempt
//! budget runs out. Tunnelled payload is matched to its session by the
//! header tunnel identifier, which mirrors the session handle.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use sgsn_gtp::wire::{self, GtpHeader};
use sgsn_gtp::{
    CauseCode, Eua, GtpEngine, GtpError, GtpEvent, GtpResult, GtpcMessageType, SessionHandle,
    SessionRequest, CAUSE_REQUEST_ACCEPTED,
};

/// Retransmission attempts per request
const N3_REQUESTS: u32 = 3;

/// Retransmission interval
const T3_RESPONSE: Duration = Duration::from_secs(3);

struct Pending {
    msg_type: GtpcMessageType,
    handle: Option<SessionHandle>,
    dest: SocketAddrV4,
    data: Vec<u8>,
    deadline: Instant,
    attempts: u32,
}

/// Protocol engine over a UDP signalling socket
pub struct GtpPath {
    socket: UdpSocket,
    peer: SocketAddrV4,
    seq: u16,
    next_handle: u32,
    pending: HashMap<u16, Pending>,
    nsapi_by_handle: HashMap<u32, u8>,
}

impl GtpPath {
    /// Bind the signalling socket and aim it at the gateway
    pub fn new(listen: SocketAddrV4, peer: SocketAddrV4) -> std::io::Result<GtpPath> {
        let socket = UdpSocket::bind(listen)?;
        socket.set_nonblocking(true)?;
        log::info!("GTP signalling socket bound to {}", socket.local_addr()?);
        Ok(GtpPath {
            socket,
            peer,
            seq: 0,
            next_handle: 1,
            pending: HashMap::new(),
            nsapi_by_handle: HashMap::new(),
        })
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn send_pending(
        &mut self,
        msg_type: GtpcMessageType,
        handle: Option<SessionHandle>,
        dest: SocketAddrV4,
        seq: u16,
        data: Vec<u8>,
    ) -> GtpResult<()> {
        self.socket.send_to(&data, dest)?;
        self.pending.insert(
            seq,
            Pending {
                msg_type,
                handle,
                dest,
                data,
                deadline: Instant::now() + T3_RESPONSE,
                attempts: 1,
            },
        );
        Ok(())
    }

    fn decode(&mut self, data: &[u8], from: SocketAddrV4, out: &mut Vec<GtpEvent>) {
        let (header, offset) = match GtpHeader::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Undecodable message from {from}: {e}");
                return;
            }
        };
        let msg_type = match GtpcMessageType::try_from(header.msg_type) {
            Ok(msg_type) => msg_type,
            Err(e) => {
                log::warn!("Unhandled message from {from}: {e}");
                return;
            }
        };
        let body = &data[offset..];

        match msg_type {
            GtpcMessageType::GPdu => out.push(GtpEvent::Payload {
                handle: SessionHandle(header.teid),
                data: body.to_vec(),
            }),
            GtpcMessageType::EchoRequest => {
                // Answer peer health checks in place
                let mut reply = wire::build_echo_request(header.seq.unwrap_or(0));
                reply[1] = GtpcMessageType::EchoResponse as u8;
                if let Err(e) = self.socket.send_to(&reply, from) {
                    log::error!("Failed to answer echo request: {e}");
                }
            }
            GtpcMessageType::EchoResponse => {
                let Some(seq) = header.seq else {
                    log::warn!("Echo response without sequence number");
                    return;
                };
                if self.pending.remove(&seq).is_none() {
                    log::debug!("Unsolicited echo response, seq {seq}");
                    return;
                }
                out.push(GtpEvent::EchoConfirm {
                    cause: Some(CauseCode(CAUSE_REQUEST_ACCEPTED)),
                });
            }
            GtpcMessageType::CreatePdpContextResponse
            | GtpcMessageType::DeletePdpContextResponse => {
                let Some(seq) = header.seq else {
                    log::warn!("Response without sequence number");
                    return;
                };
                let Some(pending) = self.pending.remove(&seq) else {
                    log::debug!("Unsolicited response, seq {seq}");
                    return;
                };
                let Some(handle) = pending.handle else {
                    return;
                };
                let ies = match wire::parse_ies(body) {
                    Ok(ies) => ies,
                    Err(e) => {
                        log::warn!("Malformed response body from {from}: {e}");
                        return;
                    }
                };
                let cause = match wire::find_ie(&ies, wire::IE_CAUSE) {
                    Some([cause]) => CauseCode(*cause),
                    _ => {
                        log::warn!("Response without cause from {from}");
                        return;
                    }
                };
                if msg_type == GtpcMessageType::CreatePdpContextResponse {
                    let eua = wire::find_ie(&ies, wire::IE_EUA)
                        .map(|bytes| Eua::from_bytes(bytes.to_vec()));
                    out.push(GtpEvent::CreateConfirm {
                        handle,
                        cause,
                        eua,
                    });
                } else {
                    self.nsapi_by_handle.remove(&handle.0);
                    out.push(GtpEvent::DeleteConfirm { handle, cause });
                }
            }
            GtpcMessageType::CreatePdpContextRequest
            | GtpcMessageType::DeletePdpContextRequest => {
                log::debug!("Ignoring request type {:?} from {from}", msg_type);
            }
        }
    }
}

impl GtpEngine for GtpPath {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn create_context(&mut self, req: &SessionRequest) -> GtpResult<SessionHandle> {
        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        self.nsapi_by_handle.insert(handle.0, req.nsapi);
        let seq = self.next_seq();
        let data = wire::build_create_pdp_request(seq, handle.0, req);
        self.send_pending(
            GtpcMessageType::CreatePdpContextRequest,
            Some(handle),
            self.peer,
            seq,
            data,
        )?;
        Ok(handle)
    }

    fn delete_context(&mut self, handle: SessionHandle) -> GtpResult<()> {
        let nsapi = *self
            .nsapi_by_handle
            .get(&handle.0)
            .ok_or(GtpError::UnknownHandle(handle.0))?;
        let seq = self.next_seq();
        let data = wire::build_delete_pdp_request(seq, handle.0, nsapi);
        self.send_pending(
            GtpcMessageType::DeletePdpContextRequest,
            Some(handle),
            self.peer,
            seq,
            data,
        )
    }

    fn echo_request(&mut self, peer: Ipv4Addr) -> GtpResult<()> {
        let seq = self.next_seq();
        let data = wire::build_echo_request(seq);
        self.send_pending(
            GtpcMessageType::EchoRequest,
            None,
            SocketAddrV4::new(peer, self.peer.port()),
            seq,
            data,
        )
    }

    fn send_gpdu(&mut self, handle: SessionHandle, data: &[u8]) -> GtpResult<()> {
        let pack = wire::build_gpdu(handle.0, data);
        self.socket.send_to(&pack, self.peer)?;
        Ok(())
    }

    fn retrans_timeout(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|p| p.deadline.saturating_duration_since(now))
            .min()
    }

    fn retrans(&mut self, now: Instant) -> Vec<GtpEvent> {
        let mut events = Vec::new();
        let due: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in due {
            let attempts = match self.pending.get(&seq) {
                Some(pending) => pending.attempts,
                None => continue,
            };
            if attempts >= N3_REQUESTS {
                if let Some(pending) = self.pending.remove(&seq) {
                    match pending.msg_type {
                        GtpcMessageType::EchoRequest => {
                            events.push(GtpEvent::EchoConfirm { cause: None });
                        }
                        other => {
                            log::warn!(
                                "Request {:?} seq {seq} gave up after {} attempts",
                                other,
                                N3_REQUESTS
                            );
                        }
                    }
                }
                continue;
            }
            if let Some(pending) = self.pending.get_mut(&seq) {
                pending.attempts += 1;
                pending.deadline = now + T3_RESPONSE;
                log::debug!(
                    "Retransmitting {:?} seq {seq}, attempt {}",
                    pending.msg_type,
                    pending.attempts
                );
                if let Err(e) = self.socket.send_to(&pending.data, pending.dest) {
                    log::error!("Retransmission failed: {e}");
                }
            }
        }
        events
    }

    fn decaps(&mut self) -> std::io::Result<Vec<GtpEvent>> {
        let mut events = Vec::new();
        let mut buffer = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((n, from)) => {
                    let from = match from {
                        std::net::SocketAddr::V4(v4) => v4,
                        std::net::SocketAddr::V6(_) => continue,
                    };
                    let data = buffer[..n].to_vec();
                    self.decode(&data, from, &mut events);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }
}

// ============================================================================
// Tests
// ============================================================================
