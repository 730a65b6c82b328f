//! Minimal GTPv1-C framing used at the engine boundary
//!
//! Only the header and the handful of information elements the emulator
//! exchanges with a gateway are covered here; the full message codec is
//! the protocol engine's own concern.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{GtpError, GtpResult};
use crate::types::SessionRequest;

/// GTP-C UDP port
pub const GTPC_PORT: u16 = 2123;

/// Mandatory header length
pub const GTP_HEADER_LEN: usize = 8;

/// Optional field block length (sequence number, N-PDU, next extension)
pub const GTP_OPT_LEN: usize = 4;

/// Version 1, protocol type GTP
const GTP_FLAGS_BASE: u8 = 0x30;

/// Sequence number present
const GTP_FLAGS_S: u8 = 0x02;

// Information element types
pub const IE_CAUSE: u8 = 1;
pub const IE_IMSI: u8 = 2;
pub const IE_RECOVERY: u8 = 14;
pub const IE_SELECTION_MODE: u8 = 15;
pub const IE_NSAPI: u8 = 20;
pub const IE_EUA: u8 = 128;
pub const IE_APN: u8 = 131;
pub const IE_PCO: u8 = 132;
pub const IE_MSISDN: u8 = 134;
pub const IE_QOS: u8 = 135;

/// Fixed payload length of a TV-format IE, if known
fn tv_len(ie_type: u8) -> Option<usize> {
    match ie_type {
        IE_CAUSE => Some(1),
        IE_IMSI => Some(8),
        IE_RECOVERY => Some(1),
        IE_SELECTION_MODE => Some(1),
        IE_NSAPI => Some(1),
        _ => None,
    }
}

/// GTPv1 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GtpHeader {
    pub msg_type: u8,
    pub teid: u32,
    pub seq: Option<u16>,
}

impl GtpHeader {
    /// Encode the header in front of `payload_len` bytes of body
    pub fn encode(&self, payload_len: usize, buf: &mut BytesMut) {
        let mut flags = GTP_FLAGS_BASE;
        let mut length = payload_len;
        if self.seq.is_some() {
            flags |= GTP_FLAGS_S;
            length += GTP_OPT_LEN;
        }
        buf.put_u8(flags);
        buf.put_u8(self.msg_type);
        buf.put_u16(length as u16);
        buf.put_u32(self.teid);
        if let Some(seq) = self.seq {
            buf.put_u16(seq);
            buf.put_u8(0); // N-PDU number
            buf.put_u8(0); // next extension header type
        }
    }

    /// Parse a header, returning it and the offset of the body
    pub fn parse(data: &[u8]) -> GtpResult<(GtpHeader, usize)> {
        if data.len() < GTP_HEADER_LEN {
            return Err(GtpError::BufferTooShort {
                needed: GTP_HEADER_LEN,
                available: data.len(),
            });
        }
        let flags = data[0];
        let version = flags >> 5;
        if version != 1 {
            return Err(GtpError::InvalidVersion(version));
        }
        let mut cursor = &data[1..];
        let msg_type = cursor.get_u8();
        let _length = cursor.get_u16();
        let teid = cursor.get_u32();
        let mut offset = GTP_HEADER_LEN;
        let seq = if flags & GTP_FLAGS_S != 0 {
            if data.len() < GTP_HEADER_LEN + GTP_OPT_LEN {
                return Err(GtpError::BufferTooShort {
                    needed: GTP_HEADER_LEN + GTP_OPT_LEN,
                    available: data.len(),
                });
            }
            let seq = cursor.get_u16();
            offset += GTP_OPT_LEN;
            Some(seq)
        } else {
            None
        };
        Ok((
            GtpHeader {
                msg_type,
                teid,
                seq,
            },
            offset,
        ))
    }
}

/// Parse the information elements of a signalling message body.
///
/// TV-format elements (type < 128) have implicit lengths; anything with
/// an unknown implicit length aborts the parse since the remainder
/// cannot be framed.
pub fn parse_ies(mut body: &[u8]) -> GtpResult<Vec<(u8, Vec<u8>)>> {
    let mut ies = Vec::new();
    while body.has_remaining() {
        let ie_type = body.get_u8();
        let len = if ie_type < 128 {
            tv_len(ie_type).ok_or(GtpError::MalformedIe("unknown TV element"))?
        } else {
            if body.remaining() < 2 {
                return Err(GtpError::MalformedIe("truncated TLV length"));
            }
            body.get_u16() as usize
        };
        if body.remaining() < len {
            return Err(GtpError::MalformedIe("truncated element payload"));
        }
        ies.push((ie_type, body[..len].to_vec()));
        body.advance(len);
    }
    Ok(ies)
}

/// First element of the given type, if present
pub fn find_ie<'a>(ies: &'a [(u8, Vec<u8>)], ie_type: u8) -> Option<&'a [u8]> {
    ies.iter()
        .find(|(t, _)| *t == ie_type)
        .map(|(_, v)| v.as_slice())
}

fn put_tv1(buf: &mut BytesMut, ie_type: u8, value: u8) {
    buf.put_u8(ie_type);
    buf.put_u8(value);
}

fn put_tlv(buf: &mut BytesMut, ie_type: u8, value: &[u8]) {
    buf.put_u8(ie_type);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

/// Echo request: header only
pub fn build_echo_request(seq: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(GTP_HEADER_LEN + GTP_OPT_LEN);
    GtpHeader {
        msg_type: crate::types::GtpcMessageType::EchoRequest as u8,
        teid: 0,
        seq: Some(seq),
    }
    .encode(0, &mut buf);
    buf.to_vec()
}

/// Create-context request carrying the session parameter block
pub fn build_create_pdp_request(seq: u16, teid: u32, req: &SessionRequest) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(IE_IMSI);
    // BCD digits are packed from the low nibble up, which matches the
    // wire octet order when written least significant byte first
    body.put_slice(&req.imsi.to_le_bytes());
    put_tv1(&mut body, IE_SELECTION_MODE, req.selection_mode);
    put_tv1(&mut body, IE_NSAPI, req.nsapi);
    let eua = req
        .eua
        .clone()
        .unwrap_or_else(crate::types::Eua::dynamic);
    put_tlv(&mut body, IE_EUA, eua.as_bytes());
    put_tlv(&mut body, IE_APN, &req.apn);
    put_tlv(&mut body, IE_PCO, &req.pco);
    put_tlv(&mut body, IE_MSISDN, &req.msisdn);
    put_tlv(&mut body, IE_QOS, &req.qos);

    let mut buf = BytesMut::with_capacity(GTP_HEADER_LEN + GTP_OPT_LEN + body.len());
    GtpHeader {
        msg_type: crate::types::GtpcMessageType::CreatePdpContextRequest as u8,
        teid,
        seq: Some(seq),
    }
    .encode(body.len(), &mut buf);
    buf.put_slice(&body);
    buf.to_vec()
}

/// Delete-context request for one NSAPI
pub fn build_delete_pdp_request(seq: u16, teid: u32, nsapi: u8) -> Vec<u8> {
    let mut body = BytesMut::new();
    put_tv1(&mut body, IE_NSAPI, nsapi);
    let mut buf = BytesMut::with_capacity(GTP_HEADER_LEN + GTP_OPT_LEN + body.len());
    GtpHeader {
        msg_type: crate::types::GtpcMessageType::DeletePdpContextRequest as u8,
        teid,
        seq: Some(seq),
    }
    .encode(body.len(), &mut buf);
    buf.put_slice(&body);
    buf.to_vec()
}

/// Encapsulate user payload as a G-PDU
pub fn build_gpdu(teid: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(GTP_HEADER_LEN + payload.len());
    GtpHeader {
        msg_type: crate::types::GtpcMessageType::GPdu as u8,
        teid,
        seq: None,
    }
    .encode(payload.len(), &mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}
