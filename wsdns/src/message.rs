//! DNS message admission and EDNS(0) shaping
//!
//! The admission filter runs in two stages: a cheap screen over the raw
//! 12-byte header before any parsing, and a post-parse check of the OPT
//! pseudo-record. The shaping helpers normalize the advertised UDP buffer
//! size in both directions and synthesize error responses carrying an
//! Extended DNS Error option.

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsOption;

use crate::error::{Error, Result};

/// Length of the fixed DNS header
pub const DNS_HEADER_LEN: usize = 12;

/// EDNS option code for Extended DNS Errors (RFC 8914)
const EDE_OPTION_CODE: u16 = 15;

/// EDE info-code `Other`
const EDE_INFO_CODE_OTHER: u16 = 0;

/// EDE text attached to admission refusals
pub const BUSY_TEXT: &str = "Too busy, try again later";

/// Outcome of screening a raw DNS header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// The message may be parsed and served
    Accept,
    /// Drop the message without a reply
    Ignore,
    /// Reply with NotImplemented
    NotImplemented,
    /// Reply with FormatError
    FormatError,
}

/// Screen the raw header of an inbound message before parsing it.
///
/// Accepted messages are queries (QR=0) with opcode QUERY, exactly one
/// question, no answer or authority records, and at most one additional
/// record.
pub fn screen_header(packet: &[u8]) -> Screen {
    if packet.len() < DNS_HEADER_LEN {
        return Screen::Ignore;
    }

    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 != 0 {
        // A response; not ours to answer.
        return Screen::Ignore;
    }
    if (flags >> 11) & 0x0F != 0 {
        return Screen::NotImplemented;
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);
    let nscount = u16::from_be_bytes([packet[8], packet[9]]);
    let arcount = u16::from_be_bytes([packet[10], packet[11]]);
    if qdcount != 1 || ancount != 0 || nscount != 0 || arcount > 1 {
        return Screen::FormatError;
    }

    Screen::Accept
}

/// Build a header-only reply for a screened-out message.
///
/// The transaction id, opcode, and RD bit are echoed from the request
/// header; QR is set and all counts are zero.
pub fn reject_from_header(packet: &[u8], code: ResponseCode) -> Vec<u8> {
    let mut out = vec![0u8; DNS_HEADER_LEN];
    out[0] = packet[0];
    out[1] = packet[1];
    out[2] = 0x80 | (packet[2] & 0x78) | (packet[2] & 0x01);
    out[3] = code.low() & 0x0F;
    out
}

/// Post-parse admission check, shared by the wire listeners and the
/// WebSocket acceptor.
///
/// Returns the rejection response to send, or `None` when the query is
/// acceptable. The only additional record allowed is a version-0 OPT.
pub fn validate_query(req: &Message, udp_buffer_size: u16) -> Option<Message> {
    if req.queries().len() != 1
        || !req.answers().is_empty()
        || !req.name_servers().is_empty()
        || !req.additionals().is_empty()
    {
        return Some(response_with_code(req, ResponseCode::FormErr));
    }

    if let Some(edns) = req.extensions() {
        if edns.version() != 0 {
            return Some(badvers_response(req, udp_buffer_size));
        }
    }

    None
}

/// Start a response to `req`: id, opcode, RD, and question echoed, QR set
pub fn response_with_code(req: &Message, code: ResponseCode) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_response_code(code);
    for query in req.queries() {
        resp.add_query(query.clone());
    }
    resp
}

/// BADVERS response with an empty OPT at the server's buffer size
pub fn badvers_response(req: &Message, udp_buffer_size: u16) -> Message {
    let mut resp = response_with_code(req, ResponseCode::BADVERS);
    let edns = resp.extensions_mut().get_or_insert_with(Edns::new);
    edns.set_max_payload(udp_buffer_size);
    resp
}

/// Synthesize an error response.
///
/// When the request carried an OPT record, the response gets one too,
/// preserving the client's DO bit, with an EDE option carrying `ede_text`.
pub fn failure_response(
    req: &Message,
    code: ResponseCode,
    udp_buffer_size: u16,
    ede_text: Option<&str>,
) -> Message {
    let mut resp = response_with_code(req, code);
    if let Some(req_edns) = req.extensions() {
        let edns = resp.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(udp_buffer_size);
        edns.set_dnssec_ok(req_edns.flags().dnssec_ok);
        if let Some(text) = ede_text {
            edns.options_mut().insert(ede_other(text));
        }
    }
    resp
}

/// Encode an EDE option with info-code `Other` and free text
fn ede_other(text: &str) -> EdnsOption {
    let mut data = Vec::with_capacity(2 + text.len());
    data.extend_from_slice(&EDE_INFO_CODE_OTHER.to_be_bytes());
    data.extend_from_slice(text.as_bytes());
    EdnsOption::Unknown(EDE_OPTION_CODE, data)
}

/// Normalize the request's advertised UDP buffer size before forwarding.
///
/// A request without OPT gets one (DO clear); a request with OPT has its
/// size overwritten.
pub fn shape_request_edns(req: &mut Message, udp_buffer_size: u16) {
    let edns = req.extensions_mut().get_or_insert_with(Edns::new);
    edns.set_max_payload(udp_buffer_size);
}

/// Shape a response on its way back to the caller.
///
/// Strips an OPT the upstream added when the original request had none,
/// and otherwise clamps the advertised size down to ours.
pub fn shape_response_edns(resp: &mut Message, request_had_opt: bool, udp_buffer_size: u16) {
    if !request_had_opt {
        *resp.extensions_mut() = None;
        return;
    }
    if let Some(edns) = resp.extensions_mut() {
        if edns.max_payload() > udp_buffer_size {
            edns.set_max_payload(udp_buffer_size);
        }
    }
}

/// Encode a response for UDP delivery, truncating it to `limit` bytes.
///
/// Records are dropped from the back, additional data first, until the
/// message fits; the TC flag is set whenever anything was dropped.
pub fn encode_truncated(resp: &mut Message, limit: usize) -> Result<Vec<u8>> {
    let wire = resp
        .to_vec()
        .map_err(|e| Error::Dns(format!("encode response: {}", e)))?;
    if wire.len() <= limit {
        return Ok(wire);
    }

    let mut additionals = resp.take_additionals();
    let mut authorities = resp.take_name_servers();
    let mut answers = resp.take_answers();
    resp.set_truncated(true);

    loop {
        let dropped = additionals.pop().is_some()
            || authorities.pop().is_some()
            || answers.pop().is_some();

        let mut candidate = resp.clone();
        candidate.insert_answers(answers.clone());
        candidate.insert_name_servers(authorities.clone());
        candidate.insert_additionals(additionals.clone());

        let wire = candidate
            .to_vec()
            .map_err(|e| Error::Dns(format!("encode response: {}", e)))?;
        if wire.len() <= limit || !dropped {
            *resp = candidate;
            return Ok(wire);
        }
    }
}

/// Effective UDP payload limit for a client that announced `announced`
/// bytes (0 when the request had no OPT)
pub fn effective_udp_size(announced: u16, udp_buffer_size: u16) -> usize {
    announced.clamp(512, udp_buffer_size) as usize
}
