//! Request/response frame codec.
//!
//! Every frame on the wire is a 16-bit big-endian length prefix followed by
//! a body whose first byte is a message-type discriminator. Bodies at or
//! above [`PART_SIZE`] are split across a header frame and one or more
//! continuation frames; the reassembly state lives in a per-connection map
//! keyed by session, owned by the caller (client or server).

use std::collections::HashMap;
use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

use crate::address::Address;
use crate::error::{ClusterError, ClusterResult};
use crate::packet::{ReqPack, RespPack};
use crate::substring;

/// Bodies this size or larger are chunked into multi-part sequences.
pub const PART_SIZE: usize = 0x8000;

mod req_type {
    pub const SINGLE_NUMBER: u8 = 0x00;
    pub const MULTI_HEADER_NUMBER_CALL: u8 = 0x01;
    pub const MULTI_CONT: u8 = 0x02;
    pub const MULTI_CONT_FINAL: u8 = 0x03;
    pub const TRACE: u8 = 0x04;
    pub const MULTI_HEADER_NUMBER_PUSH: u8 = 0x41;
    pub const SINGLE_NAME: u8 = 0x80;
    pub const MULTI_HEADER_NAME_CALL: u8 = 0x81;
    pub const MULTI_HEADER_NAME_PUSH: u8 = 0xC1;
}

mod resp_type {
    pub const ERR: u8 = 0x00;
    pub const OK: u8 = 0x01;
    pub const MULTI_HEADER: u8 = 0x02;
    pub const MULTI_CONT: u8 = 0x03;
    pub const MULTI_CONT_FINAL: u8 = 0x04;
}

/// Reassembly slot for one in-flight multi-part request. The push/call
/// distinction for multi-part requests lives entirely in the header's type
/// byte; by the time a session reaches this table only the address and
/// accumulated body remain relevant. The final `ReqPack`'s session (0 for
/// push) is what callers key push-ness off of.
struct PendingReq {
    addr: Address,
    buf: Vec<u8>,
}

/// Reassembly slot for one in-flight multi-part response.
struct PendingResp {
    buf: Vec<u8>,
}

#[derive(Default)]
pub struct ReqReassembly(HashMap<u32, PendingReq>);

impl ReqReassembly {
    pub fn new() -> Self {
        ReqReassembly(HashMap::new())
    }
}

#[derive(Default)]
pub struct RespReassembly(HashMap<u32, PendingResp>);

impl RespReassembly {
    pub fn new() -> Self {
        RespReassembly(HashMap::new())
    }
}

/// Reads one outer-framed body (2-byte BE length then that many bytes).
/// Returns `Ok(None)` on a clean EOF before any bytes of the next frame arrive.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = BigEndian::read_u16(&len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

fn push_outer_frame(out: &mut Vec<u8>, body: &[u8]) {
    out.write_u16::<BigEndian>(body.len() as u16)
        .expect("writing to a Vec<u8> cannot fail");
    out.extend_from_slice(body);
}

/// Encodes a request into one or more outer-framed wire chunks, ready to
/// write to a socket as-is.
pub fn encode_req(req: &ReqPack) -> Vec<u8> {
    let inner = substring::pack(&[&req.method, &req.payload]);
    let mut out = Vec::new();

    if inner.len() < PART_SIZE {
        let mut body = Vec::new();
        encode_single_addr(&mut body, &req.addr, req.session);
        body.extend_from_slice(&inner);
        push_outer_frame(&mut out, &body);
        return out;
    }

    let push = req.is_push();
    let mut header = Vec::new();
    let header_type = match (&req.addr, push) {
        (Address::Id(_), false) => req_type::MULTI_HEADER_NUMBER_CALL,
        (Address::Id(_), true) => req_type::MULTI_HEADER_NUMBER_PUSH,
        (Address::Name(_), false) => req_type::MULTI_HEADER_NAME_CALL,
        (Address::Name(_), true) => req_type::MULTI_HEADER_NAME_PUSH,
    };
    header.push(header_type);
    encode_addr_body(&mut header, &req.addr);
    header.write_u32::<LittleEndian>(req.session).unwrap();
    header.write_u32::<LittleEndian>(inner.len() as u32).unwrap();
    push_outer_frame(&mut out, &header);

    let mut offset = 0;
    while offset < inner.len() {
        let end = (offset + PART_SIZE).min(inner.len());
        let is_final = end == inner.len();
        let mut body = Vec::new();
        body.push(if is_final { req_type::MULTI_CONT_FINAL } else { req_type::MULTI_CONT });
        body.write_u32::<LittleEndian>(req.session).unwrap();
        body.extend_from_slice(&inner[offset..end]);
        push_outer_frame(&mut out, &body);
        offset = end;
    }

    out
}

fn encode_single_addr(body: &mut Vec<u8>, addr: &Address, session: u32) {
    body.push(match addr {
        Address::Id(_) => req_type::SINGLE_NUMBER,
        Address::Name(_) => req_type::SINGLE_NAME,
    });
    encode_addr_body(body, addr);
    body.write_u32::<LittleEndian>(session).unwrap();
}

fn encode_addr_body(body: &mut Vec<u8>, addr: &Address) {
    match addr {
        Address::Id(id) => body.write_u32::<LittleEndian>(*id).unwrap(),
        Address::Name(name) => {
            body.push(name.len() as u8);
            body.extend_from_slice(name.as_bytes());
        }
    }
}

/// Best-effort extraction of the session carried by a request frame that
/// failed to decode, so the caller can decide whether the failure is
/// reportable back to the peer: call errors get an error response on the
/// offending session, push errors (session 0) are only logged. Returns
/// `None` when the frame is too short to contain even a session field, or
/// its type byte carries none (e.g. trace).
pub fn recoverable_session(body: &[u8]) -> Option<u32> {
    if body.is_empty() {
        return None;
    }
    let ty = body[0];
    let rest = &body[1..];
    match ty {
        req_type::SINGLE_NUMBER if rest.len() >= 8 => Some(LittleEndian::read_u32(&rest[4..8])),
        req_type::SINGLE_NAME if !rest.is_empty() => {
            let header_end = 1 + rest[0] as usize;
            if rest.len() >= header_end + 4 {
                Some(LittleEndian::read_u32(&rest[header_end..header_end + 4]))
            } else {
                None
            }
        }
        req_type::MULTI_HEADER_NUMBER_CALL | req_type::MULTI_HEADER_NUMBER_PUSH if rest.len() >= 8 => {
            Some(LittleEndian::read_u32(&rest[4..8]))
        }
        req_type::MULTI_HEADER_NAME_CALL | req_type::MULTI_HEADER_NAME_PUSH if !rest.is_empty() => {
            let header_end = 1 + rest[0] as usize;
            if rest.len() >= header_end + 4 {
                Some(LittleEndian::read_u32(&rest[header_end..header_end + 4]))
            } else {
                None
            }
        }
        req_type::MULTI_CONT | req_type::MULTI_CONT_FINAL if rest.len() >= 4 => Some(LittleEndian::read_u32(&rest[0..4])),
        _ => None,
    }
}

/// Decodes one inbound request frame body. Returns `Some(ReqPack)` once a
/// complete request has been assembled (immediately for single-frame
/// requests, on the final continuation for multi-part ones).
pub fn decode_req(body: &[u8], pending: &mut ReqReassembly) -> ClusterResult<Option<ReqPack>> {
    if body.is_empty() {
        return Err(ClusterError::protocol("empty request frame"));
    }
    let ty = body[0];
    let rest = &body[1..];

    let mut req = match ty {
        req_type::SINGLE_NUMBER => decode_single_number(rest)?,
        req_type::SINGLE_NAME => decode_single_name(rest)?,
        req_type::MULTI_HEADER_NUMBER_CALL | req_type::MULTI_HEADER_NUMBER_PUSH => {
            decode_multi_header_number(rest, pending)?;
            return Ok(None);
        }
        req_type::MULTI_HEADER_NAME_CALL | req_type::MULTI_HEADER_NAME_PUSH => {
            decode_multi_header_name(rest, pending)?;
            return Ok(None);
        }
        req_type::MULTI_CONT | req_type::MULTI_CONT_FINAL => {
            match decode_continuation(rest, ty == req_type::MULTI_CONT_FINAL, pending)? {
                Some(req) => req,
                None => return Ok(None),
            }
        }
        req_type::TRACE => return Err(ClusterError::protocol("trace requests are not supported")),
        other => return Err(ClusterError::protocol(format!("unknown request type byte 0x{:02x}", other))),
    };

    req.normalize_method();
    Ok(Some(req))
}

fn decode_single_number(rest: &[u8]) -> ClusterResult<ReqPack> {
    if rest.len() < 8 {
        return Err(ClusterError::protocol("truncated single numeric request"));
    }
    let id = LittleEndian::read_u32(&rest[0..4]);
    let session = LittleEndian::read_u32(&rest[4..8]);
    let (method, payload) = decode_inner(&rest[8..])?;
    Ok(ReqPack { addr: Address::Id(id), session, method, payload })
}

fn decode_single_name(rest: &[u8]) -> ClusterResult<ReqPack> {
    if rest.is_empty() {
        return Err(ClusterError::protocol("truncated name request header"));
    }
    let name_len = rest[0] as usize;
    let header_end = 1 + name_len;
    if rest.len() < header_end + 4 {
        return Err(ClusterError::protocol("truncated name request"));
    }
    let name = String::from_utf8_lossy(&rest[1..header_end]).into_owned();
    let session = LittleEndian::read_u32(&rest[header_end..header_end + 4]);
    let (method, payload) = decode_inner(&rest[header_end + 4..])?;
    Ok(ReqPack { addr: Address::Name(name), session, method, payload })
}

fn decode_inner(data: &[u8]) -> ClusterResult<(Vec<u8>, Vec<u8>)> {
    let (method, consumed) = substring::decode(data)?;
    if method.is_empty() {
        return Err(ClusterError::protocol("empty method name"));
    }
    let method = method.to_vec();
    let (payload, _) = substring::decode(&data[consumed..])?;
    Ok((method, payload.to_vec()))
}

fn decode_multi_header_number(rest: &[u8], pending: &mut ReqReassembly) -> ClusterResult<()> {
    if rest.len() < 12 {
        return Err(ClusterError::protocol("truncated numeric multi-part header"));
    }
    let id = LittleEndian::read_u32(&rest[0..4]);
    let session = LittleEndian::read_u32(&rest[4..8]);
    let total_len = LittleEndian::read_u32(&rest[8..12]) as usize;
    pending.0.insert(session, PendingReq { addr: Address::Id(id), buf: Vec::with_capacity(total_len) });
    Ok(())
}

fn decode_multi_header_name(rest: &[u8], pending: &mut ReqReassembly) -> ClusterResult<()> {
    if rest.is_empty() {
        return Err(ClusterError::protocol("truncated name multi-part header"));
    }
    let name_len = rest[0] as usize;
    let header_end = 1 + name_len;
    if rest.len() < header_end + 8 {
        return Err(ClusterError::protocol("truncated name multi-part header"));
    }
    let name = String::from_utf8_lossy(&rest[1..header_end]).into_owned();
    let session = LittleEndian::read_u32(&rest[header_end..header_end + 4]);
    let total_len = LittleEndian::read_u32(&rest[header_end + 4..header_end + 8]) as usize;
    pending.0.insert(session, PendingReq { addr: Address::Name(name), buf: Vec::with_capacity(total_len) });
    Ok(())
}

fn decode_continuation(rest: &[u8], is_final: bool, pending: &mut ReqReassembly) -> ClusterResult<Option<ReqPack>> {
    if rest.len() < 4 {
        return Err(ClusterError::protocol("truncated continuation frame"));
    }
    let session = LittleEndian::read_u32(&rest[0..4]);
    let chunk = &rest[4..];

    let slot = match pending.0.get_mut(&session) {
        Some(slot) => slot,
        None => return Err(ClusterError::protocol(format!("continuation for unknown session {}", session))),
    };
    slot.buf.extend_from_slice(chunk);

    if !is_final {
        return Ok(None);
    }

    let PendingReq { addr, buf } = pending.0.remove(&session).unwrap();
    let (method, consumed) = substring::decode(&buf)?;
    if method.is_empty() {
        return Err(ClusterError::protocol("empty method name"));
    }
    let method = method.to_vec();
    let (payload, _) = substring::decode(&buf[consumed..])?;
    let payload = payload.to_vec();
    Ok(Some(ReqPack { addr, session, method, payload }))
}

/// Encodes a response into one or more outer-framed wire chunks.
pub fn encode_resp(resp: &RespPack) -> Vec<u8> {
    let mut out = Vec::new();

    if !resp.ok {
        let mut payload = resp.payload.clone();
        if payload.len() > PART_SIZE {
            payload.truncate(PART_SIZE);
        }
        let mut body = Vec::with_capacity(5 + payload.len());
        body.write_u32::<LittleEndian>(resp.session).unwrap();
        body.push(resp_type::ERR);
        body.extend_from_slice(&payload);
        push_outer_frame(&mut out, &body);
        return out;
    }

    let wrapped = substring::pack(&[&resp.payload]);
    if wrapped.len() < PART_SIZE {
        let mut body = Vec::with_capacity(5 + wrapped.len());
        body.write_u32::<LittleEndian>(resp.session).unwrap();
        body.push(resp_type::OK);
        body.extend_from_slice(&wrapped);
        push_outer_frame(&mut out, &body);
        return out;
    }

    let mut header = Vec::with_capacity(9);
    header.write_u32::<LittleEndian>(resp.session).unwrap();
    header.push(resp_type::MULTI_HEADER);
    header.write_u32::<LittleEndian>(wrapped.len() as u32).unwrap();
    push_outer_frame(&mut out, &header);

    let mut offset = 0;
    while offset < wrapped.len() {
        let end = (offset + PART_SIZE).min(wrapped.len());
        let is_final = end == wrapped.len();
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(resp.session).unwrap();
        body.push(if is_final { resp_type::MULTI_CONT_FINAL } else { resp_type::MULTI_CONT });
        body.extend_from_slice(&wrapped[offset..end]);
        push_outer_frame(&mut out, &body);
        offset = end;
    }

    out
}

/// Decodes one inbound response frame body, mirroring [`decode_req`].
pub fn decode_resp(body: &[u8], pending: &mut RespReassembly) -> ClusterResult<Option<RespPack>> {
    if body.len() < 5 {
        return Err(ClusterError::protocol("truncated response frame"));
    }
    let session = LittleEndian::read_u32(&body[0..4]);
    let ty = body[4];
    let rest = &body[5..];

    match ty {
        resp_type::ERR => Ok(Some(RespPack { session, ok: false, payload: rest.to_vec() })),
        resp_type::OK => {
            let (payload, _) = substring::decode(rest)?;
            Ok(Some(RespPack { session, ok: true, payload: payload.to_vec() }))
        }
        resp_type::MULTI_HEADER => {
            if rest.len() < 4 {
                return Err(ClusterError::protocol("truncated multi-part response header"));
            }
            let total_len = LittleEndian::read_u32(&rest[0..4]) as usize;
            pending.0.insert(session, PendingResp { buf: Vec::with_capacity(total_len) });
            Ok(None)
        }
        resp_type::MULTI_CONT | resp_type::MULTI_CONT_FINAL => {
            let slot = match pending.0.get_mut(&session) {
                Some(slot) => slot,
                None => return Err(ClusterError::protocol(format!("continuation for unknown session {}", session))),
            };
            slot.buf.extend_from_slice(rest);

            if ty == resp_type::MULTI_CONT {
                return Ok(None);
            }

            let PendingResp { buf } = pending.0.remove(&session).unwrap();
            let (payload, _) = substring::decode(&buf)?;
            Ok(Some(RespPack { session, ok: true, payload: payload.to_vec() }))
        }
        other => Err(ClusterError::protocol(format!("unknown response type byte 0x{:02x}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn drive_req(wire: &[u8]) -> ClusterResult<ReqPack> {
        let mut cursor = Cursor::new(wire);
        let mut pending = ReqReassembly::new();
        loop {
            let body = read_frame(&mut cursor).unwrap().expect("frame expected");
            if let Some(req) = decode_req(&body, &mut pending)? {
                return Ok(req);
            }
        }
    }

    #[test]
    fn single_frame_numeric_roundtrips() {
        let req = ReqPack {
            addr: Address::Id(42),
            session: 7,
            method: b"Add".to_vec(),
            payload: b"{}".to_vec(),
        };
        let wire = encode_req(&req);
        let decoded = drive_req(&wire).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn single_frame_name_roundtrips() {
        let req = ReqPack {
            addr: Address::Name("db".into()),
            session: 9,
            method: b"SETX".to_vec(),
            payload: b"payload".to_vec(),
        };
        let wire = encode_req(&req);
        let decoded = drive_req(&wire).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn multi_part_numeric_roundtrips() {
        for extra in [0usize, 1, PART_SIZE, 3 * PART_SIZE + 7] {
            let payload = vec![0x42u8; PART_SIZE + extra];
            let req = ReqPack {
                addr: Address::Id(99),
                session: 5,
                method: b"Store".to_vec(),
                payload,
            };
            let wire = encode_req(&req);
            let decoded = drive_req(&wire).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn multi_part_frame_count_matches_chunking() {
        let payload = vec![0u8; 3 * PART_SIZE + 7];
        let req = ReqPack { addr: Address::Id(1), session: 1, method: b"X".to_vec(), payload };
        let wire = encode_req(&req);

        let mut cursor = Cursor::new(wire.as_slice());
        let mut count = 0;
        let mut types = Vec::new();
        while let Some(body) = read_frame(&mut cursor).unwrap() {
            types.push(body[0]);
            count += 1;
        }
        // 1 header + ceil((3*PART_SIZE+7+substring overhead)/PART_SIZE) continuations
        assert_eq!(types[0], req_type::MULTI_HEADER_NUMBER_CALL);
        assert_eq!(count, types.len());
        assert_eq!(*types.last().unwrap(), req_type::MULTI_CONT_FINAL);
        assert!(types[1..types.len() - 1].iter().all(|t| *t == req_type::MULTI_CONT));
    }

    #[test]
    fn push_request_preserves_zero_session() {
        let req = ReqPack {
            addr: Address::Name("db".into()),
            session: 0,
            method: b"Setx".to_vec(),
            payload: vec![0u8; PART_SIZE + 3],
        };
        let wire = encode_req(&req);
        let decoded = drive_req(&wire).unwrap();
        assert_eq!(decoded.method, b"Setx".to_vec());
        assert!(decoded.is_push());
    }

    #[test]
    fn method_case_is_normalized_on_decode() {
        let req = ReqPack { addr: Address::Id(1), session: 1, method: b"add".to_vec(), payload: vec![] };
        let wire = encode_req(&req);
        let decoded = drive_req(&wire).unwrap();
        assert_eq!(decoded.method, b"Add".to_vec());
    }

    #[test]
    fn method_case_is_normalized_on_decode_for_multi_part_requests() {
        let req = ReqPack {
            addr: Address::Id(1),
            session: 1,
            method: b"store".to_vec(),
            payload: vec![0u8; PART_SIZE + 3],
        };
        let wire = encode_req(&req);
        let decoded = drive_req(&wire).unwrap();
        assert_eq!(decoded.method, b"Store".to_vec());
    }

    #[test]
    fn response_roundtrips_single_and_multi_part() {
        let mut pending = RespReassembly::new();

        let ok = RespPack { session: 3, ok: true, payload: b"result".to_vec() };
        let wire = encode_resp(&ok);
        let body = {
            let mut cursor = Cursor::new(wire.as_slice());
            read_frame(&mut cursor).unwrap().unwrap()
        };
        assert_eq!(decode_resp(&body, &mut pending).unwrap().unwrap(), ok);

        let big = RespPack { session: 4, ok: true, payload: vec![7u8; 2 * PART_SIZE + 11] };
        let wire = encode_resp(&big);
        let mut cursor = Cursor::new(wire.as_slice());
        let mut result = None;
        while let Some(body) = read_frame(&mut cursor).unwrap() {
            if let Some(resp) = decode_resp(&body, &mut pending).unwrap() {
                result = Some(resp);
            }
        }
        assert_eq!(result.unwrap(), big);
    }

    #[test]
    fn error_response_is_truncated_to_part_size() {
        let err = RespPack { session: 1, ok: false, payload: vec![b'e'; PART_SIZE + 100] };
        let wire = encode_resp(&err);
        let mut cursor = Cursor::new(wire.as_slice());
        let body = read_frame(&mut cursor).unwrap().unwrap();
        let mut pending = RespReassembly::new();
        let decoded = decode_resp(&body, &mut pending).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), PART_SIZE);
        assert!(!decoded.ok);
    }

    #[test]
    fn unknown_type_byte_is_a_decode_error() {
        let body = [0x77u8];
        let mut pending = ReqReassembly::new();
        assert!(decode_req(&body, &mut pending).is_err());
    }

    #[test]
    fn trace_request_is_a_decode_error() {
        let body = [req_type::TRACE];
        let mut pending = ReqReassembly::new();
        assert!(decode_req(&body, &mut pending).is_err());
    }

    #[test]
    fn continuation_for_unknown_session_is_an_error() {
        let mut body = Vec::new();
        body.push(req_type::MULTI_CONT_FINAL);
        body.write_u32::<LittleEndian>(999).unwrap();
        let mut pending = ReqReassembly::new();
        assert!(decode_req(&body, &mut pending).is_err());
    }

    #[test]
    fn recoverable_session_reads_session_from_a_bad_continuation() {
        let mut body = Vec::new();
        body.push(req_type::MULTI_CONT_FINAL);
        body.write_u32::<LittleEndian>(42).unwrap();
        body.extend_from_slice(b"garbage");
        assert_eq!(recoverable_session(&body), Some(42));
    }

    #[test]
    fn recoverable_session_reads_session_from_a_truncated_single_numeric_request() {
        let mut body = Vec::new();
        body.push(req_type::SINGLE_NUMBER);
        body.write_u32::<LittleEndian>(1).unwrap();
        body.write_u32::<LittleEndian>(77).unwrap();
        // No inner substring bytes follow -- decode_inner will fail.
        assert!(decode_req(&body, &mut ReqReassembly::new()).is_err());
        assert_eq!(recoverable_session(&body), Some(77));
    }

    #[test]
    fn recoverable_session_is_none_for_trace_and_empty_frames() {
        assert_eq!(recoverable_session(&[]), None);
        assert_eq!(recoverable_session(&[req_type::TRACE]), None);
    }
}
