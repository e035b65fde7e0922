//! Prefix-typed variable-length byte string encoding.
//!
//! Uses `lua`-flavoured type tags: only `ShortString` (4) and `LongString`
//! (5) are ever produced by this protocol, but the decoder also accepts the
//! `nil` tag (0) for an empty body.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ClusterError, ClusterResult};

const TYPE_NIL: u8 = 0;
const TYPE_SHORT_STRING: u8 = 4;
const TYPE_LONG_STRING: u8 = 5;

/// Packs a 3-bit type and a 5-bit value into one header byte.
///
/// `value` is masked to 5 bits, so `combine(t, 32)` aliases `combine(t, 0)`.
/// Callers must guarantee `value <= 31`; this is not guarded here.
#[inline]
pub fn combine(ty: u8, value: u8) -> u8 {
    ty | (value << 3)
}

/// Inverse of [`combine`].
#[inline]
pub fn uncombine(header: u8) -> (u8, u8) {
    (header & 0x7, header >> 3)
}

/// Encodes one byte string with its 1-byte (+ optional length) header.
pub fn encode(out: &mut Vec<u8>, s: &[u8]) {
    let len = s.len();
    if len < 32 {
        out.push(combine(TYPE_SHORT_STRING, len as u8));
    } else if len < 65536 {
        out.push(combine(TYPE_LONG_STRING, 2));
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, len as u16);
        out.extend_from_slice(&buf);
    } else {
        out.push(combine(TYPE_LONG_STRING, 4));
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, len as u32);
        out.extend_from_slice(&buf);
    }
    out.extend_from_slice(s);
}

/// Decodes one byte string starting at `data[0]`. Returns the string and the
/// number of bytes consumed.
pub fn decode(data: &[u8]) -> ClusterResult<(&[u8], usize)> {
    if data.is_empty() {
        return Err(ClusterError::protocol("empty buffer, expected substring header"));
    }

    let (ty, value) = uncombine(data[0]);
    match ty {
        TYPE_NIL => Ok((&data[0..0], 1)),
        TYPE_SHORT_STRING => {
            let len = value as usize;
            let end = 1 + len;
            if data.len() < end {
                return Err(ClusterError::protocol(format!(
                    "short string truncated: have {}, need {}",
                    data.len(),
                    end
                )));
            }
            Ok((&data[1..end], end))
        }
        TYPE_LONG_STRING => {
            if value != 2 && value != 4 {
                return Err(ClusterError::protocol(format!(
                    "invalid long string length field width: {}",
                    value
                )));
            }
            let header_end = 1 + value as usize;
            if data.len() < header_end {
                return Err(ClusterError::protocol("long string length header truncated"));
            }
            let len = if value == 2 {
                LittleEndian::read_u16(&data[1..header_end]) as usize
            } else {
                LittleEndian::read_u32(&data[1..header_end]) as usize
            };
            let end = header_end + len;
            if data.len() < end {
                return Err(ClusterError::protocol(format!(
                    "long string body truncated: have {}, need {}",
                    data.len(),
                    end
                )));
            }
            Ok((&data[header_end..end], end))
        }
        other => Err(ClusterError::protocol(format!("unsupported substring type={}", other))),
    }
}

/// Concatenates a sequence of byte strings, each prefixed per [`encode`].
pub fn pack(items: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        encode(&mut out, item);
    }
    out
}

/// Inverse of [`pack`] for a known count of items.
pub fn unpack(mut data: &[u8], count: usize) -> ClusterResult<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let (item, consumed) = decode(data)?;
        out.push(item.to_vec());
        data = &data[consumed..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(len: usize) {
        let s = vec![0x5au8; len];
        let mut buf = Vec::new();
        encode(&mut buf, &s);
        let (decoded, consumed) = decode(&buf).unwrap();
        assert_eq!(decoded, s.as_slice());
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn roundtrips_boundary_lengths() {
        for len in [0, 31, 32, 65535, 65536, 10 * 0x8000] {
            roundtrip(len);
        }
    }

    #[test]
    fn header_overhead_matches_length_class() {
        let mut buf = Vec::new();
        encode(&mut buf, &vec![0u8; 31]);
        assert_eq!(buf.len(), 1 + 31);

        buf.clear();
        encode(&mut buf, &vec![0u8; 32]);
        assert_eq!(buf.len(), 3 + 32);

        buf.clear();
        encode(&mut buf, &vec![0u8; 65536]);
        assert_eq!(buf.len(), 5 + 65536);
    }

    #[test]
    fn pack_unpack_sequence_roundtrips() {
        let a = b"Add".to_vec();
        let b = vec![1u8; 40000];
        let c = Vec::new();
        let packed = pack(&[&a, &b, &c]);
        let items = unpack(&packed, 3).unwrap();
        assert_eq!(items, vec![a, b, c]);
    }

    #[test]
    fn combine_uncombine_roundtrip() {
        for ty in 0..8u8 {
            for value in 0..32u8 {
                assert_eq!(uncombine(combine(ty, value)), (ty, value));
            }
        }
    }

    #[test]
    fn combine_aliases_32_to_0() {
        assert_eq!(combine(4, 32), combine(4, 0));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let buf = [combine(7, 0)];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn decode_accepts_nil_as_empty() {
        let buf = [combine(0, 0)];
        let (s, consumed) = decode(&buf).unwrap();
        assert!(s.is_empty());
        assert_eq!(consumed, 1);
    }
}
