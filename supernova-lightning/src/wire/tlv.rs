// SuperNova Lightning Network - TLV Extension Records
//
// BigSize integers and the type-length-value streams that trail wire messages.

use super::WireError;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;

/// Write a BigSize-encoded integer
pub fn write_bigsize(out: &mut BytesMut, value: u64) {
    match value {
        0..=0xfc => out.put_u8(value as u8),
        0xfd..=0xffff => {
            out.put_u8(0xfd);
            out.put_u16(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            out.put_u8(0xfe);
            out.put_u32(value as u32);
        }
        _ => {
            out.put_u8(0xff);
            out.put_u64(value);
        }
    }
}

/// Read a BigSize integer, returning the value and the number of bytes consumed.
///
/// Non-minimal encodings are rejected.
pub fn read_bigsize(input: &[u8]) -> Result<(u64, usize), WireError> {
    let truncated = || WireError::MalformedMessage("truncated bigsize".to_string());
    let first = *input.first().ok_or_else(truncated)?;
    let (value, len, min) = match first {
        0xfd => {
            let b = input.get(1..3).ok_or_else(truncated)?;
            (u16::from_be_bytes([b[0], b[1]]) as u64, 3, 0xfd)
        }
        0xfe => {
            let b = input.get(1..5).ok_or_else(truncated)?;
            (u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64, 5, 0x1_0000)
        }
        0xff => {
            let b = input.get(1..9).ok_or_else(truncated)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            (u64::from_be_bytes(arr), 9, 0x1_0000_0000)
        }
        small => return Ok((small as u64, 1)),
    };
    if value < min {
        return Err(WireError::MalformedMessage(format!(
            "non-canonical bigsize {}",
            value
        )));
    }
    Ok((value, len))
}

/// An ordered set of TLV records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvStream {
    records: BTreeMap<u64, Vec<u8>>,
}

impl TlvStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tlv_type: u64, value: Vec<u8>) {
        self.records.insert(tlv_type, value);
    }

    pub fn get(&self, tlv_type: u64) -> Option<&[u8]> {
        self.records.get(&tlv_type).map(Vec::as_slice)
    }

    pub fn remove(&mut self, tlv_type: u64) -> Option<Vec<u8>> {
        self.records.remove(&tlv_type)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn types(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.keys().copied()
    }

    pub fn encode(&self, out: &mut BytesMut) {
        for (tlv_type, value) in &self.records {
            write_bigsize(out, *tlv_type);
            write_bigsize(out, value.len() as u64);
            out.put_slice(value);
        }
    }

    /// Parse a stream. Types must be strictly increasing. An unknown
    /// odd type is critical and fails the whole message; unknown even
    /// types are kept so they survive re-encoding.
    pub fn decode(mut input: &[u8], known: &[u64]) -> Result<Self, WireError> {
        let mut records = BTreeMap::new();
        let mut last: Option<u64> = None;

        while !input.is_empty() {
            let (tlv_type, n) = read_bigsize(input)?;
            input = &input[n..];
            let (len, n) = read_bigsize(input)?;
            input = &input[n..];

            if last.map_or(false, |prev| tlv_type <= prev) {
                return Err(WireError::MalformedMessage(format!(
                    "tlv type {} out of order",
                    tlv_type
                )));
            }
            last = Some(tlv_type);

            let len = usize::try_from(len)
                .map_err(|_| WireError::MalformedMessage("tlv length overflow".to_string()))?;
            if input.len() < len {
                return Err(WireError::MalformedMessage(format!(
                    "tlv {} declares {} bytes, {} available",
                    tlv_type,
                    len,
                    input.len()
                )));
            }

            if !known.contains(&tlv_type) && tlv_type % 2 == 1 {
                return Err(WireError::UnknownCriticalExtension(tlv_type));
            }

            records.insert(tlv_type, input[..len].to_vec());
            input = &input[len..];
        }

        Ok(Self { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigsize_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000, u64::MAX] {
            let mut out = BytesMut::new();
            write_bigsize(&mut out, value);
            assert_eq!(read_bigsize(&out).unwrap(), (value, out.len()));
        }
    }

    #[test]
    fn test_non_canonical_bigsize_rejected() {
        assert!(matches!(
            read_bigsize(&[0xfd, 0x00, 0xfc]),
            Err(WireError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_unknown_odd_type_is_critical() {
        let mut stream = TlvStream::new();
        stream.insert(5, vec![1, 2, 3]);
        let mut out = BytesMut::new();
        stream.encode(&mut out);

        assert_eq!(
            TlvStream::decode(&out, &[]),
            Err(WireError::UnknownCriticalExtension(5))
        );
        assert_eq!(TlvStream::decode(&out, &[5]).unwrap(), stream);
    }

    #[test]
    fn test_unknown_even_type_is_retained() {
        let mut stream = TlvStream::new();
        stream.insert(4, vec![9]);
        let mut out = BytesMut::new();
        stream.encode(&mut out);

        let decoded = TlvStream::decode(&out, &[]).unwrap();
        assert_eq!(decoded.get(4), Some(&[9u8][..]));
    }

    #[test]
    fn test_out_of_order_types_rejected() {
        // type 4 then type 2
        let bytes = [4u8, 0, 2, 0];
        assert!(matches!(
            TlvStream::decode(&bytes, &[2, 4]),
            Err(WireError::MalformedMessage(_))
        ));
    }
}
