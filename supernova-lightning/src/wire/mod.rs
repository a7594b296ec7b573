// SuperNova Lightning Network - Wire Protocol Implementation
//
// This module implements the binary peer protocol: a closed set of message
// kinds, their byte layouts, trailing TLV extensions, and length-prefixed
// framing for byte-stream transports.

pub mod features;
pub mod framing;
pub mod messages;
pub mod tlv;

pub use features::Features;
pub use framing::{frame, FrameDecoder, MAX_FRAME_LEN};
pub use messages::{
    ChannelAnnouncement, ChannelReestablish, ChannelUpdate, ClosingSigned, CommitmentSigned,
    ErrorMessage, HopPayload, Init, NodeAnnouncement, Ping, Pong, RevokeAndAck, Shutdown,
    UpdateAddHtlc, UpdateFailHtlc, UpdateFulfillHtlc,
};
pub use tlv::TlvStream;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Error types for wire encoding and decoding
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown critical extension record type {0}")]
    UnknownCriticalExtension(u64),

    #[error("Unknown required message type {0}")]
    UnknownRequiredMessage(u16),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

pub const MSG_INIT: u16 = 16;
pub const MSG_ERROR: u16 = 17;
pub const MSG_PING: u16 = 18;
pub const MSG_PONG: u16 = 19;
pub const MSG_SHUTDOWN: u16 = 38;
pub const MSG_CLOSING_SIGNED: u16 = 39;
pub const MSG_UPDATE_ADD_HTLC: u16 = 128;
pub const MSG_UPDATE_FULFILL_HTLC: u16 = 130;
pub const MSG_UPDATE_FAIL_HTLC: u16 = 131;
pub const MSG_COMMITMENT_SIGNED: u16 = 132;
pub const MSG_REVOKE_AND_ACK: u16 = 133;
pub const MSG_CHANNEL_REESTABLISH: u16 = 136;
pub const MSG_CHANNEL_ANNOUNCEMENT: u16 = 256;
pub const MSG_NODE_ANNOUNCEMENT: u16 = 257;
pub const MSG_CHANNEL_UPDATE: u16 = 258;

/// Gossip may be dropped when it cannot be parsed; other messages may not.
pub fn is_gossip_type(msg_type: u16) -> bool {
    (MSG_CHANNEL_ANNOUNCEMENT..=MSG_CHANNEL_UPDATE).contains(&msg_type)
}

/// Message type at the start of an encoded body.
pub fn peek_type(body: &[u8]) -> Option<u16> {
    match body {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Every message kind exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Init(Init),
    Error(ErrorMessage),
    Ping(Ping),
    Pong(Pong),
    Shutdown(Shutdown),
    ClosingSigned(ClosingSigned),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    CommitmentSigned(CommitmentSigned),
    RevokeAndAck(RevokeAndAck),
    ChannelReestablish(ChannelReestablish),
    ChannelAnnouncement(ChannelAnnouncement),
    NodeAnnouncement(NodeAnnouncement),
    ChannelUpdate(ChannelUpdate),
    /// An even-typed message we do not understand; safe to ignore.
    Unknown { msg_type: u16, payload: Bytes },
}

impl Message {
    pub fn msg_type(&self) -> u16 {
        match self {
            Message::Init(_) => MSG_INIT,
            Message::Error(_) => MSG_ERROR,
            Message::Ping(_) => MSG_PING,
            Message::Pong(_) => MSG_PONG,
            Message::Shutdown(_) => MSG_SHUTDOWN,
            Message::ClosingSigned(_) => MSG_CLOSING_SIGNED,
            Message::UpdateAddHtlc(_) => MSG_UPDATE_ADD_HTLC,
            Message::UpdateFulfillHtlc(_) => MSG_UPDATE_FULFILL_HTLC,
            Message::UpdateFailHtlc(_) => MSG_UPDATE_FAIL_HTLC,
            Message::CommitmentSigned(_) => MSG_COMMITMENT_SIGNED,
            Message::RevokeAndAck(_) => MSG_REVOKE_AND_ACK,
            Message::ChannelReestablish(_) => MSG_CHANNEL_REESTABLISH,
            Message::ChannelAnnouncement(_) => MSG_CHANNEL_ANNOUNCEMENT,
            Message::NodeAnnouncement(_) => MSG_NODE_ANNOUNCEMENT,
            Message::ChannelUpdate(_) => MSG_CHANNEL_UPDATE,
            Message::Unknown { msg_type, .. } => *msg_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Init(_) => "init",
            Message::Error(_) => "error",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Shutdown(_) => "shutdown",
            Message::ClosingSigned(_) => "closing_signed",
            Message::UpdateAddHtlc(_) => "update_add_htlc",
            Message::UpdateFulfillHtlc(_) => "update_fulfill_htlc",
            Message::UpdateFailHtlc(_) => "update_fail_htlc",
            Message::CommitmentSigned(_) => "commitment_signed",
            Message::RevokeAndAck(_) => "revoke_and_ack",
            Message::ChannelReestablish(_) => "channel_reestablish",
            Message::ChannelAnnouncement(_) => "channel_announcement",
            Message::NodeAnnouncement(_) => "node_announcement",
            Message::ChannelUpdate(_) => "channel_update",
            Message::Unknown { .. } => "unknown",
        }
    }

    /// Serialize the message: a big-endian type followed by its fields.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = BytesMut::with_capacity(64);
        out.put_u16(self.msg_type());
        match self {
            Message::Init(m) => m.write(&mut out)?,
            Message::Error(m) => m.write(&mut out)?,
            Message::Ping(m) => m.write(&mut out)?,
            Message::Pong(m) => m.write(&mut out)?,
            Message::Shutdown(m) => m.write(&mut out)?,
            Message::ClosingSigned(m) => m.write(&mut out)?,
            Message::UpdateAddHtlc(m) => m.write(&mut out)?,
            Message::UpdateFulfillHtlc(m) => m.write(&mut out)?,
            Message::UpdateFailHtlc(m) => m.write(&mut out)?,
            Message::CommitmentSigned(m) => m.write(&mut out)?,
            Message::RevokeAndAck(m) => m.write(&mut out)?,
            Message::ChannelReestablish(m) => m.write(&mut out)?,
            Message::ChannelAnnouncement(m) => m.write(&mut out)?,
            Message::NodeAnnouncement(m) => m.write(&mut out)?,
            Message::ChannelUpdate(m) => m.write(&mut out)?,
            Message::Unknown { payload, .. } => out.put_slice(payload),
        }
        Ok(out.freeze())
    }

    /// Parse a single message.
    ///
    /// Bytes left after the fixed fields must form a valid TLV stream. For
    /// messages that define no records of their own the stream is checked
    /// for critical types and then dropped.
    pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
        let mut reader = Reader::new(bytes);
        let msg_type = reader.u16("type")?;

        let message = match msg_type {
            MSG_INIT => Message::Init(Init::read(&mut reader)?),
            MSG_ERROR => Message::Error(ErrorMessage::read(&mut reader)?),
            MSG_PING => Message::Ping(Ping::read(&mut reader)?),
            MSG_PONG => Message::Pong(Pong::read(&mut reader)?),
            MSG_SHUTDOWN => Message::Shutdown(Shutdown::read(&mut reader)?),
            MSG_CLOSING_SIGNED => Message::ClosingSigned(ClosingSigned::read(&mut reader)?),
            MSG_UPDATE_ADD_HTLC => Message::UpdateAddHtlc(UpdateAddHtlc::read(&mut reader)?),
            MSG_UPDATE_FULFILL_HTLC => {
                Message::UpdateFulfillHtlc(UpdateFulfillHtlc::read(&mut reader)?)
            }
            MSG_UPDATE_FAIL_HTLC => Message::UpdateFailHtlc(UpdateFailHtlc::read(&mut reader)?),
            MSG_COMMITMENT_SIGNED => {
                Message::CommitmentSigned(CommitmentSigned::read(&mut reader)?)
            }
            MSG_REVOKE_AND_ACK => Message::RevokeAndAck(RevokeAndAck::read(&mut reader)?),
            MSG_CHANNEL_REESTABLISH => {
                Message::ChannelReestablish(ChannelReestablish::read(&mut reader)?)
            }
            MSG_CHANNEL_ANNOUNCEMENT => {
                Message::ChannelAnnouncement(ChannelAnnouncement::read(&mut reader)?)
            }
            MSG_NODE_ANNOUNCEMENT => {
                Message::NodeAnnouncement(NodeAnnouncement::read(&mut reader)?)
            }
            MSG_CHANNEL_UPDATE => Message::ChannelUpdate(ChannelUpdate::read(&mut reader)?),
            other if other % 2 == 1 => return Err(WireError::UnknownRequiredMessage(other)),
            other => {
                return Ok(Message::Unknown {
                    msg_type: other,
                    payload: Bytes::copy_from_slice(reader.rest()),
                })
            }
        };

        if !reader.is_empty() {
            TlvStream::decode(reader.rest(), &[])?;
        }
        Ok(message)
    }
}

/// Cursor over a message body that reports which field ran short.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], WireError> {
        if self.buf.len() < len {
            return Err(WireError::MalformedMessage(format!(
                "truncated {}: need {} bytes, have {}",
                field,
                len,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    pub fn u8(&mut self, field: &str) -> Result<u8, WireError> {
        Ok(self.array::<1>(field)?[0])
    }

    pub fn u16(&mut self, field: &str) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    pub fn u32(&mut self, field: &str) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    pub fn u64(&mut self, field: &str) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.array(field)?))
    }

    /// A `u16` length followed by that many bytes.
    pub fn var_bytes(&mut self, field: &str) -> Result<&'a [u8], WireError> {
        let len = self.u16(field)? as usize;
        self.take(len, field)
    }

    /// Consume everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, ShortChannelId};
    use secp256k1::{Secp256k1, SecretKey};

    fn sample_add() -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: ChannelId::new([3u8; 32]),
            id: 7,
            amount_msat: 100_000,
            payment_hash: [9u8; 32],
            cltv_expiry: 500_144,
            hops: vec![HopPayload {
                short_channel_id: ShortChannelId::new(600_000, 12, 1),
                amount_to_forward: 99_000,
                outgoing_cltv_value: 500_100,
            }],
            extensions: TlvStream::new(),
        }
    }

    #[test]
    fn test_update_add_htlc_roundtrip() {
        let message = Message::UpdateAddHtlc(sample_add());
        let bytes = message.encode().unwrap();
        assert_eq!(&bytes[..2], &MSG_UPDATE_ADD_HTLC.to_be_bytes());
        assert_eq!(Message::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_truncated_message_is_malformed() {
        let bytes = Message::UpdateAddHtlc(sample_add()).encode().unwrap();
        // Cut inside the fixed fields.
        let result = Message::decode(&bytes[..40]);
        assert!(matches!(result, Err(WireError::MalformedMessage(_))));
    }

    #[test]
    fn test_trailing_garbage_is_malformed() {
        let mut bytes = Message::Pong(Pong { ignored: vec![] }).encode().unwrap().to_vec();
        // bigsize type 0, declared length 5, no value
        bytes.extend_from_slice(&[0x00, 0x05]);
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_trailing_odd_extension_is_fatal() {
        let mut bytes = Message::Ping(Ping { num_pong_bytes: 4, ignored: vec![] })
            .encode()
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(&[0x03, 0x01, 0xaa]);
        assert_eq!(
            Message::decode(&bytes),
            Err(WireError::UnknownCriticalExtension(3))
        );
    }

    #[test]
    fn test_trailing_even_extension_is_ignored() {
        let ping = Message::Ping(Ping { num_pong_bytes: 4, ignored: vec![] });
        let mut bytes = ping.encode().unwrap().to_vec();
        bytes.extend_from_slice(&[0x04, 0x01, 0xaa]);
        assert_eq!(Message::decode(&bytes).unwrap(), ping);
    }

    #[test]
    fn test_unknown_message_type_parity() {
        let even = [0x7f, 0xfe, 1, 2, 3];
        match Message::decode(&even).unwrap() {
            Message::Unknown { msg_type, payload } => {
                assert_eq!(msg_type, 0x7ffe);
                assert_eq!(&payload[..], &[1, 2, 3]);
            }
            other => panic!("expected unknown message, got {:?}", other),
        }

        let odd = [0x7f, 0xff];
        assert_eq!(
            Message::decode(&odd),
            Err(WireError::UnknownRequiredMessage(0x7fff))
        );
    }

    #[test]
    fn test_init_preserves_even_extensions() {
        let mut extensions = TlvStream::new();
        extensions.insert(6, vec![1, 2]);
        let init = Message::Init(Init {
            features: Features::local_init(),
            extensions,
        });
        assert_eq!(Message::decode(&init.encode().unwrap()).unwrap(), init);
    }

    #[test]
    fn test_gossip_roundtrip() {
        let secp = Secp256k1::new();
        let key_a = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let key_b = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let announcement = ChannelAnnouncement::new_signed(
            &secp,
            ShortChannelId::new(1, 2, 3),
            &key_a,
            &key_b,
        )
        .unwrap();
        assert!(announcement.node_id_1.serialize() < announcement.node_id_2.serialize());

        let message = Message::ChannelAnnouncement(announcement);
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);

        let node = Message::NodeAnnouncement(NodeAnnouncement::new_signed(&secp, &key_a, "alice", 10).unwrap());
        assert_eq!(Message::decode(&node.encode().unwrap()).unwrap(), node);
    }

    #[test]
    fn test_oversized_gossip_features_rejected() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let mut node = NodeAnnouncement::new_signed(&secp, &key, "wide", 1).unwrap();
        node.features = Features::from_bytes(&vec![0x01; usize::from(u16::MAX) + 1]);

        assert!(matches!(node.signed_payload(), Err(WireError::MalformedMessage(_))));
        assert!(matches!(
            Message::NodeAnnouncement(node).encode(),
            Err(WireError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_gossip_type_detection() {
        assert!(is_gossip_type(MSG_CHANNEL_UPDATE));
        assert!(is_gossip_type(MSG_CHANNEL_ANNOUNCEMENT));
        assert!(!is_gossip_type(MSG_COMMITMENT_SIGNED));
        assert_eq!(peek_type(&[0x01, 0x02, 0xff]), Some(MSG_CHANNEL_UPDATE));
        assert_eq!(peek_type(&[0x01]), None);
    }
}
