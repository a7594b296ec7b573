// SuperNova Lightning Network - Wire Message Payloads
//
// Field layouts for every message kind the engine speaks. Each payload knows
// how to write itself after the type prefix and how to read itself back.

use super::features::Features;
use super::tlv::TlvStream;
use super::{Reader, WireError};
use crate::channel::{ChannelId, ShortChannelId};
use crate::digest::sha256d;
use bytes::{BufMut, BytesMut};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message as SecpMessage, PublicKey, Secp256k1, SecretKey, Signing};

/// TLV type carrying downstream hop instructions in `update_add_htlc`.
pub const TLV_HOP_PAYLOADS: u64 = 2;

/// Size of one serialized [`HopPayload`].
const HOP_PAYLOAD_LEN: usize = 8 + 8 + 4;

fn put_var(out: &mut BytesMut, bytes: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| WireError::MalformedMessage(format!("field of {} bytes", bytes.len())))?;
    out.put_u16(len);
    out.put_slice(bytes);
    Ok(())
}

fn put_signature(out: &mut BytesMut, signature: &Signature) {
    out.put_slice(&signature.serialize_compact());
}

fn read_signature(reader: &mut Reader<'_>, field: &str) -> Result<Signature, WireError> {
    let raw: [u8; 64] = reader.array(field)?;
    Signature::from_compact(&raw)
        .map_err(|e| WireError::MalformedMessage(format!("{}: {}", field, e)))
}

fn read_pubkey(reader: &mut Reader<'_>, field: &str) -> Result<PublicKey, WireError> {
    let raw: [u8; 33] = reader.array(field)?;
    PublicKey::from_slice(&raw)
        .map_err(|e| WireError::MalformedMessage(format!("{}: {}", field, e)))
}

/// Double-SHA256 digest used for gossip signatures.
pub fn gossip_digest(payload: &[u8]) -> SecpMessage {
    sha256d(payload).to_message()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub features: Features,
    pub extensions: TlvStream,
}

impl Init {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        put_var(out, &[])?;
        put_var(out, self.features.as_bytes())?;
        self.extensions.encode(out);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let global = Features::from_bytes(reader.var_bytes("globalfeatures")?);
        let local = Features::from_bytes(reader.var_bytes("features")?);
        let extensions = TlvStream::decode(reader.rest(), &[])?;
        Ok(Self {
            features: global.union(&local),
            extensions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// All zeroes refers to every channel with the peer.
    pub channel_id: ChannelId,
    pub data: Vec<u8>,
}

impl ErrorMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        put_var(out, &self.data)
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            data: reader.var_bytes("data")?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub num_pong_bytes: u16,
    pub ignored: Vec<u8>,
}

impl Ping {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_u16(self.num_pong_bytes);
        put_var(out, &self.ignored)
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            num_pong_bytes: reader.u16("num_pong_bytes")?,
            ignored: reader.var_bytes("ignored")?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub ignored: Vec<u8>,
}

impl Pong {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        put_var(out, &self.ignored)
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            ignored: reader.var_bytes("ignored")?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    pub channel_id: ChannelId,
    pub scriptpubkey: Vec<u8>,
}

impl Shutdown {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        put_var(out, &self.scriptpubkey)
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            scriptpubkey: reader.var_bytes("scriptpubkey")?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosingSigned {
    pub channel_id: ChannelId,
    pub fee_satoshis: u64,
    pub signature: Signature,
}

impl ClosingSigned {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        out.put_u64(self.fee_satoshis);
        put_signature(out, &self.signature);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            fee_satoshis: reader.u64("fee_satoshis")?,
            signature: read_signature(reader, "signature")?,
        })
    }
}

/// Forwarding instruction for one downstream hop, sent in clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopPayload {
    pub short_channel_id: ShortChannelId,
    pub amount_to_forward: u64,
    pub outgoing_cltv_value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAddHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: [u8; 32],
    pub cltv_expiry: u32,
    /// Remaining hops after the receiver. Empty means the receiver is the payee.
    pub hops: Vec<HopPayload>,
    pub extensions: TlvStream,
}

impl UpdateAddHtlc {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        out.put_u64(self.id);
        out.put_u64(self.amount_msat);
        out.put_slice(&self.payment_hash);
        out.put_u32(self.cltv_expiry);

        let mut stream = self.extensions.clone();
        if !self.hops.is_empty() {
            let mut value = BytesMut::with_capacity(self.hops.len() * HOP_PAYLOAD_LEN);
            for hop in &self.hops {
                value.put_u64(hop.short_channel_id.to_u64());
                value.put_u64(hop.amount_to_forward);
                value.put_u32(hop.outgoing_cltv_value);
            }
            stream.insert(TLV_HOP_PAYLOADS, value.to_vec());
        }
        stream.encode(out);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let channel_id = ChannelId::new(reader.array("channel_id")?);
        let id = reader.u64("id")?;
        let amount_msat = reader.u64("amount_msat")?;
        let payment_hash = reader.array("payment_hash")?;
        let cltv_expiry = reader.u32("cltv_expiry")?;
        let mut extensions = TlvStream::decode(reader.rest(), &[TLV_HOP_PAYLOADS])?;

        let hops = match extensions.remove(TLV_HOP_PAYLOADS) {
            Some(value) => {
                if value.len() % HOP_PAYLOAD_LEN != 0 {
                    return Err(WireError::MalformedMessage(format!(
                        "hop payloads of {} bytes",
                        value.len()
                    )));
                }
                let mut hops = Vec::with_capacity(value.len() / HOP_PAYLOAD_LEN);
                let mut hop_reader = Reader::new(&value);
                while !hop_reader.is_empty() {
                    hops.push(HopPayload {
                        short_channel_id: ShortChannelId::from_u64(hop_reader.u64("short_channel_id")?),
                        amount_to_forward: hop_reader.u64("amount_to_forward")?,
                        outgoing_cltv_value: hop_reader.u32("outgoing_cltv_value")?,
                    });
                }
                hops
            }
            None => Vec::new(),
        };

        Ok(Self {
            channel_id,
            id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            hops,
            extensions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFulfillHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub payment_preimage: [u8; 32],
}

impl UpdateFulfillHtlc {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        out.put_u64(self.id);
        out.put_slice(&self.payment_preimage);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            id: reader.u64("id")?,
            payment_preimage: reader.array("payment_preimage")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailHtlc {
    pub channel_id: ChannelId,
    pub id: u64,
    pub reason: Vec<u8>,
}

impl UpdateFailHtlc {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        out.put_u64(self.id);
        put_var(out, &self.reason)
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            id: reader.u64("id")?,
            reason: reader.var_bytes("reason")?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentSigned {
    pub channel_id: ChannelId,
    pub signature: Signature,
}

impl CommitmentSigned {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        put_signature(out, &self.signature);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            signature: read_signature(reader, "signature")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeAndAck {
    pub channel_id: ChannelId,
    pub per_commitment_secret: [u8; 32],
    pub next_per_commitment_point: [u8; 32],
}

impl RevokeAndAck {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        out.put_slice(&self.per_commitment_secret);
        out.put_slice(&self.next_per_commitment_point);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            per_commitment_secret: reader.array("per_commitment_secret")?,
            next_per_commitment_point: reader.array("next_per_commitment_point")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReestablish {
    pub channel_id: ChannelId,
    pub next_commitment_number: u64,
    pub next_revocation_number: u64,
    pub your_last_per_commitment_secret: [u8; 32],
    pub my_current_per_commitment_point: [u8; 32],
}

impl ChannelReestablish {
    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        out.put_slice(self.channel_id.as_bytes());
        out.put_u64(self.next_commitment_number);
        out.put_u64(self.next_revocation_number);
        out.put_slice(&self.your_last_per_commitment_secret);
        out.put_slice(&self.my_current_per_commitment_point);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channel_id: ChannelId::new(reader.array("channel_id")?),
            next_commitment_number: reader.u64("next_commitment_number")?,
            next_revocation_number: reader.u64("next_revocation_number")?,
            your_last_per_commitment_secret: reader.array("your_last_per_commitment_secret")?,
            my_current_per_commitment_point: reader.array("my_current_per_commitment_point")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAnnouncement {
    pub node_signature_1: Signature,
    pub node_signature_2: Signature,
    pub features: Features,
    pub short_channel_id: ShortChannelId,
    pub node_id_1: PublicKey,
    pub node_id_2: PublicKey,
}

impl ChannelAnnouncement {
    /// Build and sign an announcement. Node ids are ordered so that
    /// `node_id_1` is the lexicographically smaller key.
    pub fn new_signed<C: Signing>(
        secp: &Secp256k1<C>,
        short_channel_id: ShortChannelId,
        key_a: &SecretKey,
        key_b: &SecretKey,
    ) -> Result<Self, WireError> {
        let (mut key_1, mut key_2) = (key_a, key_b);
        let mut node_id_1 = PublicKey::from_secret_key(secp, key_1);
        let mut node_id_2 = PublicKey::from_secret_key(secp, key_2);
        if node_id_1.serialize() > node_id_2.serialize() {
            std::mem::swap(&mut key_1, &mut key_2);
            std::mem::swap(&mut node_id_1, &mut node_id_2);
        }

        let features = Features::empty();
        let mut payload = BytesMut::new();
        Self::write_unsigned_fields(&mut payload, &features, short_channel_id, &node_id_1, &node_id_2)?;
        let digest = gossip_digest(&payload);

        Ok(Self {
            node_signature_1: secp.sign_ecdsa(&digest, key_1),
            node_signature_2: secp.sign_ecdsa(&digest, key_2),
            features,
            short_channel_id,
            node_id_1,
            node_id_2,
        })
    }

    /// Bytes covered by the node signatures.
    pub fn signed_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut out = BytesMut::new();
        self.write_unsigned(&mut out)?;
        Ok(out.to_vec())
    }

    fn write_unsigned(&self, out: &mut BytesMut) -> Result<(), WireError> {
        Self::write_unsigned_fields(
            out,
            &self.features,
            self.short_channel_id,
            &self.node_id_1,
            &self.node_id_2,
        )
    }

    fn write_unsigned_fields(
        out: &mut BytesMut,
        features: &Features,
        short_channel_id: ShortChannelId,
        node_id_1: &PublicKey,
        node_id_2: &PublicKey,
    ) -> Result<(), WireError> {
        put_var(out, features.as_bytes())?;
        out.put_u64(short_channel_id.to_u64());
        out.put_slice(&node_id_1.serialize());
        out.put_slice(&node_id_2.serialize());
        Ok(())
    }

    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        put_signature(out, &self.node_signature_1);
        put_signature(out, &self.node_signature_2);
        self.write_unsigned(out)
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            node_signature_1: read_signature(reader, "node_signature_1")?,
            node_signature_2: read_signature(reader, "node_signature_2")?,
            features: Features::from_bytes(reader.var_bytes("features")?),
            short_channel_id: ShortChannelId::from_u64(reader.u64("short_channel_id")?),
            node_id_1: read_pubkey(reader, "node_id_1")?,
            node_id_2: read_pubkey(reader, "node_id_2")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAnnouncement {
    pub signature: Signature,
    pub features: Features,
    pub timestamp: u32,
    pub node_id: PublicKey,
    pub rgb_color: [u8; 3],
    pub alias: [u8; 32],
}

impl NodeAnnouncement {
    pub fn new_signed<C: Signing>(
        secp: &Secp256k1<C>,
        node_key: &SecretKey,
        alias: &str,
        timestamp: u32,
    ) -> Result<Self, WireError> {
        let mut alias_bytes = [0u8; 32];
        let raw = alias.as_bytes();
        let len = raw.len().min(32);
        alias_bytes[..len].copy_from_slice(&raw[..len]);

        let features = Features::empty();
        let node_id = PublicKey::from_secret_key(secp, node_key);
        let rgb_color = [0u8; 3];
        let mut payload = BytesMut::new();
        Self::write_unsigned_fields(&mut payload, &features, timestamp, &node_id, &rgb_color, &alias_bytes)?;

        Ok(Self {
            signature: secp.sign_ecdsa(&gossip_digest(&payload), node_key),
            features,
            timestamp,
            node_id,
            rgb_color,
            alias: alias_bytes,
        })
    }

    pub fn alias_text(&self) -> String {
        let end = self.alias.iter().position(|b| *b == 0).unwrap_or(32);
        String::from_utf8_lossy(&self.alias[..end]).into_owned()
    }

    pub fn signed_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut out = BytesMut::new();
        self.write_unsigned(&mut out)?;
        Ok(out.to_vec())
    }

    fn write_unsigned(&self, out: &mut BytesMut) -> Result<(), WireError> {
        Self::write_unsigned_fields(
            out,
            &self.features,
            self.timestamp,
            &self.node_id,
            &self.rgb_color,
            &self.alias,
        )
    }

    fn write_unsigned_fields(
        out: &mut BytesMut,
        features: &Features,
        timestamp: u32,
        node_id: &PublicKey,
        rgb_color: &[u8; 3],
        alias: &[u8; 32],
    ) -> Result<(), WireError> {
        put_var(out, features.as_bytes())?;
        out.put_u32(timestamp);
        out.put_slice(&node_id.serialize());
        out.put_slice(rgb_color);
        out.put_slice(alias);
        Ok(())
    }

    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        put_signature(out, &self.signature);
        self.write_unsigned(out)
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            signature: read_signature(reader, "signature")?,
            features: Features::from_bytes(reader.var_bytes("features")?),
            timestamp: reader.u32("timestamp")?,
            node_id: read_pubkey(reader, "node_id")?,
            rgb_color: reader.array("rgb_color")?,
            alias: reader.array("alias")?,
        })
    }
}

/// `channel_flags` bit 0: direction (0 = from node_id_1).
pub const CHANNEL_FLAG_DIRECTION: u8 = 0x01;
/// `channel_flags` bit 1: channel disabled.
pub const CHANNEL_FLAG_DISABLED: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub signature: Signature,
    pub short_channel_id: ShortChannelId,
    pub timestamp: u32,
    pub message_flags: u8,
    pub channel_flags: u8,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum_msat: u64,
}

impl ChannelUpdate {
    /// Index of the announcing node within the channel (0 or 1).
    pub fn direction(&self) -> usize {
        (self.channel_flags & CHANNEL_FLAG_DIRECTION) as usize
    }

    pub fn is_disabled(&self) -> bool {
        self.channel_flags & CHANNEL_FLAG_DISABLED != 0
    }

    /// Sign (or re-sign) the update with the announcing node's key.
    pub fn sign<C: Signing>(&mut self, secp: &Secp256k1<C>, node_key: &SecretKey) {
        self.signature = secp.sign_ecdsa(&gossip_digest(&self.signed_payload()), node_key);
    }

    pub fn signed_payload(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        self.write_unsigned(&mut out);
        out.to_vec()
    }

    fn write_unsigned(&self, out: &mut BytesMut) {
        out.put_u64(self.short_channel_id.to_u64());
        out.put_u32(self.timestamp);
        out.put_u8(self.message_flags);
        out.put_u8(self.channel_flags);
        out.put_u16(self.cltv_expiry_delta);
        out.put_u64(self.htlc_minimum_msat);
        out.put_u32(self.fee_base_msat);
        out.put_u32(self.fee_proportional_millionths);
        out.put_u64(self.htlc_maximum_msat);
    }

    pub(super) fn write(&self, out: &mut BytesMut) -> Result<(), WireError> {
        put_signature(out, &self.signature);
        self.write_unsigned(out);
        Ok(())
    }

    pub(super) fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            signature: read_signature(reader, "signature")?,
            short_channel_id: ShortChannelId::from_u64(reader.u64("short_channel_id")?),
            timestamp: reader.u32("timestamp")?,
            message_flags: reader.u8("message_flags")?,
            channel_flags: reader.u8("channel_flags")?,
            cltv_expiry_delta: reader.u16("cltv_expiry_delta")?,
            htlc_minimum_msat: reader.u64("htlc_minimum_msat")?,
            fee_base_msat: reader.u32("fee_base_msat")?,
            fee_proportional_millionths: reader.u32("fee_proportional_millionths")?,
            htlc_maximum_msat: reader.u64("htlc_maximum_msat")?,
        })
    }
}
