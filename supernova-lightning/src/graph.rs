// SuperNova Lightning Network - Channel Graph
//
// Gossip-fed view of the network. Writers build the next version of the
// graph and swap it in under the lock; readers hold an immutable snapshot.

use crate::channel::ShortChannelId;
use crate::wire::messages::{gossip_digest, CHANNEL_FLAG_DIRECTION, CHANNEL_FLAG_DISABLED};
use crate::wire::{ChannelAnnouncement, ChannelUpdate, Features, Message, NodeAnnouncement};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, Secp256k1, SecretKey, Signing, VerifyOnly};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Invalid gossip signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid announcement: {0}")]
    InvalidAnnouncement(String),

    #[error("Not a gossip message: {0}")]
    NotGossip(&'static str),

    #[error("Graph lock poisoned")]
    LockPoisoned,
}

/// Node identity (compressed public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(PublicKey);

impl NodeId {
    pub fn new(key: PublicKey) -> Self {
        Self(key)
    }

    pub fn public_key(&self) -> PublicKey {
        self.0
    }

    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serialize().cmp(&other.serialize())
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.serialize()))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl From<PublicKey> for NodeId {
    fn from(key: PublicKey) -> Self {
        Self(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_id: NodeId,
    pub alias: String,
    pub features: Features,
    pub rgb_color: [u8; 3],
    pub last_update: u32,
}

/// Forwarding policy of one direction of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub htlc_maximum_msat: u64,
    pub disabled: bool,
    pub last_update: u32,
}

impl ChannelPolicy {
    /// Fee charged for forwarding `amount_msat` over this direction.
    pub fn fee_for(&self, amount_msat: u64) -> u64 {
        let proportional =
            u128::from(amount_msat) * u128::from(self.fee_proportional_millionths) / 1_000_000;
        u64::from(self.fee_base_msat).saturating_add(u64::try_from(proportional).unwrap_or(u64::MAX))
    }

    pub fn accepts(&self, amount_msat: u64) -> bool {
        !self.disabled && amount_msat >= self.htlc_minimum_msat && amount_msat <= self.htlc_maximum_msat
    }

    fn from_update(update: &ChannelUpdate) -> Self {
        Self {
            fee_base_msat: update.fee_base_msat,
            fee_proportional_millionths: update.fee_proportional_millionths,
            cltv_expiry_delta: update.cltv_expiry_delta,
            htlc_minimum_msat: update.htlc_minimum_msat,
            htlc_maximum_msat: update.htlc_maximum_msat,
            disabled: update.is_disabled(),
            last_update: update.timestamp,
        }
    }

    /// Signed `channel_update` advertising this policy for `direction`.
    pub fn signed_update<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        node_key: &SecretKey,
        short_channel_id: ShortChannelId,
        direction: usize,
    ) -> ChannelUpdate {
        let mut channel_flags = (direction as u8) & CHANNEL_FLAG_DIRECTION;
        if self.disabled {
            channel_flags |= CHANNEL_FLAG_DISABLED;
        }
        let mut update = ChannelUpdate {
            signature: placeholder_signature(secp, node_key),
            short_channel_id,
            timestamp: self.last_update,
            message_flags: 1,
            channel_flags,
            cltv_expiry_delta: self.cltv_expiry_delta,
            htlc_minimum_msat: self.htlc_minimum_msat,
            fee_base_msat: self.fee_base_msat,
            fee_proportional_millionths: self.fee_proportional_millionths,
            htlc_maximum_msat: self.htlc_maximum_msat,
        };
        update.sign(secp, node_key);
        update
    }
}

fn placeholder_signature<C: Signing>(secp: &Secp256k1<C>, key: &SecretKey) -> Signature {
    secp.sign_ecdsa(&gossip_digest(&[]), key)
}

/// A channel and the policies of both of its directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub short_channel_id: ShortChannelId,
    /// Lexicographically smaller node
    pub node_1: NodeId,
    pub node_2: NodeId,
    pub features: Features,
    /// Policy for node_1 -> node_2
    pub one_to_two: Option<ChannelPolicy>,
    /// Policy for node_2 -> node_1
    pub two_to_one: Option<ChannelPolicy>,
    /// Added from a channel of our own rather than from gossip
    pub local: bool,
}

impl ChannelInfo {
    fn policy_slot(&mut self, direction: usize) -> &mut Option<ChannelPolicy> {
        if direction == 0 {
            &mut self.one_to_two
        } else {
            &mut self.two_to_one
        }
    }

    /// Node that announces the policy for `direction`.
    pub fn source_of(&self, direction: usize) -> NodeId {
        if direction == 0 {
            self.node_1
        } else {
            self.node_2
        }
    }
}

/// A routable direction of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectedEdge {
    pub short_channel_id: ShortChannelId,
    pub from: NodeId,
    pub to: NodeId,
    pub policy: ChannelPolicy,
}

/// Immutable version of the graph. Each map is shared between versions
/// until a write touches it.
#[derive(Debug, Clone, Default)]
pub struct GraphData {
    nodes: Arc<HashMap<NodeId, Node>>,
    channels: Arc<HashMap<ShortChannelId, ChannelInfo>>,
    channels_by_node: Arc<HashMap<NodeId, BTreeSet<ShortChannelId>>>,
}

impl GraphData {
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn channel(&self, short_channel_id: &ShortChannelId) -> Option<&ChannelInfo> {
        self.channels.get(short_channel_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Directed edges ending at `node` that carry a policy.
    pub fn edges_into(&self, node: &NodeId) -> Vec<DirectedEdge> {
        let Some(scids) = self.channels_by_node.get(node) else {
            return Vec::new();
        };
        scids
            .iter()
            .filter_map(|scid| self.channels.get(scid))
            .filter_map(|info| {
                let (from, policy) = if info.node_2 == *node {
                    (info.node_1, info.one_to_two?)
                } else {
                    (info.node_2, info.two_to_one?)
                };
                Some(DirectedEdge {
                    short_channel_id: info.short_channel_id,
                    from,
                    to: *node,
                    policy,
                })
            })
            .collect()
    }

    fn insert_channel(&mut self, info: ChannelInfo) {
        let by_node = Arc::make_mut(&mut self.channels_by_node);
        for node in [info.node_1, info.node_2] {
            by_node.entry(node).or_default().insert(info.short_channel_id);
        }
        Arc::make_mut(&mut self.channels).insert(info.short_channel_id, info);
    }

    fn remove_channel(&mut self, short_channel_id: &ShortChannelId) -> Option<ChannelInfo> {
        if !self.channels.contains_key(short_channel_id) {
            return None;
        }
        let info = Arc::make_mut(&mut self.channels).remove(short_channel_id)?;
        let by_node = Arc::make_mut(&mut self.channels_by_node);
        for node in [info.node_1, info.node_2] {
            if let Some(set) = by_node.get_mut(&node) {
                set.remove(short_channel_id);
                if set.is_empty() {
                    by_node.remove(&node);
                }
            }
        }
        Some(info)
    }

    fn channel_mut(&mut self, short_channel_id: &ShortChannelId) -> Option<&mut ChannelInfo> {
        if !self.channels.contains_key(short_channel_id) {
            return None;
        }
        Arc::make_mut(&mut self.channels).get_mut(short_channel_id)
    }
}

/// Shared, concurrently updated channel graph
pub struct NetworkGraph {
    data: RwLock<Arc<GraphData>>,
    secp: Secp256k1<VerifyOnly>,
}

impl Default for NetworkGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetworkGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkGraph").finish_non_exhaustive()
    }
}

impl NetworkGraph {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Arc::new(GraphData::default())),
            secp: Secp256k1::verification_only(),
        }
    }

    /// Immutable view for path finding.
    pub fn snapshot(&self) -> Result<Arc<GraphData>, GraphError> {
        self.data
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| GraphError::LockPoisoned)
    }

    /// Apply `f` to the current graph. Snapshots taken earlier keep seeing
    /// the previous version; with none outstanding the write is in place.
    fn update<T>(&self, f: impl FnOnce(&mut GraphData) -> T) -> Result<T, GraphError> {
        let mut guard = self.data.write().map_err(|_| GraphError::LockPoisoned)?;
        Ok(f(Arc::make_mut(&mut guard)))
    }

    fn verify(&self, payload: &[u8], signature: &Signature, key: &PublicKey) -> Result<(), GraphError> {
        self.secp
            .verify_ecdsa(&gossip_digest(payload), signature, key)
            .map_err(|e| GraphError::InvalidSignature(e.to_string()))
    }

    /// Apply any gossip message. Returns whether the graph changed.
    pub fn apply_announcement(&self, message: &Message) -> Result<bool, GraphError> {
        match message {
            Message::ChannelAnnouncement(msg) => self.apply_channel_announcement(msg),
            Message::NodeAnnouncement(msg) => self.apply_node_announcement(msg),
            Message::ChannelUpdate(msg) => self.apply_policy_update(msg),
            other => Err(GraphError::NotGossip(other.name())),
        }
    }

    pub fn apply_channel_announcement(&self, msg: &ChannelAnnouncement) -> Result<bool, GraphError> {
        if msg.node_id_1.serialize() >= msg.node_id_2.serialize() {
            return Err(GraphError::InvalidAnnouncement(
                "node ids are not in ascending order".to_string(),
            ));
        }
        let payload = msg
            .signed_payload()
            .map_err(|e| GraphError::InvalidAnnouncement(e.to_string()))?;
        self.verify(&payload, &msg.node_signature_1, &msg.node_id_1)?;
        self.verify(&payload, &msg.node_signature_2, &msg.node_id_2)?;

        let info = ChannelInfo {
            short_channel_id: msg.short_channel_id,
            node_1: NodeId::new(msg.node_id_1),
            node_2: NodeId::new(msg.node_id_2),
            features: msg.features.clone(),
            one_to_two: None,
            two_to_one: None,
            local: false,
        };
        self.update(|data| {
            if data.channels.contains_key(&info.short_channel_id) {
                return false;
            }
            debug!("Added channel {} to graph", info.short_channel_id);
            data.insert_channel(info);
            true
        })
    }

    pub fn apply_node_announcement(&self, msg: &NodeAnnouncement) -> Result<bool, GraphError> {
        let payload = msg
            .signed_payload()
            .map_err(|e| GraphError::InvalidAnnouncement(e.to_string()))?;
        self.verify(&payload, &msg.signature, &msg.node_id)?;

        let node = Node {
            node_id: NodeId::new(msg.node_id),
            alias: msg.alias_text(),
            features: msg.features.clone(),
            rgb_color: msg.rgb_color,
            last_update: msg.timestamp,
        };
        self.update(|data| {
            if let Some(existing) = data.nodes.get(&node.node_id) {
                if existing.last_update >= node.last_update {
                    return false;
                }
            }
            Arc::make_mut(&mut data.nodes).insert(node.node_id, node);
            true
        })
    }

    /// Update one direction of a known channel. Updates for unknown
    /// channels and stale updates are ignored.
    pub fn apply_policy_update(&self, msg: &ChannelUpdate) -> Result<bool, GraphError> {
        let direction = msg.direction();
        let source = {
            let current = self.snapshot()?;
            match current.channels.get(&msg.short_channel_id) {
                Some(info) => info.source_of(direction),
                None => {
                    debug!("Ignoring update for unknown channel {}", msg.short_channel_id);
                    return Ok(false);
                }
            }
        };
        self.verify(&msg.signed_payload(), &msg.signature, &source.public_key())?;

        let policy = ChannelPolicy::from_update(msg);
        self.update(|data| {
            let Some(info) = data.channel_mut(&msg.short_channel_id) else {
                return false;
            };
            // The channel may have been replaced since the signature check.
            if info.source_of(direction) != source {
                warn!("Channel {} changed endpoints during update", msg.short_channel_id);
                return false;
            }
            let slot = info.policy_slot(direction);
            if matches!(slot, Some(existing) if existing.last_update >= policy.last_update) {
                return false;
            }
            *slot = Some(policy);
            true
        })
    }

    /// Admit one of our own channels once it is open. Only our outgoing
    /// direction is known until the counterparty sends an update.
    pub fn add_local_channel(
        &self,
        short_channel_id: ShortChannelId,
        local: NodeId,
        remote: NodeId,
        local_policy: ChannelPolicy,
    ) -> Result<(), GraphError> {
        let (node_1, node_2) = if local < remote { (local, remote) } else { (remote, local) };
        let mut info = ChannelInfo {
            short_channel_id,
            node_1,
            node_2,
            features: Features::empty(),
            one_to_two: None,
            two_to_one: None,
            local: true,
        };
        *info.policy_slot(usize::from(local != node_1)) = Some(local_policy);

        self.update(|data| {
            if let Some(existing) = data.remove_channel(&short_channel_id) {
                info.one_to_two = info.one_to_two.or(existing.one_to_two);
                info.two_to_one = info.two_to_one.or(existing.two_to_one);
            }
            data.insert_channel(info);
        })
    }

    pub fn remove_channel(&self, short_channel_id: &ShortChannelId) -> Result<bool, GraphError> {
        self.update(|data| data.remove_channel(short_channel_id).is_some())
    }
}
