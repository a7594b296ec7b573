//! Shared fixtures for unit tests

use crate::channel::{Channel, ChannelConfig, ChannelParams, ChannelState, ShortChannelId};
use crate::config::LightningConfig;
use crate::graph::NodeId;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

/// Deterministic node key derived from a single byte.
pub fn node_key(n: u8) -> SecretKey {
    SecretKey::from_slice(&[n; 32]).expect("valid secret key")
}

pub fn node_pubkey(n: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), &node_key(n))
}

pub fn node_id(n: u8) -> NodeId {
    NodeId::new(node_pubkey(n))
}

pub fn test_config() -> LightningConfig {
    LightningConfig {
        handshake_timeout_secs: 2,
        ..LightningConfig::default()
    }
}

/// Both ends of a fresh channel in the OPENING state.
pub fn channel_pair(balance_a: u64, balance_b: u64) -> (Channel, Channel) {
    let (params_a, params_b) = ChannelParams::new_pair(
        [0x42; 32],
        0,
        ShortChannelId::new(600_000, 1, 0),
        (node_pubkey(1), balance_a),
        (node_pubkey(2), balance_b),
        ChannelConfig::default(),
    );
    (
        Channel::new(params_a).expect("channel a"),
        Channel::new(params_b).expect("channel b"),
    )
}

/// Both ends of an open channel that have exchanged `channel_reestablish`.
pub fn open_channel_pair(balance_a: u64, balance_b: u64) -> (Channel, Channel) {
    let (mut a, mut b) = channel_pair(balance_a, balance_b);
    a.set_state(ChannelState::Open).expect("open a");
    b.set_state(ChannelState::Open).expect("open b");
    let from_a = a.reestablish_message();
    let from_b = b.reestablish_message();
    a.verify_reestablish(&from_b).expect("reestablish a");
    b.verify_reestablish(&from_a).expect("reestablish b");
    (a, b)
}
