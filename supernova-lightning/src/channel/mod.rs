// SuperNova Lightning Network - Channel Implementation
//
// This module owns one bilateral ledger: balances, in-flight HTLCs,
// commitment numbering and revocation material, and the
// OPENING -> OPEN -> CLOSING -> CLOSED lifecycle.

pub mod commitment;
pub mod revocation;

pub use commitment::CommitmentView;
pub use revocation::{RevocationSeed, RevocationStore};

use crate::digest::{sha256, Hash32};
use crate::payment::{FailureReason, PaymentHash, PaymentPreimage};
use crate::wire::{
    ChannelReestablish, ClosingSigned, CommitmentSigned, RevokeAndAck, Shutdown, UpdateAddHtlc,
};
use rand::RngCore;
use revocation::per_commitment_point;
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for channel operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Insufficient balance: required {required} msat, available {available} msat")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Channel not open (state {0:?})")]
    ChannelNotOpen(ChannelState),

    #[error("HTLC {0} not found")]
    HtlcNotFound(u64),

    #[error("Preimage does not match payment hash of HTLC {0}")]
    PreimageMismatch(u64),

    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: ChannelState, to: ChannelState },

    #[error("HTLC amount {amount} msat below channel minimum {minimum} msat")]
    HtlcBelowMinimum { amount: u64, minimum: u64 },

    #[error("Too many pending HTLCs (limit {0})")]
    TooManyHtlcs(u16),

    #[error("Balance conservation violated")]
    ConservationViolation,

    #[error("Invalid commitment signature")]
    InvalidCommitmentSignature,

    #[error("Invalid revocation: {0}")]
    InvalidRevocation(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Unique identifier for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId([u8; 32]);

impl ChannelId {
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    /// The all-zero id, meaning "every channel" in error messages.
    pub fn all() -> Self {
        Self([0u8; 32])
    }

    /// Funding txid with the output index XORed into its last two bytes
    pub fn from_funding_outpoint(txid: &[u8; 32], output_index: u16) -> Self {
        let mut id = *txid;
        let index = output_index.to_be_bytes();
        id[30] ^= index[0];
        id[31] ^= index[1];
        Self(id)
    }

    /// Get the raw ID bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Location of the funding output: block height, transaction index, output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortChannelId(u64);

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        Self(
            ((block_height as u64 & 0xff_ffff) << 40)
                | ((tx_index as u64 & 0xff_ffff) << 16)
                | output_index as u64,
        )
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn block_height(self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(self) -> u32 {
        ((self.0 >> 16) & 0xff_ffff) as u32
    }

    pub fn output_index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Funding negotiated, not yet usable
    Opening,
    /// Channel is operational and can process payments
    Open,
    /// Shutdown exchanged; pending HTLCs may still resolve
    Closing,
    /// Channel has been closed
    Closed,
}

impl ChannelState {
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        matches!(
            (self, next),
            (ChannelState::Opening, ChannelState::Open)
                | (ChannelState::Open, ChannelState::Closing)
                | (ChannelState::Closing, ChannelState::Closed)
        )
    }
}

/// HTLC direction from our side of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HtlcDirection {
    /// We offered it; paid from our balance
    Offered,
    /// The counterparty offered it; paid from theirs
    Received,
}

impl HtlcDirection {
    pub fn flip(self) -> Self {
        match self {
            HtlcDirection::Offered => HtlcDirection::Received,
            HtlcDirection::Received => HtlcDirection::Offered,
        }
    }
}

/// Fields of an HTLC that enter a commitment digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcSummary {
    pub id: u64,
    pub direction: HtlcDirection,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
}

/// Hash Time Locked Contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    pub id: u64,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
    pub direction: HtlcDirection,
    /// Progress of the add through both commitments.
    add: UpdateProgress,
    locked_in: bool,
}

/// How far one update (an add, fulfill or fail) has travelled through the
/// two commitments.
///
/// An update sent by one side appears in the other side's commitment as
/// soon as the sender signs. It appears in the sender's own commitment
/// only once the other side has revoked for it. Both parties derive the
/// same view from these rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProgress {
    /// Covered by a commitment the counterparty signed for us.
    local_signed: bool,
    /// Covered by a commitment we signed for the counterparty.
    remote_signed: bool,
    /// The counterparty revoked its previous commitment after that signature.
    remote_revoked: bool,
}

impl UpdateProgress {
    fn irrevocable(&self) -> bool {
        self.local_signed && self.remote_revoked
    }

    /// Whether the update belongs in the commitment held by us
    /// (`holder_is_local`) or by the counterparty. `ours` is true when we
    /// sent the update.
    fn in_view(&self, ours: bool, holder_is_local: bool) -> bool {
        if holder_is_local {
            !ours || self.remote_revoked
        } else {
            ours || self.local_signed
        }
    }
}

/// An HTLC removed from the ledger whose removal is not yet committed on
/// both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedHtlc {
    htlc: Htlc,
    fulfilled: bool,
    progress: UpdateProgress,
}

impl ResolvedHtlc {
    /// The side that received an HTLC is the one that resolves it.
    fn ours(&self) -> bool {
        self.htlc.direction == HtlcDirection::Received
    }
}

impl Htlc {
    fn ours(&self) -> bool {
        self.direction == HtlcDirection::Offered
    }

    /// Irrevocably committed on both sides; only then may it be resolved.
    pub fn is_locked_in(&self) -> bool {
        self.locked_in
    }

    pub fn summary(&self) -> HtlcSummary {
        HtlcSummary {
            id: self.id,
            direction: self.direction,
            amount_msat: self.amount_msat,
            payment_hash: self.payment_hash,
            cltv_expiry: self.cltv_expiry,
        }
    }
}

type HtlcKey = (HtlcDirection, u64);

/// Balances and in-flight HTLCs. HTLC amounts are reserved out of the
/// payer's balance when added, so the three parts always sum to capacity.
/// This is the latest state, with every update we know of applied.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ledger {
    local_balance_msat: u64,
    remote_balance_msat: u64,
    htlcs: BTreeMap<HtlcKey, Htlc>,
    /// Settled or failed HTLCs kept until the removal is irrevocable.
    resolved: BTreeMap<HtlcKey, ResolvedHtlc>,
}

impl Ledger {
    fn total(&self) -> Option<u64> {
        self.htlcs
            .values()
            .try_fold(self.local_balance_msat, |acc, h| acc.checked_add(h.amount_msat))?
            .checked_add(self.remote_balance_msat)
    }
}

/// Channel limits enforced on every added HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub max_accepted_htlcs: u16,
    pub htlc_minimum_msat: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_accepted_htlcs: 30,
            htlc_minimum_msat: 1,
        }
    }
}

/// Everything needed to construct one side of a funded channel.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub funding_txid: [u8; 32],
    pub funding_output_index: u16,
    pub short_channel_id: ShortChannelId,
    pub local_node_id: PublicKey,
    pub remote_node_id: PublicKey,
    pub funding_key: SecretKey,
    pub remote_funding_pubkey: PublicKey,
    pub revocation_seed: RevocationSeed,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub config: ChannelConfig,
}

impl ChannelParams {
    /// Matching parameters for both ends of one channel, with fresh funding
    /// keys and revocation seeds. `a` and `b` are (node id, balance) pairs.
    pub fn new_pair(
        funding_txid: [u8; 32],
        funding_output_index: u16,
        short_channel_id: ShortChannelId,
        a: (PublicKey, u64),
        b: (PublicKey, u64),
        config: ChannelConfig,
    ) -> (ChannelParams, ChannelParams) {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let key_a = SecretKey::new(&mut rng);
        let key_b = SecretKey::new(&mut rng);
        let mut seed_a = [0u8; 32];
        let mut seed_b = [0u8; 32];
        rng.fill_bytes(&mut seed_a);
        rng.fill_bytes(&mut seed_b);

        let side_a = ChannelParams {
            funding_txid,
            funding_output_index,
            short_channel_id,
            local_node_id: a.0,
            remote_node_id: b.0,
            funding_key: key_a,
            remote_funding_pubkey: PublicKey::from_secret_key(&secp, &key_b),
            revocation_seed: RevocationSeed::new(seed_a),
            local_balance_msat: a.1,
            remote_balance_msat: b.1,
            config,
        };
        let side_b = ChannelParams {
            funding_txid,
            funding_output_index,
            short_channel_id,
            local_node_id: b.0,
            remote_node_id: a.0,
            funding_key: key_b,
            remote_funding_pubkey: PublicKey::from_secret_key(&secp, &key_a),
            revocation_seed: RevocationSeed::new(seed_b),
            local_balance_msat: b.1,
            remote_balance_msat: a.1,
            config,
        };
        (side_a, side_b)
    }
}

/// Progress of a cooperative close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CloseProgress {
    local_shutdown_sent: bool,
    remote_shutdown_received: bool,
    we_initiated: bool,
    closing_signed_sent: bool,
}

/// Persistable view of a channel, handed to the wallet collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel_id: ChannelId,
    pub short_channel_id: ShortChannelId,
    pub state: ChannelState,
    pub remote_node_id: String,
    pub capacity_msat: u64,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub local_commitment_number: u64,
    pub remote_commitment_number: u64,
    pub next_local_htlc_id: u64,
    pub next_remote_htlc_id: u64,
    pub pending_htlcs: Vec<Htlc>,
    pub remote_revocations: RevocationStore,
}

/// A bilateral payment channel
pub struct Channel {
    channel_id: ChannelId,
    short_channel_id: ShortChannelId,
    state: ChannelState,
    capacity_msat: u64,
    local_node_id: PublicKey,
    remote_node_id: PublicKey,
    funding_key: SecretKey,
    remote_funding_pubkey: PublicKey,
    revocation_seed: RevocationSeed,
    remote_revocations: RevocationStore,
    remote_current_point: Option<[u8; 32]>,
    ledger: Ledger,
    next_local_htlc_id: u64,
    next_remote_htlc_id: u64,
    local_commitment_number: u64,
    remote_commitment_number: u64,
    awaiting_revocation: bool,
    reestablished: bool,
    close: CloseProgress,
    config: ChannelConfig,
    secp: Secp256k1<All>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.channel_id)
            .field("short_channel_id", &self.short_channel_id)
            .field("state", &self.state)
            .field("local_balance_msat", &self.ledger.local_balance_msat)
            .field("remote_balance_msat", &self.ledger.remote_balance_msat)
            .field("pending_htlcs", &self.ledger.htlcs.len())
            .finish()
    }
}

impl Channel {
    pub fn new(params: ChannelParams) -> Result<Self, ChannelError> {
        let capacity_msat = params
            .local_balance_msat
            .checked_add(params.remote_balance_msat)
            .ok_or(ChannelError::ConservationViolation)?;

        Ok(Self {
            channel_id: ChannelId::from_funding_outpoint(
                &params.funding_txid,
                params.funding_output_index,
            ),
            short_channel_id: params.short_channel_id,
            state: ChannelState::Opening,
            capacity_msat,
            local_node_id: params.local_node_id,
            remote_node_id: params.remote_node_id,
            funding_key: params.funding_key,
            remote_funding_pubkey: params.remote_funding_pubkey,
            revocation_seed: params.revocation_seed,
            remote_revocations: RevocationStore::new(),
            remote_current_point: None,
            ledger: Ledger {
                local_balance_msat: params.local_balance_msat,
                remote_balance_msat: params.remote_balance_msat,
                htlcs: BTreeMap::new(),
                resolved: BTreeMap::new(),
            },
            next_local_htlc_id: 0,
            next_remote_htlc_id: 0,
            local_commitment_number: 0,
            remote_commitment_number: 0,
            awaiting_revocation: false,
            reestablished: false,
            close: CloseProgress::default(),
            config: params.config,
            secp: Secp256k1::new(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn short_channel_id(&self) -> ShortChannelId {
        self.short_channel_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn local_node_id(&self) -> PublicKey {
        self.local_node_id
    }

    pub fn remote_node_id(&self) -> PublicKey {
        self.remote_node_id
    }

    pub fn capacity_msat(&self) -> u64 {
        self.capacity_msat
    }

    /// Our balance, excluding amounts reserved by offered HTLCs.
    pub fn local_balance_msat(&self) -> u64 {
        self.ledger.local_balance_msat
    }

    pub fn remote_balance_msat(&self) -> u64 {
        self.ledger.remote_balance_msat
    }

    pub fn pending_htlcs(&self) -> impl Iterator<Item = &Htlc> {
        self.ledger.htlcs.values()
    }

    pub fn pending_htlc_total_msat(&self) -> u64 {
        self.ledger.htlcs.values().map(|h| h.amount_msat).sum()
    }

    pub fn htlc(&self, direction: HtlcDirection, id: u64) -> Option<&Htlc> {
        self.ledger.htlcs.get(&(direction, id))
    }

    pub fn local_commitment_number(&self) -> u64 {
        self.local_commitment_number
    }

    pub fn remote_commitment_number(&self) -> u64 {
        self.remote_commitment_number
    }

    pub fn is_reestablished(&self) -> bool {
        self.reestablished
    }

    /// Move along the state graph. Returns true the first time the channel
    /// becomes open.
    pub fn set_state(&mut self, new_state: ChannelState) -> Result<bool, ChannelError> {
        if !self.state.can_transition_to(new_state) {
            return Err(ChannelError::InvalidStateTransition {
                from: self.state,
                to: new_state,
            });
        }
        info!(
            "Channel {} state transition: {:?} -> {:?}",
            self.short_channel_id, self.state, new_state
        );
        let first_open = self.state == ChannelState::Opening && new_state == ChannelState::Open;
        self.state = new_state;
        Ok(first_open)
    }

    fn require_state(&self, allowed: &[ChannelState]) -> Result<(), ChannelError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ChannelError::ChannelNotOpen(self.state))
        }
    }

    /// Replace the ledger after checking conservation. Nothing changes on error.
    fn commit(&mut self, next: Ledger) -> Result<(), ChannelError> {
        if next.total() != Some(self.capacity_msat) {
            warn!(
                "Rejected ledger update on channel {}: conservation violated",
                self.short_channel_id
            );
            return Err(ChannelError::ConservationViolation);
        }
        self.ledger = next;
        Ok(())
    }

    /// Add an HTLC and return its id.
    pub fn add_htlc(
        &mut self,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        direction: HtlcDirection,
    ) -> Result<u64, ChannelError> {
        self.require_state(&[ChannelState::Open])?;

        if amount_msat == 0 || amount_msat < self.config.htlc_minimum_msat {
            return Err(ChannelError::HtlcBelowMinimum {
                amount: amount_msat,
                minimum: self.config.htlc_minimum_msat,
            });
        }

        let in_direction = self
            .ledger
            .htlcs
            .keys()
            .filter(|(d, _)| *d == direction)
            .count();
        if in_direction >= self.config.max_accepted_htlcs as usize {
            return Err(ChannelError::TooManyHtlcs(self.config.max_accepted_htlcs));
        }

        let mut next = self.ledger.clone();
        let payer = match direction {
            HtlcDirection::Offered => &mut next.local_balance_msat,
            HtlcDirection::Received => &mut next.remote_balance_msat,
        };
        if amount_msat > *payer {
            return Err(ChannelError::InsufficientBalance {
                required: amount_msat,
                available: *payer,
            });
        }
        *payer -= amount_msat;

        let id = match direction {
            HtlcDirection::Offered => self.next_local_htlc_id,
            HtlcDirection::Received => self.next_remote_htlc_id,
        };
        next.htlcs.insert(
            (direction, id),
            Htlc {
                id,
                amount_msat,
                payment_hash,
                cltv_expiry,
                direction,
                add: UpdateProgress::default(),
                locked_in: false,
            },
        );
        self.commit(next)?;

        match direction {
            HtlcDirection::Offered => self.next_local_htlc_id += 1,
            HtlcDirection::Received => self.next_remote_htlc_id += 1,
        }
        debug!(
            "Added {:?} HTLC {} for {} msat on channel {}",
            direction, id, amount_msat, self.short_channel_id
        );
        Ok(id)
    }

    /// Apply an `update_add_htlc` from the counterparty.
    pub fn receive_update_add_htlc(&mut self, msg: &UpdateAddHtlc) -> Result<u64, ChannelError> {
        if msg.id != self.next_remote_htlc_id {
            return Err(ChannelError::ProtocolViolation(format!(
                "expected htlc id {}, got {}",
                self.next_remote_htlc_id, msg.id
            )));
        }
        self.add_htlc(
            msg.amount_msat,
            PaymentHash::new(msg.payment_hash),
            msg.cltv_expiry,
            HtlcDirection::Received,
        )
    }

    /// Settle an HTLC: remove it and credit its amount to the payee.
    pub fn fulfill_htlc(
        &mut self,
        direction: HtlcDirection,
        id: u64,
        preimage: PaymentPreimage,
    ) -> Result<Htlc, ChannelError> {
        self.require_state(&[ChannelState::Open, ChannelState::Closing])?;

        let mut next = self.ledger.clone();
        let htlc = next
            .htlcs
            .remove(&(direction, id))
            .ok_or(ChannelError::HtlcNotFound(id))?;
        if !preimage.matches(&htlc.payment_hash) {
            return Err(ChannelError::PreimageMismatch(id));
        }

        let payee = match direction {
            HtlcDirection::Offered => &mut next.remote_balance_msat,
            HtlcDirection::Received => &mut next.local_balance_msat,
        };
        *payee = payee
            .checked_add(htlc.amount_msat)
            .ok_or(ChannelError::ConservationViolation)?;
        next.resolved.insert(
            (direction, id),
            ResolvedHtlc {
                htlc: htlc.clone(),
                fulfilled: true,
                progress: UpdateProgress::default(),
            },
        );
        self.commit(next)?;

        debug!(
            "Fulfilled {:?} HTLC {} ({} msat) on channel {}",
            direction, id, htlc.amount_msat, self.short_channel_id
        );
        Ok(htlc)
    }

    /// Remove an HTLC without paying it; the reserved amount returns to the payer.
    pub fn fail_htlc(
        &mut self,
        direction: HtlcDirection,
        id: u64,
        reason: &FailureReason,
    ) -> Result<Htlc, ChannelError> {
        self.require_state(&[ChannelState::Open, ChannelState::Closing])?;

        let mut next = self.ledger.clone();
        let htlc = next
            .htlcs
            .remove(&(direction, id))
            .ok_or(ChannelError::HtlcNotFound(id))?;

        let payer = match direction {
            HtlcDirection::Offered => &mut next.local_balance_msat,
            HtlcDirection::Received => &mut next.remote_balance_msat,
        };
        *payer = payer
            .checked_add(htlc.amount_msat)
            .ok_or(ChannelError::ConservationViolation)?;
        next.resolved.insert(
            (direction, id),
            ResolvedHtlc {
                htlc: htlc.clone(),
                fulfilled: false,
                progress: UpdateProgress::default(),
            },
        );
        self.commit(next)?;

        debug!(
            "Failed {:?} HTLC {} on channel {}: {}",
            direction, id, self.short_channel_id, reason
        );
        Ok(htlc)
    }

    /// Resolution of one of our offered HTLCs by the counterparty; it must
    /// already be irrevocably committed.
    pub fn receive_fulfill(&mut self, id: u64, preimage: PaymentPreimage) -> Result<Htlc, ChannelError> {
        self.require_locked_in(HtlcDirection::Offered, id)?;
        self.fulfill_htlc(HtlcDirection::Offered, id, preimage)
    }

    pub fn receive_fail(&mut self, id: u64, reason: &FailureReason) -> Result<Htlc, ChannelError> {
        self.require_locked_in(HtlcDirection::Offered, id)?;
        self.fail_htlc(HtlcDirection::Offered, id, reason)
    }

    fn require_locked_in(&self, direction: HtlcDirection, id: u64) -> Result<(), ChannelError> {
        let htlc = self
            .ledger
            .htlcs
            .get(&(direction, id))
            .ok_or(ChannelError::HtlcNotFound(id))?;
        if !htlc.locked_in {
            return Err(ChannelError::ProtocolViolation(format!(
                "htlc {} resolved before it was locked in",
                id
            )));
        }
        Ok(())
    }

    /// The commitment held by us (`holder_is_local`) or by the
    /// counterparty: the latest ledger with every update the holder has
    /// not received yet rolled back.
    fn view(&self, holder_is_local: bool, commitment_number: u64) -> Result<CommitmentView, ChannelError> {
        let mut local = self.ledger.local_balance_msat;
        let mut remote = self.ledger.remote_balance_msat;
        let mut htlcs = Vec::new();

        for htlc in self.ledger.htlcs.values() {
            if htlc.add.in_view(htlc.ours(), holder_is_local) {
                htlcs.push(htlc.summary());
                continue;
            }
            let payer = match htlc.direction {
                HtlcDirection::Offered => &mut local,
                HtlcDirection::Received => &mut remote,
            };
            *payer = payer
                .checked_add(htlc.amount_msat)
                .ok_or(ChannelError::ConservationViolation)?;
        }

        for resolved in self.ledger.resolved.values() {
            if resolved.progress.in_view(resolved.ours(), holder_is_local) {
                continue;
            }
            let credited = match (resolved.fulfilled, resolved.htlc.direction) {
                (true, HtlcDirection::Offered) | (false, HtlcDirection::Received) => &mut remote,
                (true, HtlcDirection::Received) | (false, HtlcDirection::Offered) => &mut local,
            };
            *credited = credited
                .checked_sub(resolved.htlc.amount_msat)
                .ok_or(ChannelError::ConservationViolation)?;
            htlcs.push(resolved.htlc.summary());
        }

        if !holder_is_local {
            for summary in &mut htlcs {
                summary.direction = summary.direction.flip();
            }
        }
        let (holder, counterparty) = if holder_is_local {
            (local, remote)
        } else {
            (remote, local)
        };
        Ok(CommitmentView {
            channel_id: self.channel_id,
            commitment_number,
            holder_balance_msat: holder,
            counterparty_balance_msat: counterparty,
            htlcs,
        })
    }

    /// Apply `mark` to the progress of every update in the given view.
    fn mark_updates(&mut self, holder_is_local: bool, mark: impl Fn(&mut UpdateProgress)) {
        for htlc in self.ledger.htlcs.values_mut() {
            if htlc.add.in_view(htlc.ours(), holder_is_local) {
                mark(&mut htlc.add);
            }
        }
        for resolved in self.ledger.resolved.values_mut() {
            if resolved.progress.in_view(resolved.ours(), holder_is_local) {
                mark(&mut resolved.progress);
            }
        }
    }

    fn has_unsigned_updates(&self) -> bool {
        let adds = self
            .ledger
            .htlcs
            .values()
            .any(|h| !h.add.remote_signed && h.add.in_view(h.ours(), false));
        let removals = self
            .ledger
            .resolved
            .values()
            .any(|r| !r.progress.remote_signed && r.progress.in_view(r.ours(), false));
        adds || removals
    }

    /// True when there are updates to sign and no signature is outstanding.
    pub fn needs_signature(&self) -> bool {
        !self.awaiting_revocation && self.has_unsigned_updates()
    }

    pub fn is_awaiting_revocation(&self) -> bool {
        self.awaiting_revocation
    }

    /// No update is still travelling through either commitment.
    pub fn is_settled(&self) -> bool {
        self.ledger.resolved.is_empty() && self.ledger.htlcs.values().all(|h| h.add.irrevocable())
    }

    /// Sign the counterparty's next commitment.
    pub fn sign_next_commitment(&mut self) -> Result<CommitmentSigned, ChannelError> {
        self.require_state(&[ChannelState::Open, ChannelState::Closing])?;
        if self.awaiting_revocation {
            return Err(ChannelError::ProtocolViolation(
                "previous commitment not yet revoked".to_string(),
            ));
        }

        let view = self.view(false, self.remote_commitment_number + 1)?;
        let signature = view.sign(&self.secp, &self.funding_key);
        self.mark_updates(false, |p| p.remote_signed = true);
        self.awaiting_revocation = true;

        debug!(
            "Signed remote commitment {} with {} HTLCs on channel {}",
            view.commitment_number,
            view.htlcs.len(),
            self.short_channel_id
        );
        Ok(CommitmentSigned {
            channel_id: self.channel_id,
            signature,
        })
    }

    /// Verify the counterparty's signature on our next commitment and
    /// revoke the current one. Returns the revocation to send plus any
    /// received HTLCs that became irrevocably committed.
    pub fn receive_commitment_signed(
        &mut self,
        msg: &CommitmentSigned,
    ) -> Result<(RevokeAndAck, Vec<Htlc>), ChannelError> {
        self.require_state(&[ChannelState::Open, ChannelState::Closing])?;

        let view = self.view(true, self.local_commitment_number + 1)?;
        if !view.verify(&self.secp, &msg.signature, &self.remote_funding_pubkey) {
            return Err(ChannelError::InvalidCommitmentSignature);
        }

        self.mark_updates(true, |p| p.local_signed = true);
        let revoked_secret = self.revocation_seed.secret(self.local_commitment_number);
        self.local_commitment_number += 1;

        debug!(
            "Accepted local commitment {} on channel {}",
            self.local_commitment_number, self.short_channel_id
        );
        let revoke = RevokeAndAck {
            channel_id: self.channel_id,
            per_commitment_secret: revoked_secret,
            next_per_commitment_point: self.revocation_seed.point(self.local_commitment_number),
        };
        Ok((revoke, self.take_locked_in()))
    }

    /// Process the counterparty's revocation of its previous commitment.
    pub fn receive_revoke_and_ack(&mut self, msg: &RevokeAndAck) -> Result<Vec<Htlc>, ChannelError> {
        if !self.awaiting_revocation {
            return Err(ChannelError::ProtocolViolation(
                "unexpected revoke_and_ack".to_string(),
            ));
        }
        let expected = self
            .remote_current_point
            .ok_or_else(|| ChannelError::InvalidRevocation("no commitment point known".to_string()))?;
        let derived = per_commitment_point(&msg.per_commitment_secret);
        if !bool::from(derived.ct_eq(&expected)) {
            return Err(ChannelError::InvalidRevocation(
                "secret does not match commitment point".to_string(),
            ));
        }
        self.remote_revocations
            .insert(msg.per_commitment_secret)
            .map_err(|e| ChannelError::InvalidRevocation(e.to_string()))?;

        self.remote_current_point = Some(msg.next_per_commitment_point);
        self.remote_commitment_number += 1;
        self.awaiting_revocation = false;
        for htlc in self.ledger.htlcs.values_mut() {
            htlc.add.remote_revoked |= htlc.add.remote_signed;
        }
        for resolved in self.ledger.resolved.values_mut() {
            resolved.progress.remote_revoked |= resolved.progress.remote_signed;
        }

        debug!(
            "Remote revoked commitment {} on channel {}",
            self.remote_commitment_number - 1,
            self.short_channel_id
        );
        Ok(self.take_locked_in())
    }

    /// Mark newly committed HTLCs as locked in and return the received ones.
    /// Removals that are committed on both sides are forgotten.
    fn take_locked_in(&mut self) -> Vec<Htlc> {
        self.ledger.resolved.retain(|_, r| !r.progress.irrevocable());

        let mut received = Vec::new();
        for htlc in self.ledger.htlcs.values_mut() {
            if htlc.locked_in || !htlc.add.irrevocable() {
                continue;
            }
            htlc.locked_in = true;
            if htlc.direction == HtlcDirection::Received {
                received.push(htlc.clone());
            }
        }
        received
    }

    pub fn reestablish_message(&self) -> ChannelReestablish {
        let revealed = self.remote_revocations.len();
        let your_last_per_commitment_secret = if revealed == 0 {
            [0u8; 32]
        } else {
            self.remote_revocations
                .secret_for_commitment(revealed - 1)
                .unwrap_or([0u8; 32])
        };
        ChannelReestablish {
            channel_id: self.channel_id,
            next_commitment_number: self.local_commitment_number + 1,
            next_revocation_number: self.remote_commitment_number,
            your_last_per_commitment_secret,
            my_current_per_commitment_point: self.revocation_seed.point(self.local_commitment_number),
        }
    }

    /// Check the counterparty's view of the channel against ours.
    pub fn verify_reestablish(&mut self, msg: &ChannelReestablish) -> Result<(), ChannelError> {
        let their_local = msg.next_commitment_number.saturating_sub(1);
        let in_flight = u64::from(self.awaiting_revocation);
        if their_local < self.remote_commitment_number
            || their_local > self.remote_commitment_number + in_flight
        {
            return Err(ChannelError::ProtocolViolation(format!(
                "peer holds commitment {}, we expected {}",
                their_local, self.remote_commitment_number
            )));
        }

        if msg.next_revocation_number != self.local_commitment_number {
            return Err(ChannelError::ProtocolViolation(format!(
                "peer expects revocation {}, we have revoked {}",
                msg.next_revocation_number, self.local_commitment_number
            )));
        }

        let expected_secret = if self.local_commitment_number == 0 {
            [0u8; 32]
        } else {
            self.revocation_seed.secret(self.local_commitment_number - 1)
        };
        if !bool::from(msg.your_last_per_commitment_secret.ct_eq(&expected_secret)) {
            return Err(ChannelError::ProtocolViolation(
                "last per-commitment secret mismatch, channel state may be lost".to_string(),
            ));
        }

        match self.remote_current_point {
            None => self.remote_current_point = Some(msg.my_current_per_commitment_point),
            Some(point) if their_local == self.remote_commitment_number => {
                if point != msg.my_current_per_commitment_point {
                    return Err(ChannelError::ProtocolViolation(
                        "commitment point changed across reconnect".to_string(),
                    ));
                }
            }
            Some(_) => {}
        }

        self.reestablished = true;
        Ok(())
    }

    /// Forget per-connection state when the transport goes away.
    pub fn mark_disconnected(&mut self) {
        self.reestablished = false;
    }

    /// Begin a cooperative close.
    pub fn shutdown(&mut self, scriptpubkey: Vec<u8>) -> Result<Shutdown, ChannelError> {
        if self.state == ChannelState::Open {
            self.set_state(ChannelState::Closing)?;
            self.close.we_initiated = !self.close.remote_shutdown_received;
        }
        self.require_state(&[ChannelState::Closing])?;
        self.close.local_shutdown_sent = true;
        Ok(Shutdown {
            channel_id: self.channel_id,
            scriptpubkey,
        })
    }

    pub fn receive_shutdown(&mut self, _msg: &Shutdown) -> Result<(), ChannelError> {
        if self.state == ChannelState::Open {
            self.set_state(ChannelState::Closing)?;
        }
        self.require_state(&[ChannelState::Closing])?;
        self.close.remote_shutdown_received = true;
        Ok(())
    }

    pub fn local_shutdown_sent(&self) -> bool {
        self.close.local_shutdown_sent
    }

    /// The initiator signs the close once both shutdowns are exchanged and
    /// no HTLC is left.
    pub fn ready_to_sign_close(&self) -> bool {
        self.state == ChannelState::Closing
            && self.close.we_initiated
            && self.close.local_shutdown_sent
            && self.close.remote_shutdown_received
            && !self.close.closing_signed_sent
            && self.ledger.htlcs.is_empty()
            && self.ledger.resolved.is_empty()
    }

    fn closing_digest(&self, fee_satoshis: u64) -> Hash32 {
        let local_first = self.local_node_id.serialize() < self.remote_node_id.serialize();
        let (first, second) = if local_first {
            (self.ledger.local_balance_msat, self.ledger.remote_balance_msat)
        } else {
            (self.ledger.remote_balance_msat, self.ledger.local_balance_msat)
        };
        let mut data = Vec::with_capacity(80);
        data.extend_from_slice(b"supernova-ln-closing");
        data.extend_from_slice(self.channel_id.as_bytes());
        data.extend_from_slice(&fee_satoshis.to_be_bytes());
        data.extend_from_slice(&first.to_be_bytes());
        data.extend_from_slice(&second.to_be_bytes());
        sha256(&data)
    }

    pub fn sign_closing(&mut self, fee_satoshis: u64) -> Result<ClosingSigned, ChannelError> {
        self.require_state(&[ChannelState::Closing])?;
        if !self.ledger.htlcs.is_empty() {
            return Err(ChannelError::ProtocolViolation(
                "cannot sign close with pending htlcs".to_string(),
            ));
        }
        let digest = self.closing_digest(fee_satoshis);
        let signature = self.secp.sign_ecdsa(&digest.to_message(), &self.funding_key);
        self.close.closing_signed_sent = true;
        Ok(ClosingSigned {
            channel_id: self.channel_id,
            fee_satoshis,
            signature,
        })
    }

    /// Verify the counterparty's closing signature. Returns our own
    /// signature if we have not sent one yet. The channel is closed afterwards.
    pub fn receive_closing_signed(
        &mut self,
        msg: &ClosingSigned,
    ) -> Result<Option<ClosingSigned>, ChannelError> {
        self.require_state(&[ChannelState::Closing])?;
        if !self.ledger.htlcs.is_empty() {
            return Err(ChannelError::ProtocolViolation(
                "closing_signed with pending htlcs".to_string(),
            ));
        }
        let digest = self.closing_digest(msg.fee_satoshis);
        self.secp
            .verify_ecdsa(&digest.to_message(), &msg.signature, &self.remote_funding_pubkey)
            .map_err(|_| ChannelError::ProtocolViolation("invalid closing signature".to_string()))?;

        let reply = if self.close.closing_signed_sent {
            None
        } else {
            Some(self.sign_closing(msg.fee_satoshis)?)
        };
        self.set_state(ChannelState::Closed)?;
        Ok(reply)
    }

    /// HTLCs whose expiry is at or within `margin` blocks of `height`.
    pub fn expired_htlcs(&self, height: u32, margin: u32) -> Vec<Htlc> {
        let limit = height.saturating_add(margin);
        self.ledger
            .htlcs
            .values()
            .filter(|h| h.cltv_expiry <= limit)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: self.channel_id,
            short_channel_id: self.short_channel_id,
            state: self.state,
            remote_node_id: hex::encode(self.remote_node_id.serialize()),
            capacity_msat: self.capacity_msat,
            local_balance_msat: self.ledger.local_balance_msat,
            remote_balance_msat: self.ledger.remote_balance_msat,
            local_commitment_number: self.local_commitment_number,
            remote_commitment_number: self.remote_commitment_number,
            next_local_htlc_id: self.next_local_htlc_id,
            next_remote_htlc_id: self.next_remote_htlc_id,
            pending_htlcs: self.ledger.htlcs.values().cloned().collect(),
            remote_revocations: self.remote_revocations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::{channel_pair, open_channel_pair};
    use std::collections::VecDeque;

    fn preimage(n: u8) -> PaymentPreimage {
        PaymentPreimage::new([n; 32])
    }

    fn assert_conserved(channel: &Channel) {
        assert_eq!(
            channel.local_balance_msat()
                + channel.remote_balance_msat()
                + channel.pending_htlc_total_msat(),
            channel.capacity_msat()
        );
    }

    /// Run a full commitment exchange started by `a`.
    fn dance(a: &mut Channel, b: &mut Channel) -> (Vec<Htlc>, Vec<Htlc>) {
        let mut locked_a = Vec::new();
        let mut locked_b = Vec::new();

        let sig_a = a.sign_next_commitment().unwrap();
        let (rev_b, locked) = b.receive_commitment_signed(&sig_a).unwrap();
        locked_b.extend(locked);
        let sig_b = b.sign_next_commitment().unwrap();
        locked_a.extend(a.receive_revoke_and_ack(&rev_b).unwrap());
        let (rev_a, locked) = a.receive_commitment_signed(&sig_b).unwrap();
        locked_a.extend(locked);
        locked_b.extend(b.receive_revoke_and_ack(&rev_a).unwrap());
        (locked_a, locked_b)
    }

    #[test]
    fn test_channel_id_from_outpoint() {
        let txid = [0xab; 32];
        let id = ChannelId::from_funding_outpoint(&txid, 1);
        assert_eq!(id.as_bytes()[31], 0xab ^ 0x01);
        assert_eq!(id.as_bytes()[30], 0xab);
        assert_eq!(&id.as_bytes()[..30], &txid[..30]);
    }

    #[test]
    fn test_short_channel_id_fields() {
        let scid = ShortChannelId::new(539_268, 845, 1);
        assert_eq!(scid.block_height(), 539_268);
        assert_eq!(scid.tx_index(), 845);
        assert_eq!(scid.output_index(), 1);
        assert_eq!(scid.to_string(), "539268x845x1");
    }

    #[test]
    fn test_state_graph_enforced() {
        let (mut a, _) = channel_pair(1_000, 0);
        assert!(matches!(
            a.set_state(ChannelState::Closing),
            Err(ChannelError::InvalidStateTransition { .. })
        ));
        assert_eq!(a.set_state(ChannelState::Open), Ok(true));
        assert_eq!(a.set_state(ChannelState::Closing), Ok(false));
        assert!(a.set_state(ChannelState::Open).is_err());
    }

    #[test]
    fn test_add_htlc_requires_open() {
        let (mut a, _) = channel_pair(1_000, 0);
        let result = a.add_htlc(10, preimage(1).payment_hash(), 100, HtlcDirection::Offered);
        assert_eq!(result, Err(ChannelError::ChannelNotOpen(ChannelState::Opening)));
    }

    #[test]
    fn test_add_htlc_checks_balance_net_of_pending() {
        let (mut a, _) = open_channel_pair(1_000, 0);
        a.add_htlc(600, preimage(1).payment_hash(), 100, HtlcDirection::Offered)
            .unwrap();
        let result = a.add_htlc(500, preimage(2).payment_hash(), 100, HtlcDirection::Offered);
        assert_eq!(
            result,
            Err(ChannelError::InsufficientBalance { required: 500, available: 400 })
        );
        assert_conserved(&a);
    }

    #[test]
    fn test_fulfill_moves_balance_fail_does_not() {
        let (mut a, _) = open_channel_pair(1_000, 0);
        let paid = a
            .add_htlc(300, preimage(1).payment_hash(), 100, HtlcDirection::Offered)
            .unwrap();
        let failed = a
            .add_htlc(200, preimage(2).payment_hash(), 100, HtlcDirection::Offered)
            .unwrap();

        assert_eq!(
            a.fulfill_htlc(HtlcDirection::Offered, paid, preimage(9)),
            Err(ChannelError::PreimageMismatch(paid))
        );
        assert_conserved(&a);

        a.fulfill_htlc(HtlcDirection::Offered, paid, preimage(1)).unwrap();
        a.fail_htlc(HtlcDirection::Offered, failed, &FailureReason::Unspecified)
            .unwrap();
        assert_eq!(a.local_balance_msat(), 700);
        assert_eq!(a.remote_balance_msat(), 300);
        assert_eq!(
            a.fail_htlc(HtlcDirection::Offered, failed, &FailureReason::Unspecified),
            Err(ChannelError::HtlcNotFound(failed))
        );
        assert_conserved(&a);
    }

    #[test]
    fn test_commitment_dance_locks_in_htlc() {
        let (mut a, mut b) = open_channel_pair(100_000, 0);
        let hash = preimage(1).payment_hash();

        let id = a.add_htlc(100_000, hash, 500, HtlcDirection::Offered).unwrap();
        let add = UpdateAddHtlc {
            channel_id: a.id(),
            id,
            amount_msat: 100_000,
            payment_hash: hash.into_inner(),
            cltv_expiry: 500,
            hops: vec![],
            extensions: Default::default(),
        };
        b.receive_update_add_htlc(&add).unwrap();

        let (locked_a, locked_b) = dance(&mut a, &mut b);
        assert!(locked_a.is_empty());
        assert_eq!(locked_b.len(), 1);
        assert_eq!(locked_b[0].payment_hash, hash);
        assert!(a.htlc(HtlcDirection::Offered, id).unwrap().is_locked_in());

        b.fulfill_htlc(HtlcDirection::Received, id, preimage(1)).unwrap();
        a.receive_fulfill(id, preimage(1)).unwrap();
        dance(&mut b, &mut a);

        assert_eq!(a.local_balance_msat(), 0);
        assert_eq!(b.local_balance_msat(), 100_000);
        assert_eq!(a.local_commitment_number(), 2);
        assert_eq!(b.remote_commitment_number(), 2);
        assert!(!a.needs_signature() && !b.needs_signature());
    }

    #[test]
    fn test_out_of_order_htlc_id_rejected() {
        let (_, mut b) = open_channel_pair(1_000, 0);
        let add = UpdateAddHtlc {
            channel_id: b.id(),
            id: 3,
            amount_msat: 10,
            payment_hash: [0u8; 32],
            cltv_expiry: 10,
            hops: vec![],
            extensions: Default::default(),
        };
        assert!(matches!(
            b.receive_update_add_htlc(&add),
            Err(ChannelError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_tampered_commitment_signature_rejected() {
        let (mut a, mut b) = open_channel_pair(1_000, 0);
        a.add_htlc(10, preimage(1).payment_hash(), 100, HtlcDirection::Offered)
            .unwrap();
        // b never saw the add, so the digests differ
        let sig = a.sign_next_commitment().unwrap();
        assert_eq!(
            b.receive_commitment_signed(&sig).map(|_| ()),
            Err(ChannelError::InvalidCommitmentSignature)
        );
        assert_eq!(b.local_commitment_number(), 0);
    }

    #[test]
    fn test_bad_revocation_secret_rejected() {
        let (mut a, mut b) = open_channel_pair(1_000, 0);
        a.add_htlc(10, preimage(1).payment_hash(), 100, HtlcDirection::Offered)
            .unwrap();
        b.add_htlc(10, preimage(1).payment_hash(), 100, HtlcDirection::Received)
            .unwrap();
        let sig = a.sign_next_commitment().unwrap();
        let (mut rev, _) = b.receive_commitment_signed(&sig).unwrap();
        rev.per_commitment_secret[0] ^= 1;
        assert!(matches!(
            a.receive_revoke_and_ack(&rev),
            Err(ChannelError::InvalidRevocation(_))
        ));
    }

    #[test]
    fn test_reestablish_detects_lost_state() {
        let (mut a, mut b) = channel_pair(1_000, 0);
        let mut stale = b.reestablish_message();
        stale.next_revocation_number = 4;
        assert!(matches!(
            a.verify_reestablish(&stale),
            Err(ChannelError::ProtocolViolation(_))
        ));
        a.verify_reestablish(&b.reestablish_message()).unwrap();
        b.verify_reestablish(&a.reestablish_message()).unwrap();
        assert!(a.is_reestablished());
    }

    #[test]
    fn test_expired_htlcs() {
        let (mut a, _) = open_channel_pair(1_000, 0);
        a.add_htlc(10, preimage(1).payment_hash(), 100, HtlcDirection::Offered)
            .unwrap();
        a.add_htlc(10, preimage(2).payment_hash(), 200, HtlcDirection::Offered)
            .unwrap();
        assert_eq!(a.expired_htlcs(90, 5).len(), 0);
        assert_eq!(a.expired_htlcs(95, 5).len(), 1);
        assert_eq!(a.expired_htlcs(250, 0).len(), 2);
    }

    #[test]
    fn test_cooperative_close() {
        let (mut a, mut b) = open_channel_pair(1_000, 500);
        let shutdown = a.shutdown(vec![0x00, 0x14]).unwrap();
        b.receive_shutdown(&shutdown).unwrap();
        let reply = b.shutdown(vec![0x00, 0x14]).unwrap();
        a.receive_shutdown(&reply).unwrap();

        assert!(a.ready_to_sign_close());
        assert!(!b.ready_to_sign_close());
        let closing = a.sign_closing(200).unwrap();
        let back = b.receive_closing_signed(&closing).unwrap().unwrap();
        assert_eq!(a.receive_closing_signed(&back).unwrap(), None);
        assert_eq!(a.state(), ChannelState::Closed);
        assert_eq!(b.state(), ChannelState::Closed);
    }

    #[test]
    fn test_snapshot_serializes() {
        let (mut a, _) = open_channel_pair(1_000, 0);
        a.add_htlc(10, preimage(1).payment_hash(), 100, HtlcDirection::Offered)
            .unwrap();
        let json = serde_json::to_string(&a.snapshot()).unwrap();
        let back: ChannelSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pending_htlcs.len(), 1);
        assert_eq!(back.local_balance_msat, 990);
    }

    enum Wire {
        Add(UpdateAddHtlc),
        Fulfill(u64, PaymentPreimage),
        Sig(CommitmentSigned),
        Rev(RevokeAndAck),
    }

    /// Two channel ends joined by in-order message queues. `queues[i]`
    /// holds the messages travelling towards end `i`.
    struct Link {
        ends: [Channel; 2],
        queues: [VecDeque<Wire>; 2],
        locked: [Vec<Htlc>; 2],
    }

    impl Link {
        fn new(balance_0: u64, balance_1: u64) -> Self {
            let (a, b) = open_channel_pair(balance_0, balance_1);
            Self {
                ends: [a, b],
                queues: [VecDeque::new(), VecDeque::new()],
                locked: [Vec::new(), Vec::new()],
            }
        }

        fn offer(&mut self, from: usize, amount_msat: u64, preimage: PaymentPreimage) -> u64 {
            let end = &mut self.ends[from];
            let hash = preimage.payment_hash();
            let id = end
                .add_htlc(amount_msat, hash, 500, HtlcDirection::Offered)
                .unwrap();
            self.queues[1 - from].push_back(Wire::Add(UpdateAddHtlc {
                channel_id: end.id(),
                id,
                amount_msat,
                payment_hash: hash.into_inner(),
                cltv_expiry: 500,
                hops: vec![],
                extensions: Default::default(),
            }));
            id
        }

        fn fulfill(&mut self, from: usize, id: u64, preimage: PaymentPreimage) {
            self.ends[from]
                .fulfill_htlc(HtlcDirection::Received, id, preimage)
                .unwrap();
            self.queues[1 - from].push_back(Wire::Fulfill(id, preimage));
        }

        fn sign(&mut self, from: usize) {
            if self.ends[from].needs_signature() {
                let sig = self.ends[from].sign_next_commitment().unwrap();
                self.queues[1 - from].push_back(Wire::Sig(sig));
            }
        }

        fn deliver(&mut self, to: usize) -> bool {
            let Some(message) = self.queues[to].pop_front() else {
                return false;
            };
            let end = &mut self.ends[to];
            match message {
                Wire::Add(add) => {
                    end.receive_update_add_htlc(&add).unwrap();
                }
                Wire::Fulfill(id, preimage) => {
                    end.receive_fulfill(id, preimage).unwrap();
                }
                Wire::Sig(sig) => {
                    let (rev, locked) = end.receive_commitment_signed(&sig).unwrap();
                    self.locked[to].extend(locked);
                    self.queues[1 - to].push_back(Wire::Rev(rev));
                }
                Wire::Rev(rev) => {
                    let locked = end.receive_revoke_and_ack(&rev).unwrap();
                    self.locked[to].extend(locked);
                }
            }
            true
        }

        /// Sign whenever something is pending, as a session does after every
        /// message, until both queues drain.
        fn settle(&mut self) {
            loop {
                self.sign(0);
                self.sign(1);
                let to_0 = self.deliver(0);
                let to_1 = self.deliver(1);
                if !to_0 && !to_1 {
                    break;
                }
            }
        }

        fn take_locked(&mut self, end: usize) -> Vec<u64> {
            self.locked[end].drain(..).map(|h| h.id).collect()
        }
    }

    #[test]
    fn test_crossing_updates_from_both_sides_settle() {
        let mut link = Link::new(100_000, 100_000);

        let from_0 = link.offer(0, 10_000, preimage(1));
        let from_1 = link.offer(1, 20_000, preimage(2));
        // Both sign before seeing the other's add.
        link.sign(0);
        link.sign(1);
        link.settle();

        assert_eq!(link.take_locked(0), vec![from_1]);
        assert_eq!(link.take_locked(1), vec![from_0]);
        for end in &link.ends {
            assert!(end.is_settled());
            assert_eq!(end.pending_htlcs().count(), 2);
            assert_conserved(end);
        }

        link.fulfill(0, from_1, preimage(2));
        link.fulfill(1, from_0, preimage(1));
        link.sign(0);
        link.sign(1);
        link.settle();

        let [a, b] = &link.ends;
        assert_eq!(a.local_balance_msat(), 110_000);
        assert_eq!(a.remote_balance_msat(), 90_000);
        assert_eq!(b.local_balance_msat(), 90_000);
        assert_eq!(b.remote_balance_msat(), 110_000);
        assert!(a.is_settled() && b.is_settled());
        assert_eq!(a.pending_htlc_total_msat() + b.pending_htlc_total_msat(), 0);
    }

    #[test]
    fn test_add_while_signature_outstanding() {
        let mut link = Link::new(100_000, 0);

        let first = link.offer(0, 10_000, preimage(1));
        link.sign(0);
        assert!(link.ends[0].is_awaiting_revocation());
        let second = link.offer(0, 20_000, preimage(2));
        assert!(!link.ends[0].needs_signature());
        link.settle();

        assert_eq!(link.take_locked(1), vec![first, second]);
        link.fulfill(1, first, preimage(1));
        link.settle();
        link.fulfill(1, second, preimage(2));
        link.settle();

        let [a, b] = &link.ends;
        assert_eq!(a.local_balance_msat(), 70_000);
        assert_eq!(b.local_balance_msat(), 30_000);
        assert!(a.is_settled() && b.is_settled());
        assert_eq!(a.local_commitment_number(), b.remote_commitment_number());
        assert_eq!(b.local_commitment_number(), a.remote_commitment_number());
    }

    #[test]
    fn test_fulfill_crossing_new_add() {
        let mut link = Link::new(100_000, 0);
        let first = link.offer(0, 10_000, preimage(1));
        link.settle();
        assert_eq!(link.take_locked(1), vec![first]);

        // The payee settles while the payer is already adding the next HTLC.
        link.fulfill(1, first, preimage(1));
        let second = link.offer(0, 5_000, preimage(2));
        link.sign(0);
        link.sign(1);
        link.settle();

        assert_eq!(link.take_locked(1), vec![second]);
        let [a, b] = &link.ends;
        assert_eq!(a.local_balance_msat(), 85_000);
        assert_eq!(a.remote_balance_msat(), 10_000);
        assert_eq!(b.local_balance_msat(), 10_000);
        assert!(a.is_settled() && b.is_settled());
        assert_conserved(a);
    }
}
