// SuperNova Lightning Network - HTLC Switch
//
// State shared by the manager and every peer session: the channel
// registry, live session handles, where each offered HTLC came from, and
// the settlement side of issued invoices.

use crate::channel::{
    Channel, ChannelError, ChannelId, ChannelSnapshot, Htlc, HtlcDirection, ShortChannelId,
};
use crate::config::LightningConfig;
use crate::graph::{NetworkGraph, NodeId};
use crate::invoice::{now_secs, InvoiceDatabase, InvoiceState};
use crate::manager::{LightningEvent, ManagerError};
use crate::payment::{FailureCode, FailureReason, PaymentHash, PaymentPreimage};
use crate::peer::PeerCommand;
use crate::wallet::WalletBackend;
use crate::wire::HopPayload;
use dashmap::DashMap;
use secp256k1::{All, Secp256k1, SecretKey};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How an offered HTLC ended, as reported to whoever asked for it.
#[derive(Debug)]
pub(crate) enum HtlcResolution {
    Fulfilled(PaymentPreimage),
    Failed(FailureReason),
    /// The HTLC could not be added to the channel.
    Rejected(ChannelError),
    /// The session carrying the HTLC went away before it resolved.
    Aborted(String),
}

/// Who is waiting on an offered HTLC
#[derive(Debug)]
pub(crate) enum HtlcOrigin {
    /// A payment made by this node
    Local {
        payment_hash: PaymentHash,
        resolver: Option<oneshot::Sender<HtlcResolution>>,
    },
    /// A received HTLC on another channel that we forwarded
    Forwarded { channel_id: ChannelId, htlc_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PaymentState {
    InFlight,
    Succeeded(PaymentPreimage),
}

pub(crate) struct ChannelEntry {
    pub(crate) remote: NodeId,
    pub(crate) channel: Arc<Mutex<Channel>>,
}

struct PeerHandle {
    session: u64,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

pub(crate) fn lock_channel(channel: &Mutex<Channel>) -> Result<MutexGuard<'_, Channel>, ManagerError> {
    channel.lock().map_err(|_| ManagerError::LockPoisoned)
}

pub(crate) struct Switch {
    pub(crate) config: LightningConfig,
    pub(crate) node_key: SecretKey,
    pub(crate) node_id: NodeId,
    pub(crate) graph: Arc<NetworkGraph>,
    pub(crate) wallet: Arc<dyn WalletBackend>,
    pub(crate) invoices: Mutex<InvoiceDatabase>,
    pub(crate) secp: Secp256k1<All>,
    pub(crate) payments: DashMap<PaymentHash, PaymentState>,
    channels: DashMap<ChannelId, ChannelEntry>,
    scid_index: DashMap<ShortChannelId, ChannelId>,
    peers: DashMap<NodeId, PeerHandle>,
    htlc_origins: DashMap<(ChannelId, u64), HtlcOrigin>,
    block_height: AtomicU32,
    next_session: AtomicU64,
    events: mpsc::UnboundedSender<LightningEvent>,
}

impl Switch {
    pub(crate) fn new(
        config: LightningConfig,
        node_key: SecretKey,
        wallet: Arc<dyn WalletBackend>,
        events: mpsc::UnboundedSender<LightningEvent>,
    ) -> Self {
        let secp = Secp256k1::new();
        let node_id = NodeId::new(secp256k1::PublicKey::from_secret_key(&secp, &node_key));
        Self {
            config,
            node_key,
            node_id,
            graph: Arc::new(NetworkGraph::new()),
            wallet,
            invoices: Mutex::new(InvoiceDatabase::new()),
            secp,
            payments: DashMap::new(),
            channels: DashMap::new(),
            scid_index: DashMap::new(),
            peers: DashMap::new(),
            htlc_origins: DashMap::new(),
            block_height: AtomicU32::new(0),
            next_session: AtomicU64::new(0),
            events,
        }
    }

    pub(crate) fn emit(&self, event: LightningEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    pub(crate) fn block_height(&self) -> u32 {
        self.block_height.load(Ordering::SeqCst)
    }

    pub(crate) fn set_block_height(&self, height: u32) {
        self.block_height.store(height, Ordering::SeqCst);
    }

    pub(crate) fn lock_invoices(&self) -> Result<MutexGuard<'_, InvoiceDatabase>, ManagerError> {
        self.invoices.lock().map_err(|_| ManagerError::LockPoisoned)
    }

    // Channel registry

    pub(crate) fn insert_channel(&self, channel: Channel) -> Result<ChannelId, ManagerError> {
        let channel_id = channel.id();
        if self.channels.contains_key(&channel_id) {
            return Err(ManagerError::DuplicateChannel(channel_id));
        }
        let remote = NodeId::new(channel.remote_node_id());
        self.scid_index.insert(channel.short_channel_id(), channel_id);
        self.channels.insert(
            channel_id,
            ChannelEntry {
                remote,
                channel: Arc::new(Mutex::new(channel)),
            },
        );
        Ok(channel_id)
    }

    pub(crate) fn channel(&self, channel_id: &ChannelId) -> Option<Arc<Mutex<Channel>>> {
        self.channels.get(channel_id).map(|e| Arc::clone(&e.channel))
    }

    /// The channel, provided it is shared with `remote`.
    pub(crate) fn channel_with(
        &self,
        channel_id: &ChannelId,
        remote: &NodeId,
    ) -> Option<Arc<Mutex<Channel>>> {
        self.channels
            .get(channel_id)
            .filter(|e| e.remote == *remote)
            .map(|e| Arc::clone(&e.channel))
    }

    pub(crate) fn channel_id_by_scid(&self, short_channel_id: &ShortChannelId) -> Option<ChannelId> {
        self.scid_index.get(short_channel_id).map(|id| *id)
    }

    /// Channels shared with `remote`, ordered by id.
    pub(crate) fn channels_of(&self, remote: &NodeId) -> Vec<(ChannelId, Arc<Mutex<Channel>>)> {
        let mut found: Vec<_> = self
            .channels
            .iter()
            .filter(|e| e.remote == *remote)
            .map(|e| (*e.key(), Arc::clone(&e.channel)))
            .collect();
        found.sort_by_key(|(id, _)| *id);
        found
    }

    pub(crate) fn all_channels(&self) -> Vec<(ChannelId, NodeId, Arc<Mutex<Channel>>)> {
        let mut found: Vec<_> = self
            .channels
            .iter()
            .map(|e| (*e.key(), e.remote, Arc::clone(&e.channel)))
            .collect();
        found.sort_by_key(|(id, _, _)| *id);
        found
    }

    pub(crate) fn save_snapshot(&self, snapshot: &ChannelSnapshot) {
        if let Err(e) = self.wallet.save_channel(snapshot) {
            warn!("Failed to save channel {}: {}", snapshot.channel_id, e);
        }
    }

    pub(crate) fn channel_closed(&self, snapshot: &ChannelSnapshot) {
        if let Err(e) = self.graph.remove_channel(&snapshot.short_channel_id) {
            warn!("Failed to remove channel {} from graph: {}", snapshot.short_channel_id, e);
        }
        self.save_snapshot(snapshot);
        info!("Channel {} closed", snapshot.short_channel_id);
        self.emit(LightningEvent::ChannelClosed {
            channel_id: snapshot.channel_id,
        });
    }

    // Sessions

    pub(crate) fn register_peer(
        &self,
        remote: NodeId,
        commands: mpsc::UnboundedSender<PeerCommand>,
    ) -> Result<u64, ManagerError> {
        if self.peers.contains_key(&remote) {
            return Err(ManagerError::AlreadyConnected(remote));
        }
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.peers.insert(remote, PeerHandle { session, commands });
        Ok(session)
    }

    pub(crate) fn is_connected(&self, remote: &NodeId) -> bool {
        self.peers.contains_key(remote)
    }

    pub(crate) fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| *p.key()).collect()
    }

    /// Queue a command on the session of `remote`. The command is handed
    /// back when there is no live session.
    pub(crate) fn send_to_peer(&self, remote: &NodeId, command: PeerCommand) -> Result<(), PeerCommand> {
        match self.peers.get(remote) {
            Some(handle) => handle.commands.send(command).map_err(|e| e.0),
            None => Err(command),
        }
    }

    pub(crate) fn send_to_channel_peer(
        &self,
        channel_id: &ChannelId,
        command: PeerCommand,
    ) -> Result<(), PeerCommand> {
        let remote = match self.channels.get(channel_id) {
            Some(entry) => entry.remote,
            None => return Err(command),
        };
        self.send_to_peer(&remote, command)
    }

    /// Forget a session and fail payments waiting on its channels.
    pub(crate) fn peer_disconnected(&self, remote: &NodeId, session: u64, reason: &str) {
        self.peers.remove_if(remote, |_, handle| handle.session == session);

        let channels = self.channels_of(remote);
        for (_, channel) in &channels {
            if let Ok(mut channel) = lock_channel(channel) {
                channel.mark_disconnected();
            }
        }

        // Offered HTLCs stay in the channel; only the waiting caller is told.
        for mut entry in self.htlc_origins.iter_mut() {
            let (channel_id, htlc_id) = *entry.key();
            if !channels.iter().any(|(id, _)| *id == channel_id) {
                continue;
            }
            if let HtlcOrigin::Local { resolver, payment_hash } = entry.value_mut() {
                if let Some(resolver) = resolver.take() {
                    warn!(
                        "Payment {} interrupted: HTLC {} on channel {} left pending",
                        payment_hash, htlc_id, channel_id
                    );
                    let _ = resolver.send(HtlcResolution::Aborted(reason.to_string()));
                }
            }
        }

        self.emit(LightningEvent::PeerDisconnected {
            node_id: *remote,
            reason: reason.to_string(),
        });
    }

    // HTLC bookkeeping

    pub(crate) fn register_origin(&self, channel_id: ChannelId, htlc_id: u64, origin: HtlcOrigin) {
        self.htlc_origins.insert((channel_id, htlc_id), origin);
    }

    /// True if the received HTLC has been forwarded and is still pending downstream.
    pub(crate) fn is_forwarding(&self, channel_id: &ChannelId, htlc_id: u64) -> bool {
        self.htlc_origins.iter().any(|entry| {
            matches!(entry.value(), HtlcOrigin::Forwarded { channel_id: c, htlc_id: h }
                if c == channel_id && *h == htlc_id)
        })
    }

    /// Report an origin whose HTLC never made it into a channel.
    pub(crate) fn fail_origin(&self, origin: HtlcOrigin, resolution: HtlcResolution) {
        match origin {
            HtlcOrigin::Local {
                payment_hash,
                resolver,
            } => {
                self.payments.remove(&payment_hash);
                if let Some(resolver) = resolver {
                    let _ = resolver.send(resolution);
                }
            }
            HtlcOrigin::Forwarded { channel_id, htlc_id } => {
                let reason = match resolution {
                    HtlcResolution::Failed(reason) => reason,
                    _ => FailureReason::Remote(FailureCode::TemporaryChannelFailure),
                };
                self.fail_upstream(channel_id, htlc_id, reason);
            }
        }
    }

    fn fail_upstream(&self, channel_id: ChannelId, htlc_id: u64, reason: FailureReason) {
        let command = PeerCommand::FailHtlc {
            channel_id,
            htlc_id,
            reason,
        };
        if self.send_to_channel_peer(&channel_id, command).is_err() {
            warn!(
                "Cannot fail HTLC {} back on channel {}: no session",
                htlc_id, channel_id
            );
        }
    }

    /// An offered HTLC was fulfilled or failed by the counterparty.
    pub(crate) fn resolve_offered(&self, channel_id: ChannelId, htlc_id: u64, resolution: HtlcResolution) {
        let Some((_, origin)) = self.htlc_origins.remove(&(channel_id, htlc_id)) else {
            warn!("No origin for HTLC {} on channel {}", htlc_id, channel_id);
            return;
        };

        match origin {
            HtlcOrigin::Local {
                payment_hash,
                resolver,
            } => {
                match &resolution {
                    HtlcResolution::Fulfilled(preimage) => {
                        self.payments
                            .insert(payment_hash, PaymentState::Succeeded(*preimage));
                        info!("Payment {} succeeded", payment_hash);
                        self.emit(LightningEvent::PaymentSent {
                            payment_hash,
                            preimage: *preimage,
                        });
                    }
                    HtlcResolution::Failed(reason) => {
                        self.payments.remove(&payment_hash);
                        warn!("Payment {} failed: {}", payment_hash, reason);
                        self.emit(LightningEvent::PaymentFailed {
                            payment_hash,
                            reason: reason.clone(),
                        });
                    }
                    HtlcResolution::Rejected(_) | HtlcResolution::Aborted(_) => {
                        self.payments.remove(&payment_hash);
                    }
                }
                if let Some(resolver) = resolver {
                    let _ = resolver.send(resolution);
                }
            }
            HtlcOrigin::Forwarded {
                channel_id: upstream,
                htlc_id: upstream_id,
            } => {
                let command = match resolution {
                    HtlcResolution::Fulfilled(preimage) => PeerCommand::FulfillHtlc {
                        channel_id: upstream,
                        htlc_id: upstream_id,
                        preimage,
                    },
                    HtlcResolution::Failed(reason) => PeerCommand::FailHtlc {
                        channel_id: upstream,
                        htlc_id: upstream_id,
                        reason,
                    },
                    HtlcResolution::Rejected(_) | HtlcResolution::Aborted(_) => PeerCommand::FailHtlc {
                        channel_id: upstream,
                        htlc_id: upstream_id,
                        reason: FailureReason::Remote(FailureCode::TemporaryChannelFailure),
                    },
                };
                if self.send_to_channel_peer(&upstream, command).is_err() {
                    warn!(
                        "Upstream session for channel {} is gone; HTLC {} stays pending",
                        upstream, upstream_id
                    );
                }
            }
        }
    }

    /// Check a received HTLC addressed to us against the invoice it pays
    /// and fulfill it on `channel`. The invoice is marked paid only once the
    /// channel has accepted the fulfill. A `ManagerError::Channel` means the
    /// invoice was left untouched.
    pub(crate) fn settle_final(
        &self,
        channel: &Mutex<Channel>,
        htlc: &Htlc,
    ) -> Result<PaymentPreimage, ManagerError> {
        let now = now_secs();
        let height = self.block_height();
        let mut invoices = self.lock_invoices()?;

        let record = invoices
            .get(&htlc.payment_hash)
            .ok_or(ManagerError::UnknownPaymentHash)?;
        match record.state {
            InvoiceState::Open if !record.invoice.is_expired(now) => {}
            InvoiceState::Open | InvoiceState::Expired => return Err(ManagerError::InvoiceExpired),
            InvoiceState::Paid => return Err(ManagerError::AlreadyPaid),
            InvoiceState::Canceled => return Err(ManagerError::UnknownPaymentHash),
        }
        if let Some(expected) = record.invoice.amount_msat {
            if htlc.amount_msat < expected {
                return Err(ManagerError::PaymentFailed(FailureReason::Remote(
                    FailureCode::FinalIncorrectHtlcAmount,
                )));
            }
        }
        let min_cltv = height.saturating_add(record.invoice.min_final_cltv_expiry);
        if htlc.cltv_expiry < min_cltv {
            return Err(ManagerError::PaymentFailed(FailureReason::Remote(
                FailureCode::FinalIncorrectCltvExpiry,
            )));
        }

        let preimage = record.preimage;
        lock_channel(channel)?.fulfill_htlc(HtlcDirection::Received, htlc.id, preimage)?;
        if invoices.mark_paid(&htlc.payment_hash, htlc.amount_msat, now)? {
            info!(
                "Received payment {} for {} msat",
                htlc.payment_hash, htlc.amount_msat
            );
            self.emit(LightningEvent::PaymentReceived {
                payment_hash: htlc.payment_hash,
                amount_msat: htlc.amount_msat,
            });
        }
        Ok(preimage)
    }

    /// Pass a received HTLC on to the next channel named in its hop payloads.
    pub(crate) fn forward(
        &self,
        upstream: ChannelId,
        htlc: &Htlc,
        mut hops: Vec<HopPayload>,
    ) -> Result<(), FailureReason> {
        let unknown_next = FailureReason::Remote(FailureCode::UnknownNextPeer);
        if hops.is_empty() {
            return Err(FailureReason::Remote(FailureCode::InvalidOnionPayload));
        }
        let next = hops.remove(0);

        let channel_id = self
            .channel_id_by_scid(&next.short_channel_id)
            .ok_or_else(|| unknown_next.clone())?;

        let policy = self.config.local_policy(0);
        let required = next
            .amount_to_forward
            .saturating_add(policy.fee_for(next.amount_to_forward));
        if htlc.amount_msat < required {
            return Err(FailureReason::Remote(FailureCode::FeeInsufficient));
        }
        if next.amount_to_forward < policy.htlc_minimum_msat {
            return Err(FailureReason::Remote(FailureCode::AmountBelowMinimum));
        }
        let cltv_floor = next
            .outgoing_cltv_value
            .saturating_add(u32::from(policy.cltv_expiry_delta));
        if htlc.cltv_expiry < cltv_floor {
            return Err(FailureReason::Remote(FailureCode::IncorrectCltvExpiry));
        }
        let height = self.block_height();
        if next.outgoing_cltv_value <= height.saturating_add(self.config.htlc_fail_back_margin) {
            return Err(FailureReason::Remote(FailureCode::ExpiryTooSoon));
        }

        debug!(
            "Forwarding HTLC {} from channel {} to {} ({} msat)",
            htlc.id, upstream, next.short_channel_id, next.amount_to_forward
        );
        let command = PeerCommand::AddHtlc {
            channel_id,
            amount_msat: next.amount_to_forward,
            payment_hash: htlc.payment_hash,
            cltv_expiry: next.outgoing_cltv_value,
            hops,
            origin: HtlcOrigin::Forwarded {
                channel_id: upstream,
                htlc_id: htlc.id,
            },
        };
        self.send_to_channel_peer(&channel_id, command)
            .map_err(|_| unknown_next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{Currency, Invoice};
    use crate::test_common::{node_key, node_pubkey, open_channel_pair, test_config};
    use crate::wallet::InMemoryWallet;

    fn switch_with_invoice(
        preimage: PaymentPreimage,
    ) -> (Switch, mpsc::UnboundedReceiver<LightningEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let switch = Switch::new(
            test_config(),
            node_key(2),
            Arc::new(InMemoryWallet::new()),
            events_tx,
        );
        let invoice = Invoice::new(
            Currency::Supernova,
            preimage.payment_hash(),
            Some(5_000),
            "tea",
            node_pubkey(2),
            now_secs(),
        );
        switch
            .lock_invoices()
            .unwrap()
            .add(invoice, String::new(), preimage)
            .unwrap();
        (switch, events)
    }

    #[test]
    fn test_rejected_fulfill_leaves_invoice_open() {
        let preimage = PaymentPreimage::new([6u8; 32]);
        let hash = preimage.payment_hash();
        let (switch, mut events) = switch_with_invoice(preimage);

        let (_, mut channel) = open_channel_pair(100_000, 0);
        let id = channel
            .add_htlc(5_000, hash, 1_000, HtlcDirection::Received)
            .unwrap();
        let htlc = channel.htlc(HtlcDirection::Received, id).cloned().unwrap();
        channel
            .fail_htlc(HtlcDirection::Received, id, &FailureReason::Unspecified)
            .unwrap();
        let channel = Mutex::new(channel);

        assert_eq!(
            switch.settle_final(&channel, &htlc),
            Err(ManagerError::Channel(ChannelError::HtlcNotFound(id)))
        );
        assert_eq!(
            switch.lock_invoices().unwrap().get(&hash).unwrap().state,
            InvoiceState::Open
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_settle_final_fulfills_then_marks_paid() {
        let preimage = PaymentPreimage::new([7u8; 32]);
        let hash = preimage.payment_hash();
        let (switch, mut events) = switch_with_invoice(preimage);

        let (_, mut channel) = open_channel_pair(100_000, 0);
        let id = channel
            .add_htlc(5_000, hash, 1_000, HtlcDirection::Received)
            .unwrap();
        let htlc = channel.htlc(HtlcDirection::Received, id).cloned().unwrap();
        let channel = Mutex::new(channel);

        assert_eq!(switch.settle_final(&channel, &htlc), Ok(preimage));
        assert_eq!(channel.lock().unwrap().local_balance_msat(), 5_000);
        assert_eq!(
            switch.lock_invoices().unwrap().get(&hash).unwrap().state,
            InvoiceState::Paid
        );
        assert!(matches!(
            events.try_recv(),
            Ok(LightningEvent::PaymentReceived { amount_msat: 5_000, .. })
        ));

        // A second HTLC for the same invoice is refused and stays pending.
        let mut guard = channel.lock().unwrap();
        let again = guard.add_htlc(5_000, hash, 1_000, HtlcDirection::Received).unwrap();
        let htlc = guard.htlc(HtlcDirection::Received, again).cloned().unwrap();
        drop(guard);
        assert_eq!(switch.settle_final(&channel, &htlc), Err(ManagerError::AlreadyPaid));
        assert_eq!(channel.lock().unwrap().pending_htlc_total_msat(), 5_000);
    }
}
