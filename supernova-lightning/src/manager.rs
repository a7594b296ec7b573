// SuperNova Lightning Network - Lightning Manager
//
// Entry point for embedding the engine: owns the shared switch, spawns peer
// sessions, issues invoices and drives outgoing payments.

use crate::channel::{Channel, ChannelError, ChannelId, ChannelParams, ChannelState, ShortChannelId};
use crate::config::LightningConfig;
use crate::graph::{GraphError, NetworkGraph, NodeId};
use crate::invoice::{now_secs, Invoice, InvoiceError, RouteHint, RouteHintHop};
use crate::payment::{FailureCode, FailureReason, PaymentHash, PaymentPreimage};
use crate::peer::{Peer, PeerCommand, PeerError, Transport};
use crate::requests::{self, PaymentRequestView};
use crate::router::{PathFinder, RoutingError};
use crate::switch::{lock_channel, HtlcOrigin, HtlcResolution, PaymentState, Switch};
use crate::wallet::{WalletBackend, WalletError};
use dashmap::mapref::entry::Entry;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notifications surfaced to the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightningEvent {
    PaymentReceived {
        payment_hash: PaymentHash,
        amount_msat: u64,
    },
    PaymentSent {
        payment_hash: PaymentHash,
        preimage: PaymentPreimage,
    },
    PaymentFailed {
        payment_hash: PaymentHash,
        reason: FailureReason,
    },
    ChannelOpened {
        channel_id: ChannelId,
    },
    ChannelClosed {
        channel_id: ChannelId,
    },
    PeerConnected {
        node_id: NodeId,
    },
    PeerDisconnected {
        node_id: NodeId,
        reason: String,
    },
    /// An offered HTLC reached its expiry height without being resolved.
    HtlcExpired {
        channel_id: ChannelId,
        htlc_id: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Payment failed: {0}")]
    PaymentFailed(FailureReason),

    #[error("A payment for this hash is already in flight")]
    PaymentInProgress,

    #[error("Invoice already paid")]
    AlreadyPaid,

    #[error("Unknown payment hash")]
    UnknownPaymentHash,

    #[error("Invoice expired")]
    InvoiceExpired,

    #[error("Peer connection closed: {0}")]
    PeerConnectionClosed(String),

    #[error("Invoice is for network {0}")]
    WrongNetwork(String),

    #[error("Invoice does not specify an amount")]
    MissingAmount,

    #[error("Already connected to {0}")]
    AlreadyConnected(NodeId),

    #[error("Channel {0} already registered")]
    DuplicateChannel(ChannelId),

    #[error("Channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("Channel does not belong to this node")]
    ForeignChannel,

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Invoice error: {0}")]
    Invoice(#[from] InvoiceError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
}

impl ManagerError {
    /// Reason reported upstream when a received HTLC is rejected. Details
    /// of our invoices are not revealed.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ManagerError::PaymentFailed(reason) => reason.clone(),
            ManagerError::UnknownPaymentHash
            | ManagerError::InvoiceExpired
            | ManagerError::AlreadyPaid => {
                FailureReason::Remote(FailureCode::IncorrectOrUnknownPaymentDetails)
            }
            _ => FailureReason::Remote(FailureCode::TemporaryNodeFailure),
        }
    }
}

/// Balances of one channel, from our side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBalance {
    pub channel_id: ChannelId,
    pub short_channel_id: ShortChannelId,
    pub state: ChannelState,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub pending_htlc_msat: u64,
}

/// A channel as listed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub short_channel_id: ShortChannelId,
    pub remote_node_id: NodeId,
    pub state: ChannelState,
    pub capacity_msat: u64,
    pub pending_htlcs: usize,
    pub connected: bool,
}

/// Lightning Network Manager - coordinates channels, peers and payments
#[derive(Clone)]
pub struct LightningManager {
    switch: Arc<Switch>,
}

impl LightningManager {
    /// Create a manager for the node identified by `node_secret`. Events are
    /// delivered on the returned receiver.
    pub fn new(
        config: LightningConfig,
        node_secret: SecretKey,
        wallet: Arc<dyn WalletBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<LightningEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let switch = Arc::new(Switch::new(config, node_secret, wallet, events));
        info!("Lightning manager started for node {}", switch.node_id);
        (Self { switch }, receiver)
    }

    pub fn node_id(&self) -> NodeId {
        self.switch.node_id
    }

    pub fn config(&self) -> &LightningConfig {
        &self.switch.config
    }

    pub fn graph(&self) -> Arc<NetworkGraph> {
        Arc::clone(&self.switch.graph)
    }

    pub fn block_height(&self) -> u32 {
        self.switch.block_height()
    }

    /// Register a channel. It must be added before connecting its peer.
    pub fn add_channel(&self, params: ChannelParams) -> Result<ChannelId, ManagerError> {
        if NodeId::new(params.local_node_id) != self.switch.node_id {
            return Err(ManagerError::ForeignChannel);
        }
        let channel = Channel::new(params)?;
        let snapshot = channel.snapshot();
        let channel_id = self.switch.insert_channel(channel)?;
        self.switch.save_snapshot(&snapshot);
        debug!("Registered channel {}", channel_id);
        Ok(channel_id)
    }

    /// Move a channel to OPEN. The first time, its edges enter the graph.
    pub fn mark_open(&self, channel_id: &ChannelId) -> Result<(), ManagerError> {
        let channel = self
            .switch
            .channel(channel_id)
            .ok_or(ManagerError::ChannelNotFound(*channel_id))?;
        let (first_open, short_channel_id, remote, snapshot) = {
            let mut guard = lock_channel(&channel)?;
            let first_open = guard.set_state(ChannelState::Open)?;
            (
                first_open,
                guard.short_channel_id(),
                NodeId::new(guard.remote_node_id()),
                guard.snapshot(),
            )
        };
        if first_open {
            let timestamp = u32::try_from(now_secs()).unwrap_or(u32::MAX);
            self.switch.graph.add_local_channel(
                short_channel_id,
                self.switch.node_id,
                remote,
                self.switch.config.local_policy(timestamp),
            )?;
            self.switch.save_snapshot(&snapshot);
            info!("Channel {} is open", short_channel_id);
            self.switch.emit(LightningEvent::ChannelOpened {
                channel_id: *channel_id,
            });
        }
        Ok(())
    }

    /// Start a session with `remote` over `transport`. The returned task
    /// ends with the session.
    pub fn connect_peer<T>(
        &self,
        remote: PublicKey,
        transport: T,
    ) -> Result<JoinHandle<Result<(), PeerError>>, ManagerError>
    where
        T: Transport + 'static,
    {
        let remote = NodeId::new(remote);
        let (commands, receiver) = mpsc::unbounded_channel();
        let session = self.switch.register_peer(remote, commands)?;
        info!("Connecting to peer {}", remote);
        let peer = Peer::new(remote, session, transport, Arc::clone(&self.switch), receiver);
        Ok(tokio::spawn(peer.run()))
    }

    pub fn is_connected(&self, remote: &PublicKey) -> bool {
        self.switch.is_connected(&NodeId::new(*remote))
    }

    /// Ask the session with `remote` to end.
    pub fn disconnect(&self, remote: &PublicKey) -> bool {
        self.switch
            .send_to_peer(&NodeId::new(*remote), PeerCommand::Disconnect)
            .is_ok()
    }

    /// Issue an invoice. Open channels whose counterparty has published its
    /// policy are added as routing hints.
    pub fn create_invoice(
        &self,
        amount_msat: Option<u64>,
        description: &str,
        expiry_secs: Option<u64>,
    ) -> Result<String, ManagerError> {
        let hints = self.private_route_hints()?;
        self.create_invoice_with_hints(amount_msat, description, expiry_secs, hints)
    }

    pub fn create_invoice_with_hints(
        &self,
        amount_msat: Option<u64>,
        description: &str,
        expiry_secs: Option<u64>,
        route_hints: Vec<RouteHint>,
    ) -> Result<String, ManagerError> {
        let config = &self.switch.config;
        let preimage = PaymentPreimage::new_random();
        let mut payment_secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut payment_secret);

        let mut invoice = Invoice::new(
            config.network,
            preimage.payment_hash(),
            amount_msat,
            description,
            self.switch.node_id.public_key(),
            now_secs(),
        );
        invoice.payment_secret = Some(payment_secret);
        invoice.expiry = expiry_secs.unwrap_or(config.invoice_expiry_secs);
        invoice.min_final_cltv_expiry = config.min_final_cltv_expiry;
        invoice.route_hints = route_hints;

        let encoded = invoice.encode(&self.switch.node_key)?;
        let payment_hash = invoice.payment_hash;
        self.switch
            .lock_invoices()?
            .add(invoice, encoded.clone(), preimage)?;
        info!("Created invoice {}", payment_hash);
        Ok(encoded)
    }

    /// Hints for our open channels, using the policy the counterparty
    /// advertised for its direction towards us.
    fn private_route_hints(&self) -> Result<Vec<RouteHint>, ManagerError> {
        let graph = self.switch.graph.snapshot()?;
        let mut hints = Vec::new();
        for edge in graph.edges_into(&self.switch.node_id) {
            let open = self
                .switch
                .channel_id_by_scid(&edge.short_channel_id)
                .and_then(|id| self.switch.channel(&id))
                .map(|channel| {
                    lock_channel(&channel).map(|c| c.state() == ChannelState::Open)
                })
                .transpose()?
                .unwrap_or(false);
            if !open || edge.policy.disabled {
                continue;
            }
            hints.push(RouteHint(vec![RouteHintHop {
                node_id: edge.from.public_key(),
                short_channel_id: edge.short_channel_id,
                fee_base_msat: edge.policy.fee_base_msat,
                fee_proportional_millionths: edge.policy.fee_proportional_millionths,
                cltv_expiry_delta: edge.policy.cltv_expiry_delta,
            }]));
        }
        Ok(hints)
    }

    /// Pay an encoded invoice and return the preimage.
    pub async fn pay(&self, invoice: &str) -> Result<PaymentPreimage, ManagerError> {
        self.pay_excluding(invoice, &[]).await
    }

    /// Like `pay`, avoiding the given channels. Used to retry after a
    /// failure on a known hop.
    pub async fn pay_excluding(
        &self,
        invoice: &str,
        excluded: &[ShortChannelId],
    ) -> Result<PaymentPreimage, ManagerError> {
        let invoice = Invoice::decode(invoice)?;
        if invoice.currency != self.switch.config.network {
            return Err(ManagerError::WrongNetwork(invoice.currency.to_string()));
        }
        if invoice.is_expired(now_secs()) {
            return Err(ManagerError::InvoiceExpired);
        }
        let amount_msat = invoice.amount_msat.ok_or(ManagerError::MissingAmount)?;
        let payment_hash = invoice.payment_hash;

        match self.switch.payments.entry(payment_hash) {
            Entry::Occupied(existing) => {
                return Err(match existing.get() {
                    PaymentState::InFlight => ManagerError::PaymentInProgress,
                    PaymentState::Succeeded(_) => ManagerError::AlreadyPaid,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(PaymentState::InFlight);
            }
        }

        let resolution = match self.send_htlc(&invoice, amount_msat, excluded).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.switch.payments.remove(&payment_hash);
                warn!("Payment {} not sent: {}", payment_hash, e);
                return Err(e);
            }
        };

        match resolution.await {
            Ok(HtlcResolution::Fulfilled(preimage)) => Ok(preimage),
            Ok(HtlcResolution::Failed(reason)) => Err(ManagerError::PaymentFailed(reason)),
            Ok(HtlcResolution::Rejected(e)) => Err(ManagerError::Channel(e)),
            Ok(HtlcResolution::Aborted(reason)) => Err(ManagerError::PeerConnectionClosed(reason)),
            Err(_) => {
                self.switch.payments.remove(&payment_hash);
                Err(ManagerError::PeerConnectionClosed(
                    "payment abandoned by session".to_string(),
                ))
            }
        }
    }

    /// Find a route and hand the first HTLC to the session of the first hop.
    async fn send_htlc(
        &self,
        invoice: &Invoice,
        amount_msat: u64,
        excluded: &[ShortChannelId],
    ) -> Result<oneshot::Receiver<HtlcResolution>, ManagerError> {
        let config = &self.switch.config;
        let graph = self.switch.graph.snapshot()?;
        let source = self.switch.node_id;
        let payee = NodeId::new(invoice.payee);
        let hints = invoice.route_hints.clone();
        let excluded = excluded.to_vec();
        let max_fee_msat = config.max_fee_msat(amount_msat);
        let max_cltv_delta = config
            .max_route_cltv_delta
            .saturating_sub(invoice.min_final_cltv_expiry);

        let route = tokio::task::spawn_blocking(move || {
            PathFinder::new(&graph)
                .with_route_hints(&hints, payee)
                .excluding(excluded)
                .find_route(source, payee, amount_msat, max_fee_msat, max_cltv_delta)
        })
        .await
        .map_err(|e| ManagerError::TaskFailed(e.to_string()))??;

        let first_hop = route.first_hop().ok_or(RoutingError::NoRouteFound)?;
        let channel_id = self
            .switch
            .channel_id_by_scid(&first_hop.short_channel_id)
            .ok_or(RoutingError::NoRouteFound)?;

        let height = self.switch.block_height();
        let min_final = invoice.min_final_cltv_expiry;
        let (resolver, resolution) = oneshot::channel();
        info!(
            "Paying {} msat for {} over {} hops (fee {} msat)",
            amount_msat,
            invoice.payment_hash,
            route.hops.len(),
            route.total_fee_msat()
        );
        let command = PeerCommand::AddHtlc {
            channel_id,
            amount_msat: route.total_amount_msat(),
            payment_hash: invoice.payment_hash,
            cltv_expiry: route.first_hop_cltv(height, min_final),
            hops: route.hop_payloads(height, min_final),
            origin: HtlcOrigin::Local {
                payment_hash: invoice.payment_hash,
                resolver: Some(resolver),
            },
        };
        if self.switch.send_to_channel_peer(&channel_id, command).is_err() {
            return Err(ManagerError::PeerConnectionClosed(format!(
                "no session for channel {}",
                channel_id
            )));
        }
        Ok(resolution)
    }

    /// Record a new chain tip: expire invoices and let sessions fail back
    /// HTLCs that are about to time out.
    pub fn set_block_height(&self, height: u32) -> Result<(), ManagerError> {
        self.switch.set_block_height(height);
        let expired = self.switch.lock_invoices()?.expire_old_invoices(now_secs());
        if expired > 0 {
            debug!("Expired {} invoices", expired);
        }
        for peer in self.switch.connected_peers() {
            let _ = self
                .switch
                .send_to_peer(&peer, PeerCommand::CheckExpiry { height });
        }
        Ok(())
    }

    /// Start a cooperative close. Completion is reported by a
    /// `ChannelClosed` event.
    pub async fn close_channel(&self, channel_id: &ChannelId) -> Result<(), ManagerError> {
        let (reply, response) = oneshot::channel();
        let command = PeerCommand::CloseChannel {
            channel_id: *channel_id,
            reply,
        };
        if self.switch.channel(channel_id).is_none() {
            return Err(ManagerError::ChannelNotFound(*channel_id));
        }
        self.switch
            .send_to_channel_peer(channel_id, command)
            .map_err(|_| ManagerError::PeerConnectionClosed("peer not connected".to_string()))?;
        response
            .await
            .map_err(|_| ManagerError::PeerConnectionClosed("session ended".to_string()))??;
        Ok(())
    }

    /// Send our signed channel updates to every connected peer.
    pub fn announce_policy(&self) {
        for peer in self.switch.connected_peers() {
            let _ = self.switch.send_to_peer(&peer, PeerCommand::AnnouncePolicy);
        }
    }

    pub fn channel_balances(&self) -> Result<Vec<ChannelBalance>, ManagerError> {
        self.switch
            .all_channels()
            .into_iter()
            .map(|(channel_id, _, channel)| {
                let guard = lock_channel(&channel)?;
                Ok(ChannelBalance {
                    channel_id,
                    short_channel_id: guard.short_channel_id(),
                    state: guard.state(),
                    local_balance_msat: guard.local_balance_msat(),
                    remote_balance_msat: guard.remote_balance_msat(),
                    pending_htlc_msat: guard.pending_htlc_total_msat(),
                })
            })
            .collect()
    }

    pub fn channel_balance(&self, channel_id: &ChannelId) -> Result<ChannelBalance, ManagerError> {
        self.channel_balances()?
            .into_iter()
            .find(|b| b.channel_id == *channel_id)
            .ok_or(ManagerError::ChannelNotFound(*channel_id))
    }

    pub fn list_channels(&self) -> Result<Vec<ChannelSummary>, ManagerError> {
        self.switch
            .all_channels()
            .into_iter()
            .map(|(channel_id, remote, channel)| {
                let guard = lock_channel(&channel)?;
                Ok(ChannelSummary {
                    channel_id,
                    short_channel_id: guard.short_channel_id(),
                    remote_node_id: remote,
                    state: guard.state(),
                    capacity_msat: guard.capacity_msat(),
                    pending_htlcs: guard.pending_htlcs().count(),
                    connected: self.switch.is_connected(&remote),
                })
            })
            .collect()
    }

    /// Outstanding on-chain requests and issued invoices, oldest first.
    pub fn list_requests(&self) -> Result<Vec<PaymentRequestView>, ManagerError> {
        let invoices = self.switch.lock_invoices()?;
        requests::list_requests(self.switch.wallet.as_ref(), &invoices)
    }

    /// Delete a request by payment hash (hex) or on-chain address.
    pub fn delete_request(&self, key: &str) -> Result<bool, ManagerError> {
        let mut invoices = self.switch.lock_invoices()?;
        requests::delete_request(self.switch.wallet.as_ref(), &mut invoices, key)
    }

    /// Stop accepting payments for an issued invoice.
    pub fn cancel_invoice(&self, payment_hash: &PaymentHash) -> Result<(), ManagerError> {
        self.switch.lock_invoices()?.cancel(payment_hash)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::InvoiceState;
    use crate::test_common::{node_key, node_pubkey, test_config};
    use crate::wallet::InMemoryWallet;

    fn manager(n: u8) -> (LightningManager, mpsc::UnboundedReceiver<LightningEvent>) {
        LightningManager::new(test_config(), node_key(n), Arc::new(InMemoryWallet::new()))
    }

    fn params(balance_local: u64, balance_remote: u64) -> (ChannelParams, ChannelParams) {
        ChannelParams::new_pair(
            [9; 32],
            1,
            ShortChannelId::new(700_000, 3, 1),
            (node_pubkey(1), balance_local),
            (node_pubkey(2), balance_remote),
            crate::channel::ChannelConfig::default(),
        )
    }

    #[test]
    fn test_failure_reason_hides_invoice_details() {
        assert_eq!(
            ManagerError::InvoiceExpired.failure_reason(),
            FailureReason::Remote(FailureCode::IncorrectOrUnknownPaymentDetails)
        );
        assert_eq!(
            ManagerError::UnknownPaymentHash.failure_reason(),
            ManagerError::AlreadyPaid.failure_reason()
        );
        let amount = FailureReason::Remote(FailureCode::FinalIncorrectHtlcAmount);
        assert_eq!(ManagerError::PaymentFailed(amount.clone()).failure_reason(), amount);
    }

    #[test]
    fn test_add_channel_rejects_foreign_params() {
        let (manager, _) = manager(1);
        let (_, theirs) = params(1_000, 1_000);
        assert_eq!(manager.add_channel(theirs), Err(ManagerError::ForeignChannel));
    }

    #[tokio::test]
    async fn test_mark_open_admits_channel_once() {
        let (manager, mut events) = manager(1);
        let (ours, _) = params(50_000, 0);
        let channel_id = manager.add_channel(ours).unwrap();
        assert_eq!(
            manager.add_channel(params(1, 1).0),
            Err(ManagerError::DuplicateChannel(channel_id))
        );

        manager.mark_open(&channel_id).unwrap();
        assert_eq!(
            events.recv().await,
            Some(LightningEvent::ChannelOpened { channel_id })
        );
        assert_eq!(manager.graph().snapshot().unwrap().channel_count(), 1);
        assert!(matches!(
            manager.mark_open(&channel_id),
            Err(ManagerError::Channel(ChannelError::InvalidStateTransition { .. }))
        ));

        let balance = manager.channel_balance(&channel_id).unwrap();
        assert_eq!(balance.local_balance_msat, 50_000);
        assert_eq!(balance.state, ChannelState::Open);
    }

    #[test]
    fn test_created_invoice_is_stored_open() {
        let (manager, _) = manager(1);
        let encoded = manager
            .create_invoice(Some(25_000), "coffee", Some(600))
            .unwrap();
        let invoice = Invoice::decode(&encoded).unwrap();
        assert_eq!(invoice.amount_msat, Some(25_000));
        assert_eq!(invoice.expiry, 600);
        assert_eq!(invoice.payee, node_pubkey(1));

        let invoices = manager.switch.lock_invoices().unwrap();
        let record = invoices.get(&invoice.payment_hash).unwrap();
        assert_eq!(record.state, InvoiceState::Open);
        assert!(record.preimage.matches(&invoice.payment_hash));
    }

    #[tokio::test]
    async fn test_pay_requires_amount_and_network() {
        let (payer, _) = manager(1);
        let (payee, _) = manager(2);
        let no_amount = payee.create_invoice(None, "tip", None).unwrap();
        assert_eq!(payer.pay(&no_amount).await, Err(ManagerError::MissingAmount));

        let mut config = test_config();
        config.network = crate::invoice::Currency::Regtest;
        let (regtest, _) =
            LightningManager::new(config, node_key(3), Arc::new(InMemoryWallet::new()));
        let foreign = regtest.create_invoice(Some(1_000), "x", None).unwrap();
        assert!(matches!(
            payer.pay(&foreign).await,
            Err(ManagerError::WrongNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_pay_without_route_releases_hash() {
        let (payer, _) = manager(1);
        let (payee, _) = manager(2);
        let invoice = payee.create_invoice(Some(1_000), "x", None).unwrap();

        for _ in 0..2 {
            assert_eq!(
                payer.pay(&invoice).await,
                Err(ManagerError::Routing(RoutingError::NoRouteFound))
            );
        }
        assert!(payer.switch.payments.is_empty());
    }
}
