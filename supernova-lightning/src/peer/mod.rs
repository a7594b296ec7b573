// SuperNova Lightning Network - Peer Sessions
//
// One task per connected counterparty. The task owns the transport, runs
// the init handshake and then drives every channel shared with that peer:
// incoming messages and queued commands are applied one at a time, and
// commitments are signed whenever updates are waiting.

pub mod transport;

pub use transport::{MemoryTransport, StreamTransport, Transport, TransportError};

use crate::channel::{Channel, ChannelError, ChannelId, ChannelState, Htlc, HtlcDirection};
use crate::graph::NodeId;
use crate::invoice::now_secs;
use crate::manager::{LightningEvent, ManagerError};
use crate::payment::{FailureCode, FailureReason, PaymentHash, PaymentPreimage};
use crate::switch::{lock_channel, HtlcOrigin, HtlcResolution, Switch};
use crate::wire::{
    frame, is_gossip_type, peek_type, ChannelReestablish, ClosingSigned, CommitmentSigned,
    Features, FrameDecoder, HopPayload, Init, Message, Pong, RevokeAndAck, Shutdown, TlvStream,
    UpdateAddHtlc, UpdateFailHtlc, UpdateFulfillHtlc,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Largest `num_pong_bytes` that still gets an answer.
const MAX_PONG_BYTES: u16 = 65531;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The session is over; no further messages are exchanged.
    #[error("Peer connection closed: {0}")]
    PeerConnectionClosed(String),
}

impl From<ManagerError> for PeerError {
    fn from(err: ManagerError) -> Self {
        PeerError::PeerConnectionClosed(err.to_string())
    }
}

fn closed(reason: impl fmt::Display) -> PeerError {
    PeerError::PeerConnectionClosed(reason.to_string())
}

fn lock(channel: &Mutex<Channel>) -> Result<MutexGuard<'_, Channel>, PeerError> {
    Ok(lock_channel(channel)?)
}

/// Work queued on a session by the manager or by another session.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    AddHtlc {
        channel_id: ChannelId,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        hops: Vec<HopPayload>,
        origin: HtlcOrigin,
    },
    FulfillHtlc {
        channel_id: ChannelId,
        htlc_id: u64,
        preimage: PaymentPreimage,
    },
    FailHtlc {
        channel_id: ChannelId,
        htlc_id: u64,
        reason: FailureReason,
    },
    CloseChannel {
        channel_id: ChannelId,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    /// A new block height; fail back received HTLCs close to expiry.
    CheckExpiry { height: u32 },
    /// Send our signed forwarding policy for every open channel.
    AnnouncePolicy,
    Disconnect,
}

/// Read the next complete message. Cancel-safe: bytes are only consumed
/// once a full frame is buffered. Gossip that fails to parse is skipped.
async fn read_message<T: Transport>(
    transport: &mut T,
    decoder: &mut FrameDecoder,
) -> Result<Message, PeerError> {
    loop {
        while let Some(body) = decoder.next_frame() {
            match Message::decode(&body) {
                Ok(message) => return Ok(message),
                Err(e) if peek_type(&body).is_some_and(is_gossip_type) => {
                    warn!("Dropped malformed gossip ({} bytes): {}", body.len(), e);
                }
                Err(e) => return Err(closed(e)),
            }
        }
        let chunk = transport.recv().await.map_err(closed)?;
        decoder.push(&chunk);
    }
}

pub(crate) struct Peer<T: Transport> {
    remote: NodeId,
    session: u64,
    transport: T,
    decoder: FrameDecoder,
    switch: Arc<Switch>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    remote_features: Features,
    /// Forwarding instructions of received HTLCs that are not locked in yet
    incoming_hops: HashMap<(ChannelId, u64), Vec<HopPayload>>,
}

impl<T: Transport> Peer<T> {
    pub(crate) fn new(
        remote: NodeId,
        session: u64,
        transport: T,
        switch: Arc<Switch>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Self {
        Self {
            remote,
            session,
            transport,
            decoder: FrameDecoder::new(),
            switch,
            commands,
            remote_features: Features::empty(),
            incoming_hops: HashMap::new(),
        }
    }

    /// Run the session until the peer goes away, a fatal error occurs or a
    /// disconnect is requested.
    pub(crate) async fn run(mut self) -> Result<(), PeerError> {
        let span = info_span!("peer", remote = %self.remote);
        async move {
            let result = self.serve().await;
            let reason = match &result {
                Ok(()) => "disconnected".to_string(),
                Err(e) => {
                    error!("Session terminated: {}", e);
                    e.to_string()
                }
            };
            self.teardown(&reason);
            result
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self) -> Result<(), PeerError> {
        self.handshake().await?;
        info!("Handshake complete, features {:?}", self.remote_features.set_bits());
        self.switch.emit(LightningEvent::PeerConnected {
            node_id: self.remote,
        });

        for (_, channel) in self.switch.channels_of(&self.remote) {
            let reestablish = lock(&channel)?.reestablish_message();
            self.send(Message::ChannelReestablish(reestablish)).await?;
        }

        loop {
            tokio::select! {
                message = read_message(&mut self.transport, &mut self.decoder) => {
                    self.handle_message(message?).await?;
                }
                command = self.commands.recv() => match command {
                    None | Some(PeerCommand::Disconnect) => {
                        info!("Disconnect requested");
                        return Ok(());
                    }
                    Some(command) => self.handle_command(command).await?,
                },
            }
            self.flush_commitments().await?;
        }
    }

    async fn handshake(&mut self) -> Result<(), PeerError> {
        let init = Init {
            features: Features::local_init(),
            extensions: TlvStream::new(),
        };
        self.send(Message::Init(init)).await?;

        let limit = Duration::from_secs(self.switch.config.handshake_timeout_secs);
        let first = tokio::time::timeout(limit, read_message(&mut self.transport, &mut self.decoder))
            .await
            .map_err(|_| closed("handshake timed out"))??;
        let init = match first {
            Message::Init(init) => init,
            other => return Err(closed(format!("expected init, got {}", other.name()))),
        };

        if !init.features.supports_data_loss_protect() {
            return Err(closed("peer does not support option_data_loss_protect"));
        }
        let unknown = init.features.unknown_required_bits();
        if !unknown.is_empty() {
            return Err(closed(format!("peer requires unknown features {:?}", unknown)));
        }
        self.remote_features = init.features;
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        debug!("Sending {}", message.name());
        let bytes = frame(&message).map_err(closed)?;
        self.transport.send(bytes).await.map_err(closed)
    }

    fn channel(&self, channel_id: &ChannelId) -> Result<Arc<Mutex<Channel>>, PeerError> {
        self.switch
            .channel_with(channel_id, &self.remote)
            .ok_or_else(|| closed(format!("unknown channel {}", channel_id)))
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        debug!("Received {}", message.name());
        match message {
            Message::Init(_) => Err(closed("unexpected init after handshake")),
            Message::Error(msg) => Err(closed(format!("peer sent error: {}", msg.text()))),
            Message::Ping(ping) => {
                if ping.num_pong_bytes <= MAX_PONG_BYTES {
                    let pong = Pong {
                        ignored: vec![0u8; usize::from(ping.num_pong_bytes)],
                    };
                    self.send(Message::Pong(pong)).await?;
                }
                Ok(())
            }
            Message::Pong(_) => Ok(()),
            gossip @ (Message::ChannelAnnouncement(_)
            | Message::NodeAnnouncement(_)
            | Message::ChannelUpdate(_)) => {
                if let Err(e) = self.switch.graph.apply_announcement(&gossip) {
                    warn!("Dropped {}: {}", gossip.name(), e);
                }
                Ok(())
            }
            Message::Unknown { msg_type, .. } => {
                debug!("Ignoring message type {}", msg_type);
                Ok(())
            }
            Message::ChannelReestablish(msg) => self.on_reestablish(&msg),
            Message::UpdateAddHtlc(msg) => self.on_update_add_htlc(msg),
            Message::UpdateFulfillHtlc(msg) => self.on_update_fulfill_htlc(&msg),
            Message::UpdateFailHtlc(msg) => self.on_update_fail_htlc(&msg),
            Message::CommitmentSigned(msg) => self.on_commitment_signed(&msg).await,
            Message::RevokeAndAck(msg) => self.on_revoke_and_ack(&msg).await,
            Message::Shutdown(msg) => self.on_shutdown(&msg).await,
            Message::ClosingSigned(msg) => self.on_closing_signed(&msg).await,
        }
    }

    fn on_reestablish(&mut self, msg: &ChannelReestablish) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let mut channel = lock(&channel)?;
        channel.verify_reestablish(msg).map_err(closed)?;
        info!("Channel {} reestablished", channel.short_channel_id());
        Ok(())
    }

    fn on_update_add_htlc(&mut self, msg: UpdateAddHtlc) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let id = lock(&channel)?
            .receive_update_add_htlc(&msg)
            .map_err(closed)?;
        if !msg.hops.is_empty() {
            self.incoming_hops.insert((msg.channel_id, id), msg.hops);
        }
        Ok(())
    }

    fn on_update_fulfill_htlc(&mut self, msg: &UpdateFulfillHtlc) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let preimage = PaymentPreimage::new(msg.payment_preimage);
        lock(&channel)?
            .receive_fulfill(msg.id, preimage)
            .map_err(closed)?;
        self.switch
            .resolve_offered(msg.channel_id, msg.id, HtlcResolution::Fulfilled(preimage));
        Ok(())
    }

    fn on_update_fail_htlc(&mut self, msg: &UpdateFailHtlc) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let reason = FailureReason::decode(&msg.reason);
        lock(&channel)?
            .receive_fail(msg.id, &reason)
            .map_err(closed)?;
        self.switch
            .resolve_offered(msg.channel_id, msg.id, HtlcResolution::Failed(reason));
        Ok(())
    }

    async fn on_commitment_signed(&mut self, msg: &CommitmentSigned) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let (revoke, locked_in, snapshot) = {
            let mut guard = lock(&channel)?;
            let (revoke, locked_in) = guard.receive_commitment_signed(msg).map_err(closed)?;
            (revoke, locked_in, guard.snapshot())
        };
        self.switch.save_snapshot(&snapshot);
        self.send(Message::RevokeAndAck(revoke)).await?;
        self.process_locked_in(msg.channel_id, locked_in).await
    }

    async fn on_revoke_and_ack(&mut self, msg: &RevokeAndAck) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let (locked_in, snapshot) = {
            let mut guard = lock(&channel)?;
            let locked_in = guard.receive_revoke_and_ack(msg).map_err(closed)?;
            (locked_in, guard.snapshot())
        };
        self.switch.save_snapshot(&snapshot);
        self.process_locked_in(msg.channel_id, locked_in).await
    }

    /// Settle or forward received HTLCs that just became irrevocable.
    async fn process_locked_in(&mut self, channel_id: ChannelId, htlcs: Vec<Htlc>) -> Result<(), PeerError> {
        for htlc in htlcs {
            let hops = self
                .incoming_hops
                .remove(&(channel_id, htlc.id))
                .unwrap_or_default();

            if hops.is_empty() {
                let channel = self.channel(&channel_id)?;
                match self.switch.settle_final(&channel, &htlc) {
                    Ok(preimage) => self.send_fulfill(channel_id, htlc.id, preimage).await?,
                    Err(e @ (ManagerError::Channel(_) | ManagerError::LockPoisoned)) => {
                        return Err(closed(format!(
                            "cannot fulfill HTLC {} on {}: {}",
                            htlc.id, channel_id, e
                        )));
                    }
                    Err(e) => {
                        warn!("Rejecting HTLC {} for {}: {}", htlc.id, htlc.payment_hash, e);
                        let reason = e.failure_reason();
                        self.fail_received(channel_id, htlc.id, reason).await?;
                    }
                }
            } else if let Err(reason) = self.switch.forward(channel_id, &htlc, hops) {
                warn!("Cannot forward HTLC {} on {}: {}", htlc.id, channel_id, reason);
                self.fail_received(channel_id, htlc.id, reason).await?;
            }
        }
        Ok(())
    }

    async fn fulfill_received(
        &mut self,
        channel_id: ChannelId,
        htlc_id: u64,
        preimage: PaymentPreimage,
    ) -> Result<(), PeerError> {
        let channel = self.channel(&channel_id)?;
        lock(&channel)?
            .fulfill_htlc(HtlcDirection::Received, htlc_id, preimage)
            .map_err(|e| closed(format!("cannot fulfill HTLC {} on {}: {}", htlc_id, channel_id, e)))?;
        self.send_fulfill(channel_id, htlc_id, preimage).await
    }

    async fn send_fulfill(
        &mut self,
        channel_id: ChannelId,
        htlc_id: u64,
        preimage: PaymentPreimage,
    ) -> Result<(), PeerError> {
        self.send(Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
            channel_id,
            id: htlc_id,
            payment_preimage: preimage.into_inner(),
        }))
        .await
    }

    async fn fail_received(
        &mut self,
        channel_id: ChannelId,
        htlc_id: u64,
        reason: FailureReason,
    ) -> Result<(), PeerError> {
        let channel = self.channel(&channel_id)?;
        lock(&channel)?
            .fail_htlc(HtlcDirection::Received, htlc_id, &reason)
            .map_err(|e| closed(format!("cannot fail HTLC {} on {}: {}", htlc_id, channel_id, e)))?;
        self.send(Message::UpdateFailHtlc(UpdateFailHtlc {
            channel_id,
            id: htlc_id,
            reason: reason.encode(),
        }))
        .await
    }

    async fn on_shutdown(&mut self, msg: &Shutdown) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let reply = {
            let mut guard = lock(&channel)?;
            guard.receive_shutdown(msg).map_err(closed)?;
            if guard.local_shutdown_sent() {
                None
            } else {
                Some(guard.shutdown(Vec::new()).map_err(closed)?)
            }
        };
        if let Some(reply) = reply {
            self.send(Message::Shutdown(reply)).await?;
        }
        Ok(())
    }

    async fn on_closing_signed(&mut self, msg: &ClosingSigned) -> Result<(), PeerError> {
        let channel = self.channel(&msg.channel_id)?;
        let (reply, snapshot) = {
            let mut guard = lock(&channel)?;
            let reply = guard.receive_closing_signed(msg).map_err(closed)?;
            (reply, guard.snapshot())
        };
        if let Some(reply) = reply {
            self.send(Message::ClosingSigned(reply)).await?;
        }
        self.switch.channel_closed(&snapshot);
        Ok(())
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::AddHtlc {
                channel_id,
                amount_msat,
                payment_hash,
                cltv_expiry,
                hops,
                origin,
            } => {
                self.add_htlc(channel_id, amount_msat, payment_hash, cltv_expiry, hops, origin)
                    .await
            }
            PeerCommand::FulfillHtlc {
                channel_id,
                htlc_id,
                preimage,
            } => self.fulfill_received(channel_id, htlc_id, preimage).await,
            PeerCommand::FailHtlc {
                channel_id,
                htlc_id,
                reason,
            } => self.fail_received(channel_id, htlc_id, reason).await,
            PeerCommand::CloseChannel { channel_id, reply } => {
                let shutdown = match self.switch.channel_with(&channel_id, &self.remote) {
                    Some(channel) => {
                        let result = lock(&channel)?.shutdown(Vec::new());
                        result
                    }
                    None => Err(ChannelError::ProtocolViolation(format!(
                        "unknown channel {}",
                        channel_id
                    ))),
                };
                match shutdown {
                    Ok(shutdown) => {
                        info!("Closing channel {}", channel_id);
                        self.send(Message::Shutdown(shutdown)).await?;
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                Ok(())
            }
            PeerCommand::CheckExpiry { height } => self.check_expiry(height).await,
            PeerCommand::AnnouncePolicy => self.announce_policy().await,
            // Handled by the session loop
            PeerCommand::Disconnect => Ok(()),
        }
    }

    async fn add_htlc(
        &mut self,
        channel_id: ChannelId,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        hops: Vec<HopPayload>,
        origin: HtlcOrigin,
    ) -> Result<(), PeerError> {
        let Some(channel) = self.switch.channel_with(&channel_id, &self.remote) else {
            let err = ChannelError::ProtocolViolation(format!("unknown channel {}", channel_id));
            self.switch.fail_origin(origin, HtlcResolution::Rejected(err));
            return Ok(());
        };

        let added = lock(&channel)?.add_htlc(amount_msat, payment_hash, cltv_expiry, HtlcDirection::Offered);
        match added {
            Ok(htlc_id) => {
                self.switch.register_origin(channel_id, htlc_id, origin);
                self.send(Message::UpdateAddHtlc(UpdateAddHtlc {
                    channel_id,
                    id: htlc_id,
                    amount_msat,
                    payment_hash: payment_hash.into_inner(),
                    cltv_expiry,
                    hops,
                    extensions: TlvStream::new(),
                }))
                .await
            }
            Err(e) => {
                warn!("Cannot add HTLC for {} on {}: {}", payment_hash, channel_id, e);
                self.switch.fail_origin(origin, HtlcResolution::Rejected(e));
                Ok(())
            }
        }
    }

    async fn check_expiry(&mut self, height: u32) -> Result<(), PeerError> {
        let margin = self.switch.config.htlc_fail_back_margin;
        for (channel_id, channel) in self.switch.channels_of(&self.remote) {
            let expiring = lock(&channel)?.expired_htlcs(height, margin);
            for htlc in expiring {
                match htlc.direction {
                    HtlcDirection::Received
                        if htlc.is_locked_in() && !self.switch.is_forwarding(&channel_id, htlc.id) =>
                    {
                        warn!("Failing back HTLC {} on {}: expiry {} too close", htlc.id, channel_id, htlc.cltv_expiry);
                        self.fail_received(
                            channel_id,
                            htlc.id,
                            FailureReason::Remote(FailureCode::ExpiryTooSoon),
                        )
                        .await?;
                    }
                    HtlcDirection::Offered if htlc.cltv_expiry <= height => {
                        warn!("Offered HTLC {} on {} expired at {}", htlc.id, channel_id, htlc.cltv_expiry);
                        self.switch.emit(LightningEvent::HtlcExpired {
                            channel_id,
                            htlc_id: htlc.id,
                            payment_hash: htlc.payment_hash,
                            cltv_expiry: htlc.cltv_expiry,
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn announce_policy(&mut self) -> Result<(), PeerError> {
        let timestamp = u32::try_from(now_secs()).unwrap_or(u32::MAX);
        // Direction 0 is sent by the node with the lower id.
        let direction = usize::from(self.switch.node_id > self.remote);
        for (_, channel) in self.switch.channels_of(&self.remote) {
            let short_channel_id = {
                let guard = lock(&channel)?;
                if guard.state() != ChannelState::Open {
                    continue;
                }
                guard.short_channel_id()
            };
            let update = self.switch.config.local_policy(timestamp).signed_update(
                &self.switch.secp,
                &self.switch.node_key,
                short_channel_id,
                direction,
            );
            self.send(Message::ChannelUpdate(update)).await?;
        }
        Ok(())
    }

    /// Sign pending updates, and the closing transaction once the channel
    /// has drained.
    async fn flush_commitments(&mut self) -> Result<(), PeerError> {
        let closing_fee = self.switch.config.closing_fee_satoshis;
        for (_, channel) in self.switch.channels_of(&self.remote) {
            let (signed, closing) = {
                let mut guard = lock(&channel)?;
                let active = matches!(guard.state(), ChannelState::Open | ChannelState::Closing);
                if !active || !guard.is_reestablished() {
                    continue;
                }
                let signed = if guard.needs_signature() {
                    Some(guard.sign_next_commitment().map_err(closed)?)
                } else {
                    None
                };
                let closing = if guard.ready_to_sign_close()
                    && !guard.is_awaiting_revocation()
                    && !guard.needs_signature()
                {
                    Some(guard.sign_closing(closing_fee).map_err(closed)?)
                } else {
                    None
                };
                (signed, closing)
            };
            if let Some(signed) = signed {
                self.send(Message::CommitmentSigned(signed)).await?;
            }
            if let Some(closing) = closing {
                self.send(Message::ClosingSigned(closing)).await?;
            }
        }
        Ok(())
    }

    /// Fail whatever is still queued for this session and unregister it.
    fn teardown(&mut self, reason: &str) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                PeerCommand::AddHtlc { origin, .. } => {
                    self.switch
                        .fail_origin(origin, HtlcResolution::Aborted(reason.to_string()));
                }
                PeerCommand::CloseChannel { reply, .. } => {
                    let _ = reply.send(Err(ChannelError::ProtocolViolation(format!(
                        "peer disconnected: {}",
                        reason
                    ))));
                }
                PeerCommand::FulfillHtlc { channel_id, htlc_id, .. }
                | PeerCommand::FailHtlc { channel_id, htlc_id, .. } => {
                    warn!("Dropping resolution of HTLC {} on {}", htlc_id, channel_id);
                }
                PeerCommand::CheckExpiry { .. } | PeerCommand::AnnouncePolicy | PeerCommand::Disconnect => {}
            }
        }
        self.switch.peer_disconnected(&self.remote, self.session, reason);
        info!("Session closed: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::{node_key, test_config};
    use crate::wallet::InMemoryWallet;
    use crate::wire::Ping;

    fn test_switch() -> Arc<Switch> {
        let (events, _) = mpsc::unbounded_channel();
        Arc::new(Switch::new(
            test_config(),
            node_key(1),
            Arc::new(InMemoryWallet::new()),
            events,
        ))
    }

    async fn write(transport: &mut MemoryTransport, message: Message) {
        transport.send(frame(&message).unwrap()).await.unwrap();
    }

    async fn read(transport: &mut MemoryTransport, decoder: &mut FrameDecoder) -> Message {
        read_message(transport, decoder).await.unwrap()
    }

    fn spawn_peer(switch: &Arc<Switch>, transport: MemoryTransport) -> tokio::task::JoinHandle<Result<(), PeerError>> {
        let remote = crate::test_common::node_id(2);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = switch.register_peer(remote, tx).unwrap();
        let peer = Peer::new(remote, session, transport, Arc::clone(switch), rx);
        tokio::spawn(peer.run())
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_requested_length() {
        let switch = test_switch();
        let (ours, mut theirs) = MemoryTransport::pair();
        let handle = spawn_peer(&switch, ours);
        let mut decoder = FrameDecoder::new();

        assert!(matches!(read(&mut theirs, &mut decoder).await, Message::Init(_)));
        write(
            &mut theirs,
            Message::Init(Init {
                features: Features::local_init(),
                extensions: TlvStream::new(),
            }),
        )
        .await;
        write(
            &mut theirs,
            Message::Ping(Ping {
                num_pong_bytes: 12,
                ignored: vec![],
            }),
        )
        .await;

        match read(&mut theirs, &mut decoder).await {
            Message::Pong(pong) => assert_eq!(pong.ignored.len(), 12),
            other => panic!("expected pong, got {:?}", other),
        }

        drop(theirs);
        assert!(matches!(
            handle.await.unwrap(),
            Err(PeerError::PeerConnectionClosed(_))
        ));
        assert!(!switch.is_connected(&crate::test_common::node_id(2)));
    }

    #[tokio::test]
    async fn test_malformed_gossip_is_skipped() {
        let switch = test_switch();
        let (ours, mut theirs) = MemoryTransport::pair();
        let handle = spawn_peer(&switch, ours);
        let mut decoder = FrameDecoder::new();

        assert!(matches!(read(&mut theirs, &mut decoder).await, Message::Init(_)));
        write(
            &mut theirs,
            Message::Init(Init {
                features: Features::local_init(),
                extensions: TlvStream::new(),
            }),
        )
        .await;
        // A channel_update cut off after four bytes of signature.
        theirs
            .send(bytes::Bytes::from_static(&[0x00, 0x06, 0x01, 0x02, 0xde, 0xad, 0xbe, 0xef]))
            .await
            .unwrap();
        write(
            &mut theirs,
            Message::Ping(Ping {
                num_pong_bytes: 3,
                ignored: vec![],
            }),
        )
        .await;

        match read(&mut theirs, &mut decoder).await {
            Message::Pong(pong) => assert_eq!(pong.ignored.len(), 3),
            other => panic!("expected pong, got {:?}", other),
        }
        assert!(!handle.is_finished());
        assert!(switch.is_connected(&crate::test_common::node_id(2)));
    }

    #[tokio::test]
    async fn test_malformed_channel_message_is_fatal() {
        let switch = test_switch();
        let (ours, mut theirs) = MemoryTransport::pair();
        let handle = spawn_peer(&switch, ours);

        write(
            &mut theirs,
            Message::Init(Init {
                features: Features::local_init(),
                extensions: TlvStream::new(),
            }),
        )
        .await;
        // A commitment_signed with no body.
        theirs
            .send(bytes::Bytes::from_static(&[0x00, 0x02, 0x00, 0x84]))
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PeerError::PeerConnectionClosed(reason)) if reason.contains("Malformed")));
    }

    #[tokio::test]
    async fn test_handshake_requires_init_first() {
        let switch = test_switch();
        let (ours, mut theirs) = MemoryTransport::pair();
        let handle = spawn_peer(&switch, ours);

        write(
            &mut theirs,
            Message::Ping(Ping {
                num_pong_bytes: 0,
                ignored: vec![],
            }),
        )
        .await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PeerError::PeerConnectionClosed(reason)) if reason.contains("expected init")));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let switch = test_switch();
        let (ours, _theirs) = MemoryTransport::pair();
        let handle = spawn_peer(&switch, ours);

        let result = handle.await.unwrap();
        assert_eq!(
            result,
            Err(PeerError::PeerConnectionClosed("handshake timed out".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unknown_channel_is_fatal() {
        let switch = test_switch();
        let (ours, mut theirs) = MemoryTransport::pair();
        let handle = spawn_peer(&switch, ours);

        write(
            &mut theirs,
            Message::Init(Init {
                features: Features::local_init(),
                extensions: TlvStream::new(),
            }),
        )
        .await;
        write(
            &mut theirs,
            Message::UpdateFailHtlc(UpdateFailHtlc {
                channel_id: ChannelId::new([7; 32]),
                id: 0,
                reason: vec![],
            }),
        )
        .await;

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PeerError::PeerConnectionClosed(reason)) if reason.contains("unknown channel")));
    }
}
