// SuperNova Lightning Network
// Payment-channel protocol engine: wire codec, invoices, channel state
// machine, peer sessions, channel graph, path finding and payments.

pub mod channel;
pub mod config;
pub mod digest;
pub mod graph;
pub mod invoice;
pub mod logging;
pub mod manager;
pub mod payment;
pub mod peer;
pub mod requests;
pub mod router;
pub mod wallet;
pub mod wire;

mod switch;

#[cfg(test)]
mod test_common;

pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelId, ChannelParams, ChannelSnapshot, ChannelState,
    Htlc, HtlcDirection, ShortChannelId,
};
pub use config::{ConfigValidationError, LightningConfig};
pub use graph::{ChannelPolicy, GraphError, NetworkGraph, NodeId};
pub use invoice::{Currency, Invoice, InvoiceError, RouteHint, RouteHintHop};
pub use logging::init_logging;
pub use manager::{ChannelBalance, ChannelSummary, LightningEvent, LightningManager, ManagerError};
pub use payment::{FailureCode, FailureReason, PaymentHash, PaymentPreimage};
pub use peer::{MemoryTransport, PeerError, StreamTransport, Transport, TransportError};
pub use requests::{PaymentRequestView, RequestKind};
pub use router::{PathFinder, Route, RouteHop, RoutingError};
pub use wallet::{InMemoryWallet, OnchainRequest, RequestStatus, WalletBackend, WalletError};
pub use wire::{Message, WireError};

use thiserror::Error;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Any error raised by the engine
#[derive(Debug, Error)]
pub enum LightningError {
    #[error("Wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("Invoice error: {0}")]
    Invoice(#[from] InvoiceError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),
}
