// SuperNova Lightning Network - Wallet Collaborator
//
// Boundary to the on-chain wallet: channel persistence and the wallet's
// own receive requests. The in-memory backend keeps channels as JSON, the
// same form a file or database backend would store.

use crate::channel::{ChannelId, ChannelSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown receive request: {0}")]
    UnknownRequest(String),

    #[error("Wallet lock poisoned")]
    LockPoisoned,
}

/// Status of an on-chain receive request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Unpaid,
    Paid,
    Expired,
}

/// An on-chain payment request issued by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainRequest {
    pub address: String,
    pub amount_sat: Option<u64>,
    pub message: String,
    pub timestamp: u64,
    pub status: RequestStatus,
}

impl OnchainRequest {
    /// BIP-21 style URI for the request
    pub fn uri(&self) -> String {
        let mut params = Vec::new();
        if let Some(sat) = self.amount_sat {
            params.push(format!("amount={}.{:08}", sat / 100_000_000, sat % 100_000_000));
        }
        if !self.message.is_empty() {
            params.push(format!("message={}", self.message.replace(' ', "%20")));
        }
        if params.is_empty() {
            format!("bitcoin:{}", self.address)
        } else {
            format!("bitcoin:{}?{}", self.address, params.join("&"))
        }
    }
}

/// Services the lightning engine needs from the wallet
pub trait WalletBackend: Send + Sync {
    fn save_channel(&self, snapshot: &ChannelSnapshot) -> Result<(), WalletError>;

    fn get_receiving_addresses(&self) -> Result<Vec<String>, WalletError>;

    fn receive_requests(&self) -> Result<Vec<OnchainRequest>, WalletError>;

    fn delete_receive_request(&self, address: &str) -> Result<(), WalletError>;
}

#[derive(Debug, Default)]
struct WalletState {
    channels: HashMap<ChannelId, String>,
    addresses: BTreeSet<String>,
    requests: HashMap<String, OnchainRequest>,
}

/// Wallet backend held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryWallet {
    state: Mutex<WalletState>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WalletState>, WalletError> {
        self.state.lock().map_err(|_| WalletError::LockPoisoned)
    }

    pub fn add_receiving_address(&self, address: &str) -> Result<(), WalletError> {
        self.lock()?.addresses.insert(address.to_string());
        Ok(())
    }

    pub fn add_receive_request(&self, request: OnchainRequest) -> Result<(), WalletError> {
        self.lock()?
            .requests
            .insert(request.address.clone(), request);
        Ok(())
    }

    /// Last snapshot saved for a channel.
    pub fn saved_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelSnapshot>, WalletError> {
        let state = self.lock()?;
        state
            .channels
            .get(channel_id)
            .map(|json| {
                serde_json::from_str(json).map_err(|e| WalletError::Serialization(e.to_string()))
            })
            .transpose()
    }

    pub fn saved_channel_count(&self) -> usize {
        self.lock().map(|s| s.channels.len()).unwrap_or(0)
    }
}

impl WalletBackend for InMemoryWallet {
    fn save_channel(&self, snapshot: &ChannelSnapshot) -> Result<(), WalletError> {
        let json =
            serde_json::to_string(snapshot).map_err(|e| WalletError::Serialization(e.to_string()))?;
        self.lock()?.channels.insert(snapshot.channel_id, json);
        debug!("Saved channel {}", snapshot.channel_id);
        Ok(())
    }

    fn get_receiving_addresses(&self) -> Result<Vec<String>, WalletError> {
        Ok(self.lock()?.addresses.iter().cloned().collect())
    }

    fn receive_requests(&self) -> Result<Vec<OnchainRequest>, WalletError> {
        Ok(self.lock()?.requests.values().cloned().collect())
    }

    fn delete_receive_request(&self, address: &str) -> Result<(), WalletError> {
        self.lock()?
            .requests
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| WalletError::UnknownRequest(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::open_channel_pair;

    #[test]
    fn test_saved_channel_round_trips() {
        let wallet = InMemoryWallet::new();
        let (channel, _) = open_channel_pair(10_000, 5_000);
        wallet.save_channel(&channel.snapshot()).unwrap();

        let saved = wallet.saved_channel(&channel.id()).unwrap().unwrap();
        assert_eq!(saved, channel.snapshot());
        assert_eq!(wallet.saved_channel_count(), 1);
    }

    #[test]
    fn test_delete_receive_request() {
        let wallet = InMemoryWallet::new();
        wallet
            .add_receive_request(OnchainRequest {
                address: "sn1qexample".to_string(),
                amount_sat: Some(150_000_000),
                message: "rent".to_string(),
                timestamp: 1,
                status: RequestStatus::Unpaid,
            })
            .unwrap();
        assert_eq!(
            wallet.receive_requests().unwrap()[0].uri(),
            "bitcoin:sn1qexample?amount=1.50000000&message=rent"
        );
        wallet.delete_receive_request("sn1qexample").unwrap();
        assert!(wallet.delete_receive_request("sn1qexample").is_err());
    }
}
