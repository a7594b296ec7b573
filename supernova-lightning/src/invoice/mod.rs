// SuperNova Lightning Network - Invoice Implementation
//
// Payment requests as checksummed, signed bech32 strings. Decoding is
// purely local: the payee key is recovered from the signature itself.

mod codec;
pub mod database;

pub use database::{InvoiceDatabase, InvoiceRecord, InvoiceState};

use crate::channel::ShortChannelId;
use crate::payment::PaymentHash;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default invoice lifetime in seconds
pub const DEFAULT_EXPIRY_SECS: u64 = 3600;

/// Default min_final_cltv_expiry in blocks
pub const DEFAULT_MIN_FINAL_CLTV_EXPIRY: u32 = 18;

/// Error types for invoice operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvoiceError {
    #[error("Invalid invoice checksum")]
    InvalidChecksum,

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Unsupported prefix: {0}")]
    UnsupportedPrefix(String),

    #[error("Invalid invoice format: {0}")]
    InvalidFormat(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Field too long: {0}")]
    FieldTooLong(String),

    #[error("Invoice for payment hash {0} already exists")]
    Duplicate(String),

    #[error("Unknown invoice: {0}")]
    NotFound(String),
}

/// Network an invoice is valid on, encoded in the human-readable prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Bitcoin,
    Testnet,
    Regtest,
    Signet,
    Supernova,
}

impl Currency {
    /// Longest prefixes first so `bcrt` is not read as `bc`.
    const ALL: [Currency; 5] = [
        Currency::Regtest,
        Currency::Bitcoin,
        Currency::Signet,
        Currency::Testnet,
        Currency::Supernova,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Currency::Bitcoin => "bc",
            Currency::Testnet => "tb",
            Currency::Regtest => "bcrt",
            Currency::Signet => "tbs",
            Currency::Supernova => "sb",
        }
    }

    /// Split a currency prefix off the part of the HRP after `ln`. The
    /// remainder must be empty or start with an amount digit.
    fn split(rest: &str) -> Option<(Currency, &str)> {
        Self::ALL.iter().find_map(|currency| {
            let tail = rest.strip_prefix(currency.prefix())?;
            match tail.chars().next() {
                None => Some((*currency, tail)),
                Some(c) if c.is_ascii_digit() => Some((*currency, tail)),
                Some(_) => None,
            }
        })
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// One hop of a private route leading to the payee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHintHop {
    /// Node at the start of the channel
    pub node_id: PublicKey,
    pub short_channel_id: ShortChannelId,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// Route hint for private channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHint(pub Vec<RouteHintHop>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceDescription {
    Direct(String),
    Hash([u8; 32]),
}

/// A decoded payment request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub currency: Currency,
    pub amount_msat: Option<u64>,
    /// Creation time, seconds since the epoch
    pub timestamp: u64,
    pub payment_hash: PaymentHash,
    pub payment_secret: Option<[u8; 32]>,
    pub description: InvoiceDescription,
    pub payee: PublicKey,
    /// Lifetime in seconds
    pub expiry: u64,
    pub min_final_cltv_expiry: u32,
    pub route_hints: Vec<RouteHint>,
}

impl Invoice {
    pub fn new(
        currency: Currency,
        payment_hash: PaymentHash,
        amount_msat: Option<u64>,
        description: &str,
        payee: PublicKey,
        timestamp: u64,
    ) -> Self {
        Self {
            currency,
            amount_msat,
            timestamp,
            payment_hash,
            payment_secret: None,
            description: InvoiceDescription::Direct(description.to_string()),
            payee,
            expiry: DEFAULT_EXPIRY_SECS,
            min_final_cltv_expiry: DEFAULT_MIN_FINAL_CLTV_EXPIRY,
            route_hints: Vec::new(),
        }
    }

    /// Serialize and sign with the payee's node key.
    pub fn encode(&self, signing_key: &SecretKey) -> Result<String, InvoiceError> {
        codec::encode(self, signing_key)
    }

    /// Parse, verify the checksum and check the signature.
    pub fn decode(s: &str) -> Result<Invoice, InvoiceError> {
        codec::decode(s)
    }

    pub fn expires_at(&self) -> u64 {
        self.timestamp.saturating_add(self.expiry)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at()
    }

    pub fn description_text(&self) -> Option<&str> {
        match &self.description {
            InvoiceDescription::Direct(text) => Some(text),
            InvoiceDescription::Hash(_) => None,
        }
    }
}

/// Seconds since the Unix epoch
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
