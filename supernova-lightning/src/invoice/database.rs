// SuperNova Lightning Network - Invoice Database
//
// Invoices issued by this node, keyed by payment hash, together with the
// preimage that settles them.

use super::{Invoice, InvoiceError};
use crate::payment::{PaymentHash, PaymentPreimage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Lifecycle of an issued invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceState {
    /// Waiting for payment
    Open,
    /// Settled
    Paid,
    /// Lifetime elapsed before payment
    Expired,
    /// Withdrawn by the payee
    Canceled,
}

/// An issued invoice and its settlement material
#[derive(Debug, Clone)]
pub struct InvoiceRecord {
    pub invoice: Invoice,
    /// Signed bech32 form handed to the payer
    pub encoded: String,
    pub preimage: PaymentPreimage,
    pub state: InvoiceState,
    pub amount_received_msat: Option<u64>,
    pub settled_at: Option<u64>,
}

impl InvoiceRecord {
    pub fn payment_hash(&self) -> PaymentHash {
        self.invoice.payment_hash
    }
}

/// Invoices by payment hash
#[derive(Debug, Default)]
pub struct InvoiceDatabase {
    invoices: HashMap<PaymentHash, InvoiceRecord>,
}

impl InvoiceDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an invoice. The preimage must hash to the invoice's payment hash.
    pub fn add(
        &mut self,
        invoice: Invoice,
        encoded: String,
        preimage: PaymentPreimage,
    ) -> Result<(), InvoiceError> {
        let payment_hash = invoice.payment_hash;
        if self.invoices.contains_key(&payment_hash) {
            return Err(InvoiceError::Duplicate(payment_hash.to_hex()));
        }
        if !preimage.matches(&payment_hash) {
            return Err(InvoiceError::InvalidFormat(
                "preimage does not match payment hash".to_string(),
            ));
        }

        debug!("Stored invoice {}", payment_hash);
        self.invoices.insert(
            payment_hash,
            InvoiceRecord {
                invoice,
                encoded,
                preimage,
                state: InvoiceState::Open,
                amount_received_msat: None,
                settled_at: None,
            },
        );
        Ok(())
    }

    pub fn get(&self, payment_hash: &PaymentHash) -> Option<&InvoiceRecord> {
        self.invoices.get(payment_hash)
    }

    /// Mark an open invoice as paid. Returns `false` if it was already paid.
    pub fn mark_paid(
        &mut self,
        payment_hash: &PaymentHash,
        amount_msat: u64,
        now: u64,
    ) -> Result<bool, InvoiceError> {
        let record = self
            .invoices
            .get_mut(payment_hash)
            .ok_or_else(|| InvoiceError::NotFound(payment_hash.to_hex()))?;

        match record.state {
            InvoiceState::Paid => Ok(false),
            InvoiceState::Open => {
                record.state = InvoiceState::Paid;
                record.amount_received_msat = Some(amount_msat);
                record.settled_at = Some(now);
                Ok(true)
            }
            other => Err(InvoiceError::InvalidFormat(format!(
                "invoice {} is {:?}",
                payment_hash, other
            ))),
        }
    }

    pub fn cancel(&mut self, payment_hash: &PaymentHash) -> Result<(), InvoiceError> {
        let record = self
            .invoices
            .get_mut(payment_hash)
            .ok_or_else(|| InvoiceError::NotFound(payment_hash.to_hex()))?;
        if record.state == InvoiceState::Open {
            record.state = InvoiceState::Canceled;
        }
        Ok(())
    }

    pub fn remove(&mut self, payment_hash: &PaymentHash) -> Option<InvoiceRecord> {
        self.invoices.remove(payment_hash)
    }

    pub fn all(&self) -> impl Iterator<Item = &InvoiceRecord> {
        self.invoices.values()
    }

    pub fn len(&self) -> usize {
        self.invoices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }

    /// Move open invoices past their lifetime to `Expired`; returns how many changed.
    pub fn expire_old_invoices(&mut self, now: u64) -> usize {
        let mut expired = 0;
        for record in self.invoices.values_mut() {
            if record.state == InvoiceState::Open && record.invoice.is_expired(now) {
                record.state = InvoiceState::Expired;
                expired += 1;
            }
        }
        expired
    }
}
