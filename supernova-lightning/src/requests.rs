// SuperNova Lightning Network - Payment Request Listing
//
// Read-only view over the wallet's on-chain receive requests and the
// invoices issued by this node, for presentation layers.

use crate::invoice::{now_secs, Invoice, InvoiceDatabase, InvoiceState};
use crate::manager::ManagerError;
use crate::payment::PaymentHash;
use crate::wallet::{RequestStatus, WalletBackend};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Lightning,
    Onchain,
}

/// One row of the request list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequestView {
    pub kind: RequestKind,
    /// Payment hash in hex, or the receiving address
    pub key: String,
    pub invoice_or_uri: String,
    pub amount_msat: Option<u64>,
    pub description: String,
    pub timestamp: u64,
    pub status: RequestStatus,
}

fn invoice_status(state: InvoiceState, invoice: &Invoice, now: u64) -> Option<RequestStatus> {
    match state {
        InvoiceState::Open if invoice.is_expired(now) => Some(RequestStatus::Expired),
        InvoiceState::Open => Some(RequestStatus::Unpaid),
        InvoiceState::Paid => Some(RequestStatus::Paid),
        InvoiceState::Expired => Some(RequestStatus::Expired),
        InvoiceState::Canceled => None,
    }
}

/// On-chain requests for our own addresses plus issued invoices, oldest first.
pub fn list_requests(
    wallet: &dyn WalletBackend,
    invoices: &InvoiceDatabase,
) -> Result<Vec<PaymentRequestView>, ManagerError> {
    let domain: HashSet<String> = wallet.get_receiving_addresses()?.into_iter().collect();
    let now = now_secs();

    let mut views: Vec<PaymentRequestView> = wallet
        .receive_requests()?
        .into_iter()
        .filter(|request| domain.contains(&request.address))
        .map(|request| PaymentRequestView {
            kind: RequestKind::Onchain,
            invoice_or_uri: request.uri(),
            amount_msat: request.amount_sat.map(|sat| sat.saturating_mul(1_000)),
            description: request.message.clone(),
            timestamp: request.timestamp,
            status: request.status,
            key: request.address,
        })
        .collect();

    for record in invoices.all() {
        // Shown as the payer would see it.
        let invoice = match Invoice::decode(&record.encoded) {
            Ok(invoice) => invoice,
            Err(e) => {
                warn!("Skipping undecodable invoice {}: {}", record.payment_hash(), e);
                continue;
            }
        };
        let Some(status) = invoice_status(record.state, &invoice, now) else {
            continue;
        };
        views.push(PaymentRequestView {
            kind: RequestKind::Lightning,
            key: invoice.payment_hash.to_hex(),
            invoice_or_uri: record.encoded.clone(),
            amount_msat: invoice.amount_msat,
            description: invoice.description_text().unwrap_or_default().to_string(),
            timestamp: invoice.timestamp,
            status,
        });
    }

    views.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
    Ok(views)
}

/// Remove the request identified by `key`. Returns false if nothing matched.
pub fn delete_request(
    wallet: &dyn WalletBackend,
    invoices: &mut InvoiceDatabase,
    key: &str,
) -> Result<bool, ManagerError> {
    if let Ok(payment_hash) = PaymentHash::from_hex(key) {
        if invoices.remove(&payment_hash).is_some() {
            return Ok(true);
        }
    }
    let known = wallet.receive_requests()?.iter().any(|r| r.address == key);
    if !known {
        return Ok(false);
    }
    wallet.delete_receive_request(key)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::Currency;
    use crate::payment::PaymentPreimage;
    use crate::test_common::{node_key, node_pubkey};
    use crate::wallet::{InMemoryWallet, OnchainRequest};

    fn onchain(address: &str, timestamp: u64) -> OnchainRequest {
        OnchainRequest {
            address: address.to_string(),
            amount_sat: Some(2),
            message: "deposit".to_string(),
            timestamp,
            status: RequestStatus::Unpaid,
        }
    }

    fn add_invoice(db: &mut InvoiceDatabase, timestamp: u64) -> PaymentHash {
        let preimage = PaymentPreimage::new_random();
        let invoice = Invoice::new(
            Currency::Supernova,
            preimage.payment_hash(),
            Some(7_000),
            "book",
            node_pubkey(1),
            timestamp,
        );
        let encoded = invoice.encode(&node_key(1)).unwrap();
        db.add(invoice, encoded, preimage).unwrap();
        preimage.payment_hash()
    }

    #[test]
    fn test_list_merges_and_sorts() {
        let wallet = InMemoryWallet::new();
        wallet.add_receiving_address("sn1qours").unwrap();
        wallet.add_receive_request(onchain("sn1qours", 300)).unwrap();
        wallet.add_receive_request(onchain("sn1qforeign", 100)).unwrap();

        let mut db = InvoiceDatabase::new();
        let hash = add_invoice(&mut db, 200);

        let views = list_requests(&wallet, &db).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].kind, RequestKind::Lightning);
        assert_eq!(views[0].key, hash.to_hex());
        assert_eq!(views[0].description, "book");
        assert_eq!(views[0].amount_msat, Some(7_000));
        assert_eq!(views[1].key, "sn1qours");
        assert_eq!(views[1].amount_msat, Some(2_000));
    }

    #[test]
    fn test_delete_by_hash_or_address() {
        let wallet = InMemoryWallet::new();
        wallet.add_receiving_address("sn1qours").unwrap();
        wallet.add_receive_request(onchain("sn1qours", 1)).unwrap();
        let mut db = InvoiceDatabase::new();
        let hash = add_invoice(&mut db, 2);

        assert!(delete_request(&wallet, &mut db, &hash.to_hex()).unwrap());
        assert!(db.is_empty());
        assert!(delete_request(&wallet, &mut db, "sn1qours").unwrap());
        assert!(!delete_request(&wallet, &mut db, "sn1qours").unwrap());
        assert!(list_requests(&wallet, &db).unwrap().is_empty());
    }
}
