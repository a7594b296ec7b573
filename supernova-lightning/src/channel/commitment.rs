// SuperNova Lightning Network - Commitment Signatures
//
// A commitment is summarised by a digest over the channel id, its number,
// the balance split and the HTLC set, always from the perspective of the
// party that holds the commitment. Each side signs the other's digest with
// its funding key.

use super::{ChannelId, HtlcDirection, HtlcSummary};
use crate::digest::{sha256, Hash32};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, Secp256k1, SecretKey, Signing, Verification};

/// View of a commitment as seen by its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentView {
    pub channel_id: ChannelId,
    pub commitment_number: u64,
    pub holder_balance_msat: u64,
    pub counterparty_balance_msat: u64,
    /// HTLCs with `direction` relative to the holder.
    pub htlcs: Vec<HtlcSummary>,
}

impl CommitmentView {
    pub fn digest(&self) -> Hash32 {
        let mut htlcs = self.htlcs.clone();
        htlcs.sort_by_key(|h| (h.direction == HtlcDirection::Received, h.id));

        let mut data = Vec::with_capacity(32 + 8 * 3 + htlcs.len() * 53);
        data.extend_from_slice(b"supernova-ln-commitment");
        data.extend_from_slice(self.channel_id.as_bytes());
        data.extend_from_slice(&self.commitment_number.to_be_bytes());
        data.extend_from_slice(&self.holder_balance_msat.to_be_bytes());
        data.extend_from_slice(&self.counterparty_balance_msat.to_be_bytes());
        for htlc in &htlcs {
            data.push(match htlc.direction {
                HtlcDirection::Offered => 0,
                HtlcDirection::Received => 1,
            });
            data.extend_from_slice(&htlc.id.to_be_bytes());
            data.extend_from_slice(&htlc.amount_msat.to_be_bytes());
            data.extend_from_slice(htlc.payment_hash.as_bytes());
            data.extend_from_slice(&htlc.cltv_expiry.to_be_bytes());
        }
        sha256(&data)
    }

    pub fn sign<C: Signing>(&self, secp: &Secp256k1<C>, funding_key: &SecretKey) -> Signature {
        secp.sign_ecdsa(&self.digest().to_message(), funding_key)
    }

    pub fn verify<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        signature: &Signature,
        funding_pubkey: &PublicKey,
    ) -> bool {
        secp.verify_ecdsa(&self.digest().to_message(), signature, funding_pubkey)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::PaymentHash;

    fn view(holder: u64, counterparty: u64) -> CommitmentView {
        CommitmentView {
            channel_id: ChannelId::new([1u8; 32]),
            commitment_number: 3,
            holder_balance_msat: holder,
            counterparty_balance_msat: counterparty,
            htlcs: vec![HtlcSummary {
                id: 0,
                direction: HtlcDirection::Offered,
                amount_msat: 10,
                payment_hash: PaymentHash::new([2u8; 32]),
                cltv_expiry: 144,
            }],
        }
    }

    #[test]
    fn test_signature_binds_balances() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key);

        let signed = view(100, 200);
        let signature = signed.sign(&secp, &key);
        assert!(signed.verify(&secp, &signature, &pubkey));
        assert!(!view(200, 100).verify(&secp, &signature, &pubkey));
    }

    #[test]
    fn test_htlc_order_does_not_matter() {
        let mut a = view(1, 2);
        a.htlcs.push(HtlcSummary {
            id: 5,
            direction: HtlcDirection::Received,
            amount_msat: 3,
            payment_hash: PaymentHash::new([4u8; 32]),
            cltv_expiry: 10,
        });
        let mut b = a.clone();
        b.htlcs.reverse();
        assert_eq!(a.digest(), b.digest());
    }
}
