use std::collections::HashMap;

use proptest::prelude::*;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

use supernova_lightning::{
    Channel, ChannelConfig, ChannelError, ChannelParams, ChannelState, FailureReason,
    HtlcDirection, PaymentHash, PaymentPreimage, ShortChannelId,
};

const CAPACITY_MSAT: u64 = 200_000;

fn node(byte: u8) -> PublicKey {
    let key = SecretKey::from_slice(&[byte; 32]).expect("valid key");
    PublicKey::from_secret_key(&Secp256k1::new(), &key)
}

fn open_channel(local_msat: u64) -> Channel {
    let (params, _) = ChannelParams::new_pair(
        [7u8; 32],
        0,
        ShortChannelId::new(500, 1, 0),
        (node(1), local_msat),
        (node(2), CAPACITY_MSAT - local_msat),
        ChannelConfig::default(),
    );
    let mut channel = Channel::new(params).expect("Failed to create channel");
    channel.set_state(ChannelState::Open).expect("Failed to open channel");
    channel
}

fn assert_conserved(channel: &Channel) {
    assert_eq!(
        channel.local_balance_msat()
            + channel.remote_balance_msat()
            + channel.pending_htlc_total_msat(),
        channel.capacity_msat()
    );
}

#[derive(Debug, Clone)]
enum Op {
    Add { amount_msat: u64, offered: bool, secret: u8 },
    Fulfill(usize),
    Fail(usize),
    WrongPreimage(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..120_000, any::<bool>(), any::<u8>()).prop_map(|(amount_msat, offered, secret)| {
            Op::Add { amount_msat, offered, secret }
        }),
        any::<usize>().prop_map(Op::Fulfill),
        any::<usize>().prop_map(Op::Fail),
        any::<usize>().prop_map(Op::WrongPreimage),
    ]
}

fn pick(channel: &Channel, index: usize) -> Option<(HtlcDirection, u64, PaymentHash)> {
    let pending: Vec<_> = channel
        .pending_htlcs()
        .map(|h| (h.direction, h.id, h.payment_hash))
        .collect();
    if pending.is_empty() {
        None
    } else {
        Some(pending[index % pending.len()])
    }
}

proptest! {
    #[test]
    fn test_balances_always_sum_to_capacity(
        local_msat in 1u64..CAPACITY_MSAT,
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let mut channel = open_channel(local_msat);
        let mut preimages: HashMap<PaymentHash, PaymentPreimage> = HashMap::new();
        assert_conserved(&channel);

        for op in ops {
            let before = channel.snapshot();
            let result: Result<(), ChannelError> = match op {
                Op::Add { amount_msat, offered, secret } => {
                    let preimage = PaymentPreimage::new([secret; 32]);
                    preimages.insert(preimage.payment_hash(), preimage);
                    let direction = if offered {
                        HtlcDirection::Offered
                    } else {
                        HtlcDirection::Received
                    };
                    channel
                        .add_htlc(amount_msat, preimage.payment_hash(), 600, direction)
                        .map(|_| ())
                }
                Op::Fulfill(index) => match pick(&channel, index) {
                    Some((direction, id, hash)) => channel
                        .fulfill_htlc(direction, id, preimages[&hash])
                        .map(|_| ()),
                    None => continue,
                },
                Op::Fail(index) => match pick(&channel, index) {
                    Some((direction, id, _)) => channel
                        .fail_htlc(direction, id, &FailureReason::Unspecified)
                        .map(|_| ()),
                    None => continue,
                },
                Op::WrongPreimage(index) => match pick(&channel, index) {
                    Some((direction, id, hash)) => {
                        let mut wrong = preimages[&hash].into_inner();
                        wrong[0] ^= 0xff;
                        let result = channel
                            .fulfill_htlc(direction, id, PaymentPreimage::new(wrong))
                            .map(|_| ());
                        prop_assert_eq!(result.clone(), Err(ChannelError::PreimageMismatch(id)));
                        result
                    }
                    None => continue,
                },
            };

            if result.is_err() {
                prop_assert_eq!(channel.snapshot(), before);
            }
            assert_conserved(&channel);
        }
    }
}

#[test]
fn test_offered_fulfill_moves_funds_to_remote() {
    let mut channel = open_channel(150_000);
    let preimage = PaymentPreimage::new([3u8; 32]);

    let id = channel
        .add_htlc(40_000, preimage.payment_hash(), 600, HtlcDirection::Offered)
        .unwrap();
    assert_eq!(channel.local_balance_msat(), 110_000);
    assert_eq!(channel.pending_htlc_total_msat(), 40_000);
    assert_conserved(&channel);

    channel.fulfill_htlc(HtlcDirection::Offered, id, preimage).unwrap();
    assert_eq!(channel.local_balance_msat(), 110_000);
    assert_eq!(channel.remote_balance_msat(), 90_000);
    assert_eq!(channel.pending_htlc_total_msat(), 0);
}

#[test]
fn test_failed_htlc_refunds_payer() {
    let mut channel = open_channel(150_000);
    let hash = PaymentPreimage::new([5u8; 32]).payment_hash();

    let id = channel
        .add_htlc(30_000, hash, 600, HtlcDirection::Received)
        .unwrap();
    assert_eq!(channel.remote_balance_msat(), 20_000);
    channel
        .fail_htlc(HtlcDirection::Received, id, &FailureReason::Unspecified)
        .unwrap();
    assert_eq!(channel.remote_balance_msat(), 50_000);
    assert_eq!(channel.local_balance_msat(), 150_000);
}

#[test]
fn test_overdraft_is_rejected_without_change() {
    let mut channel = open_channel(10_000);
    let before = channel.snapshot();
    let hash = PaymentPreimage::new([1u8; 32]).payment_hash();

    let result = channel.add_htlc(10_001, hash, 600, HtlcDirection::Offered);
    assert_eq!(
        result,
        Err(ChannelError::InsufficientBalance {
            required: 10_001,
            available: 10_000,
        })
    );
    assert_eq!(channel.snapshot(), before);
}
