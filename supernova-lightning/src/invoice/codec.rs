// SuperNova Lightning Network - Invoice Codec
//
// BOLT-11 layout: `ln` + currency + amount as the human-readable part,
// then a 35-bit timestamp, tagged fields and a 65-byte recoverable
// signature, all in 5-bit groups under a bech32 checksum.

use super::{
    Currency, Invoice, InvoiceDescription, InvoiceError, RouteHint, RouteHintHop,
    DEFAULT_EXPIRY_SECS, DEFAULT_MIN_FINAL_CLTV_EXPIRY,
};
use crate::channel::ShortChannelId;
use crate::digest::{sha256, Hash32};
use crate::payment::PaymentHash;
use bech32::{u5, FromBase32, ToBase32, Variant};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

const TAG_PAYMENT_HASH: u8 = 1;
const TAG_ROUTE_HINT: u8 = 3;
const TAG_EXPIRY: u8 = 6;
const TAG_DESCRIPTION: u8 = 13;
const TAG_PAYMENT_SECRET: u8 = 16;
const TAG_PAYEE: u8 = 19;
const TAG_DESCRIPTION_HASH: u8 = 23;
const TAG_MIN_FINAL_CLTV: u8 = 24;

const TIMESTAMP_LEN: usize = 7;
const SIGNATURE_LEN: usize = 104;
const MAX_FIELD_LEN: usize = 1023;
const HASH_FIELD_LEN: usize = 52;
const PUBKEY_FIELD_LEN: usize = 53;
const ROUTE_HOP_LEN: usize = 51;

/// Amount multipliers as pico-units per unit, largest first.
const MULTIPLIERS: [(&str, u128); 5] = [
    ("", 1_000_000_000_000),
    ("m", 1_000_000_000),
    ("u", 1_000_000),
    ("n", 1_000),
    ("p", 1),
];

fn to_u5(value: u8) -> Result<u5, InvoiceError> {
    u5::try_from_u8(value).map_err(|e| InvoiceError::InvalidFormat(e.to_string()))
}

fn int_to_u5s(mut value: u64) -> Result<Vec<u5>, InvoiceError> {
    let mut out = Vec::new();
    while value > 0 {
        out.push(to_u5((value & 31) as u8)?);
        value >>= 5;
    }
    out.reverse();
    Ok(out)
}

fn int_from_u5s(data: &[u5]) -> Result<u64, InvoiceError> {
    if data.len() > 12 {
        return Err(InvoiceError::InvalidFormat(format!(
            "integer field of {} groups",
            data.len()
        )));
    }
    Ok(data
        .iter()
        .fold(0u64, |acc, v| (acc << 5) | u64::from(v.to_u8())))
}

fn push_field(out: &mut Vec<u5>, tag: u8, data: &[u5]) -> Result<(), InvoiceError> {
    if data.len() > MAX_FIELD_LEN {
        return Err(InvoiceError::FieldTooLong(format!(
            "tag {} carries {} groups",
            tag,
            data.len()
        )));
    }
    out.push(to_u5(tag)?);
    out.push(to_u5((data.len() >> 5) as u8)?);
    out.push(to_u5((data.len() & 31) as u8)?);
    out.extend_from_slice(data);
    Ok(())
}

fn bytes_from_u5s(data: &[u5]) -> Result<Vec<u8>, InvoiceError> {
    Vec::<u8>::from_base32(data).map_err(|e| InvoiceError::InvalidFormat(e.to_string()))
}

fn encode_amount(amount_msat: u64) -> Result<String, InvoiceError> {
    if amount_msat == 0 {
        return Err(InvoiceError::InvalidAmount("zero amount".to_string()));
    }
    let pico = u128::from(amount_msat) * 10;
    MULTIPLIERS
        .iter()
        .find(|(_, per_unit)| pico % per_unit == 0)
        .map(|(suffix, per_unit)| format!("{}{}", pico / per_unit, suffix))
        .ok_or_else(|| InvoiceError::InvalidAmount(amount_msat.to_string()))
}

fn decode_amount(text: &str) -> Result<Option<u64>, InvoiceError> {
    if text.is_empty() {
        return Ok(None);
    }
    let (digits, per_unit) = match MULTIPLIERS[1..]
        .iter()
        .find(|(suffix, _)| text.ends_with(suffix))
    {
        Some((suffix, per_unit)) => (&text[..text.len() - suffix.len()], *per_unit),
        None => (text, MULTIPLIERS[0].1),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
        return Err(InvoiceError::InvalidAmount(text.to_string()));
    }
    let value: u128 = digits
        .parse()
        .map_err(|_| InvoiceError::InvalidAmount(text.to_string()))?;
    let pico = value
        .checked_mul(per_unit)
        .ok_or_else(|| InvoiceError::InvalidAmount(text.to_string()))?;
    if pico % 10 != 0 {
        return Err(InvoiceError::InvalidAmount(format!(
            "{} is not a whole number of millisatoshis",
            text
        )));
    }
    u64::try_from(pico / 10)
        .map(Some)
        .map_err(|_| InvoiceError::InvalidAmount(text.to_string()))
}

fn signing_hash(hrp: &str, body: &[u5]) -> Result<Hash32, InvoiceError> {
    let mut preimage = hrp.as_bytes().to_vec();
    let packed = bech32::convert_bits(body, 5, 8, true)
        .map_err(|e| InvoiceError::InvalidFormat(e.to_string()))?;
    preimage.extend_from_slice(&packed);
    Ok(sha256(&preimage))
}

fn encode_route_hint(hint: &RouteHint) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(hint.0.len() * ROUTE_HOP_LEN);
    for hop in &hint.0 {
        bytes.extend_from_slice(&hop.node_id.serialize());
        bytes.extend_from_slice(&hop.short_channel_id.to_u64().to_be_bytes());
        bytes.extend_from_slice(&hop.fee_base_msat.to_be_bytes());
        bytes.extend_from_slice(&hop.fee_proportional_millionths.to_be_bytes());
        bytes.extend_from_slice(&hop.cltv_expiry_delta.to_be_bytes());
    }
    bytes
}

fn decode_route_hint(bytes: &[u8]) -> Result<RouteHint, InvoiceError> {
    if bytes.is_empty() || bytes.len() % ROUTE_HOP_LEN != 0 {
        return Err(InvoiceError::InvalidFormat(format!(
            "route hint of {} bytes",
            bytes.len()
        )));
    }
    let mut hops = Vec::with_capacity(bytes.len() / ROUTE_HOP_LEN);
    for chunk in bytes.chunks(ROUTE_HOP_LEN) {
        let node_id = PublicKey::from_slice(&chunk[0..33])
            .map_err(|e| InvoiceError::InvalidFormat(format!("route hint node: {}", e)))?;
        let mut scid = [0u8; 8];
        scid.copy_from_slice(&chunk[33..41]);
        hops.push(RouteHintHop {
            node_id,
            short_channel_id: ShortChannelId::from_u64(u64::from_be_bytes(scid)),
            fee_base_msat: u32::from_be_bytes([chunk[41], chunk[42], chunk[43], chunk[44]]),
            fee_proportional_millionths: u32::from_be_bytes([
                chunk[45], chunk[46], chunk[47], chunk[48],
            ]),
            cltv_expiry_delta: u16::from_be_bytes([chunk[49], chunk[50]]),
        });
    }
    Ok(RouteHint(hops))
}

pub(super) fn encode(invoice: &Invoice, signing_key: &SecretKey) -> Result<String, InvoiceError> {
    let secp = Secp256k1::new();
    if PublicKey::from_secret_key(&secp, signing_key) != invoice.payee {
        return Err(InvoiceError::InvalidSignature(
            "signing key does not belong to the payee".to_string(),
        ));
    }

    let amount = match invoice.amount_msat {
        Some(msat) => encode_amount(msat)?,
        None => String::new(),
    };
    let hrp = format!("ln{}{}", invoice.currency.prefix(), amount);

    if invoice.timestamp >= 1 << 35 {
        return Err(InvoiceError::InvalidFormat("timestamp exceeds 35 bits".to_string()));
    }
    let mut data = int_to_u5s(invoice.timestamp)?;
    let mut padded = vec![to_u5(0)?; TIMESTAMP_LEN - data.len()];
    padded.append(&mut data);
    let mut data = padded;

    push_field(&mut data, TAG_PAYMENT_HASH, &invoice.payment_hash.as_bytes().to_base32())?;
    if let Some(secret) = &invoice.payment_secret {
        push_field(&mut data, TAG_PAYMENT_SECRET, &secret.to_base32())?;
    }
    match &invoice.description {
        InvoiceDescription::Direct(text) => {
            push_field(&mut data, TAG_DESCRIPTION, &text.as_bytes().to_base32())?
        }
        InvoiceDescription::Hash(hash) => {
            push_field(&mut data, TAG_DESCRIPTION_HASH, &hash.to_base32())?
        }
    }
    push_field(&mut data, TAG_PAYEE, &invoice.payee.serialize().to_base32())?;
    push_field(&mut data, TAG_EXPIRY, &int_to_u5s(invoice.expiry)?)?;
    push_field(
        &mut data,
        TAG_MIN_FINAL_CLTV,
        &int_to_u5s(u64::from(invoice.min_final_cltv_expiry))?,
    )?;
    for hint in &invoice.route_hints {
        push_field(&mut data, TAG_ROUTE_HINT, &encode_route_hint(hint).to_base32())?;
    }

    let digest = signing_hash(&hrp, &data)?;
    let (recovery_id, compact) = secp
        .sign_ecdsa_recoverable(&digest.to_message(), signing_key)
        .serialize_compact();
    let mut signature = compact.to_vec();
    signature.push(recovery_id.to_i32() as u8);
    data.extend_from_slice(&signature.to_base32());

    bech32::encode(&hrp, data, Variant::Bech32).map_err(|e| InvoiceError::InvalidFormat(e.to_string()))
}

pub(super) fn decode(s: &str) -> Result<Invoice, InvoiceError> {
    let (hrp, data, variant) = bech32::decode(s).map_err(|e| match e {
        bech32::Error::InvalidChecksum => InvoiceError::InvalidChecksum,
        other => InvoiceError::InvalidFormat(other.to_string()),
    })?;
    if variant != Variant::Bech32 {
        return Err(InvoiceError::InvalidChecksum);
    }

    let rest = hrp
        .strip_prefix("ln")
        .ok_or_else(|| InvoiceError::UnsupportedPrefix(hrp.clone()))?;
    let (currency, amount_text) =
        Currency::split(rest).ok_or_else(|| InvoiceError::UnsupportedPrefix(hrp.clone()))?;
    let amount_msat = decode_amount(amount_text)?;

    if data.len() < TIMESTAMP_LEN + SIGNATURE_LEN {
        return Err(InvoiceError::InvalidFormat("data part too short".to_string()));
    }
    let (body, signature) = data.split_at(data.len() - SIGNATURE_LEN);
    let timestamp = int_from_u5s(&body[..TIMESTAMP_LEN])?;

    let mut payment_hash = None;
    let mut payment_secret = None;
    let mut description = None;
    let mut payee = None;
    let mut expiry = DEFAULT_EXPIRY_SECS;
    let mut min_final_cltv_expiry = DEFAULT_MIN_FINAL_CLTV_EXPIRY;
    let mut route_hints = Vec::new();

    let mut fields = &body[TIMESTAMP_LEN..];
    while !fields.is_empty() {
        if fields.len() < 3 {
            return Err(InvoiceError::InvalidFormat("truncated field header".to_string()));
        }
        let tag = fields[0].to_u8();
        let len = (usize::from(fields[1].to_u8()) << 5) | usize::from(fields[2].to_u8());
        if fields.len() < 3 + len {
            return Err(InvoiceError::InvalidFormat(format!("truncated field {}", tag)));
        }
        let field = &fields[3..3 + len];
        fields = &fields[3 + len..];

        // Fixed-size fields of the wrong length are skipped, not fatal.
        match tag {
            TAG_PAYMENT_HASH if len == HASH_FIELD_LEN && payment_hash.is_none() => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes_from_u5s(field)?);
                payment_hash = Some(PaymentHash::new(hash));
            }
            TAG_PAYMENT_SECRET if len == HASH_FIELD_LEN && payment_secret.is_none() => {
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&bytes_from_u5s(field)?);
                payment_secret = Some(secret);
            }
            TAG_DESCRIPTION if description.is_none() => {
                let text = String::from_utf8(bytes_from_u5s(field)?)
                    .map_err(|_| InvoiceError::InvalidFormat("description is not utf-8".to_string()))?;
                description = Some(InvoiceDescription::Direct(text));
            }
            TAG_DESCRIPTION_HASH if len == HASH_FIELD_LEN && description.is_none() => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes_from_u5s(field)?);
                description = Some(InvoiceDescription::Hash(hash));
            }
            TAG_PAYEE if len == PUBKEY_FIELD_LEN && payee.is_none() => {
                let key = PublicKey::from_slice(&bytes_from_u5s(field)?)
                    .map_err(|e| InvoiceError::InvalidFormat(format!("payee key: {}", e)))?;
                payee = Some(key);
            }
            TAG_EXPIRY => expiry = int_from_u5s(field)?,
            TAG_MIN_FINAL_CLTV => {
                min_final_cltv_expiry = u32::try_from(int_from_u5s(field)?)
                    .map_err(|_| InvoiceError::InvalidFormat("min_final_cltv_expiry".to_string()))?
            }
            TAG_ROUTE_HINT => route_hints.push(decode_route_hint(&bytes_from_u5s(field)?)?),
            _ => {}
        }
    }

    let secp = Secp256k1::new();
    let sig_bytes = bytes_from_u5s(signature)?;
    let recovery_id = RecoveryId::from_i32(i32::from(sig_bytes[64]))
        .map_err(|e| InvoiceError::InvalidSignature(e.to_string()))?;
    let recoverable = RecoverableSignature::from_compact(&sig_bytes[..64], recovery_id)
        .map_err(|e| InvoiceError::InvalidSignature(e.to_string()))?;
    let message = signing_hash(&hrp, body)?.to_message();
    let recovered = secp
        .recover_ecdsa(&message, &recoverable)
        .map_err(|e| InvoiceError::InvalidSignature(e.to_string()))?;

    let payee = match payee {
        Some(declared) => {
            if declared != recovered
                || secp
                    .verify_ecdsa(&message, &recoverable.to_standard(), &declared)
                    .is_err()
            {
                return Err(InvoiceError::InvalidSignature(
                    "signature does not match payee".to_string(),
                ));
            }
            declared
        }
        None => recovered,
    };

    Ok(Invoice {
        currency,
        amount_msat,
        timestamp,
        payment_hash: payment_hash.ok_or_else(|| InvoiceError::MissingField("p".to_string()))?,
        payment_secret,
        description: description.ok_or_else(|| InvoiceError::MissingField("d".to_string()))?,
        payee,
        expiry,
        min_final_cltv_expiry,
        route_hints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_shortest_form() {
        assert_eq!(encode_amount(250_000_000).unwrap(), "2500u");
        assert_eq!(encode_amount(2_000_000_000).unwrap(), "20m");
        assert_eq!(encode_amount(100_000_000_000).unwrap(), "1");
        assert_eq!(encode_amount(1).unwrap(), "10p");
        assert_eq!(encode_amount(1_000).unwrap(), "10n");
        assert!(encode_amount(0).is_err());
    }

    #[test]
    fn test_amount_parsing() {
        assert_eq!(decode_amount("").unwrap(), None);
        assert_eq!(decode_amount("2500u").unwrap(), Some(250_000_000));
        assert_eq!(decode_amount("20m").unwrap(), Some(2_000_000_000));
        assert_eq!(decode_amount("10p").unwrap(), Some(1));
        // sub-millisatoshi precision
        assert!(matches!(decode_amount("1p"), Err(InvoiceError::InvalidAmount(_))));
        assert!(matches!(decode_amount("025u"), Err(InvoiceError::InvalidAmount(_))));
        assert!(matches!(decode_amount("u"), Err(InvoiceError::InvalidAmount(_))));
    }

    #[test]
    fn test_currency_prefix_split() {
        assert_eq!(Currency::split("bcrt10u"), Some((Currency::Regtest, "10u")));
        assert_eq!(Currency::split("bc10u"), Some((Currency::Bitcoin, "10u")));
        assert_eq!(Currency::split("tbs"), Some((Currency::Signet, "")));
        assert_eq!(Currency::split("tb1m"), Some((Currency::Testnet, "1m")));
        assert_eq!(Currency::split("xyz1m"), None);
    }

    #[test]
    fn test_integer_fields() {
        assert_eq!(int_from_u5s(&int_to_u5s(3600).unwrap()).unwrap(), 3600);
        assert!(int_to_u5s(0).unwrap().is_empty());
    }
}
