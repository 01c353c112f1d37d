//! Per-hop onion payloads and the HTLC command builder.
//!
//! Given a route, the destination amount and expiry, and the final-hop
//! multipart fields, this module folds the route right-to-left into BOLT-04
//! TLV per-hop payloads, accumulates the first-hop amount and expiry, and
//! asks the sphinx layer to wrap everything into an onion packet.

use std::collections::VecDeque;

use common::amount::Amount;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::{
    channel::AddHtlc,
    gossip::ShortChannelId,
    primitives::{FullPaymentTag, PartId, PaymentSecret},
    router::Route,
    sphinx::{OnionBuildError, OnionCrypto, HOP_MAC_LEN, ONION_PAYLOAD_LEN},
};

// TLV types from BOLT-04's `payload` tlv stream.
const TLV_AMT_TO_FORWARD: u64 = 2;
const TLV_OUTGOING_CLTV: u64 = 4;
const TLV_SHORT_CHANNEL_ID: u64 = 6;
const TLV_PAYMENT_DATA: u64 = 8;
const TLV_PAYMENT_METADATA: u64 = 16;

/// An opaque TLV record appended to the final hop payload. Callers use these
/// for payee-specified extensions (`onion_tlvs`) and application-specific
/// extras (`user_custom_tlvs`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TlvRecord {
    pub typ: u64,
    pub value: Vec<u8>,
}

/// Everything the final recipient's payload carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalPayload {
    /// The amount this part delivers.
    pub amount: Amount,
    /// The total across all parts of the payment, binding the MPP set.
    pub total: Amount,
    /// Absolute block height the final HTLC expires at.
    pub expiry: u32,
    pub payment_secret: PaymentSecret,
    pub payment_metadata: Option<Vec<u8>>,
    pub onion_tlvs: Vec<TlvRecord>,
    pub custom_tlvs: Vec<TlvRecord>,
}

impl FinalPayload {
    fn encode(&self) -> Vec<u8> {
        let mut records = vec![
            TlvRecord {
                typ: TLV_AMT_TO_FORWARD,
                value: encode_tu64(self.amount.msat()),
            },
            TlvRecord {
                typ: TLV_OUTGOING_CLTV,
                value: encode_tu64(u64::from(self.expiry)),
            },
            TlvRecord {
                typ: TLV_PAYMENT_DATA,
                value: {
                    let mut value = self.payment_secret.0.to_vec();
                    value.extend_from_slice(&encode_tu64(self.total.msat()));
                    value
                },
            },
        ];
        if let Some(metadata) = &self.payment_metadata {
            records.push(TlvRecord {
                typ: TLV_PAYMENT_METADATA,
                value: metadata.clone(),
            });
        }
        records.extend(self.onion_tlvs.iter().cloned());
        records.extend(self.custom_tlvs.iter().cloned());
        encode_tlv_stream(records)
    }
}

/// The payload instructing a relaying hop where to forward.
fn encode_relay_payload(
    amount: Amount,
    expiry: u32,
    scid: ShortChannelId,
) -> Vec<u8> {
    encode_tlv_stream(vec![
        TlvRecord {
            typ: TLV_AMT_TO_FORWARD,
            value: encode_tu64(amount.msat()),
        },
        TlvRecord {
            typ: TLV_OUTGOING_CLTV,
            value: encode_tu64(u64::from(expiry)),
        },
        TlvRecord {
            typ: TLV_SHORT_CHANNEL_ID,
            value: scid.0.to_be_bytes().to_vec(),
        },
    ])
}

/// Encode a TLV stream: records sorted by type, each framed as
/// `bigsize(type) bigsize(length) value`.
fn encode_tlv_stream(mut records: Vec<TlvRecord>) -> Vec<u8> {
    records.sort_by_key(|record| record.typ);
    let mut out = Vec::new();
    for record in records {
        write_bigsize(record.typ, &mut out);
        write_bigsize(record.value.len() as u64, &mut out);
        out.extend_from_slice(&record.value);
    }
    out
}

/// BOLT-01 BigSize.
fn write_bigsize(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn bigsize_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Truncated big-endian u64: leading zero bytes stripped, zero encodes to
/// the empty string.
fn encode_tu64(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(8);
    bytes[first_nonzero..].to_vec()
}

/// Fold the route into per-hop payloads, accumulate the first-hop amount and
/// expiry, and build the onion packet and add-HTLC command.
///
/// The first hop is the fake local edge into our own peer: it contributes
/// neither fee nor CLTV delta, and its payload is the second hop's relay
/// instruction.
pub fn build_htlc_command(
    crypto: &dyn OnionCrypto,
    onion_key: &SecretKey,
    full_tag: FullPaymentTag,
    route: &Route,
    final_payload: FinalPayload,
) -> Result<AddHtlc, OnionBuildError> {
    if route.hops.is_empty() {
        return Err(OnionBuildError::EmptyRoute);
    }

    let mut amount = final_payload.amount;
    let mut expiry = final_payload.expiry;
    let mut payloads = VecDeque::with_capacity(route.hops.len());
    payloads.push_back(final_payload.encode());

    for hop in route.hops.iter().skip(1).rev() {
        let scid = hop.desc.short_channel_id;
        payloads.push_front(encode_relay_payload(amount, expiry, scid));
        amount = amount.saturating_add(hop.fee(amount));
        expiry = expiry.saturating_add(u32::from(hop.update.cltv_expiry_delta));
    }

    let payloads = Vec::from(payloads);

    // Each per-hop frame is bigsize(length) + payload + per-hop hmac; all
    // frames must fit the fixed-size onion.
    let payloads_len = payloads
        .iter()
        .map(|p| bigsize_len(p.len() as u64) + p.len() + HOP_MAC_LEN)
        .sum::<usize>();
    if payloads_len > ONION_PAYLOAD_LEN {
        return Err(OnionBuildError::PayloadsTooLarge {
            payloads_len,
            max: ONION_PAYLOAD_LEN,
        });
    }

    let nodes = route.hops.iter().map(|hop| hop.desc.to).collect::<Vec<_>>();
    let packet_and_secrets = crypto.build(
        onion_key,
        &nodes,
        &payloads,
        &full_tag.payment_hash,
    )?;

    Ok(AddHtlc {
        full_tag,
        part_id: PartId::from_onion_key(onion_key),
        first_amount: amount,
        first_expiry: expiry,
        packet_and_secrets,
        final_payload,
    })
}
