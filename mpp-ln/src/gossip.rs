//! Directed channel edges and `channel_update`s.
//!
//! These types describe the *external* routing graph: the engine never owns
//! graph storage, but it identifies directed edges (for failure bookkeeping
//! and route-request filters) and inspects `channel_update`s carried inside
//! remote failure packets.

use std::fmt::{self, Display};

use common::amount::Amount;
use serde::{Deserialize, Serialize};

use crate::primitives::NodePk;

/// A `(block_height, tx_index, output_index)` triple identifying an on-chain
/// channel, packed into a u64 the way it travels on the wire.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    pub const fn new(
        block_height: u32,
        tx_index: u32,
        output_index: u16,
    ) -> Self {
        Self(
            ((block_height as u64 & 0xff_ffff) << 40)
                | ((tx_index as u64 & 0xff_ffff) << 16)
                | (output_index as u64),
        )
    }

    pub const fn block_height(self) -> u32 {
        ((self.0 >> 40) & 0xff_ffff) as u32
    }

    pub const fn tx_index(self) -> u32 {
        ((self.0 >> 16) & 0xff_ffff) as u32
    }

    pub const fn output_index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

/// The identity of one *direction* of a channel in the external graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelDesc {
    pub short_channel_id: ShortChannelId,
    pub from: NodePk,
    pub to: NodePk,
}

/// A directed edge identity together with the channel's total capacity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DescAndCapacity {
    pub desc: ChannelDesc,
    pub capacity: Amount,
}

/// A signed message describing a directed channel's current routing policy.
///
/// The engine does not verify these itself; signature checking is delegated
/// to [`OnionCrypto::is_node_update_sig`].
///
/// [`OnionCrypto::is_node_update_sig`]: crate::sphinx::OnionCrypto::is_node_update_sig
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelUpdate {
    pub signature: [u8; 64],
    pub short_channel_id: ShortChannelId,
    pub timestamp: u32,
    pub message_flags: u8,
    pub channel_flags: u8,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: Amount,
    pub htlc_maximum_msat: Amount,
    pub fee_base_msat: Amount,
    pub fee_proportional_millionths: u64,
}

impl ChannelUpdate {
    /// Whether the announcing node considers the channel usable.
    pub fn is_enabled(&self) -> bool {
        self.channel_flags & 0b10 == 0
    }

    /// Which direction of the channel this update describes (0 or 1).
    pub fn position(&self) -> u8 {
        self.channel_flags & 0b01
    }

    /// Whether two updates carry the same routing policy, ignoring the
    /// signature, timestamp, and flags. A node re-announcing the policy we
    /// already routed with usually signals an imbalanced channel rather than
    /// a policy change.
    pub fn same_policy_as(&self, other: &ChannelUpdate) -> bool {
        self.short_channel_id == other.short_channel_id
            && self.cltv_expiry_delta == other.cltv_expiry_delta
            && self.htlc_minimum_msat == other.htlc_minimum_msat
            && self.htlc_maximum_msat == other.htlc_maximum_msat
            && self.fee_base_msat == other.fee_base_msat
            && self.fee_proportional_millionths
                == other.fee_proportional_millionths
    }

    /// The relay fee this policy charges for forwarding `amount`.
    pub fn fee(&self, amount: Amount) -> Amount {
        self.fee_base_msat.saturating_add(
            amount.proportional_millionths(self.fee_proportional_millionths),
        )
    }
}

/// A directed edge plus the policy and capacity the path-finder knew for it.
/// Routes are sequences of these.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GraphEdge {
    pub desc: ChannelDesc,
    pub update: ChannelUpdate,
    pub capacity: Amount,
}

impl GraphEdge {
    /// The relay fee this edge charges for forwarding `amount`.
    pub fn fee(&self, amount: Amount) -> Amount {
        self.update.fee(amount)
    }

    pub fn to_desc_and_capacity(&self) -> DescAndCapacity {
        DescAndCapacity {
            desc: self.desc,
            capacity: self.capacity,
        }
    }

    /// A zero-fee, zero-delta edge from the payer placeholder key to one of
    /// our direct peers. Every route request carries one of these so the
    /// path-finder can treat our (private) channel as the first hop.
    pub fn fake_local(to_peer: NodePk, scid: ShortChannelId) -> Self {
        let desc = ChannelDesc {
            short_channel_id: scid,
            from: NodePk::payer_placeholder(),
            to: to_peer,
        };
        let update = ChannelUpdate {
            signature: [0u8; 64],
            short_channel_id: scid,
            timestamp: 0,
            message_flags: 0,
            channel_flags: 0,
            cltv_expiry_delta: 0,
            htlc_minimum_msat: Amount::ZERO,
            htlc_maximum_msat: Amount::MAX,
            fee_base_msat: Amount::ZERO,
            fee_proportional_millionths: 0,
        };
        Self {
            desc,
            update,
            capacity: Amount::MAX,
        }
    }
}
