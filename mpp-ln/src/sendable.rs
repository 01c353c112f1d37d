//! Channel sendable-amount calculations.
//!
//! A part may be reserved against a channel before its HTLC has been
//! delivered to the channel state machine. These calculators subtract such
//! reservations exactly once: a reserved part stops being counted here the
//! moment the channel's own outgoing set starts accounting for it.

use std::{collections::HashMap, sync::Arc};

use common::amount::Amount;

use crate::{
    channel::{ChanAndCommits, ChanCommits, Channel, ChannelId, ChannelState},
    gossip::DescAndCapacity,
    primitives::PartId,
    router::Route,
};

/// Amounts currently assigned to channels by sender state, keyed by channel.
#[derive(Default)]
pub struct Reserved(pub HashMap<ChannelId, Vec<(PartId, Amount)>>);

impl Reserved {
    pub fn add(&mut self, channel_id: ChannelId, part_id: PartId, amount: Amount) {
        self.0.entry(channel_id).or_default().push((part_id, amount));
    }

    /// The reserved total not yet reflected in this channel's outgoing set.
    fn not_yet_in_channel(&self, commits: &ChanCommits) -> Amount {
        let Some(parts) = self.0.get(&commits.channel_id) else {
            return Amount::ZERO;
        };
        parts
            .iter()
            .filter(|(part_id, _amount)| {
                !commits
                    .all_outgoing
                    .iter()
                    .any(|htlc| htlc.part_id == *part_id)
            })
            .map(|(_part_id, amount)| *amount)
            .sum()
    }
}

/// How much each Operational-and-Open channel can send right now, after the
/// fee budget and not-yet-delivered reservations. Channels whose result is
/// below their `min_sendable` are excluded.
pub fn right_now_sendable<'a>(
    chans: impl IntoIterator<Item = &'a Arc<dyn Channel>>,
    max_fee: Amount,
    reserved: &Reserved,
) -> Vec<(ChanAndCommits, Amount)> {
    sendable_in_state(chans, max_fee, reserved, ChannelState::OperationalOpen)
}

/// Same calculation over Operational-and-Sleeping channels: an estimate of
/// what would become sendable if their peers came back online.
pub fn sleeping_sendable<'a>(
    chans: impl IntoIterator<Item = &'a Arc<dyn Channel>>,
    max_fee: Amount,
    reserved: &Reserved,
) -> Vec<(ChanAndCommits, Amount)> {
    sendable_in_state(
        chans,
        max_fee,
        reserved,
        ChannelState::OperationalSleeping,
    )
}

fn sendable_in_state<'a>(
    chans: impl IntoIterator<Item = &'a Arc<dyn Channel>>,
    max_fee: Amount,
    reserved: &Reserved,
    state: ChannelState,
) -> Vec<(ChanAndCommits, Amount)> {
    chans
        .into_iter()
        .filter(|chan| chan.state() == state)
        .filter_map(|chan| {
            let cnc = ChanAndCommits::snapshot(chan.clone());
            let min_sendable = cnc.commits.min_sendable;
            let sendable = cnc
                .commits
                .max_send_in_flight
                .min(cnc.commits.available_for_send)
                .saturating_sub(max_fee)
                .saturating_sub(reserved.not_yet_in_channel(&cnc.commits));
            (sendable >= min_sendable).then_some((cnc, sendable))
        })
        .collect()
}

/// Best-effort snapshot of external-channel utilisation: for every routed
/// in-flight part, its first-hop amount is counted against every hop of its
/// route.
pub fn used_capacities<'a>(
    flights: impl IntoIterator<Item = (&'a Route, Amount)>,
) -> HashMap<DescAndCapacity, Amount> {
    let mut used = HashMap::new();
    for (route, first_amount) in flights {
        for hop in &route.hops {
            let entry = used
                .entry(hop.to_desc_and_capacity())
                .or_insert(Amount::ZERO);
            *entry = entry.saturating_add(first_amount);
        }
    }
    used
}
