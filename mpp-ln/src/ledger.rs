//! Process-wide failure memory.
//!
//! The master owns one [`FailureLedger`] for its whole lifetime. Failures
//! recorded here shape every subsequent route request until they restore
//! (time-based, for failed-at amounts) or get halved / cleared (on the next
//! payment that asks for a clean slate).

use std::collections::{HashMap, HashSet};

use common::{amount::Amount, time::TimestampMs};
use tracing::debug;

use crate::{
    config::RouterConf,
    gossip::{ChannelDesc, DescAndCapacity},
    primitives::NodePk,
};

/// The amount at which a directed channel most recently failed, and when.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelFailedAt {
    pub amount: Amount,
    pub stamp: TimestampMs,
}

/// Process-wide memory of recent failures.
#[derive(Default)]
pub struct FailureLedger {
    /// Amount at which a directed channel most recently failed. Restores
    /// toward capacity over `failed_chan_recovery_msec`.
    pub chan_failed_at_amount: HashMap<DescAndCapacity, ChannelFailedAt>,
    /// Penalty counter for nodes which fail without a usable
    /// `channel_update` (or with an invalid signature).
    pub node_failed_unknown_update_times: HashMap<NodePk, u32>,
    /// Failure counter per directed edge.
    pub direction_failed_times: HashMap<ChannelDesc, u32>,
    /// Edges disabled for the current reduction cycle.
    pub chan_not_routable: HashSet<ChannelDesc>,
}

impl FailureLedger {
    /// Record that `dac` failed while `used_now` was in flight through it.
    /// Keeps the lowest amount seen so far and increments the direction
    /// counter.
    pub fn channel_failed(
        &mut self,
        dac: DescAndCapacity,
        used_now: Amount,
        now: TimestampMs,
    ) {
        let prev = self
            .chan_failed_at_amount
            .get(&dac)
            .map(|failed| failed.amount)
            .unwrap_or(Amount::MAX);
        let amount = prev.min(used_now);
        debug!(scid = %dac.desc.short_channel_id, %amount, "channel failed at amount");
        self.chan_failed_at_amount
            .insert(dac, ChannelFailedAt { amount, stamp: now });

        let direction = self.direction_failed_times.entry(dac.desc).or_insert(0);
        *direction = direction.saturating_add(1);
    }

    pub fn node_failed(&mut self, node: NodePk, increment: u32) {
        let counter =
            self.node_failed_unknown_update_times.entry(node).or_insert(0);
        *counter = counter.saturating_add(increment);
        debug!(%node, counter = *counter, "node failure counter bumped");
    }

    pub fn mark_not_routable(&mut self, desc: ChannelDesc) {
        debug!(scid = %desc.short_channel_id, "channel marked not routable");
        self.chan_not_routable.insert(desc);
    }

    /// Restoration pass, run when a new payment arrives with
    /// `clear_failures` set:
    ///
    /// - failed-at amounts restore linearly toward capacity over
    ///   `recovery_msec`; fully restored entries are dropped,
    /// - node and direction counters are halved (integer division),
    /// - the not-routable set is cleared.
    ///
    /// Surviving entries are re-stamped at `now`, so applying the same
    /// reduction twice in one instant is a no-op for the amounts.
    pub fn reduce(&mut self, now: TimestampMs, recovery_msec: u64) {
        self.chan_failed_at_amount.retain(|dac, failed| {
            let elapsed = now.saturating_ms_since(failed.stamp);
            let restored_ratio = if recovery_msec == 0 {
                1.0
            } else {
                elapsed as f64 / recovery_msec as f64
            };
            let headroom = dac.capacity.saturating_sub(failed.amount);
            let restored = (headroom.msat() as f64 * restored_ratio) as u64;
            let amount =
                failed.amount.saturating_add(Amount::from_msat(restored));
            if amount >= dac.capacity {
                false
            } else {
                failed.amount = amount;
                failed.stamp = now;
                true
            }
        });

        for counter in self.node_failed_unknown_update_times.values_mut() {
            *counter /= 2;
        }
        self.node_failed_unknown_update_times
            .retain(|_node, counter| *counter > 0);

        for counter in self.direction_failed_times.values_mut() {
            *counter /= 2;
        }
        self.direction_failed_times
            .retain(|_desc, counter| *counter > 0);

        self.chan_not_routable.clear();
    }

    /// The nodes and directed edges a route request for `amount` must route
    /// around, given the current in-flight utilisation snapshot.
    pub fn ignorables(
        &self,
        amount: Amount,
        used: &HashMap<DescAndCapacity, Amount>,
        conf: &RouterConf,
    ) -> (HashSet<NodePk>, HashSet<ChannelDesc>) {
        let ignore_nodes = self
            .node_failed_unknown_update_times
            .iter()
            .filter(|(_node, counter)| **counter >= conf.max_strange_node_failures)
            .map(|(node, _counter)| *node)
            .collect::<HashSet<_>>();

        let mut ignore_channels = HashSet::new();

        // Channels this payment's own parts already fill close to capacity.
        for (dac, used_amount) in used {
            let headroom = dac.capacity.saturating_sub(amount / 32);
            if used_amount.saturating_add(amount) >= headroom {
                ignore_channels.insert(dac.desc);
            }
        }

        // Channels whose last known failure amount leaves no room for this
        // part (with a small slack of amount/8).
        for (dac, failed) in &self.chan_failed_at_amount {
            let used_amount =
                used.get(dac).copied().unwrap_or(Amount::ZERO).msat() as i128;
            let reachable = failed.amount.msat() as i128
                - used_amount
                - (amount / 8).msat() as i128;
            if reachable <= amount.msat() as i128 {
                ignore_channels.insert(dac.desc);
            }
        }

        for (desc, counter) in &self.direction_failed_times {
            if *counter >= conf.max_direction_failures {
                ignore_channels.insert(*desc);
            }
        }

        ignore_channels.extend(self.chan_not_routable.iter().copied());

        (ignore_nodes, ignore_channels)
    }
}
