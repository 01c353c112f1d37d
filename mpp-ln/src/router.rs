//! The path-finder interface consumed by the engine.
//!
//! Route computation (Dijkstra over the gossip graph) lives outside this
//! crate. The engine serialises one outstanding [`RouteRequest`] at a time
//! through the master; answers come back as master events.

use std::collections::HashSet;

use common::amount::Amount;

use crate::{
    gossip::{ChannelDesc, ChannelUpdate, GraphEdge},
    primitives::{FullPaymentTag, NodePk, PartId},
};

/// Limits applied to a single route search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RouteParams {
    /// Fee budget still available for this part. The path-finder must not
    /// return a route whose total fee exceeds it.
    pub fee_reserve: Amount,
    /// Maximum number of hops.
    pub route_max_length: u32,
    /// Maximum total CLTV delta across the route.
    pub route_max_cltv: u32,
}

/// A request for a route for one part of one payment.
#[derive(Clone, Debug)]
pub struct RouteRequest {
    pub full_tag: FullPaymentTag,
    pub part_id: PartId,
    /// Always the payer placeholder key; the real first hop comes from
    /// `local_edge`.
    pub source: NodePk,
    pub target: NodePk,
    pub amount: Amount,
    /// A fake zero-fee edge from `source` into the reserved channel's peer.
    pub local_edge: GraphEdge,
    pub params: RouteParams,
    /// Nodes the path-finder must route around. Filled in by the master from
    /// the failure ledger just before forwarding.
    pub ignore_nodes: HashSet<NodePk>,
    /// Directed edges the path-finder must route around. Filled in by the
    /// master from the failure ledger just before forwarding.
    pub ignore_channels: HashSet<ChannelDesc>,
}

/// A found route: the fake local edge first, then graph edges to the target.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub hops: Vec<GraphEdge>,
}

impl Route {
    /// Total relay fee for delivering `final_amount` to the target. The
    /// first (local) hop charges nothing: its fee would be paid to
    /// ourselves.
    pub fn fee(&self, final_amount: Amount) -> Amount {
        let mut amount = final_amount;
        for hop in self.hops.iter().skip(1).rev() {
            amount = amount.saturating_add(hop.fee(amount));
        }
        amount.saturating_sub(final_amount)
    }

    /// The edge whose `from` endpoint is `node`, if `node` relays on this
    /// route.
    pub fn edge_from(&self, node: NodePk) -> Option<&GraphEdge> {
        self.hops.iter().find(|hop| hop.desc.from == node)
    }

    /// The node right before the final recipient.
    pub fn second_to_last_node(&self) -> Option<NodePk> {
        self.hops.last().map(|hop| hop.desc.from)
    }

    /// The final recipient.
    pub fn target_node(&self) -> Option<NodePk> {
        self.hops.last().map(|hop| hop.desc.to)
    }
}

/// The path-finder the engine consumes. All methods must be non-blocking
/// from the master's viewpoint; `find_route` answers arrive later as
/// `RouteFound` / `NoRouteAvailable` master events.
pub trait PathFinder: Send + Sync {
    fn find_route(&self, request: RouteRequest);

    /// Install a `channel_update` learned from a remote failure packet.
    fn learn_update(&self, update: ChannelUpdate);

    /// Install a payee-provided routing hint.
    fn learn_edge(&self, edge: GraphEdge);
}
