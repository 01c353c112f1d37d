//! The per-payment sender FSM.
//!
//! One [`PaymentSender`] exists per logical payment. It owns the payment's
//! part map and drives each part through its lifecycle: reserve a channel,
//! request a route, build the onion, dispatch, await resolution. Remote
//! failures feed the master's failure ledger and either switch the part to
//! another channel, split it in half, or fail it for good.
//!
//! Senders are driven exclusively by the master's worker; all methods here
//! run on that single logical thread.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use common::{
    amount::Amount,
    rng::{shuffle, Crng},
};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    channel::{
        AddHtlc, ChanAndCommits, Channel, ChannelId, InFlightBag, LocalReject,
        LocalRejectReason, RemoteFulfill, RemoteReject,
    },
    config::RouterConf,
    gossip::GraphEdge,
    master::{AbortTimers, MasterEvent},
    onion::{build_htlc_command, FinalPayload, TlvRecord},
    primitives::{
        random_session_key, FullPaymentTag, NodePk, PartId, PaymentSecret,
    },
    router::{PathFinder, Route, RouteParams, RouteRequest},
    sendable::{self, Reserved},
    sphinx::{DecryptedFailurePacket, FailureMessage, OnionCrypto},
};

// --- The SendPayment command --- //

/// How a payment's total splits between all participating senders: for a
/// plain payment `my_part == total_sum`; a trampoline relay may carry only a
/// fraction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SplitInfo {
    pub total_sum: Amount,
    pub my_part: Amount,
}

/// The final HTLC expiry, either as an absolute block height or as a delta
/// on top of the master's last known chain tip.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainExpiry {
    Absolute(u32),
    Delta(u32),
}

impl ChainExpiry {
    pub fn to_absolute(self, chain_tip: u32) -> u32 {
        match self {
            Self::Absolute(height) => height,
            Self::Delta(delta) => chain_tip.saturating_add(delta),
        }
    }
}

/// The immutable command initiating (or re-initiating) one payment.
#[derive(Clone)]
pub struct SendPayment {
    pub full_tag: FullPaymentTag,
    pub split: SplitInfo,
    pub target_node_id: NodePk,
    pub chain_expiry: ChainExpiry,
    pub router_conf: RouterConf,
    /// Budgeted upper bound on fees across all parts of this payment.
    pub total_fee_reserve: Amount,
    /// The local channels this payment may use.
    pub allowed_chans: Vec<Arc<dyn Channel>>,
    /// The payment secret bound into every part's final payload.
    pub outer_payment_secret: PaymentSecret,
    pub payee_metadata: Option<Vec<u8>>,
    /// Payee-provided routing hints, pushed to the path-finder up front.
    pub assisted_edges: Vec<GraphEdge>,
    pub onion_tlvs: Vec<TlvRecord>,
    pub user_custom_tlvs: Vec<TlvRecord>,
    /// Whether to run a failure-ledger reduction before this payment.
    pub clear_failures: bool,
}

impl fmt::Debug for SendPayment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendPayment")
            .field("full_tag", &self.full_tag)
            .field("split", &self.split)
            .field("target_node_id", &self.target_node_id)
            .field("total_fee_reserve", &self.total_fee_reserve)
            .field("allowed_chans", &self.allowed_chans.len())
            .finish_non_exhaustive()
    }
}

// --- Failures --- //

/// Locally-decided failure reasons, string-tagged for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LocalFailureKind {
    NoRoutesFound,
    NotEnoughFunds,
    PaymentNotSendable,
    RunOutOfRetryAttempts,
    RunOutOfCapableChannels,
    NodeCouldNotParseOnion,
    NotRetryingNoDetails,
    OnionCreationFailure,
    TimedOut,
}

impl LocalFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRoutesFound => "NO_ROUTES_FOUND",
            Self::NotEnoughFunds => "NOT_ENOUGH_FUNDS",
            Self::PaymentNotSendable => "PAYMENT_NOT_SENDABLE",
            Self::RunOutOfRetryAttempts => "RUN_OUT_OF_RETRY_ATTEMPTS",
            Self::RunOutOfCapableChannels => "RUN_OUT_OF_CAPABLE_CHANNELS",
            Self::NodeCouldNotParseOnion => "NODE_COULD_NOT_PARSE_ONION",
            Self::NotRetryingNoDetails => "NOT_RETRYING_NO_DETAILS",
            Self::OnionCreationFailure => "ONION_CREATION_FAILURE",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for LocalFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt of one part. Accumulated most-recent-first in sender
/// state and surfaced to listeners with the final verdict.
#[derive(Clone, Debug)]
pub enum PaymentFailure {
    Local {
        kind: LocalFailureKind,
        amount: Amount,
    },
    /// A decrypted remote failure, with the route it came back along.
    Remote {
        packet: DecryptedFailurePacket,
        route: Route,
    },
    /// A failure packet we could not decrypt.
    UnreadableRemote { route: Route },
}

// --- Part lifecycle --- //

/// A dispatched HTLC: the command we handed to the channel and the route it
/// took.
#[derive(Clone, Debug)]
pub struct InFlightInfo {
    pub cmd: AddHtlc,
    pub route: Route,
    /// `cmd.first_amount - part amount`; counts against the fee reserve.
    pub route_fee: Amount,
}

/// A part that holds a reserved channel and is either waiting for a route
/// (`flight == None`) or waiting for its dispatched HTLC to resolve.
#[derive(Clone, Debug)]
pub struct WaitForRouteOrInFlight {
    pub onion_key: SecretKey,
    pub amount: Amount,
    pub cnc: ChanAndCommits,
    pub flight: Option<InFlightInfo>,
    /// Fees of every route this part has dispatched over.
    pub fees_tried: Vec<Amount>,
    /// Channels which locally failed this part; excluded from local retries.
    pub local_failed_chan_ids: Vec<ChannelId>,
    pub remote_attempts: u32,
}

impl WaitForRouteOrInFlight {
    fn new(onion_key: SecretKey, amount: Amount, cnc: ChanAndCommits) -> Self {
        Self {
            onion_key,
            amount,
            cnc,
            flight: None,
            fees_tried: Vec::new(),
            local_failed_chan_ids: Vec::new(),
            remote_attempts: 0,
        }
    }

    pub fn part_id(&self) -> PartId {
        PartId::from_onion_key(&self.onion_key)
    }
}

/// The status of one part. Keyed in the part map by the public key derived
/// from its `onion_key`; a remote retry rotates the key (and therefore the
/// id), a local retry keeps both since no HTLC ever went out.
#[derive(Clone, Debug)]
pub enum PartStatus {
    /// No routable channel right now; waiting for one to come online.
    WaitForChanOnline { onion_key: SecretKey, amount: Amount },
    WaitForRouteOrInFlight(WaitForRouteOrInFlight),
}

impl PartStatus {
    pub fn part_id(&self) -> PartId {
        match self {
            Self::WaitForChanOnline { onion_key, .. } =>
                PartId::from_onion_key(onion_key),
            Self::WaitForRouteOrInFlight(wait) => wait.part_id(),
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            Self::WaitForChanOnline { amount, .. } => *amount,
            Self::WaitForRouteOrInFlight(wait) => wait.amount,
        }
    }

    fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::WaitForRouteOrInFlight(wait) if wait.flight.is_some()
        )
    }
}

// --- Listeners --- //

/// A cloneable view of a sender's state handed to listeners.
#[derive(Clone, Debug)]
pub struct SenderSnapshot {
    pub full_tag: FullPaymentTag,
    pub state: SenderState,
    pub cmd: Option<SendPayment>,
    pub parts: HashMap<PartId, PartStatus>,
    pub failures: Vec<PaymentFailure>,
    pub used_fee: Amount,
}

/// Host callbacks for payment outcomes. Invoked from the master's worker;
/// implementations must not block.
pub trait PaymentListener: Send + Sync {
    /// The first preimage arrived: the payment is cryptographically settled,
    /// even though other parts may still be in flight. The snapshot is taken
    /// *before* the fulfilled part is dropped, routes intact.
    fn got_first_preimage(
        &self,
        _snapshot: &SenderSnapshot,
        _fulfill: &RemoteFulfill,
    ) {
    }

    /// All parts are resolved and no channel holds an HTLC with this tag
    /// anymore; the payment succeeded. Fires exactly once.
    fn whole_payment_succeeded(&self, _snapshot: &SenderSnapshot) {}

    /// All parts are resolved and no channel holds an HTLC with this tag
    /// anymore; the payment failed. Fires exactly once.
    fn whole_payment_failed(&self, _snapshot: &SenderSnapshot) {}
}

/// The sender FSM phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SenderState {
    Init,
    Pending,
    Aborted,
    Succeeded,
}

// --- Master-provided context --- //

/// Everything a sender handler may reach outside its own state. Built by the
/// master for the duration of one event delivery.
pub(crate) struct SenderCtx<'a> {
    /// Every *other* registered sender; used for cross-payment channel
    /// reservation accounting.
    pub others: &'a HashMap<FullPaymentTag, PaymentSender>,
    /// Follow-up master events, drained FIFO after the current handler.
    pub outbox: &'a mut VecDeque<MasterEvent>,
    pub rng: &'a mut dyn Crng,
    pub timers: &'a dyn AbortTimers,
    pub crypto: &'a dyn OnionCrypto,
    pub path_finder: &'a dyn PathFinder,
    pub chain_tip: u32,
}

impl SenderCtx<'_> {
    fn reserved_with(&self, me: &PaymentSender) -> Reserved {
        let mut reserved = Reserved::default();
        let all_parts = self
            .others
            .values()
            .flat_map(|sender| sender.parts.values())
            .chain(me.parts.values());
        for part in all_parts {
            if let PartStatus::WaitForRouteOrInFlight(wait) = part {
                reserved.add(
                    wait.cnc.commits.channel_id,
                    wait.part_id(),
                    wait.amount,
                );
            }
        }
        reserved
    }

    fn right_now_sendable(
        &self,
        me: &PaymentSender,
        chans: &[Arc<dyn Channel>],
        max_fee: Amount,
    ) -> Vec<(ChanAndCommits, Amount)> {
        sendable::right_now_sendable(chans, max_fee, &self.reserved_with(me))
    }

    fn sleeping_sendable_total(
        &self,
        me: &PaymentSender,
        chans: &[Arc<dyn Channel>],
        max_fee: Amount,
    ) -> Amount {
        sendable::sleeping_sendable(chans, max_fee, &self.reserved_with(me))
            .iter()
            .map(|(_cnc, sendable)| *sendable)
            .sum()
    }
}

// --- The sender FSM --- //

/// One logical payment's state machine.
pub struct PaymentSender {
    full_tag: FullPaymentTag,
    state: SenderState,
    cmd: Option<SendPayment>,
    parts: HashMap<PartId, PartStatus>,
    failures: Vec<PaymentFailure>,
    listeners: Vec<Arc<dyn PaymentListener>>,
    /// Bumped on every `assign_to_chans`; stale timer events are ignored.
    abort_generation: u64,
    /// Guards the exactly-once terminal notifications.
    final_notified: bool,
}

impl PaymentSender {
    pub(crate) fn new(
        full_tag: FullPaymentTag,
        listeners: Vec<Arc<dyn PaymentListener>>,
    ) -> Self {
        Self {
            full_tag,
            state: SenderState::Init,
            cmd: None,
            parts: HashMap::new(),
            failures: Vec::new(),
            listeners,
            abort_generation: 0,
            final_notified: false,
        }
    }

    pub fn full_tag(&self) -> FullPaymentTag {
        self.full_tag
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn parts(&self) -> &HashMap<PartId, PartStatus> {
        &self.parts
    }

    pub fn failures(&self) -> &[PaymentFailure] {
        &self.failures
    }

    /// Iterate the dispatched (in-flight) parts.
    pub fn in_flight_parts(
        &self,
    ) -> impl Iterator<Item = &WaitForRouteOrInFlight> {
        self.parts.values().filter_map(|part| match part {
            PartStatus::WaitForRouteOrInFlight(wait)
                if wait.flight.is_some() =>
                Some(wait),
            _ => None,
        })
    }

    /// Total fee committed by currently in-flight parts.
    pub fn used_fee(&self) -> Amount {
        self.in_flight_parts()
            .filter_map(|wait| wait.flight.as_ref())
            .map(|flight| flight.route_fee)
            .sum()
    }

    /// Fee budget still available for new routes. Never negative.
    pub fn fee_leftover(&self) -> Amount {
        let reserve = self
            .cmd
            .as_ref()
            .map(|cmd| cmd.total_fee_reserve)
            .unwrap_or(Amount::ZERO);
        reserve.saturating_sub(self.used_fee())
    }

    /// How many more parts this payment may create before hitting its
    /// per-channel HTLC budget. Caps runaway splitting.
    pub fn outgoing_htlc_slots_left(&self) -> u32 {
        let Some(cmd) = &self.cmd else { return 0 };
        let budget = cmd.allowed_chans.len() as u32
            * cmd.router_conf.max_in_channel_htlcs;
        budget.saturating_sub(self.parts.len() as u32)
    }

    pub fn snapshot(&self) -> SenderSnapshot {
        SenderSnapshot {
            full_tag: self.full_tag,
            state: self.state,
            cmd: self.cmd.clone(),
            parts: self.parts.clone(),
            failures: self.failures.clone(),
            used_fee: self.used_fee(),
        }
    }

    // --- Event handlers, called by the master --- //

    pub(crate) fn on_send_payment(
        &mut self,
        cmd: SendPayment,
        ctx: &mut SenderCtx<'_>,
    ) {
        match self.state {
            SenderState::Init | SenderState::Aborted => {
                info!(
                    tag = %self.full_tag,
                    my_part = %cmd.split.my_part,
                    fee_reserve = %cmd.total_fee_reserve,
                    "starting payment"
                );
                let my_part = cmd.split.my_part;
                let fee_reserve = cmd.total_fee_reserve;
                let allowed = cmd.allowed_chans.clone();
                self.cmd = Some(cmd);
                self.parts.clear();
                self.failures.clear();
                self.final_notified = false;

                let sendable =
                    ctx.right_now_sendable(self, &allowed, fee_reserve);
                self.assign_to_chans(sendable, my_part, ctx);
            }
            state => {
                warn!(tag = %self.full_tag, ?state, "ignoring SendPayment");
            }
        }
    }

    /// Ask the master for a route for the largest route-less part, if any.
    pub(crate) fn on_ask_for_route(&mut self, ctx: &mut SenderCtx<'_>) {
        if self.state != SenderState::Pending {
            return;
        }
        let Some(cmd) = &self.cmd else { return };

        let candidate = self
            .parts
            .values()
            .filter_map(|part| match part {
                PartStatus::WaitForRouteOrInFlight(wait)
                    if wait.flight.is_none() =>
                    Some(wait),
                _ => None,
            })
            .max_by_key(|wait| wait.amount);

        if let Some(wait) = candidate {
            let peer = wait.cnc.commits.remote_node_id;
            let alias = wait.cnc.commits.channel_id.local_alias_scid();
            let request = RouteRequest {
                full_tag: self.full_tag,
                part_id: wait.part_id(),
                source: NodePk::payer_placeholder(),
                target: cmd.target_node_id,
                amount: wait.amount,
                local_edge: GraphEdge::fake_local(peer, alias),
                params: RouteParams {
                    fee_reserve: self.fee_leftover(),
                    route_max_length: cmd.router_conf.init_route_max_length,
                    route_max_cltv: cmd.router_conf.route_max_cltv,
                },
                ignore_nodes: HashSet::new(),
                ignore_channels: HashSet::new(),
            };
            ctx.outbox.push_back(MasterEvent::RouteRequest(Box::new(request)));
        }
    }

    pub(crate) fn on_route_found(
        &mut self,
        part_id: PartId,
        route: Route,
        ctx: &mut SenderCtx<'_>,
    ) {
        if self.state != SenderState::Pending {
            return;
        }
        let Some(cmd) = &self.cmd else { return };
        let full_tag = cmd.full_tag;
        let final_payload_template = FinalPayload {
            // Placeholder amount; replaced per-part below.
            amount: Amount::ZERO,
            total: cmd.split.total_sum,
            expiry: cmd.chain_expiry.to_absolute(ctx.chain_tip),
            payment_secret: cmd.outer_payment_secret,
            payment_metadata: cmd.payee_metadata.clone(),
            onion_tlvs: cmd.onion_tlvs.clone(),
            custom_tlvs: cmd.user_custom_tlvs.clone(),
        };

        let Some(PartStatus::WaitForRouteOrInFlight(wait)) =
            self.parts.get_mut(&part_id)
        else {
            debug!(%part_id, "RouteFound for an unknown part");
            return;
        };
        if wait.flight.is_some() {
            return;
        }

        let final_payload = FinalPayload {
            amount: wait.amount,
            ..final_payload_template
        };
        match build_htlc_command(
            ctx.crypto,
            &wait.onion_key,
            full_tag,
            &route,
            final_payload,
        ) {
            Ok(add) => {
                let route_fee = add.first_amount.saturating_sub(wait.amount);
                info!(
                    tag = %self.full_tag,
                    %part_id,
                    amount = %wait.amount,
                    first_amount = %add.first_amount,
                    %route_fee,
                    "dispatching part"
                );
                wait.fees_tried.push(route_fee);
                wait.flight = Some(InFlightInfo {
                    cmd: add.clone(),
                    route,
                    route_fee,
                });
                wait.cnc.chan.send_htlc(add);
            }
            Err(err) => {
                // Inputs won't change on a re-route, so retrying is
                // pointless.
                warn!(tag = %self.full_tag, %part_id, %err, "onion build failed");
                let amount = wait.amount;
                self.parts.remove(&part_id);
                self.push_local_failure(
                    LocalFailureKind::OnionCreationFailure,
                    amount,
                );
                self.abort_maybe_notify();
            }
        }
    }

    pub(crate) fn on_no_route(
        &mut self,
        part_id: PartId,
        ctx: &mut SenderCtx<'_>,
    ) {
        if self.state != SenderState::Pending {
            return;
        }
        let Some(cmd) = &self.cmd else { return };
        let allowed = cmd.allowed_chans.clone();

        let Some(PartStatus::WaitForRouteOrInFlight(wait)) =
            self.parts.get(&part_id)
        else {
            return;
        };
        if wait.flight.is_some() {
            return;
        }
        let amount = wait.amount;
        // A switch must land on a *different* channel: the reserved one has
        // just proven routeless for this amount.
        let mut excluded = wait.local_failed_chan_ids.clone();
        excluded.push(wait.cnc.commits.channel_id);

        let alternatives = chans_excluding(&allowed, &excluded);
        let sendable =
            ctx.right_now_sendable(self, &alternatives, self.fee_leftover());
        let switch = sendable
            .into_iter()
            .find(|(_cnc, sendable)| *sendable >= amount);

        match switch {
            Some((cnc, _sendable)) => {
                debug!(
                    tag = %self.full_tag, %part_id,
                    to = %cnc.commits.channel_id,
                    "no route; retrying part on another channel"
                );
                self.one_more_local_attempt(part_id, cnc);
            }
            None if self.outgoing_htlc_slots_left() >= 1 => {
                debug!(tag = %self.full_tag, %part_id, "no route; splitting");
                self.parts.remove(&part_id);
                ctx.outbox.push_back(MasterEvent::CutIntoHalves {
                    full_tag: self.full_tag,
                    amount,
                });
            }
            None => {
                self.parts.remove(&part_id);
                self.push_local_failure(
                    LocalFailureKind::NoRoutesFound,
                    amount,
                );
                self.abort_maybe_notify();
            }
        }
    }

    pub(crate) fn on_local_reject(
        &mut self,
        reject: LocalReject,
        ctx: &mut SenderCtx<'_>,
    ) {
        match self.state {
            SenderState::Init => {
                // No part context to retry with.
                self.push_local_failure(
                    LocalFailureKind::NotRetryingNoDetails,
                    reject.add.first_amount,
                );
                self.abort_maybe_notify();
            }
            SenderState::Succeeded => {
                self.parts.remove(&reject.add.part_id);
            }
            SenderState::Aborted => {
                self.parts.remove(&reject.add.part_id);
                self.abort_maybe_notify();
            }
            SenderState::Pending => {
                self.local_reject_pending(reject, ctx);
            }
        }
    }

    fn local_reject_pending(
        &mut self,
        reject: LocalReject,
        ctx: &mut SenderCtx<'_>,
    ) {
        let Some(cmd) = &self.cmd else { return };
        let allowed = cmd.allowed_chans.clone();
        let part_id = reject.add.part_id;

        let Some(PartStatus::WaitForRouteOrInFlight(wait)) =
            self.parts.get(&part_id)
        else {
            return;
        };
        let amount = wait.amount;
        let current_chan = wait.cnc.commits.channel_id;

        if reject.reason == LocalRejectReason::InPrincipleNotSendable {
            self.parts.remove(&part_id);
            self.push_local_failure(
                LocalFailureKind::PaymentNotSendable,
                amount,
            );
            self.abort_maybe_notify();
            return;
        }

        let alternatives = chans_excluding(&allowed, &[current_chan]);
        let sendable =
            ctx.right_now_sendable(self, &alternatives, self.fee_leftover());
        let switch = sendable
            .into_iter()
            .find(|(_cnc, sendable)| *sendable >= amount);

        match switch {
            Some((cnc, _sendable)) => {
                debug!(
                    tag = %self.full_tag, %part_id,
                    to = %cnc.commits.channel_id,
                    "local reject; retrying part on another channel"
                );
                self.one_more_local_attempt(part_id, cnc);
            }
            None if reject.reason == LocalRejectReason::ChannelOffline => {
                // The reserved channel went away; reassign the amount from
                // scratch (which may re-split it).
                self.parts.remove(&part_id);
                let sendable = ctx.right_now_sendable(
                    self,
                    &allowed,
                    self.fee_leftover(),
                );
                self.assign_to_chans(sendable, amount, ctx);
            }
            None => {
                self.parts.remove(&part_id);
                self.push_local_failure(
                    LocalFailureKind::RunOutOfCapableChannels,
                    amount,
                );
                self.abort_maybe_notify();
            }
        }
    }

    pub(crate) fn on_remote_fulfill(&mut self, fulfill: RemoteFulfill) {
        match self.state {
            SenderState::Init | SenderState::Pending | SenderState::Aborted
                if fulfill.add.full_tag.payment_hash
                    == self.full_tag.payment_hash =>
            {
                info!(tag = %self.full_tag, "got first preimage");
                let snapshot = self.snapshot();
                for listener in &self.listeners {
                    listener.got_first_preimage(&snapshot, &fulfill);
                }
                self.parts.remove(&fulfill.add.part_id);
                self.state = SenderState::Succeeded;
            }
            SenderState::Succeeded => {
                // A further part settled; drop it and wait for the bag to
                // clear.
                self.parts.remove(&fulfill.add.part_id);
            }
            _ => {}
        }
    }

    pub(crate) fn on_remote_reject(
        &mut self,
        reject: RemoteReject,
        ctx: &mut SenderCtx<'_>,
    ) {
        match self.state {
            SenderState::Init => {
                self.push_local_failure(
                    LocalFailureKind::NotRetryingNoDetails,
                    reject.add().first_amount,
                );
                self.abort_maybe_notify();
            }
            SenderState::Succeeded => {
                self.parts.remove(&reject.add().part_id);
            }
            SenderState::Aborted => {
                self.parts.remove(&reject.add().part_id);
                self.abort_maybe_notify();
            }
            SenderState::Pending => {
                self.remote_reject_pending(reject, ctx);
            }
        }
    }

    fn remote_reject_pending(
        &mut self,
        reject: RemoteReject,
        ctx: &mut SenderCtx<'_>,
    ) {
        let Some(cmd) = &self.cmd else { return };
        let target = cmd.target_node_id;
        let max_strange = cmd.router_conf.max_strange_node_failures;

        let part_id = reject.add().part_id;
        let Some(PartStatus::WaitForRouteOrInFlight(wait)) =
            self.parts.get(&part_id)
        else {
            return;
        };
        let Some(flight) = wait.flight.clone() else { return };
        let amount = wait.amount;

        let reason = match reject {
            RemoteReject::Malform { .. } => {
                // Some hop could not parse our onion and the failure is not
                // attributable; blaming the node right before the recipient
                // is the best heuristic we have.
                if let Some(node) = flight.route.second_to_last_node() {
                    ctx.outbox.push_back(MasterEvent::NodeFailed {
                        node_id: node,
                        increment: max_strange,
                    });
                }
                self.resolve_remote_fail(
                    part_id,
                    PaymentFailure::Local {
                        kind: LocalFailureKind::NodeCouldNotParseOnion,
                        amount,
                    },
                    ctx,
                );
                return;
            }
            RemoteReject::Fail { reason, .. } => reason,
        };

        let secrets = &flight.cmd.packet_and_secrets.shared_secrets;
        let Some(packet) = ctx.crypto.decrypt_failure(&reason, secrets) else {
            // Same heuristic as the malformed case.
            if let Some(node) = flight.route.second_to_last_node() {
                ctx.outbox.push_back(MasterEvent::NodeFailed {
                    node_id: node,
                    increment: max_strange,
                });
            }
            self.resolve_remote_fail(
                part_id,
                PaymentFailure::UnreadableRemote {
                    route: flight.route.clone(),
                },
                ctx,
            );
            return;
        };

        let origin = packet.origin_node;
        let from_destination = origin == target;
        let timed_out =
            matches!(packet.failure, FailureMessage::PaymentTimeout);
        if from_destination || timed_out {
            // The recipient itself refused, or the payment expired en route;
            // retrying this part cannot help.
            info!(tag = %self.full_tag, %part_id, "terminal remote failure");
            self.parts.remove(&part_id);
            self.failures.insert(
                0,
                PaymentFailure::Remote {
                    packet,
                    route: flight.route.clone(),
                },
            );
            self.abort_maybe_notify();
            return;
        }

        match &packet.failure {
            FailureMessage::Update(update) => {
                if ctx.crypto.is_node_update_sig(update, &origin) {
                    ctx.path_finder.learn_update(*update);
                    let edge = flight.route.edge_from(origin).copied();
                    if let Some(edge) = &edge {
                        if !update.is_enabled() {
                            ctx.outbox.push_back(
                                MasterEvent::ChannelNotRoutable(edge.desc),
                            );
                        }
                    }
                    match edge {
                        Some(edge)
                            if edge.update.short_channel_id
                                != update.short_channel_id =>
                        {
                            // The node relayed over a different channel than
                            // the one we asked for; fail the one we chose,
                            // it has most likely been tried too.
                            ctx.outbox.push_back(
                                MasterEvent::ChannelFailedAtAmount(
                                    edge.to_desc_and_capacity(),
                                ),
                            );
                            ctx.outbox.push_back(MasterEvent::NodeFailed {
                                node_id: origin,
                                increment: 1,
                            });
                        }
                        Some(edge)
                            if update.same_policy_as(&edge.update) =>
                        {
                            // The node returned the same policy we routed
                            // with: the channel is most likely imbalanced at
                            // this amount.
                            ctx.outbox.push_back(
                                MasterEvent::ChannelFailedAtAmount(
                                    edge.to_desc_and_capacity(),
                                ),
                            );
                            ctx.outbox.push_back(MasterEvent::NodeFailed {
                                node_id: origin,
                                increment: 1,
                            });
                        }
                        _ => {
                            // Fees or CLTV changed; the refreshed policy is
                            // in the graph now and the channel may be chosen
                            // again.
                            ctx.outbox.push_back(MasterEvent::NodeFailed {
                                node_id: origin,
                                increment: 1,
                            });
                        }
                    }
                } else {
                    // An invalid signature is a severe violation.
                    warn!(tag = %self.full_tag, %origin, "invalid update signature");
                    ctx.outbox.push_back(MasterEvent::NodeFailed {
                        node_id: origin,
                        increment: max_strange * 32,
                    });
                }
                self.resolve_remote_fail(
                    part_id,
                    PaymentFailure::Remote {
                        packet: packet.clone(),
                        route: flight.route.clone(),
                    },
                    ctx,
                );
            }
            FailureMessage::Node => {
                // Node-level failure: keep it out of this payment's routes.
                ctx.outbox.push_back(MasterEvent::NodeFailed {
                    node_id: origin,
                    increment: max_strange,
                });
                self.resolve_remote_fail(
                    part_id,
                    PaymentFailure::Remote {
                        packet: packet.clone(),
                        route: flight.route.clone(),
                    },
                    ctx,
                );
            }
            FailureMessage::PaymentTimeout => {
                // Handled above as terminal.
            }
            FailureMessage::Other(_code) => {
                match flight.route.edge_from(origin) {
                    Some(edge) => ctx.outbox.push_back(
                        MasterEvent::ChannelNotRoutable(edge.desc),
                    ),
                    None => {
                        ctx.outbox.push_back(MasterEvent::NodeFailed {
                            node_id: origin,
                            increment: max_strange,
                        })
                    }
                }
                self.resolve_remote_fail(
                    part_id,
                    PaymentFailure::Remote {
                        packet: packet.clone(),
                        route: flight.route.clone(),
                    },
                    ctx,
                );
            }
        }
    }

    /// Drop the failed part, record the failure, then retry on another
    /// channel (with a fresh onion session), split, or give up.
    fn resolve_remote_fail(
        &mut self,
        part_id: PartId,
        failure: PaymentFailure,
        ctx: &mut SenderCtx<'_>,
    ) {
        let Some(PartStatus::WaitForRouteOrInFlight(wait)) =
            self.parts.remove(&part_id)
        else {
            return;
        };
        self.failures.insert(0, failure);

        let Some(cmd) = &self.cmd else { return };
        let max_remote_attempts = cmd.router_conf.max_remote_attempts;
        let allowed = cmd.allowed_chans.clone();

        // The HTLC was genuinely tried, so no channel is excluded here.
        let mut sendable =
            ctx.right_now_sendable(self, &allowed, self.fee_leftover());
        shuffle(&mut sendable, &mut ctx.rng);
        let capable = sendable
            .into_iter()
            .find(|(_cnc, sendable)| *sendable >= wait.amount);

        match capable {
            Some((cnc, _sendable))
                if wait.remote_attempts < max_remote_attempts =>
            {
                // A fresh session key, so the retry is indistinguishable
                // from a new payment to everyone on the route.
                let onion_key = random_session_key(&mut ctx.rng);
                let retry = WaitForRouteOrInFlight {
                    onion_key,
                    amount: wait.amount,
                    cnc,
                    flight: None,
                    fees_tried: wait.fees_tried,
                    local_failed_chan_ids: wait.local_failed_chan_ids,
                    remote_attempts: wait.remote_attempts + 1,
                };
                debug!(
                    tag = %self.full_tag,
                    old = %part_id,
                    new = %retry.part_id(),
                    attempts = retry.remote_attempts,
                    "remote failure; retrying part"
                );
                self.parts.insert(
                    retry.part_id(),
                    PartStatus::WaitForRouteOrInFlight(retry),
                );
            }
            _ if self.outgoing_htlc_slots_left() >= 2 => {
                ctx.outbox.push_back(MasterEvent::CutIntoHalves {
                    full_tag: self.full_tag,
                    amount: wait.amount,
                });
            }
            _ => {
                self.push_local_failure(
                    LocalFailureKind::RunOutOfRetryAttempts,
                    wait.amount,
                );
                self.abort_maybe_notify();
            }
        }
    }

    pub(crate) fn on_cut_into_halves(
        &mut self,
        amount: Amount,
        ctx: &mut SenderCtx<'_>,
    ) {
        if self.state != SenderState::Pending {
            return;
        }
        let Some(cmd) = &self.cmd else { return };
        let allowed = cmd.allowed_chans.clone();

        let part_one = amount / 2;
        let part_two = amount - part_one;
        // Sequential on purpose: the second assignment must observe the
        // first's reservations.
        for part in [part_one, part_two] {
            let sendable =
                ctx.right_now_sendable(self, &allowed, self.fee_leftover());
            self.assign_to_chans(sendable, part, ctx);
        }
    }

    pub(crate) fn on_chan_got_online(&mut self, ctx: &mut SenderCtx<'_>) {
        if self.state != SenderState::Pending {
            return;
        }
        let Some(cmd) = &self.cmd else { return };
        let allowed = cmd.allowed_chans.clone();

        let waiting = self.parts.values().find_map(|part| match part {
            PartStatus::WaitForChanOnline { amount, .. } =>
                Some((part.part_id(), *amount)),
            _ => None,
        });
        if let Some((part_id, amount)) = waiting {
            self.parts.remove(&part_id);
            let sendable =
                ctx.right_now_sendable(self, &allowed, self.fee_leftover());
            self.assign_to_chans(sendable, amount, ctx);
        }
    }

    /// The abort timer armed by the latest `assign_to_chans` fired.
    pub(crate) fn on_timeout(&mut self, generation: u64) {
        if generation != self.abort_generation {
            return;
        }
        if self.state != SenderState::Pending {
            return;
        }
        let waiting = self
            .parts
            .values()
            .filter_map(|part| match part {
                PartStatus::WaitForChanOnline { amount, .. } =>
                    Some((part.part_id(), *amount)),
                _ => None,
            })
            .collect::<Vec<_>>();
        if waiting.is_empty() {
            return;
        }
        warn!(tag = %self.full_tag, "timed out waiting for a channel");
        for (part_id, amount) in waiting {
            self.parts.remove(&part_id);
            self.push_local_failure(LocalFailureKind::TimedOut, amount);
        }
        self.abort_maybe_notify();
    }

    pub(crate) fn on_in_flight_payments(&mut self, bag: &InFlightBag) {
        let no_local_flight = !self.parts.values().any(PartStatus::is_in_flight);
        let no_chan_leftovers = !bag.contains(&self.full_tag);
        if !(no_local_flight && no_chan_leftovers) || self.final_notified {
            return;
        }
        match self.state {
            SenderState::Succeeded => {
                info!(tag = %self.full_tag, "whole payment succeeded");
                self.final_notified = true;
                let snapshot = self.snapshot();
                for listener in &self.listeners {
                    listener.whole_payment_succeeded(&snapshot);
                }
            }
            SenderState::Aborted => {
                info!(tag = %self.full_tag, "whole payment failed");
                self.final_notified = true;
                let snapshot = self.snapshot();
                for listener in &self.listeners {
                    listener.whole_payment_failed(&snapshot);
                }
            }
            _ => {}
        }
    }

    // --- Internals --- //

    /// Greedily assign `amount` across the given sendable channels, direct
    /// channels to the target first and the rest shuffled. Either installs
    /// the new parts (fully assigned, or a wait-for-online part backed by
    /// sleeping capacity) or aborts the payment with `NOT_ENOUGH_FUNDS`.
    /// Always re-arms the abort timer.
    fn assign_to_chans(
        &mut self,
        mut sendable: Vec<(ChanAndCommits, Amount)>,
        amount: Amount,
        ctx: &mut SenderCtx<'_>,
    ) {
        let Some(cmd) = &self.cmd else { return };
        let target = cmd.target_node_id;
        let allowed = cmd.allowed_chans.clone();

        shuffle(&mut sendable, &mut ctx.rng);
        // Stable sort keeps the shuffle within each group.
        sendable.sort_by_key(|(cnc, _sendable)| {
            cnc.commits.remote_node_id != target
        });

        let mut leftover = amount;
        let mut new_parts = Vec::new();
        for (cnc, chan_sendable) in sendable {
            if leftover.is_zero() {
                break;
            }
            // Bump sub-minimum leftovers up to the channel minimum; the
            // overshoot is tolerated by the receiver.
            let assign =
                leftover.max(cnc.commits.min_sendable).min(chan_sendable);
            if assign < cnc.commits.min_sendable {
                continue;
            }
            let onion_key = random_session_key(&mut ctx.rng);
            new_parts.push(WaitForRouteOrInFlight::new(onion_key, assign, cnc));
            leftover = leftover.saturating_sub(assign);
        }

        if leftover.is_zero() {
            for wait in new_parts {
                debug!(
                    tag = %self.full_tag,
                    part = %wait.part_id(),
                    amount = %wait.amount,
                    chan = %wait.cnc.commits.channel_id,
                    "part assigned"
                );
                self.parts.insert(
                    wait.part_id(),
                    PartStatus::WaitForRouteOrInFlight(wait),
                );
            }
            self.state = SenderState::Pending;
        } else {
            let sleeping_total = ctx.sleeping_sendable_total(
                self,
                &allowed,
                self.fee_leftover(),
            );
            if sleeping_total >= leftover {
                // Sleeping channels could cover the rest; park the leftover
                // until one of them comes online.
                for wait in new_parts {
                    self.parts.insert(
                        wait.part_id(),
                        PartStatus::WaitForRouteOrInFlight(wait),
                    );
                }
                let onion_key = random_session_key(&mut ctx.rng);
                let part_id = PartId::from_onion_key(&onion_key);
                info!(
                    tag = %self.full_tag,
                    amount = %leftover,
                    "parking part until a channel comes online"
                );
                self.parts.insert(
                    part_id,
                    PartStatus::WaitForChanOnline {
                        onion_key,
                        amount: leftover,
                    },
                );
                self.state = SenderState::Pending;
            } else {
                self.push_local_failure(
                    LocalFailureKind::NotEnoughFunds,
                    amount,
                );
                self.abort_maybe_notify();
            }
        }

        self.abort_generation += 1;
        ctx.timers.arm(self.full_tag, self.abort_generation);
    }

    /// Move a route-less part to another channel, reusing the onion key:
    /// no HTLC ever left the node, so the session is still unexposed.
    fn one_more_local_attempt(&mut self, part_id: PartId, cnc: ChanAndCommits) {
        if let Some(PartStatus::WaitForRouteOrInFlight(wait)) =
            self.parts.get_mut(&part_id)
        {
            wait.local_failed_chan_ids.push(wait.cnc.commits.channel_id);
            wait.cnc = cnc;
            wait.flight = None;
        }
    }

    fn push_local_failure(&mut self, kind: LocalFailureKind, amount: Amount) {
        warn!(tag = %self.full_tag, %kind, %amount, "part failed");
        self.failures.insert(0, PaymentFailure::Local { kind, amount });
    }

    /// Enter `Aborted`. If nothing is left in flight locally and no allowed
    /// channel still holds an outgoing HTLC with this tag, notify listeners
    /// of the final failure (once).
    fn abort_maybe_notify(&mut self) {
        self.state = SenderState::Aborted;
        let no_local_flight = !self.parts.values().any(PartStatus::is_in_flight);
        let no_chan_leftovers = match &self.cmd {
            Some(cmd) => !cmd.allowed_chans.iter().any(|chan| {
                chan.commits()
                    .all_outgoing
                    .iter()
                    .any(|htlc| htlc.tag == self.full_tag)
            }),
            None => true,
        };
        if no_local_flight && no_chan_leftovers && !self.final_notified {
            info!(tag = %self.full_tag, "whole payment failed");
            self.final_notified = true;
            let snapshot = self.snapshot();
            for listener in &self.listeners {
                listener.whole_payment_failed(&snapshot);
            }
        }
    }
}

fn chans_excluding(
    chans: &[Arc<dyn Channel>],
    excluded: &[ChannelId],
) -> Vec<Arc<dyn Channel>> {
    chans
        .iter()
        .filter(|chan| !excluded.contains(&chan.commits().channel_id))
        .cloned()
        .collect()
}
