//! The payment master FSM and its event loop.
//!
//! The master is the singleton coordinator (one per wallet process): it owns
//! the sender registry and the failure ledger, serialises route requests so
//! the path-finder only ever sees one outstanding search, and fans channel
//! events out to the senders that own them.
//!
//! Concurrency model: one logical single-threaded worker. [`PaymentMaster`]
//! enqueues events onto an unbounded channel; the worker drains it and runs
//! each handler to completion. Handlers never block: external collaborators
//! are invoked through non-blocking trait methods and answer with later
//! events. Follow-up events a handler produces (including its own
//! "self-posts") go through an internal outbox which is drained FIFO before
//! the next external event, so a remote failure's ledger updates are always
//! applied before the affected part's next route request.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use common::{
    amount::Amount,
    rng::Crng,
    task::Task,
    time::TimestampMs,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    channel::{InFlightBag, LocalReject, RemoteFulfill, RemoteReject},
    config::RouterConf,
    gossip::{ChannelDesc, DescAndCapacity},
    ledger::FailureLedger,
    primitives::{FullPaymentTag, NodePk, PartId},
    router::{PathFinder, Route, RouteRequest},
    sendable,
    sender::{
        PaymentListener, PaymentSender, SendPayment, SenderCtx,
    },
    sphinx::OnionCrypto,
};

// --- Abort timers --- //

/// Re-armable per-sender abort timers. Armed after every part assignment;
/// when a timer fires it must deliver a [`MasterEvent::SenderTimeout`]
/// carrying the same generation back to the master.
pub trait AbortTimers: Send + Sync {
    fn arm(&self, full_tag: FullPaymentTag, generation: u64);
}

/// The production [`AbortTimers`]: one detached sleep task per arming.
/// Stale generations are ignored by the sender, so re-arming does not need
/// to cancel the previous task.
pub struct TokioAbortTimers {
    tx: mpsc::UnboundedSender<MasterEvent>,
    delay: Duration,
}

impl AbortTimers for TokioAbortTimers {
    fn arm(&self, full_tag: FullPaymentTag, generation: u64) {
        let tx = self.tx.clone();
        let delay = self.delay;
        tokio::task::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(MasterEvent::SenderTimeout {
                full_tag,
                generation,
            });
        });
    }
}

// --- Events --- //

/// Everything the master reacts to: host commands, channel events,
/// path-finder answers, and the engine's own internal follow-ups.
pub enum MasterEvent {
    /// Register a new sender for `full_tag`.
    CreateSender {
        full_tag: FullPaymentTag,
        listeners: Vec<Arc<dyn PaymentListener>>,
    },
    /// Drop the sender for `full_tag`.
    RemoveSender { full_tag: FullPaymentTag },
    /// Start (or restart) the payment for the registered sender.
    SendPayment(Box<SendPayment>),
    /// Some channel's peer reconnected; parked parts may become assignable.
    ChanGotOnline,
    /// The host's chain watcher learned a new tip height.
    ChainTipKnown(u32),
    /// Give every sender a chance to request a route for a waiting part.
    AskForRoute,
    /// A sender wants a route; forwarded to the path-finder when free.
    RouteRequest(Box<RouteRequest>),
    /// Path-finder answer.
    RouteFound {
        full_tag: FullPaymentTag,
        part_id: PartId,
        route: Route,
    },
    /// Path-finder answer: nothing found under the current filters.
    NoRouteAvailable {
        full_tag: FullPaymentTag,
        part_id: PartId,
    },
    /// Ledger update: a directed channel failed at its current usage.
    ChannelFailedAtAmount(DescAndCapacity),
    /// Ledger update: bump a node's strange-failure counter.
    NodeFailed { node_id: NodePk, increment: u32 },
    /// Ledger update: exclude an edge until the next reduction.
    ChannelNotRoutable(ChannelDesc),
    /// A sender wants an amount re-assigned as two halves.
    CutIntoHalves {
        full_tag: FullPaymentTag,
        amount: Amount,
    },
    /// Host-collected snapshot of HTLCs still present in channels; drives
    /// final success / failure notifications.
    InFlightPayments(InFlightBag),
    /// A channel refused an add-HTLC command locally.
    LocalReject(LocalReject),
    /// A remote peer revealed a preimage.
    RemoteFulfill(RemoteFulfill),
    /// A remote peer failed one of our HTLCs.
    RemoteReject(RemoteReject),
    /// A sender's abort timer fired.
    SenderTimeout {
        full_tag: FullPaymentTag,
        generation: u64,
    },
    /// Stop the worker loop.
    Shutdown,
}

/// Whether the path-finder currently has an outstanding search. Strictly
/// used to serialise one route request at a time per process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MasterPhase {
    ExpectingPayments,
    WaitingForRoute,
}

// --- The master state machine --- //

/// All master-owned state. Only ever touched from the worker; tests drive
/// it directly through [`MasterState::process`] for deterministic ordering.
pub struct MasterState {
    phase: MasterPhase,
    senders: HashMap<FullPaymentTag, PaymentSender>,
    ledger: FailureLedger,
    conf: RouterConf,
    chain_tip: u32,
    path_finder: Arc<dyn PathFinder>,
    crypto: Arc<dyn OnionCrypto>,
    timers: Arc<dyn AbortTimers>,
    rng: Box<dyn Crng + Send>,
    outbox: VecDeque<MasterEvent>,
}

impl MasterState {
    pub fn new(
        conf: RouterConf,
        path_finder: Arc<dyn PathFinder>,
        crypto: Arc<dyn OnionCrypto>,
        timers: Arc<dyn AbortTimers>,
        rng: impl Crng + Send + 'static,
    ) -> Self {
        Self {
            phase: MasterPhase::ExpectingPayments,
            senders: HashMap::new(),
            ledger: FailureLedger::default(),
            conf,
            chain_tip: 0,
            path_finder,
            crypto,
            timers,
            rng: Box::new(rng),
            outbox: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> MasterPhase {
        self.phase
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub fn sender(&self, full_tag: &FullPaymentTag) -> Option<&PaymentSender> {
        self.senders.get(full_tag)
    }

    /// Handle one event to completion, then drain every follow-up event it
    /// produced, FIFO.
    pub fn process(&mut self, event: MasterEvent) {
        self.handle(event);
        while let Some(follow_up) = self.outbox.pop_front() {
            self.handle(follow_up);
        }
    }

    fn handle(&mut self, event: MasterEvent) {
        match event {
            MasterEvent::CreateSender { full_tag, listeners } => {
                if self.senders.contains_key(&full_tag) {
                    warn!(tag = %full_tag, "sender already registered");
                    return;
                }
                info!(tag = %full_tag, "sender created");
                self.senders
                    .insert(full_tag, PaymentSender::new(full_tag, listeners));
            }

            MasterEvent::RemoveSender { full_tag } => {
                match self.senders.remove(&full_tag) {
                    Some(sender) => {
                        info!(tag = %full_tag, state = ?sender.state(), "sender removed")
                    }
                    None => debug!(tag = %full_tag, "no sender to remove"),
                }
            }

            MasterEvent::SendPayment(cmd) => {
                let full_tag = cmd.full_tag;
                if !self.senders.contains_key(&full_tag) {
                    warn!(tag = %full_tag, "SendPayment without a sender; dropping");
                    return;
                }
                if cmd.clear_failures {
                    self.ledger.reduce(
                        TimestampMs::now(),
                        cmd.router_conf.failed_chan_recovery_msec,
                    );
                }
                for edge in &cmd.assisted_edges {
                    self.path_finder.learn_edge(*edge);
                }
                self.with_sender(full_tag, |sender, ctx| {
                    sender.on_send_payment(*cmd, ctx)
                });
                self.outbox.push_back(MasterEvent::AskForRoute);
            }

            MasterEvent::ChanGotOnline => {
                self.broadcast(|sender, ctx| sender.on_chan_got_online(ctx));
                self.outbox.push_back(MasterEvent::AskForRoute);
            }

            MasterEvent::ChainTipKnown(height) => {
                self.chain_tip = height;
            }

            MasterEvent::AskForRoute => {
                if self.phase == MasterPhase::ExpectingPayments {
                    self.broadcast(|sender, ctx| sender.on_ask_for_route(ctx));
                }
            }

            MasterEvent::RouteRequest(request) => match self.phase {
                MasterPhase::ExpectingPayments => {
                    let used = self.used_capacities();
                    let (ignore_nodes, ignore_channels) = self
                        .ledger
                        .ignorables(request.amount, &used, &self.conf);
                    let mut request = *request;
                    request.ignore_nodes = ignore_nodes;
                    request.ignore_channels = ignore_channels;
                    info!(
                        tag = %request.full_tag,
                        amount = %request.amount,
                        ignored_nodes = request.ignore_nodes.len(),
                        ignored_channels = request.ignore_channels.len(),
                        "requesting route"
                    );
                    self.path_finder.find_route(request);
                    self.phase = MasterPhase::WaitingForRoute;
                }
                MasterPhase::WaitingForRoute => {
                    // The sender will re-surface this on the next
                    // AskForRoute round.
                    debug!("path-finder busy; dropping route request");
                }
            },

            MasterEvent::RouteFound { full_tag, part_id, route } => {
                self.phase = MasterPhase::ExpectingPayments;
                self.with_sender(full_tag, |sender, ctx| {
                    sender.on_route_found(part_id, route, ctx)
                });
                self.outbox.push_back(MasterEvent::AskForRoute);
            }

            MasterEvent::NoRouteAvailable { full_tag, part_id } => {
                self.phase = MasterPhase::ExpectingPayments;
                self.with_sender(full_tag, |sender, ctx| {
                    sender.on_no_route(part_id, ctx)
                });
                self.outbox.push_back(MasterEvent::AskForRoute);
            }

            MasterEvent::ChannelFailedAtAmount(dac) => {
                let used_now = self
                    .used_capacities()
                    .get(&dac)
                    .copied()
                    .unwrap_or(Amount::ZERO);
                self.ledger.channel_failed(dac, used_now, TimestampMs::now());
            }

            MasterEvent::NodeFailed { node_id, increment } => {
                self.ledger.node_failed(node_id, increment);
            }

            MasterEvent::ChannelNotRoutable(desc) => {
                self.ledger.mark_not_routable(desc);
            }

            MasterEvent::CutIntoHalves { full_tag, amount } => {
                self.with_sender(full_tag, |sender, ctx| {
                    sender.on_cut_into_halves(amount, ctx)
                });
            }

            MasterEvent::InFlightPayments(bag) => {
                for sender in self.senders.values_mut() {
                    sender.on_in_flight_payments(&bag);
                }
            }

            MasterEvent::LocalReject(reject) => {
                self.with_sender(reject.add.full_tag, |sender, ctx| {
                    sender.on_local_reject(reject, ctx)
                });
                self.outbox.push_back(MasterEvent::AskForRoute);
            }

            MasterEvent::RemoteFulfill(fulfill) => {
                match self.senders.get_mut(&fulfill.add.full_tag) {
                    Some(sender) => sender.on_remote_fulfill(fulfill),
                    None => debug!("RemoteFulfill for an unknown payment"),
                }
                self.outbox.push_back(MasterEvent::AskForRoute);
            }

            MasterEvent::RemoteReject(reject) => {
                self.with_sender(reject.add().full_tag, |sender, ctx| {
                    sender.on_remote_reject(reject, ctx)
                });
                self.outbox.push_back(MasterEvent::AskForRoute);
            }

            MasterEvent::SenderTimeout { full_tag, generation } => {
                match self.senders.get_mut(&full_tag) {
                    Some(sender) => sender.on_timeout(generation),
                    None => debug!(tag = %full_tag, "timeout for a gone sender"),
                }
            }

            MasterEvent::Shutdown => {
                // Handled by the worker loop; nothing to do on the state.
            }
        }
    }

    /// Current external-channel utilisation across every sender's in-flight
    /// parts.
    fn used_capacities(&self) -> HashMap<DescAndCapacity, Amount> {
        sendable::used_capacities(self.senders.values().flat_map(|sender| {
            sender.in_flight_parts().filter_map(|wait| {
                wait.flight
                    .as_ref()
                    .map(|flight| (&flight.route, flight.cmd.first_amount))
            })
        }))
    }

    /// Run `f` against one sender with a context that can see every *other*
    /// sender (for cross-payment reservation accounting) and push follow-up
    /// events.
    fn with_sender(
        &mut self,
        full_tag: FullPaymentTag,
        f: impl FnOnce(&mut PaymentSender, &mut SenderCtx<'_>),
    ) {
        let Some(mut sender) = self.senders.remove(&full_tag) else {
            debug!(tag = %full_tag, "event for an unknown sender");
            return;
        };
        let mut ctx = SenderCtx {
            others: &self.senders,
            outbox: &mut self.outbox,
            rng: &mut *self.rng,
            timers: self.timers.as_ref(),
            crypto: self.crypto.as_ref(),
            path_finder: self.path_finder.as_ref(),
            chain_tip: self.chain_tip,
        };
        f(&mut sender, &mut ctx);
        self.senders.insert(full_tag, sender);
    }

    fn broadcast(
        &mut self,
        mut f: impl FnMut(&mut PaymentSender, &mut SenderCtx<'_>),
    ) {
        let tags = self.senders.keys().copied().collect::<Vec<_>>();
        for tag in tags {
            self.with_sender(tag, &mut f);
        }
    }
}

// --- The public handle --- //

/// Cloneable handle to a spawned payment master. All methods enqueue an
/// event and return immediately.
#[derive(Clone)]
pub struct PaymentMaster {
    tx: mpsc::UnboundedSender<MasterEvent>,
}

impl PaymentMaster {
    /// Spawn a master worker onto the current tokio runtime.
    pub fn spawn(
        conf: RouterConf,
        path_finder: Arc<dyn PathFinder>,
        crypto: Arc<dyn OnionCrypto>,
        rng: impl Crng + Send + 'static,
    ) -> (Self, Task<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = Arc::new(TokioAbortTimers {
            tx: tx.clone(),
            delay: Duration::from_millis(conf.sender_timeout_msec),
        });
        let state = MasterState::new(conf, path_finder, crypto, timers, rng);
        let task = Task::spawn(run(state, rx));
        (Self { tx }, task)
    }

    pub fn process(&self, event: MasterEvent) {
        if self.tx.send(event).is_err() {
            warn!("payment master worker has shut down");
        }
    }

    pub fn create_sender(
        &self,
        full_tag: FullPaymentTag,
        listeners: Vec<Arc<dyn PaymentListener>>,
    ) {
        self.process(MasterEvent::CreateSender { full_tag, listeners });
    }

    pub fn remove_sender(&self, full_tag: FullPaymentTag) {
        self.process(MasterEvent::RemoveSender { full_tag });
    }

    pub fn send(&self, cmd: SendPayment) {
        self.process(MasterEvent::SendPayment(Box::new(cmd)));
    }

    pub fn chan_got_online(&self) {
        self.process(MasterEvent::ChanGotOnline);
    }

    pub fn chain_tip_known(&self, height: u32) {
        self.process(MasterEvent::ChainTipKnown(height));
    }

    pub fn in_flight_payments(&self, bag: InFlightBag) {
        self.process(MasterEvent::InFlightPayments(bag));
    }

    pub fn local_reject(&self, reject: LocalReject) {
        self.process(MasterEvent::LocalReject(reject));
    }

    pub fn remote_fulfill(&self, fulfill: RemoteFulfill) {
        self.process(MasterEvent::RemoteFulfill(fulfill));
    }

    pub fn remote_reject(&self, reject: RemoteReject) {
        self.process(MasterEvent::RemoteReject(reject));
    }

    /// Path-finder answer entry point.
    pub fn route_found(
        &self,
        full_tag: FullPaymentTag,
        part_id: PartId,
        route: Route,
    ) {
        self.process(MasterEvent::RouteFound { full_tag, part_id, route });
    }

    /// Path-finder answer entry point.
    pub fn no_route_available(
        &self,
        full_tag: FullPaymentTag,
        part_id: PartId,
    ) {
        self.process(MasterEvent::NoRouteAvailable { full_tag, part_id });
    }

    pub fn shutdown(&self) {
        self.process(MasterEvent::Shutdown);
    }
}

async fn run(
    mut state: MasterState,
    mut rx: mpsc::UnboundedReceiver<MasterEvent>,
) {
    while let Some(event) = rx.recv().await {
        if matches!(event, MasterEvent::Shutdown) {
            break;
        }
        state.process(event);
    }
    debug!("payment master worker stopped");
}

#[cfg(test)]
mod test {
    use common::rng::FastRng;
    use proptest::{prop_assert, proptest, test_runner::Config};

    use crate::{
        channel::{ChannelId, ChannelState},
        gossip::{GraphEdge, ShortChannelId},
        primitives::{PaymentPreimage, PaymentSecret},
        sender::{
            ChainExpiry, LocalFailureKind, PartStatus, PaymentFailure,
            SenderState, SplitInfo,
        },
        sphinx::{DecryptedFailurePacket, FailureMessage},
        test_utils::{
            edge, full_tag, node_pk, ListenerEvent, MockChannel,
            MockOnionCrypto, MockPathFinder, RecordingListener,
            RecordingTimers,
        },
    };

    use super::*;

    struct Harness {
        state: MasterState,
        path_finder: Arc<MockPathFinder>,
        crypto: Arc<MockOnionCrypto>,
        timers: Arc<RecordingTimers>,
        listener: Arc<RecordingListener>,
    }

    fn harness(seed: u64) -> Harness {
        crate::logger::init_for_testing();
        let path_finder = Arc::new(MockPathFinder::default());
        let crypto = Arc::new(MockOnionCrypto::new());
        let timers = Arc::new(RecordingTimers::default());
        let listener = Arc::new(RecordingListener::default());
        let state = MasterState::new(
            RouterConf::default(),
            path_finder.clone(),
            crypto.clone(),
            timers.clone(),
            FastRng::from_u64(seed),
        );
        Harness { state, path_finder, crypto, timers, listener }
    }

    impl Harness {
        fn register(&mut self, full_tag: FullPaymentTag) {
            self.state.process(MasterEvent::CreateSender {
                full_tag,
                listeners: vec![self.listener.clone()],
            });
        }

        fn send(&mut self, cmd: SendPayment) {
            self.state.process(MasterEvent::SendPayment(Box::new(cmd)));
        }

        fn sender(&self, tag: &FullPaymentTag) -> &PaymentSender {
            self.state.sender(tag).expect("sender registered")
        }
    }

    fn send_cmd(
        full_tag: FullPaymentTag,
        target: NodePk,
        my_part_msat: u64,
        fee_reserve_msat: u64,
        allowed_chans: Vec<Arc<dyn crate::channel::Channel>>,
    ) -> SendPayment {
        SendPayment {
            full_tag,
            split: SplitInfo {
                total_sum: Amount::from_msat(my_part_msat),
                my_part: Amount::from_msat(my_part_msat),
            },
            target_node_id: target,
            chain_expiry: ChainExpiry::Absolute(800_000),
            router_conf: RouterConf::default(),
            total_fee_reserve: Amount::from_msat(fee_reserve_msat),
            allowed_chans,
            outer_payment_secret: PaymentSecret([9u8; 32]),
            payee_metadata: None,
            assisted_edges: Vec::new(),
            onion_tlvs: Vec::new(),
            user_custom_tlvs: Vec::new(),
            clear_failures: false,
        }
    }

    fn assert_part_ids_consistent(sender: &PaymentSender) {
        for (part_id, part) in sender.parts() {
            assert_eq!(*part_id, part.part_id());
        }
    }

    fn wait_parts(sender: &PaymentSender) -> Vec<&crate::sender::WaitForRouteOrInFlight> {
        sender
            .parts()
            .values()
            .filter_map(|part| match part {
                PartStatus::WaitForRouteOrInFlight(wait) => Some(wait),
                PartStatus::WaitForChanOnline { .. } => None,
            })
            .collect()
    }

    // Scenario: single channel, success end to end.
    #[test]
    fn single_channel_success() {
        let mut h = harness(1);
        let tag = full_tag(7);
        let target = node_pk(3);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(1_000_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 500_000, 5_000, vec![chan.clone()]));

        // Exactly one part, one route request, path-finder busy.
        assert_eq!(h.sender(&tag).state(), SenderState::Pending);
        assert_eq!(h.sender(&tag).parts().len(), 1);
        assert_part_ids_consistent(h.sender(&tag));
        assert_eq!(h.path_finder.request_count(), 1);
        assert_eq!(h.state.phase(), MasterPhase::WaitingForRoute);

        let request = h.path_finder.last_request();
        assert_eq!(request.amount, Amount::from_msat(500_000));
        assert_eq!(request.source, NodePk::payer_placeholder());
        assert_eq!(request.local_edge.desc.to, node_pk(1));

        // A route through our peer with a 2_000 msat fee.
        let route = Route {
            hops: vec![
                GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                edge(1, 3, ShortChannelId(13), 2_000, 0),
            ],
        };
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route,
        });

        let sent = chan.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].first_amount, Amount::from_msat(502_000));
        assert_eq!(sent[0].first_expiry, 800_040);
        assert_eq!(h.sender(&tag).used_fee(), Amount::from_msat(2_000));
        assert_eq!(h.state.phase(), MasterPhase::ExpectingPayments);

        // The remote fulfills; the preimage callback sees the original
        // state, routes intact.
        h.state.process(MasterEvent::RemoteFulfill(RemoteFulfill {
            add: sent[0].clone(),
            preimage: PaymentPreimage([5u8; 32]),
        }));
        assert_eq!(h.sender(&tag).state(), SenderState::Succeeded);

        // Host reports no leftover HTLCs; the payment finalizes.
        h.state.process(MasterEvent::InFlightPayments(InFlightBag::default()));

        let events = h.listener.events();
        assert_eq!(events.len(), 2);
        let ListenerEvent::FirstPreimage(snapshot) = &events[0] else {
            panic!("expected FirstPreimage, got {:?}", events[0]);
        };
        assert_eq!(snapshot.used_fee, Amount::from_msat(2_000));
        assert_eq!(snapshot.parts.len(), 1);
        assert!(matches!(&events[1], ListenerEvent::Succeeded(_)));

        // Finalization fires exactly once.
        h.state.process(MasterEvent::InFlightPayments(InFlightBag::default()));
        assert_eq!(h.listener.events().len(), 2);
    }

    // Scenario: the amount splits across two channels, direct-to-target
    // channel first.
    #[test]
    fn split_across_two_channels() {
        let mut h = harness(2);
        let tag = full_tag(8);
        let target = node_pk(5);
        // c1 is a direct channel to the target, c2 goes through peer 2.
        let c1 = Arc::new(
            MockChannel::new(1)
                .remote(target)
                .available_for_send(305_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        let c2 = Arc::new(
            MockChannel::new(2)
                .available_for_send(305_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(
            tag,
            target,
            500_000,
            5_000,
            vec![c1.clone(), c2.clone()],
        ));

        // Two parts totalling 500_000, the direct channel filled first.
        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Pending);
        assert_part_ids_consistent(sender);
        let parts = wait_parts(sender);
        assert_eq!(parts.len(), 2);
        let total: Amount = parts.iter().map(|wait| wait.amount).sum();
        assert_eq!(total, Amount::from_msat(500_000));
        let direct = parts
            .iter()
            .find(|wait| wait.cnc.commits.channel_id == ChannelId([1u8; 32]))
            .expect("direct channel part");
        assert_eq!(direct.amount, Amount::from_msat(300_000));

        // First route request is for the largest part (the direct one).
        let request1 = h.path_finder.last_request();
        assert_eq!(request1.amount, Amount::from_msat(300_000));
        let route1 = Route {
            hops: vec![GraphEdge::fake_local(target, ShortChannelId(1))],
        };
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request1.part_id,
            route: route1,
        });

        // The response frees the path-finder and the second part asks.
        assert_eq!(h.path_finder.request_count(), 2);
        let request2 = h.path_finder.last_request();
        assert_eq!(request2.amount, Amount::from_msat(200_000));
        let route2 = Route {
            hops: vec![
                GraphEdge::fake_local(node_pk(2), ShortChannelId(2)),
                edge(2, 5, ShortChannelId(25), 0, 0),
            ],
        };
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request2.part_id,
            route: route2,
        });

        assert_eq!(c1.sent().len(), 1);
        assert_eq!(c2.sent().len(), 1);
        assert!(h.sender(&tag).used_fee() <= Amount::from_msat(5_000));

        // Both parts settle.
        h.state.process(MasterEvent::RemoteFulfill(RemoteFulfill {
            add: c1.sent()[0].clone(),
            preimage: PaymentPreimage([5u8; 32]),
        }));
        h.state.process(MasterEvent::RemoteFulfill(RemoteFulfill {
            add: c2.sent()[0].clone(),
            preimage: PaymentPreimage([5u8; 32]),
        }));
        h.state.process(MasterEvent::InFlightPayments(InFlightBag::default()));

        let events = h.listener.events();
        let preimages = events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::FirstPreimage(_)))
            .count();
        let successes = events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::Succeeded(_)))
            .count();
        assert_eq!(preimages, 1);
        assert_eq!(successes, 1);
    }

    // Scenario: a part with no route gets cut into halves.
    #[test]
    fn no_route_cuts_part_into_halves() {
        let mut h = harness(3);
        let tag = full_tag(9);
        let target = node_pk(5);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(1_000_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 600_000, 5_000, vec![chan.clone()]));

        let request = h.path_finder.last_request();
        assert_eq!(request.amount, Amount::from_msat(600_000));
        h.state.process(MasterEvent::NoRouteAvailable {
            full_tag: tag,
            part_id: request.part_id,
        });

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Pending);
        assert_part_ids_consistent(sender);
        let mut amounts = sender
            .parts()
            .values()
            .map(|part| part.amount())
            .collect::<Vec<_>>();
        amounts.sort();
        assert_eq!(
            amounts,
            vec![Amount::from_msat(300_000), Amount::from_msat(300_000)]
        );

        // One of the halves is already asking for a route.
        assert_eq!(h.path_finder.request_count(), 2);
        assert_eq!(
            h.path_finder.last_request().amount,
            Amount::from_msat(300_000)
        );
    }

    // Scenario: a valid remote `Update` with our scid fails the channel at
    // amount, penalises the origin, and retries on the other channel with a
    // fresh onion key.
    #[test]
    fn remote_update_failure_retries_on_other_channel() {
        let mut h = harness(4);
        let tag = full_tag(10);
        let target = node_pk(3);
        let c1 = Arc::new(
            MockChannel::new(1)
                .available_for_send(405_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        // Not sendable initially, so the part deterministically lands on c1.
        let c2 = Arc::new(
            MockChannel::new(2)
                .available_for_send(5_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(
            tag,
            target,
            400_000,
            5_000,
            vec![c1.clone(), c2.clone()],
        ));

        let request = h.path_finder.last_request();
        let relay = edge(1, 3, ShortChannelId(13), 1_000, 0);
        let route = Route {
            hops: vec![
                GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                relay,
            ],
        };
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route,
        });
        let add = c1.sent()[0].clone();
        let old_part_id = add.part_id;
        assert_eq!(add.first_amount, Amount::from_msat(401_000));

        // Channel conditions change before the failure arrives.
        c1.set_available_for_send(100_000);
        c2.set_available_for_send(405_000);

        // Node 1 answers with its current (identical) update, re-signed.
        let mut update = relay.update;
        update.timestamp += 1;
        h.crypto.register_failure(
            vec![0xde, 0xad],
            DecryptedFailurePacket {
                origin_node: node_pk(1),
                failure: FailureMessage::Update(update),
            },
        );
        h.state.process(MasterEvent::RemoteReject(RemoteReject::Fail {
            add,
            reason: vec![0xde, 0xad],
        }));

        // Ledger: channel failed at amount, direction counter bumped, node
        // counter bumped by one.
        let dac = relay.to_desc_and_capacity();
        assert!(h.state.ledger().chan_failed_at_amount.contains_key(&dac));
        assert_eq!(h.state.ledger().direction_failed_times[&relay.desc], 1);
        assert_eq!(
            h.state.ledger().node_failed_unknown_update_times[&node_pk(1)],
            1
        );
        // The update was installed into the path-finder.
        assert_eq!(h.path_finder.updates.lock().unwrap().len(), 1);

        // The part moved to c2 with a fresh session key and one remote
        // attempt on the clock.
        let sender = h.sender(&tag);
        assert_part_ids_consistent(sender);
        let parts = wait_parts(sender);
        assert_eq!(parts.len(), 1);
        let retry = parts[0];
        assert_eq!(retry.cnc.commits.channel_id, ChannelId([2u8; 32]));
        assert_eq!(retry.remote_attempts, 1);
        assert_ne!(retry.part_id(), old_part_id);
        assert!(retry.flight.is_none());
        assert_eq!(sender.used_fee(), Amount::ZERO);

        // The follow-up route request routes around the failed channel.
        assert_eq!(h.path_finder.request_count(), 2);
        let request2 = h.path_finder.last_request();
        assert_eq!(request2.amount, Amount::from_msat(400_000));
        assert!(request2.ignore_channels.contains(&relay.desc));
    }

    // Scenario: every channel stays asleep and the abort timer fires.
    #[test]
    fn timed_out_waiting_for_channel_online() {
        let mut h = harness(5);
        let tag = full_tag(11);
        let target = node_pk(5);
        let chan = Arc::new(
            MockChannel::new(1)
                .sleeping()
                .available_for_send(1_000_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 500_000, 5_000, vec![chan.clone()]));

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Pending);
        assert!(sender
            .parts()
            .values()
            .all(|part| matches!(part, PartStatus::WaitForChanOnline { .. })));

        // A stale timer generation is ignored.
        h.state.process(MasterEvent::SenderTimeout {
            full_tag: tag,
            generation: 0,
        });
        assert_eq!(h.sender(&tag).state(), SenderState::Pending);

        // The armed generation fires.
        let generation = h.timers.last_generation();
        h.state.process(MasterEvent::SenderTimeout {
            full_tag: tag,
            generation,
        });

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Aborted);
        assert!(matches!(
            sender.failures()[0],
            PaymentFailure::Local {
                kind: LocalFailureKind::TimedOut,
                amount,
            } if amount == Amount::from_msat(500_000)
        ));

        let events = h.listener.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ListenerEvent::Failed(_)));
    }

    // Scenario: an `Update` failure with a bogus signature severely
    // penalises the origin and keeps it out of subsequent route requests.
    #[test]
    fn invalid_failure_signature_bans_the_origin() {
        let mut h = harness(6);
        let tag = full_tag(12);
        let target = node_pk(3);
        let c1 = Arc::new(
            MockChannel::new(1)
                .available_for_send(405_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        let c2 = Arc::new(
            MockChannel::new(2)
                .available_for_send(405_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(
            tag,
            target,
            400_000,
            5_000,
            vec![c1.clone(), c2.clone()],
        ));

        let request = h.path_finder.last_request();
        let reserved = wait_parts(h.sender(&tag))[0].cnc.commits.clone();
        let relay_from = if reserved.channel_id == ChannelId([1u8; 32]) {
            1
        } else {
            2
        };
        let relay = edge(relay_from, 3, ShortChannelId(13), 1_000, 0);
        let route = Route {
            hops: vec![
                GraphEdge::fake_local(
                    reserved.remote_node_id,
                    ShortChannelId(1),
                ),
                relay,
            ],
        };
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route,
        });
        let sent_by_c1 = !c1.sent().is_empty();
        let add = if sent_by_c1 { c1.sent()[0].clone() } else { c2.sent()[0].clone() };

        h.crypto.set_sig_valid(false);
        h.crypto.register_failure(
            vec![0xba, 0xdd],
            DecryptedFailurePacket {
                origin_node: node_pk(relay_from),
                failure: FailureMessage::Update(relay.update),
            },
        );
        h.state.process(MasterEvent::RemoteReject(RemoteReject::Fail {
            add,
            reason: vec![0xba, 0xdd],
        }));

        // Severe penalty: maxStrangeNodeFailures * 32.
        let conf = RouterConf::default();
        assert_eq!(
            h.state.ledger().node_failed_unknown_update_times
                [&node_pk(relay_from)],
            conf.max_strange_node_failures * 32
        );
        // The forged update was never installed.
        assert!(h.path_finder.updates.lock().unwrap().is_empty());
        // No channel blame without a usable update.
        assert!(h.state.ledger().chan_failed_at_amount.is_empty());

        // The origin is excluded from the retry's route request.
        assert_eq!(h.path_finder.request_count(), 2);
        let request2 = h.path_finder.last_request();
        assert!(request2.ignore_nodes.contains(&node_pk(relay_from)));
    }

    // Only one path-finder request may be outstanding; others re-surface on
    // the next AskForRoute round.
    #[test]
    fn route_requests_are_serialised() {
        let mut h = harness(7);
        let tag_a = full_tag(21);
        let tag_b = full_tag(22);
        let target = node_pk(5);
        let chan_a = Arc::new(
            MockChannel::new(1)
                .available_for_send(200_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        let chan_b = Arc::new(
            MockChannel::new(2)
                .available_for_send(200_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag_a);
        h.register(tag_b);

        h.send(send_cmd(tag_a, target, 100_000, 1_000, vec![chan_a.clone()]));
        assert_eq!(h.path_finder.request_count(), 1);
        assert_eq!(h.state.phase(), MasterPhase::WaitingForRoute);

        // B assigns its part but cannot ask yet.
        h.send(send_cmd(tag_b, target, 150_000, 1_000, vec![chan_b.clone()]));
        assert_eq!(h.path_finder.request_count(), 1);

        // A's response frees the path-finder; B's request goes out.
        let request_a = h.path_finder.last_request();
        assert_eq!(request_a.full_tag, tag_a);
        let route = Route {
            hops: vec![
                GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                edge(1, 5, ShortChannelId(15), 0, 0),
            ],
        };
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag_a,
            part_id: request_a.part_id,
            route,
        });

        assert_eq!(h.path_finder.request_count(), 2);
        assert_eq!(h.path_finder.last_request().full_tag, tag_b);
    }

    // A channel going offline mid-dispatch reassigns the part, parks it,
    // and picks it back up when the channel returns.
    #[test]
    fn channel_offline_reject_parks_then_reassigns() {
        let mut h = harness(8);
        let tag = full_tag(23);
        let target = node_pk(5);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(300_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 200_000, 1_000, vec![chan.clone()]));

        let request = h.path_finder.last_request();
        let route = Route {
            hops: vec![
                GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                edge(1, 5, ShortChannelId(15), 0, 0),
            ],
        };
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route,
        });
        let add = chan.sent()[0].clone();

        // The peer disconnects before the HTLC crosses.
        chan.set_state(ChannelState::OperationalSleeping);
        h.state.process(MasterEvent::LocalReject(LocalReject {
            reason: crate::channel::LocalRejectReason::ChannelOffline,
            add,
        }));

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Pending);
        assert!(sender
            .parts()
            .values()
            .any(|part| matches!(part, PartStatus::WaitForChanOnline { .. })));

        // The peer comes back; the part is assigned and asks for a route.
        chan.set_state(ChannelState::OperationalOpen);
        let requests_before = h.path_finder.request_count();
        h.state.process(MasterEvent::ChanGotOnline);

        let sender = h.sender(&tag);
        assert_eq!(wait_parts(sender).len(), 1);
        assert_eq!(wait_parts(sender)[0].amount, Amount::from_msat(200_000));
        assert_eq!(h.path_finder.request_count(), requests_before + 1);
    }

    #[test]
    fn in_principle_not_sendable_aborts_the_payment() {
        let mut h = harness(9);
        let tag = full_tag(24);
        let target = node_pk(5);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(300_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 200_000, 1_000, vec![chan.clone()]));
        let request = h.path_finder.last_request();
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route: Route {
                hops: vec![
                    GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                    edge(1, 5, ShortChannelId(15), 0, 0),
                ],
            },
        });
        let add = chan.sent()[0].clone();

        h.state.process(MasterEvent::LocalReject(LocalReject {
            reason: crate::channel::LocalRejectReason::InPrincipleNotSendable,
            add,
        }));

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Aborted);
        assert!(matches!(
            sender.failures()[0],
            PaymentFailure::Local {
                kind: LocalFailureKind::PaymentNotSendable,
                ..
            }
        ));
        assert!(h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, ListenerEvent::Failed(_))));
    }

    #[test]
    fn not_enough_funds_aborts_immediately() {
        let mut h = harness(10);
        let tag = full_tag(25);
        let target = node_pk(5);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(100_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 500_000, 1_000, vec![chan.clone()]));

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Aborted);
        assert!(matches!(
            sender.failures()[0],
            PaymentFailure::Local {
                kind: LocalFailureKind::NotEnoughFunds,
                amount,
            } if amount == Amount::from_msat(500_000)
        ));
        assert_eq!(h.path_finder.request_count(), 0);
    }

    // A failure reported by the destination itself is terminal: the part is
    // dropped without a retry.
    #[test]
    fn destination_failure_is_terminal() {
        let mut h = harness(11);
        let tag = full_tag(26);
        let target = node_pk(3);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(300_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 200_000, 1_000, vec![chan.clone()]));
        let request = h.path_finder.last_request();
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route: Route {
                hops: vec![
                    GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                    edge(1, 3, ShortChannelId(13), 0, 0),
                ],
            },
        });
        let add = chan.sent()[0].clone();

        h.crypto.register_failure(
            vec![0x01],
            DecryptedFailurePacket {
                origin_node: target,
                failure: FailureMessage::Other(0x400f),
            },
        );
        h.state.process(MasterEvent::RemoteReject(RemoteReject::Fail {
            add,
            reason: vec![0x01],
        }));

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Aborted);
        assert!(sender.parts().is_empty());
        assert!(matches!(
            sender.failures()[0],
            PaymentFailure::Remote { .. }
        ));
        // No retry was scheduled.
        assert_eq!(h.path_finder.request_count(), 1);
    }

    #[test]
    fn exhausted_remote_attempts_fail_the_payment() {
        let mut h = harness(12);
        let tag = full_tag(27);
        let target = node_pk(3);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(300_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        let mut cmd =
            send_cmd(tag, target, 200_000, 1_000, vec![chan.clone()]);
        cmd.router_conf.max_remote_attempts = 0;
        cmd.router_conf.max_in_channel_htlcs = 1;
        h.send(cmd);

        let request = h.path_finder.last_request();
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route: Route {
                hops: vec![
                    GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                    edge(1, 3, ShortChannelId(13), 0, 0),
                ],
            },
        });
        let add = chan.sent()[0].clone();

        // A node-level failure from the relaying peer.
        h.crypto.register_failure(
            vec![0x02],
            DecryptedFailurePacket {
                origin_node: node_pk(1),
                failure: FailureMessage::Node,
            },
        );
        h.state.process(MasterEvent::RemoteReject(RemoteReject::Fail {
            add,
            reason: vec![0x02],
        }));

        let sender = h.sender(&tag);
        assert_eq!(sender.state(), SenderState::Aborted);
        assert!(matches!(
            sender.failures()[0],
            PaymentFailure::Local {
                kind: LocalFailureKind::RunOutOfRetryAttempts,
                ..
            }
        ));
        // The remote failure itself is preserved right behind the verdict.
        assert!(matches!(
            sender.failures()[1],
            PaymentFailure::Remote { .. }
        ));
    }

    // An unreadable failure packet blames the second-to-last hop.
    #[test]
    fn unreadable_failure_blames_second_to_last_hop() {
        let mut h = harness(13);
        let tag = full_tag(28);
        let target = node_pk(4);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(300_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        h.register(tag);
        h.send(send_cmd(tag, target, 200_000, 1_000, vec![chan.clone()]));
        let request = h.path_finder.last_request();
        h.state.process(MasterEvent::RouteFound {
            full_tag: tag,
            part_id: request.part_id,
            route: Route {
                hops: vec![
                    GraphEdge::fake_local(node_pk(1), ShortChannelId(1)),
                    edge(1, 2, ShortChannelId(12), 0, 0),
                    edge(2, 4, ShortChannelId(24), 0, 0),
                ],
            },
        });
        let add = chan.sent()[0].clone();

        // Nothing registered for these reason bytes: decryption fails.
        h.state.process(MasterEvent::RemoteReject(RemoteReject::Fail {
            add,
            reason: vec![0xff, 0xff],
        }));

        let conf = RouterConf::default();
        assert_eq!(
            h.state.ledger().node_failed_unknown_update_times[&node_pk(2)],
            conf.max_strange_node_failures
        );
        assert!(matches!(
            h.sender(&tag).failures()[0],
            PaymentFailure::UnreadableRemote { .. }
        ));
    }

    // Greedy assignment never exceeds the requested amount by more than one
    // min-sendable bump, and never double-uses a part id.
    #[test]
    fn assignment_amount_and_part_id_invariants() {
        proptest!(Config::with_cases(64), |(
            seed in proptest::arbitrary::any::<u64>(),
            avails in proptest::collection::vec(10_000u64..1_000_000, 1..4),
            my_part in 10_000u64..2_000_000,
        )| {
            let mut h = harness(seed);
            let tag = full_tag(30);
            let target = node_pk(5);
            let chans = avails
                .iter()
                .enumerate()
                .map(|(i, avail)| {
                    Arc::new(
                        MockChannel::new(i as u8 + 1)
                            .available_for_send(*avail)
                            .max_send_in_flight(1_000_000)
                            .min_sendable(1_000),
                    ) as Arc<dyn crate::channel::Channel>
                })
                .collect::<Vec<_>>();
            h.register(tag);
            h.send(send_cmd(tag, target, my_part, 1_000, chans));

            let sender = h.sender(&tag);
            assert_part_ids_consistent(sender);
            match sender.state() {
                SenderState::Pending => {
                    let total: Amount = sender
                        .parts()
                        .values()
                        .map(|part| part.amount())
                        .sum();
                    prop_assert!(total >= Amount::from_msat(my_part));
                    // At most one sub-minimum bump.
                    prop_assert!(
                        total <= Amount::from_msat(my_part + 1_000)
                    );
                }
                SenderState::Aborted => {
                    let is_not_enough_funds = matches!(
                        sender.failures()[0],
                        PaymentFailure::Local {
                            kind: LocalFailureKind::NotEnoughFunds,
                            ..
                        }
                    );
                    prop_assert!(is_not_enough_funds);
                }
                state => prop_assert!(false, "unexpected state {state:?}"),
            }
        });
    }

    // End to end through the spawned worker: the tokio abort timer fires
    // after `sender_timeout_msec` of paused time and fails the payment.
    #[tokio::test(start_paused = true)]
    async fn spawned_master_times_out_sleeping_payment() {
        crate::logger::init_for_testing();
        let path_finder = Arc::new(MockPathFinder::default());
        let crypto = Arc::new(MockOnionCrypto::new());
        let listener = Arc::new(RecordingListener::default());
        let conf = RouterConf::default();
        let (master, worker) = PaymentMaster::spawn(
            conf,
            path_finder,
            crypto,
            FastRng::from_u64(77),
        );

        let tag = full_tag(40);
        let chan = Arc::new(
            MockChannel::new(1)
                .sleeping()
                .available_for_send(1_000_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );
        master.create_sender(tag, vec![listener.clone()]);
        master.send(send_cmd(tag, node_pk(5), 500_000, 5_000, vec![chan]));

        // Paused time auto-advances past the abort timer while we wait.
        tokio::time::sleep(Duration::from_millis(
            conf.sender_timeout_msec + 1_000,
        ))
        .await;

        master.shutdown();
        worker.await.unwrap();

        let events = listener.events();
        assert!(matches!(events.as_slice(), [ListenerEvent::Failed(_)]));
    }

    #[test]
    fn sender_registry_lifecycle() {
        let mut h = harness(14);
        let tag = full_tag(31);
        let target = node_pk(5);
        let chan = Arc::new(
            MockChannel::new(1)
                .available_for_send(300_000)
                .max_send_in_flight(1_000_000)
                .min_sendable(1_000),
        );

        // SendPayment without a registered sender is dropped.
        h.send(send_cmd(tag, target, 100_000, 1_000, vec![chan.clone()]));
        assert!(h.state.sender(&tag).is_none());
        assert_eq!(h.path_finder.request_count(), 0);

        h.register(tag);
        assert_eq!(h.sender(&tag).state(), SenderState::Init);

        // Duplicate registration is refused (the original survives).
        h.send(send_cmd(tag, target, 100_000, 1_000, vec![chan.clone()]));
        h.register(tag);
        assert_eq!(h.sender(&tag).state(), SenderState::Pending);

        h.state.process(MasterEvent::RemoveSender { full_tag: tag });
        assert!(h.state.sender(&tag).is_none());
    }
}
