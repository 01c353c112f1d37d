//! Test fixtures and mock collaborators, shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use common::amount::Amount;
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::{
    channel::{
        AddHtlc, ChanCommits, Channel, ChannelId, ChannelState, HtlcInFlight,
    },
    gossip::{ChannelDesc, ChannelUpdate, GraphEdge, ShortChannelId},
    master::AbortTimers,
    primitives::{
        FullPaymentTag, NodePk, PartId, PaymentHash, PaymentSecret, PaymentTag,
    },
    router::{PathFinder, RouteRequest},
    sender::{PaymentListener, SenderSnapshot},
    sphinx::{
        DecryptedFailurePacket, OnionBuildError, OnionCrypto,
        PacketAndSecrets, OnionPacket, SharedSecret,
    },
};

// --- Fixtures --- //

/// A deterministic node key; `i` must be non-zero.
pub(crate) fn node_pk(i: u8) -> NodePk {
    assert_ne!(i, 0, "zero makes an invalid secret key");
    let mut bytes = [0u8; 32];
    bytes[31] = i;
    let secret = SecretKey::from_slice(&bytes).unwrap();
    NodePk(PublicKey::from_secret_key(&SECP256K1, &secret))
}

pub(crate) fn part_id(i: u8) -> PartId {
    PartId(node_pk(i).0)
}

pub(crate) fn full_tag(i: u8) -> FullPaymentTag {
    FullPaymentTag {
        payment_hash: PaymentHash([i; 32]),
        payment_secret: PaymentSecret([i.wrapping_add(1); 32]),
        tag: PaymentTag::LocallySent,
    }
}

pub(crate) fn htlc_in_flight(
    tag_i: u8,
    part_id: PartId,
    amount_msat: u64,
) -> HtlcInFlight {
    HtlcInFlight {
        tag: full_tag(tag_i),
        part_id,
        amount: Amount::from_msat(amount_msat),
    }
}

/// A graph edge `node_pk(from) -> node_pk(to)` with a flat + proportional
/// fee policy and a 40 block CLTV delta.
pub(crate) fn edge(
    from: u8,
    to: u8,
    scid: ShortChannelId,
    base_fee_msat: u64,
    prop_millionths: u64,
) -> GraphEdge {
    GraphEdge {
        desc: ChannelDesc {
            short_channel_id: scid,
            from: node_pk(from),
            to: node_pk(to),
        },
        update: ChannelUpdate {
            signature: [0u8; 64],
            short_channel_id: scid,
            timestamp: 1,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: Amount::from_msat(1),
            htlc_maximum_msat: Amount::MAX,
            fee_base_msat: Amount::from_msat(base_fee_msat),
            fee_proportional_millionths: prop_millionths,
        },
        capacity: Amount::from_msat(10_000_000_000),
    }
}

// --- Mock channel --- //

/// An in-memory [`Channel`]: builder methods configure the snapshot, and
/// dispatched HTLCs are recorded for inspection.
pub(crate) struct MockChannel {
    state: Mutex<ChannelState>,
    commits: Mutex<ChanCommits>,
    sent: Mutex<Vec<AddHtlc>>,
}

impl MockChannel {
    pub fn new(i: u8) -> Self {
        Self {
            state: Mutex::new(ChannelState::OperationalOpen),
            commits: Mutex::new(ChanCommits {
                channel_id: ChannelId([i; 32]),
                remote_node_id: node_pk(i),
                available_for_send: Amount::ZERO,
                max_send_in_flight: Amount::ZERO,
                min_sendable: Amount::ZERO,
                all_outgoing: Vec::new(),
            }),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn available_for_send(self, msat: u64) -> Self {
        self.commits.lock().unwrap().available_for_send =
            Amount::from_msat(msat);
        self
    }

    pub fn max_send_in_flight(self, msat: u64) -> Self {
        self.commits.lock().unwrap().max_send_in_flight =
            Amount::from_msat(msat);
        self
    }

    pub fn min_sendable(self, msat: u64) -> Self {
        self.commits.lock().unwrap().min_sendable = Amount::from_msat(msat);
        self
    }

    pub fn outgoing(self, htlcs: Vec<HtlcInFlight>) -> Self {
        self.commits.lock().unwrap().all_outgoing = htlcs;
        self
    }

    pub fn remote(self, remote_node_id: NodePk) -> Self {
        self.commits.lock().unwrap().remote_node_id = remote_node_id;
        self
    }

    pub fn sleeping(self) -> Self {
        *self.state.lock().unwrap() = ChannelState::OperationalSleeping;
        self
    }

    pub fn arc(self) -> Arc<dyn Channel> {
        Arc::new(self)
    }

    // Runtime mutators, for simulating channel-side changes mid-test.

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_available_for_send(&self, msat: u64) {
        self.commits.lock().unwrap().available_for_send =
            Amount::from_msat(msat);
    }

    pub fn set_outgoing(&self, htlcs: Vec<HtlcInFlight>) {
        self.commits.lock().unwrap().all_outgoing = htlcs;
    }

    pub fn sent(&self) -> Vec<AddHtlc> {
        self.sent.lock().unwrap().clone()
    }
}

impl Channel for MockChannel {
    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    fn commits(&self) -> ChanCommits {
        self.commits.lock().unwrap().clone()
    }

    fn send_htlc(&self, add: AddHtlc) {
        self.sent.lock().unwrap().push(add);
    }
}

// --- Mock path-finder --- //

#[derive(Default)]
pub(crate) struct MockPathFinder {
    pub requests: Mutex<Vec<RouteRequest>>,
    pub updates: Mutex<Vec<ChannelUpdate>>,
    pub edges: Mutex<Vec<GraphEdge>>,
}

impl MockPathFinder {
    pub fn last_request(&self) -> RouteRequest {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no route request recorded")
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl PathFinder for MockPathFinder {
    fn find_route(&self, request: RouteRequest) {
        self.requests.lock().unwrap().push(request);
    }

    fn learn_update(&self, update: ChannelUpdate) {
        self.updates.lock().unwrap().push(update);
    }

    fn learn_edge(&self, edge: GraphEdge) {
        self.edges.lock().unwrap().push(edge);
    }
}

// --- Mock sphinx --- //

/// Fake onion crypto: packets embed the session public key (as real sphinx
/// packets do) and failure "decryption" looks the reason bytes up in a
/// test-registered table.
pub(crate) struct MockOnionCrypto {
    failures: Mutex<HashMap<Vec<u8>, DecryptedFailurePacket>>,
    sig_valid: Mutex<bool>,
}

impl MockOnionCrypto {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            sig_valid: Mutex::new(true),
        }
    }

    pub fn register_failure(
        &self,
        reason: Vec<u8>,
        packet: DecryptedFailurePacket,
    ) {
        self.failures.lock().unwrap().insert(reason, packet);
    }

    pub fn set_sig_valid(&self, valid: bool) {
        *self.sig_valid.lock().unwrap() = valid;
    }
}

impl OnionCrypto for MockOnionCrypto {
    fn build(
        &self,
        session_key: &SecretKey,
        nodes: &[NodePk],
        payloads: &[Vec<u8>],
        _assoc_data: &PaymentHash,
    ) -> Result<PacketAndSecrets, OnionBuildError> {
        let packet = OnionPacket {
            version: 0,
            public_key: PublicKey::from_secret_key(&SECP256K1, session_key),
            payload: payloads.concat(),
            hmac: [0u8; 32],
        };
        let shared_secrets = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (SharedSecret([(i as u8) + 1; 32]), *node))
            .collect();
        Ok(PacketAndSecrets { packet, shared_secrets })
    }

    fn decrypt_failure(
        &self,
        reason: &[u8],
        _shared_secrets: &[(SharedSecret, NodePk)],
    ) -> Option<DecryptedFailurePacket> {
        self.failures.lock().unwrap().get(reason).cloned()
    }

    fn is_node_update_sig(
        &self,
        _update: &ChannelUpdate,
        _node_id: &NodePk,
    ) -> bool {
        *self.sig_valid.lock().unwrap()
    }
}

// --- Recording timers and listeners --- //

#[derive(Default)]
pub(crate) struct RecordingTimers {
    pub armed: Mutex<Vec<(FullPaymentTag, u64)>>,
}

impl RecordingTimers {
    pub fn last_generation(&self) -> u64 {
        self.armed.lock().unwrap().last().expect("no timer armed").1
    }
}

impl AbortTimers for RecordingTimers {
    fn arm(&self, full_tag: FullPaymentTag, generation: u64) {
        self.armed.lock().unwrap().push((full_tag, generation));
    }
}

#[derive(Clone, Debug)]
pub(crate) enum ListenerEvent {
    FirstPreimage(SenderSnapshot),
    Succeeded(SenderSnapshot),
    Failed(SenderSnapshot),
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    pub events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl PaymentListener for RecordingListener {
    fn got_first_preimage(
        &self,
        snapshot: &SenderSnapshot,
        _fulfill: &crate::channel::RemoteFulfill,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::FirstPreimage(snapshot.clone()));
    }

    fn whole_payment_succeeded(&self, snapshot: &SenderSnapshot) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::Succeeded(snapshot.clone()));
    }

    fn whole_payment_failed(&self, snapshot: &SenderSnapshot) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::Failed(snapshot.clone()));
    }
}
