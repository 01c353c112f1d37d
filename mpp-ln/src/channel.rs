//! The channel interface consumed by the payment engine.
//!
//! Channel state machines and commitment bookkeeping live outside this
//! crate; the engine only queries snapshots, dispatches add-HTLC commands,
//! and receives resolution events back through the master.

use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::Arc,
};

use common::{amount::Amount, hex};

use crate::{
    gossip::ShortChannelId,
    onion::FinalPayload,
    primitives::{FullPaymentTag, NodePk, PartId, PaymentPreimage},
    sphinx::PacketAndSecrets,
};

/// A channel's funding-level identity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// A deterministic scid-shaped alias for this channel, used as the fake
    /// local edge of route requests. Never a real confirmed channel's scid.
    pub fn local_alias_scid(&self) -> ShortChannelId {
        let bytes = <[u8; 8]>::try_from(&self.0[..8]).expect("32 >= 8");
        ShortChannelId(u64::from_be_bytes(bytes))
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

impl FromStr for ChannelId {
    type Err = hex::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map(|()| Self(bytes))
    }
}

/// The channel states the engine distinguishes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// Established and connected; can carry new HTLCs right now.
    OperationalOpen,
    /// Established but the peer is offline; expected to come back.
    OperationalSleeping,
    /// Closing, closed, or otherwise unusable for sending.
    Unusable,
}

/// One outgoing HTLC currently cross-signed in a channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HtlcInFlight {
    pub tag: FullPaymentTag,
    /// The session public key of the onion packet this HTLC carries.
    pub part_id: PartId,
    pub amount: Amount,
}

/// A snapshot of the channel commitment values the engine reads.
#[derive(Clone, Debug)]
pub struct ChanCommits {
    pub channel_id: ChannelId,
    pub remote_node_id: NodePk,
    /// Local balance available for new outgoing HTLCs.
    pub available_for_send: Amount,
    /// Upper bound on the sum of outgoing in-flight HTLCs.
    pub max_send_in_flight: Amount,
    /// Smallest HTLC the peer accepts.
    pub min_sendable: Amount,
    /// All outgoing HTLCs currently present in the commitment.
    pub all_outgoing: Vec<HtlcInFlight>,
}

/// A handle to an externally owned payment channel.
pub trait Channel: Send + Sync {
    fn state(&self) -> ChannelState;

    /// Snapshot the current commitment values.
    fn commits(&self) -> ChanCommits;

    /// Submit an add-HTLC command. Must not block; the outcome returns to the
    /// master as a [`LocalReject`], [`RemoteFulfill`], or [`RemoteReject`].
    fn send_htlc(&self, add: AddHtlc);
}

/// A channel handle paired with the commitment snapshot that was current
/// when the engine reserved a part against it.
#[derive(Clone)]
pub struct ChanAndCommits {
    pub chan: Arc<dyn Channel>,
    pub commits: ChanCommits,
}

impl ChanAndCommits {
    pub fn snapshot(chan: Arc<dyn Channel>) -> Self {
        let commits = chan.commits();
        Self { chan, commits }
    }
}

impl fmt::Debug for ChanAndCommits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChanAndCommits")
            .field("channel_id", &self.commits.channel_id)
            .field("remote_node_id", &self.commits.remote_node_id)
            .finish_non_exhaustive()
    }
}

/// The add-HTLC command handed to a channel: first-hop amount and expiry,
/// the encrypted onion, and the final payload for bookkeeping.
#[derive(Clone, Debug)]
pub struct AddHtlc {
    pub full_tag: FullPaymentTag,
    pub part_id: PartId,
    pub first_amount: Amount,
    /// Absolute block height timelock of the first hop.
    pub first_expiry: u32,
    pub packet_and_secrets: PacketAndSecrets,
    pub final_payload: FinalPayload,
}

/// Why a channel refused to take an add-HTLC command locally.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LocalRejectReason {
    /// The command can never succeed on this channel (e.g. amount out of
    /// bounds for the commitment). Retrying elsewhere is pointless too.
    InPrincipleNotSendable,
    /// The peer went offline between reservation and dispatch.
    ChannelOffline,
    /// A transient limit was hit (HTLC slots, in-flight maximum).
    TemporarilyUnsendable,
}

/// A channel refused the add-HTLC command before it ever left the node.
#[derive(Clone, Debug)]
pub struct LocalReject {
    pub reason: LocalRejectReason,
    pub add: AddHtlc,
}

/// The remote peer revealed the preimage for one of our outgoing HTLCs.
#[derive(Clone, Debug)]
pub struct RemoteFulfill {
    pub add: AddHtlc,
    pub preimage: PaymentPreimage,
}

/// The remote peer failed one of our outgoing HTLCs.
#[derive(Clone, Debug)]
pub enum RemoteReject {
    /// `update_fail_htlc`: carries an encrypted failure packet to decrypt
    /// with the part's shared secrets.
    Fail { add: AddHtlc, reason: Vec<u8> },
    /// `update_fail_malformed_htlc`: some hop could not parse our onion.
    Malform { add: AddHtlc },
}

impl RemoteReject {
    pub fn add(&self) -> &AddHtlc {
        match self {
            Self::Fail { add, .. } => add,
            Self::Malform { add } => add,
        }
    }
}

/// A host-collected snapshot of every outgoing HTLC still present in any
/// channel, keyed by payment. Senders finalize (success and failure
/// notifications) only once their tag has disappeared from this bag.
#[derive(Clone, Debug, Default)]
pub struct InFlightBag {
    pub out: std::collections::HashMap<FullPaymentTag, Vec<HtlcInFlight>>,
}

impl InFlightBag {
    /// Scan the given channels' commitments.
    pub fn collect<'a>(
        chans: impl IntoIterator<Item = &'a Arc<dyn Channel>>,
    ) -> Self {
        let mut out: std::collections::HashMap<_, Vec<HtlcInFlight>> =
            std::collections::HashMap::new();
        for chan in chans {
            for htlc in chan.commits().all_outgoing {
                out.entry(htlc.tag).or_default().push(htlc);
            }
        }
        Self { out }
    }

    pub fn contains(&self, tag: &FullPaymentTag) -> bool {
        self.out.get(tag).map(|htlcs| !htlcs.is_empty()).unwrap_or(false)
    }
}
