//! The sphinx (BOLT-04 onion) primitives consumed by the engine.
//!
//! Packet construction, failure decryption, and `channel_update` signature
//! checks are all performed by an external implementation behind the
//! [`OnionCrypto`] trait; the engine only decides *what* to encrypt and how
//! to react to what was decrypted.

use secp256k1::{PublicKey, SecretKey};

use crate::{
    gossip::ChannelUpdate,
    primitives::{NodePk, PaymentHash},
};

/// Byte length of the onion packet's layered payload.
pub const ONION_PAYLOAD_LEN: usize = 1300;

/// Per-hop HMAC length; every per-hop payload implicitly carries one.
pub const HOP_MAC_LEN: usize = 32;

/// A layered-encrypted onion routing packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionPacket {
    pub version: u8,
    /// The session public key; doubles as the dispatched part's id.
    pub public_key: PublicKey,
    pub payload: Vec<u8>,
    pub hmac: [u8; 32],
}

/// The ECDH secret shared with one hop of a route.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SharedSecret(pub [u8; 32]);

/// An onion packet plus the per-hop shared secrets needed to decrypt a
/// failure coming back along the same route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketAndSecrets {
    pub packet: OnionPacket,
    pub shared_secrets: Vec<(SharedSecret, NodePk)>,
}

/// The failure carried inside a decrypted failure packet, reduced to the
/// distinctions the engine's retry policy cares about.
#[derive(Clone, Debug, PartialEq)]
pub enum FailureMessage {
    /// The final recipient reports the payment expired.
    PaymentTimeout,
    /// A relaying node attached its current `channel_update`.
    Update(ChannelUpdate),
    /// A node-level failure (`temporary_node_failure` and friends).
    Node,
    /// Any other BOLT-04 failure, identified by its code.
    Other(u16),
}

/// A failure packet successfully attributed to a node on the route.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedFailurePacket {
    pub origin_node: NodePk,
    pub failure: FailureMessage,
}

/// Errors produced while building an onion packet.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OnionBuildError {
    #[error("route has no hops")]
    EmptyRoute,

    #[error(
        "per-hop payloads ({payloads_len} bytes) exceed the {max} byte onion"
    )]
    PayloadsTooLarge { payloads_len: usize, max: usize },

    #[error("onion crypto failure: {0}")]
    Crypto(String),
}

/// The sphinx primitives the engine consumes.
pub trait OnionCrypto: Send + Sync {
    /// Build an onion packet from a fresh session key, the ordered per-hop
    /// public keys, and the encoded per-hop payloads, binding the packet to
    /// `assoc_data` (the payment hash).
    fn build(
        &self,
        session_key: &SecretKey,
        nodes: &[NodePk],
        payloads: &[Vec<u8>],
        assoc_data: &PaymentHash,
    ) -> Result<PacketAndSecrets, OnionBuildError>;

    /// Attempt to decrypt and attribute a failure packet using the shared
    /// secrets recorded when the onion was built. `None` means no hop's
    /// unwrapping produced a valid HMAC.
    fn decrypt_failure(
        &self,
        reason: &[u8],
        shared_secrets: &[(SharedSecret, NodePk)],
    ) -> Option<DecryptedFailurePacket>;

    /// Verify that `update` is signed by `node_id`.
    fn is_node_update_sig(
        &self,
        update: &ChannelUpdate,
        node_id: &NodePk,
    ) -> bool;
}
