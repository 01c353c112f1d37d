//! The `mpp-ln` crate contains the outgoing multi-part Lightning payment
//! engine: it splits a requested amount into parts across locally controlled
//! channels, requests routes from an external path-finder, builds
//! onion-encrypted HTLC commands, dispatches them, and reacts to local and
//! remote failures by re-splitting, re-routing, retrying, or failing the
//! whole payment.
//!
//! The engine consumes its collaborators (channels, path-finder, sphinx
//! crypto) through the traits in [`channel`], [`router`], and [`sphinx`];
//! channel state machines, route computation, and onion encryption all live
//! outside this crate.

/// The channel interface consumed by the engine.
pub mod channel;
/// Engine configuration.
pub mod config;
/// Directed channel edges and `channel_update`s.
pub mod gossip;
/// Process-wide failure memory.
pub mod ledger;
/// `tracing` logger config.
pub mod logger;
/// The payment master FSM and its event loop.
pub mod master;
/// Per-hop onion payloads and the HTLC command builder.
pub mod onion;
/// Payment and node identity newtypes.
pub mod primitives;
/// The path-finder interface consumed by the engine.
pub mod router;
/// Channel sendable-amount calculations.
pub mod sendable;
/// The per-payment sender FSM.
pub mod sender;
/// The sphinx packet interface consumed by the engine.
pub mod sphinx;

#[cfg(test)]
mod test_utils;
