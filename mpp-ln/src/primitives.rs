//! Payment and node identity newtypes.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use common::{hex, rng::Crng};
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};

/// Implements a 32-byte array newtype with hex `Display` / `FromStr` and
/// hex-string serde impls.
macro_rules! byte_array_newtype {
    ($name:ident) => {
        impl $name {
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub const fn as_array(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::display(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = hex::DecodeError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes).map(|()| Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&hex::encode(&self.0))
                } else {
                    serializer.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                struct HexVisitor;
                impl serde::de::Visitor<'_> for HexVisitor {
                    type Value = $name;
                    fn expecting(
                        &self,
                        f: &mut fmt::Formatter<'_>,
                    ) -> fmt::Result {
                        write!(f, "a hex string or 32 raw bytes")
                    }
                    fn visit_str<E: serde::de::Error>(
                        self,
                        s: &str,
                    ) -> Result<Self::Value, E> {
                        $name::from_str(s).map_err(serde::de::Error::custom)
                    }
                    fn visit_bytes<E: serde::de::Error>(
                        self,
                        bytes: &[u8],
                    ) -> Result<Self::Value, E> {
                        <[u8; 32]>::try_from(bytes)
                            .map($name::new)
                            .map_err(serde::de::Error::custom)
                    }
                }
                if deserializer.is_human_readable() {
                    deserializer.deserialize_str(HexVisitor)
                } else {
                    deserializer.deserialize_bytes(HexVisitor)
                }
            }
        }
    };
}

/// The payment hash of an HTLC.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PaymentHash(pub [u8; 32]);
byte_array_newtype!(PaymentHash);

/// The inner payment secret bound into a multi-part payment's final payloads.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PaymentSecret(pub [u8; 32]);
byte_array_newtype!(PaymentSecret);

/// The preimage which resolves an HTLC with the matching payment hash.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PaymentPreimage(pub [u8; 32]);
byte_array_newtype!(PaymentPreimage);

/// A Lightning node's identity public key.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
pub struct NodePk(pub PublicKey);

impl NodePk {
    /// A well-known placeholder key standing in for "the local node" in route
    /// request sources and fake local edges. Never a real node's identity.
    pub fn payer_placeholder() -> Self {
        // The secp256k1 generator point; any real node key collision would
        // imply a broken secret key of 1.
        const GENERATOR: [u8; 33] = [
            0x02, 0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0,
            0x62, 0x95, 0xce, 0x87, 0x0b, 0x07, 0x02, 0x9b, 0xfc, 0xdb, 0x2d,
            0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b, 0x16, 0xf8, 0x17, 0x98,
        ];
        Self(PublicKey::from_slice(&GENERATOR).expect("valid generator point"))
    }

    pub fn inner(&self) -> PublicKey {
        self.0
    }
}

impl Display for NodePk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for NodePk {
    type Err = secp256k1::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::from_str(s).map(Self)
    }
}

impl From<PublicKey> for NodePk {
    fn from(pk: PublicKey) -> Self {
        Self(pk)
    }
}

/// Identifies one part of a multi-part payment. A part id is the public key
/// of the part's onion session keypair, so rotating the session key (remote
/// retry) also rotates the part id, while a local retry (no HTLC was ever
/// sent) keeps both.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
pub struct PartId(pub PublicKey);

impl PartId {
    pub fn from_onion_key(onion_key: &SecretKey) -> Self {
        Self(PublicKey::from_secret_key(&SECP256K1, onion_key))
    }
}

impl Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Generate a fresh onion session key from the given rng.
pub fn random_session_key(rng: &mut impl Crng) -> SecretKey {
    loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        // Rejection-sample the (vanishingly unlikely) invalid scalars.
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            return key;
        }
    }
}

/// What kind of logical payment a [`FullPaymentTag`] belongs to.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum PaymentTag {
    /// A payment initiated by the local node.
    LocallySent,
    /// A payment we re-route on behalf of a trampoline sender.
    TrampolineRouted,
}

/// The identity of one logical payment, unique per payment within a process.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct FullPaymentTag {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub tag: PaymentTag,
}

impl Display for FullPaymentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.tag, self.payment_hash)
    }
}
