//! Hash-lock primitive shared by both ledgers. A participant publishes the
//! keccak256 commitment of a secret before the secret is known; later
//! revealing a preimage that matches the commitment authorizes a payout.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Unexpected, Visitor};
use serde::ser::{Serialize, Serializer};
use serde::{Deserialize, Deserializer};
use tiny_keccak::{Hasher, Keccak};

use crate::ledger::ContractId;

/// A visitor that deserializes a hash string of a fixed hex length prefixed
/// with `0x`.
pub(crate) struct HashString(pub usize);

impl<'de> Visitor<'de> for HashString {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "a string representing a hash in hex value prefixed with 0x"
        )
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if s.len() == 2 + self.0 * 2 && s.starts_with("0x") {
            Ok(s.to_string())
        } else {
            Err(de::Error::invalid_value(Unexpected::Str(s), &self))
        }
    }
}

/// Compute the keccak256 digest of the given bytes.
fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut keccak = Keccak::v256();
    let mut out = [0u8; 32];
    keccak.update(bytes);
    keccak.finalize(&mut out);
    out
}

macro_rules! impl_commitment_serde {
    ($hash:ident, $len:expr) => {
        impl Serialize for $hash {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(format!("{:#x}", self).as_ref())
            }
        }

        impl<'de> Deserialize<'de> for $hash {
            fn deserialize<D>(deserializer: D) -> Result<$hash, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = deserializer.deserialize_string(HashString($len))?;
                $hash::from_str(s.trim_start_matches("0x")).map_err(de::Error::custom)
            }
        }
    };
}

fixed_hash::construct_fixed_hash!(
    /// Commitment of a swap secret. Stored on both the Offer and the Escrow;
    /// the state machines gate their payout transitions on a preimage of this
    /// value.
    pub struct HashLock(32);
);

impl_commitment_serde!(HashLock, 32);

impl HashLock {
    /// Commit to a secret. Both ledgers use the same construction, so a
    /// commitment published on one side can be checked against the other.
    pub fn commit(secret: &str) -> Self {
        HashLock(keccak256(secret.as_bytes()))
    }

    /// Check a candidate preimage against this commitment.
    pub fn matches(&self, secret: &str) -> bool {
        *self == Self::commit(secret)
    }
}

fixed_hash::construct_fixed_hash!(
    /// Commitment binding an Escrow to exactly one Offer. Escrow-creation
    /// events on the payment ledger only carry this hash, never the plaintext
    /// offer id.
    pub struct OfferIdHash(32);
);

impl_commitment_serde!(OfferIdHash, 32);

impl OfferIdHash {
    /// Commit to an offer id.
    pub fn commit(offer_id: &ContractId) -> Self {
        OfferIdHash(keccak256(offer_id.as_str().as_bytes()))
    }
}
