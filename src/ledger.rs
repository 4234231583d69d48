//! Identifiers and the consumed interfaces of the two ledgers. The core
//! never speaks RPC itself: transaction signing, fee handling and transport
//! live behind these traits, the protocol only submits calls and consumes
//! their results, the same way syncer backends are abstracted in other swap
//! daemons.

use std::error;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::escrow::{CreateEscrow, EscrowState};
use crate::hash::{HashString, OfferIdHash};
use crate::offer::{OfferInteraction, OfferState};

/// A block height on the payment ledger.
pub type BlockHeight = u64;
/// A token amount in the token's smallest unit.
pub type Amount = u64;
/// Seconds since the Unix epoch, as stamped by the ledgers.
pub type Timestamp = u64;

/// Errors from the underlying ledger clients. All of them are transient from
/// the protocol's point of view: the triggering event can be re-processed once
/// the infrastructure recovers. [`Self::Rejected`] is the exception, it
/// carries a contract-side revert reason.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The RPC transport failed.
    #[error("RPC error: {0}")]
    Rpc(String),
    /// The transaction was submitted but confirmation was not observed in
    /// time.
    #[error("Confirmation timeout")]
    ConfirmationTimeout,
    /// The queried contract, account or transaction does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The ledger evaluated the call and rejected it.
    #[error("Rejected by contract: {0}")]
    Rejected(String),
    /// An identifier does not have the shape the ledger assigns.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
    /// Any client error not part of this list.
    #[error("Ledger error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl LedgerError {
    /// Creates a new error of type [`Self::Other`] with an arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }
}

fixed_hash::construct_fixed_hash!(
    /// An account or contract address on the payment ledger. Participants
    /// sign interactions on both ledgers with the same key, so this is also
    /// the identity type for offer owners, buyers and delegates.
    pub struct Address(20);
);

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{:#x}", self).as_ref())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = deserializer.deserialize_string(HashString(20))?;
        Address::from_str(s.trim_start_matches("0x")).map_err(de::Error::custom)
    }
}

/// Number of characters in an asset-ledger transaction id.
const CONTRACT_ID_LEN: usize = 43;

/// A transaction id on the asset ledger, also the id of a contract instance
/// deployed by that transaction. 43 characters of the base64url alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractId(String);

impl ContractId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContractId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == CONTRACT_ID_LEN
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if valid {
            Ok(ContractId(s.to_string()))
        } else {
            Err(LedgerError::InvalidId(s.to_string()))
        }
    }
}

impl Serialize for ContractId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

struct ContractIdString;

impl<'de> Visitor<'de> for ContractIdString {
    type Value = ContractId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a 43 character base64url transaction id")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        s.parse().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for ContractId {
    fn deserialize<D>(deserializer: D) -> Result<ContractId, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_string(ContractIdString)
    }
}

/// The holder of an NFT on the asset ledger: either a wallet or a contract
/// instance (the offer contract takes custody of the NFT for the duration of
/// the swap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Holder {
    Wallet(Address),
    Contract(ContractId),
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Holder::Wallet(addr) => write!(f, "{:#x}", addr),
            Holder::Contract(id) => write!(f, "{}", id),
        }
    }
}

/// Deployment metadata of a contract instance, used by buyers to verify an
/// offer was spawned from a trusted source with no pre-seeded state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// The source transaction the instance was deployed from.
    pub source: ContractId,
    /// The JSON state the instance was initialized with.
    pub init_state: serde_json::Value,
}

/// Callback invoked with each new evaluated state of a subscribed contract.
/// Deliveries for one contract arrive in ledger-commit order.
pub type StateHandler = Box<dyn Fn(OfferState) + Send + Sync>;

/// Client for the asset ledger hosting the offer contract and the traded NFT.
/// State on this ledger is lazy: reading a contract replays its interaction
/// log, so every read reflects all committed writes.
pub trait AssetLedger: Send + Sync {
    /// Deploy a fresh offer instance from a known source transaction, with
    /// empty initial state. Returns the new instance id.
    fn deploy_offer(&self, source: &ContractId, signer: &Address) -> Result<ContractId, LedgerError>;

    /// Submit an interaction to an offer instance, await its evaluation and
    /// return the resulting state. A contract-side revert surfaces as
    /// [`LedgerError::Rejected`] with the revert reason.
    fn submit_offer_interaction(
        &self,
        contract: &ContractId,
        signer: &Address,
        input: &OfferInteraction,
    ) -> Result<OfferState, LedgerError>;

    /// Replay the offer instance's interaction log and return its current
    /// state.
    fn read_offer_state(&self, contract: &ContractId) -> Result<OfferState, LedgerError>;

    /// Subscribe to evaluated state changes of an offer instance.
    fn subscribe_offer_state(
        &self,
        contract: &ContractId,
        handler: StateHandler,
    ) -> Result<(), LedgerError>;

    /// Fetch the deployment metadata of a contract instance.
    fn deployment(&self, contract: &ContractId) -> Result<Deployment, LedgerError>;

    /// Transfer an NFT to a new holder.
    fn transfer_nft(
        &self,
        nft_contract: &ContractId,
        signer: &Address,
        nft_id: &str,
        to: &Holder,
    ) -> Result<(), LedgerError>;

    /// Query the current holder of an NFT.
    fn nft_owner(&self, nft_contract: &ContractId, nft_id: &str) -> Result<Holder, LedgerError>;
}

/// An escrow-creation event extracted from the payment ledger's log. Carries
/// only the offer id hash; resolving it back to a plaintext offer id is the
/// matcher's correlation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowCreated {
    /// Address of the freshly deployed escrow instance.
    pub escrow: Address,
    /// Commitment of the offer id this escrow targets.
    pub offer_id_hash: OfferIdHash,
    /// Block the deployment was mined in.
    pub block: BlockHeight,
}

/// Client for the payment ledger hosting the escrow factory and the payment
/// token.
pub trait PaymentLedger: Send + Sync {
    /// Height of the most recently mined block.
    fn latest_block(&self) -> Result<BlockHeight, LedgerError>;

    /// Deploy a new escrow through the factory and await confirmation.
    /// Returns the escrow instance address.
    fn create_escrow(&self, signer: &Address, params: &CreateEscrow)
        -> Result<Address, LedgerError>;

    /// Read the current state of an escrow instance.
    fn escrow_state(&self, escrow: &Address) -> Result<EscrowState, LedgerError>;

    /// Call `finalize(password)` on an escrow and await confirmation.
    fn finalize_escrow(
        &self,
        signer: &Address,
        escrow: &Address,
        password: &str,
    ) -> Result<(), LedgerError>;

    /// Call `cancel()` on an escrow and await confirmation.
    fn cancel_escrow(&self, signer: &Address, escrow: &Address) -> Result<(), LedgerError>;

    /// Transfer `amount` of `token` to `to` and await confirmation.
    fn transfer_token(
        &self,
        signer: &Address,
        token: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), LedgerError>;

    /// Token balance of an account.
    fn balance_of(&self, token: &Address, holder: &Address) -> Result<Amount, LedgerError>;

    /// Escrow-creation events mined in the half-open block range
    /// `[from_block, to_block)`.
    fn escrow_created_events(
        &self,
        from_block: BlockHeight,
        to_block: BlockHeight,
    ) -> Result<Vec<EscrowCreated>, LedgerError>;
}

/// One page of results from the interaction index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    /// Whether this page is full, i.e. pagination can advance instead of
    /// polling for more entries on the current page.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.limit
    }
}

/// An interaction record returned by the index, pointing at a create-offer
/// transaction tagged with a delegate address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    /// Id of the interaction transaction itself.
    pub id: String,
    /// The offer instance the interaction was evaluated on.
    pub contract: ContractId,
    /// Block height the interaction was mined at.
    pub block_height: BlockHeight,
    /// The interaction signer.
    pub owner: Address,
}

/// An index over asset-ledger interactions, queried by tag. External service;
/// the matcher only relies on pagination being stable for already-mined
/// entries.
pub trait InteractionIndex: Send + Sync {
    /// List create-offer interactions that name `delegate` as their delegate,
    /// oldest first.
    fn delegated_offers(
        &self,
        delegate: &Address,
        page: usize,
        limit: usize,
    ) -> Result<Page<InteractionRecord>, LedgerError>;
}
