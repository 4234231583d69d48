//! Teleport Core library
//!
//! Implements the Teleport swap protocol: a trust-minimized exchange of an
//! NFT held on a log-structured asset ledger against a fungible token held on
//! an account-based payment ledger. The two ledgers cannot observe each other,
//! so the protocol couples two independent state machines, an [`offer`]
//! contract holding the NFT and an [`escrow`] contract holding the payment,
//! through a shared hash-lock and client-side cross-checks ([`verify`]).
//! The [`matcher`] module drives swaps to completion on behalf of passive
//! participants with durable idempotency and crash recovery.

use thiserror::Error;

pub mod escrow;
pub mod hash;
pub mod ledger;
pub mod matcher;
pub mod offer;
pub mod roles;
pub mod verify;

/// A list of possible errors when performing a cross-ledger swap with the **Teleport** software
/// stack. Each error can have multiple levels down to the ledger client implementation.
#[derive(Error, Debug)]
pub enum Error {
    /// An offer contract error, the attempted interaction was rejected.
    #[error("Offer error: {0}")]
    Offer(#[from] offer::OfferError),
    /// An escrow contract error, the attempted call was reverted.
    #[error("Escrow error: {0}")]
    Escrow(#[from] escrow::EscrowError),
    /// A cross-ledger verification failure, the counterpart state did not
    /// match what this side expected.
    #[error("Verification error: {0}")]
    Verify(#[from] verify::VerifyError),
    /// An error from one of the underlying ledger clients.
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger::LedgerError),
    /// An error from the matcher's persisted store.
    #[error("Store error: {0}")]
    Store(#[from] matcher::store::StoreError),
    /// The matcher's event bus was disconnected, the engine is gone.
    #[error("Event bus disconnected")]
    Bus,
}
