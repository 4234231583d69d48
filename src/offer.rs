// Copyright 2022-2023 Teleport Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Offer state machine, the asset-ledger side of a swap. One instance per
//! swap takes custody of the NFT and walks through
//! `PENDING → ACCEPTED_BY_SELLER → FINALIZED`, or back out through
//! `CANCELED`. The ledger recomputes an instance's state by replaying its
//! interaction log, so every operation here is a pure transition over a
//! [`CallContext`]; side effects (NFT transfers) are returned as
//! [`OfferEffect`] values for the executor to apply.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::HashLock;
use crate::ledger::{Address, ContractId, Holder};

/// Minimum accepted `expirePeriod`, in seconds. Locks shorter than this leave
/// the buyer no safe window to act after funding.
pub const MIN_LOCK_PERIOD: u64 = 3600;

/// Errors raised when an offer interaction is evaluated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OfferError {
    /// `create` was submitted to an instance that already holds state.
    #[error("Can't create offer if initial state is not empty")]
    AlreadyInitialized,
    /// A non-`create` interaction was submitted to an empty instance.
    #[error("Offer instance is empty")]
    NotInitialized,
    /// An input failed basic validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// The expire period is below [`MIN_LOCK_PERIOD`].
    #[error("Lock time {got}s has to be at least equal to {min}s")]
    InvalidExpiry { min: u64, got: u64 },
    /// The price is not a positive integer.
    #[error("Price is not a positive integer")]
    InvalidPrice,
    /// The offer contract does not hold the NFT it is supposed to sell.
    #[error("Offer contract is not owner of NFT: {0}")]
    NotNftOwner(String),
    /// The interaction is not valid in the current stage.
    #[error("Wrong stage: expected {expected}, found {found}")]
    WrongStage {
        expected: OfferStage,
        found: OfferStage,
    },
    /// The signer is not entitled to this transition.
    #[error("Signer is not authorized")]
    Unauthorized,
    /// The supplied password does not hash to the stored commitment.
    #[error("Wrong password")]
    PasswordMismatch,
    /// Cancellation attempted before the lock expired.
    #[error("Offer has to expire to be canceled, expires at {expire_at}, now {now}")]
    NotExpired { expire_at: u64, now: u64 },
    /// The offer already reached a terminal stage.
    #[error("Can't act on offer in terminal stage {0}")]
    TerminalState(OfferStage),
}

/// Stage of an offer instance. `FINALIZED` and `CANCELED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStage {
    Pending,
    AcceptedBySeller,
    Finalized,
    Canceled,
}

impl fmt::Display for OfferStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OfferStage::Pending => "PENDING",
            OfferStage::AcceptedBySeller => "ACCEPTED_BY_SELLER",
            OfferStage::Finalized => "FINALIZED",
            OfferStage::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// Evaluation context of one interaction: who signed it, when the ledger
/// committed it and which instance it was evaluated on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub caller: Address,
    pub timestamp: u64,
    pub contract: ContractId,
}

/// Parameters of the `create` interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOffer {
    pub nft_contract_id: ContractId,
    pub nft_id: String,
    pub price: u64,
    pub price_token_id: Address,
    pub expire_period: u64,
    /// Overrides the signer as the recorded owner and payment receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<Address>,
    /// Identity pre-authorized to run `acceptSeller` on the owner's behalf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Address>,
}

/// Interaction log entry payload, tagged the way it is written on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function")]
pub enum OfferInteraction {
    #[serde(rename = "create")]
    Create(CreateOffer),
    #[serde(rename = "acceptSeller", rename_all = "camelCase")]
    AcceptSeller {
        hashed_password: HashLock,
        buyer: Address,
    },
    #[serde(rename = "finalize")]
    Finalize { password: String },
    #[serde(rename = "cancel")]
    Cancel,
}

/// Side effect of a transition, applied by the executor after the new state
/// is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferEffect {
    /// Transfer the NFT out of the offer contract's custody.
    TransferNft {
        nft_contract: ContractId,
        nft_id: String,
        to: Holder,
    },
}

/// Evaluated state of an offer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferState {
    pub stage: OfferStage,
    pub nft_contract_id: ContractId,
    pub nft_id: String,
    pub price: u64,
    pub price_token_id: Address,
    pub owner: Address,
    pub expire_period: u64,
    /// Absolute expiry, computed once the offer is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<u64>,
    /// Set atomically with `hashedPassword` at `acceptSeller`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Address>,
    /// Immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_password: Option<HashLock>,
    /// The revealed secret, present only in `FINALIZED` state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Address>,
}

impl OfferState {
    /// Evaluate `create` on an instance. `nft_owner` is the asset contract's
    /// answer to `ownerOf` at evaluation time; the seller must have moved the
    /// NFT into the offer contract's custody before or atomically with this
    /// call.
    pub fn create(
        existing: Option<&OfferState>,
        ctx: &CallContext,
        params: &CreateOffer,
        nft_owner: &Holder,
    ) -> Result<OfferState, OfferError> {
        if existing.is_some() {
            return Err(OfferError::AlreadyInitialized);
        }
        if params.nft_id.is_empty() {
            return Err(OfferError::InvalidInput("nftId is empty".into()));
        }
        if params.expire_period < MIN_LOCK_PERIOD {
            return Err(OfferError::InvalidExpiry {
                min: MIN_LOCK_PERIOD,
                got: params.expire_period,
            });
        }
        if params.price == 0 {
            return Err(OfferError::InvalidPrice);
        }
        if *nft_owner != Holder::Contract(ctx.contract.clone()) {
            return Err(OfferError::NotNftOwner(params.nft_id.clone()));
        }
        Ok(OfferState {
            stage: OfferStage::Pending,
            nft_contract_id: params.nft_contract_id.clone(),
            nft_id: params.nft_id.clone(),
            price: params.price,
            price_token_id: params.price_token_id,
            owner: params.receiver.unwrap_or(ctx.caller),
            expire_period: params.expire_period,
            expire_at: None,
            buyer: None,
            hashed_password: None,
            password: None,
            delegate: params.delegate,
        })
    }

    /// Evaluate `acceptSeller`. This is the race-resolution point: the first
    /// call to commit wins the offer for its escrow, later calls fail
    /// [`OfferError::WrongStage`]. `buyer` and the hash-lock are set in the
    /// same transition and the commitment is immutable from here on.
    pub fn accept_seller(
        &mut self,
        ctx: &CallContext,
        hashed_password: HashLock,
        buyer: Address,
    ) -> Result<(), OfferError> {
        if self.stage != OfferStage::Pending {
            return Err(OfferError::WrongStage {
                expected: OfferStage::Pending,
                found: self.stage,
            });
        }
        let authorized = ctx.caller == self.owner || Some(ctx.caller) == self.delegate;
        if !authorized {
            return Err(OfferError::Unauthorized);
        }
        self.buyer = Some(buyer);
        self.hashed_password = Some(hashed_password);
        self.expire_at = Some(ctx.timestamp.saturating_add(self.expire_period));
        self.stage = OfferStage::AcceptedBySeller;
        Ok(())
    }

    /// Evaluate `finalize`: reveal the secret and hand the NFT to the buyer.
    pub fn finalize(
        &mut self,
        _ctx: &CallContext,
        password: &str,
    ) -> Result<OfferEffect, OfferError> {
        if self.stage != OfferStage::AcceptedBySeller {
            return Err(OfferError::WrongStage {
                expected: OfferStage::AcceptedBySeller,
                found: self.stage,
            });
        }
        match self.hashed_password {
            Some(lock) if lock.matches(password) => {}
            _ => return Err(OfferError::PasswordMismatch),
        }
        // buyer is set atomically with hashed_password at acceptSeller
        let buyer = self.buyer.ok_or(OfferError::Unauthorized)?;
        self.password = Some(password.to_string());
        self.stage = OfferStage::Finalized;
        Ok(OfferEffect::TransferNft {
            nft_contract: self.nft_contract_id.clone(),
            nft_id: self.nft_id.clone(),
            to: Holder::Wallet(buyer),
        })
    }

    /// Evaluate `cancel`: return the NFT to the owner. Pending offers cancel
    /// immediately; accepted offers only once the lock expired.
    pub fn cancel(&mut self, ctx: &CallContext) -> Result<OfferEffect, OfferError> {
        if ctx.caller != self.owner {
            return Err(OfferError::Unauthorized);
        }
        match self.stage {
            OfferStage::Pending => {}
            OfferStage::AcceptedBySeller => {
                let expire_at = self.expire_at.unwrap_or(u64::MAX);
                if ctx.timestamp < expire_at {
                    return Err(OfferError::NotExpired {
                        expire_at,
                        now: ctx.timestamp,
                    });
                }
            }
            stage => return Err(OfferError::TerminalState(stage)),
        }
        self.stage = OfferStage::Canceled;
        Ok(OfferEffect::TransferNft {
            nft_contract: self.nft_contract_id.clone(),
            nft_id: self.nft_id.clone(),
            to: Holder::Wallet(self.owner),
        })
    }
}

/// One committed entry of an instance's interaction log. For `create`
/// entries the ownership read performed at evaluation time is recorded next
/// to the input, so a later replay folds to the same state without re-issuing
/// the read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ctx: CallContext,
    pub input: OfferInteraction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nft_owner: Option<Holder>,
}

/// Evaluate one log entry against the current state. Returns the next state
/// and the effect the entry produced when it was first committed.
pub fn apply(
    state: Option<OfferState>,
    entry: &LogEntry,
) -> Result<(OfferState, Option<OfferEffect>), OfferError> {
    match &entry.input {
        OfferInteraction::Create(params) => {
            let owner = entry
                .nft_owner
                .as_ref()
                .ok_or_else(|| OfferError::InvalidInput("missing ownership read".into()))?;
            let next = OfferState::create(state.as_ref(), &entry.ctx, params, owner)?;
            Ok((next, None))
        }
        OfferInteraction::AcceptSeller {
            hashed_password,
            buyer,
        } => {
            let mut next = state.ok_or(OfferError::NotInitialized)?;
            next.accept_seller(&entry.ctx, *hashed_password, *buyer)?;
            Ok((next, None))
        }
        OfferInteraction::Finalize { password } => {
            let mut next = state.ok_or(OfferError::NotInitialized)?;
            let effect = next.finalize(&entry.ctx, password)?;
            Ok((next, Some(effect)))
        }
        OfferInteraction::Cancel => {
            let mut next = state.ok_or(OfferError::NotInitialized)?;
            let effect = next.cancel(&entry.ctx)?;
            Ok((next, Some(effect)))
        }
    }
}

/// Fold an interaction log into the instance's current state. The fold is the
/// single source of truth for reads; entries that were rejected at commit
/// time must not be part of the log.
pub fn replay<'a, I>(entries: I) -> Result<Option<OfferState>, OfferError>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut state = None;
    for entry in entries {
        let (next, _effect) = apply(state, entry)?;
        state = Some(next);
    }
    Ok(state)
}
