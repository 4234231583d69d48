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

//! Escrow state machine, the payment-ledger side of a swap. One instance per
//! swap attempt is deployed through a factory, funded with the payment token
//! and bound to exactly one offer through [`OfferIdHash`]. The instance is
//! `PENDING` until a correct preimage finalizes it towards the receiver, or
//! until expiry lets the owner pull the funds back out.
//!
//! Like [`crate::offer`], operations here are pure transitions; token moves
//! come back as [`EscrowEffect`] values for the executor to apply.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::hash::{HashLock, OfferIdHash};
use crate::ledger::Address;

/// Minimum accepted `lockTime`, in seconds. Mirrors
/// [`crate::offer::MIN_LOCK_PERIOD`]: an escrow that expires faster than the
/// offer it pays for lets the buyer reclaim funds while the seller is still
/// committed.
pub const MIN_LOCK_TIME: u64 = 3600;

/// Errors raised by escrow calls, the revert reasons of the deployed
/// instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// The lock time is below [`MIN_LOCK_TIME`].
    #[error("Lock time {got}s has to be at least equal to {min}s")]
    InvalidLockTime { min: u64, got: u64 },
    /// The supplied password does not hash to the stored commitment.
    #[error("Wrong secret")]
    WrongSecret,
    /// The call is not valid in the current stage.
    #[error("Wrong stage: expected {expected}, found {found}")]
    WrongStage {
        expected: EscrowStage,
        found: EscrowStage,
    },
    /// Cancellation attempted before the lock expired.
    #[error("Escrow has to expire to be canceled, expires at {expire_at}, now {now}")]
    NotExpired { expire_at: u64, now: u64 },
    /// The caller is not entitled to this call.
    #[error("Caller is not authorized")]
    Unauthorized,
}

/// Stage of an escrow instance. `FINALIZED` and `CANCELED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStage {
    Pending,
    Finalized,
    Canceled,
}

impl fmt::Display for EscrowStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EscrowStage::Pending => "PENDING",
            EscrowStage::Finalized => "FINALIZED",
            EscrowStage::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// Constructor parameters of a new escrow instance, submitted to the factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEscrow {
    /// Commitment binding this escrow to one offer.
    pub offer_id_hash: OfferIdHash,
    /// Who a successful `finalize` pays, i.e. the seller.
    pub receiver: Address,
    /// Hash-lock copied from the offer the buyer intends to pay for.
    pub hashed_password: HashLock,
    /// Seconds until the deployer may reclaim the funds.
    pub lock_time: u64,
    /// The payment token the escrow holds.
    pub token: Address,
    /// Amount a successful `finalize` pays out.
    pub amount: u64,
}

/// Side effect of an escrow transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowEffect {
    /// Pay the locked amount to the receiver.
    PayOut {
        token: Address,
        to: Address,
        amount: u64,
    },
    /// Return everything the escrow holds to its owner.
    RefundAll { token: Address, to: Address },
}

/// State of a deployed escrow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowState {
    pub stage: EscrowStage,
    pub offer_id_hash: OfferIdHash,
    /// The deployer, refunded on `cancel`.
    pub owner: Address,
    pub receiver: Address,
    pub hashed_password: HashLock,
    pub token: Address,
    pub amount: u64,
    /// Absolute expiry, fixed at deployment.
    pub lock_expire_at: u64,
}

impl EscrowState {
    /// Evaluate the constructor. `owner` is the factory caller and `now` the
    /// deployment block's timestamp; all fields are immutable afterwards,
    /// only `stage` moves.
    pub fn create(params: &CreateEscrow, owner: Address, now: u64) -> Result<Self, EscrowError> {
        if params.lock_time < MIN_LOCK_TIME {
            return Err(EscrowError::InvalidLockTime {
                min: MIN_LOCK_TIME,
                got: params.lock_time,
            });
        }
        Ok(EscrowState {
            stage: EscrowStage::Pending,
            offer_id_hash: params.offer_id_hash,
            owner,
            receiver: params.receiver,
            hashed_password: params.hashed_password,
            token: params.token,
            amount: params.amount,
            lock_expire_at: now.saturating_add(params.lock_time),
        })
    }

    /// Evaluate `finalize(password)`. Callable by anyone holding the right
    /// preimage; knowledge of the secret is the only credential.
    pub fn finalize(&mut self, password: &str) -> Result<EscrowEffect, EscrowError> {
        if self.stage != EscrowStage::Pending {
            return Err(EscrowError::WrongStage {
                expected: EscrowStage::Pending,
                found: self.stage,
            });
        }
        if !self.hashed_password.matches(password) {
            return Err(EscrowError::WrongSecret);
        }
        self.stage = EscrowStage::Finalized;
        Ok(EscrowEffect::PayOut {
            token: self.token,
            to: self.receiver,
            amount: self.amount,
        })
    }

    /// Evaluate `cancel()`. Only the owner, only after expiry.
    pub fn cancel(&mut self, caller: Address, now: u64) -> Result<EscrowEffect, EscrowError> {
        if caller != self.owner {
            return Err(EscrowError::Unauthorized);
        }
        if self.stage != EscrowStage::Pending {
            return Err(EscrowError::WrongStage {
                expected: EscrowStage::Pending,
                found: self.stage,
            });
        }
        if now < self.lock_expire_at {
            return Err(EscrowError::NotExpired {
                expire_at: self.lock_expire_at,
                now,
            });
        }
        self.stage = EscrowStage::Canceled;
        Ok(EscrowEffect::RefundAll {
            token: self.token,
            to: self.owner,
        })
    }
}
