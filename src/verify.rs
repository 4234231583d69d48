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

//! Cross-ledger verification. The two ledgers cannot read each other, so
//! before committing an irreversible step each party re-derives the
//! counterpart's promises from primary sources: contract state, deployment
//! metadata and token balances. Nothing here trusts a notification payload
//! beyond using it as a pointer.

use thiserror::Error;

use crate::escrow::{EscrowStage, EscrowState};
use crate::hash::{HashLock, OfferIdHash};
use crate::ledger::{Address, AssetLedger, ContractId, LedgerError, PaymentLedger};
use crate::offer::{OfferStage, OfferState};

/// Reasons a counterpart's state failed verification. Every variant is a
/// terminal "walk away" answer for the swap attempt under inspection, except
/// [`Self::Ledger`] which is a transient lookup failure.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// The escrow does not commit to the offer it was announced for.
    #[error("Escrow commits to another offer")]
    EscrowMismatch,
    /// The escrow pays someone other than the offer owner.
    #[error("Escrow receiver is not the offer owner")]
    ReceiverMismatch,
    /// The escrow balance does not cover the offer price.
    #[error("Escrow holds {balance} of the payment token, offer price is {price}")]
    NotFunded { balance: u64, price: u64 },
    /// The offer instance was not deployed from the trusted source
    /// transaction.
    #[error("Offer deployed from untrusted source {0}")]
    UntrustedOrigin(ContractId),
    /// The offer instance was deployed with pre-seeded state.
    #[error("Offer deployed with non-empty initial state")]
    UntrustedInitState,
    /// The offer was accepted for a different buyer.
    #[error("Offer accepted for another buyer")]
    NotBuyer,
    /// The state under inspection is not in the stage this check requires.
    #[error("Wrong stage: expected {expected}, found {found}")]
    WrongStage { expected: String, found: String },
    /// The hash-lock on the counterpart does not match ours.
    #[error("Hash-lock differs from our commitment")]
    PasswordMismatch,
    /// The offer is finalized but carries no usable secret.
    #[error("Offer state does not reveal the password")]
    PasswordNotRevealed,
    /// A lookup on one of the ledgers failed; the check can be retried.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Seller-side check of an announced escrow, run before `acceptSeller`.
/// Confirms the escrow is live, bound to exactly this offer, pays the offer
/// owner and is funded up to the offer price. The hash-lock is *not* compared
/// to anything: the seller copies it from the escrow, whoever knows its
/// preimage is the buyer.
pub fn check_escrow_for_offer<P>(
    payment: &P,
    escrow_address: &Address,
    escrow: &EscrowState,
    offer_id: &ContractId,
    offer: &OfferState,
) -> Result<(), VerifyError>
where
    P: PaymentLedger + ?Sized,
{
    if escrow.stage != EscrowStage::Pending {
        return Err(VerifyError::WrongStage {
            expected: EscrowStage::Pending.to_string(),
            found: escrow.stage.to_string(),
        });
    }
    if escrow.offer_id_hash != OfferIdHash::commit(offer_id) {
        return Err(VerifyError::EscrowMismatch);
    }
    if escrow.receiver != offer.owner {
        return Err(VerifyError::ReceiverMismatch);
    }
    let balance = payment.balance_of(&offer.price_token_id, escrow_address)?;
    if balance < offer.price {
        return Err(VerifyError::NotFunded {
            balance,
            price: offer.price,
        });
    }
    Ok(())
}

/// Buyer-side check of an offer's provenance, run before locking any funds.
/// The offer's behavior is only known if its code is the trusted source
/// contract and nothing was smuggled in through the initial state.
pub fn check_offer_origin<A>(
    asset: &A,
    offer_id: &ContractId,
    trusted_source: &ContractId,
) -> Result<(), VerifyError>
where
    A: AssetLedger + ?Sized,
{
    let deployment = asset.deployment(offer_id)?;
    if deployment.source != *trusted_source {
        return Err(VerifyError::UntrustedOrigin(deployment.source));
    }
    let empty = match &deployment.init_state {
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if !empty {
        return Err(VerifyError::UntrustedInitState);
    }
    Ok(())
}

/// Buyer-side check before revealing the secret on the offer: the seller must
/// have accepted *our* escrow, i.e. the offer carries our hash-lock and names
/// us as buyer. Revealing against a foreign hash-lock would publish a secret
/// that opens nothing of ours; revealing when someone else is the buyer gives
/// the NFT away.
pub fn check_offer_finalizable(
    offer: &OfferState,
    own_lock: &HashLock,
    own_address: &Address,
) -> Result<(), VerifyError> {
    if offer.stage != OfferStage::AcceptedBySeller {
        return Err(VerifyError::WrongStage {
            expected: OfferStage::AcceptedBySeller.to_string(),
            found: offer.stage.to_string(),
        });
    }
    if offer.hashed_password.as_ref() != Some(own_lock) {
        return Err(VerifyError::PasswordMismatch);
    }
    if offer.buyer.as_ref() != Some(own_address) {
        return Err(VerifyError::NotBuyer);
    }
    Ok(())
}

/// Seller-side extraction of the revealed secret from a finalized offer. The
/// preimage is checked against the offer's own commitment before it is handed
/// to the escrow, a corrupt state never triggers a doomed payment-ledger
/// call.
pub fn revealed_password(offer: &OfferState) -> Result<&str, VerifyError> {
    if offer.stage != OfferStage::Finalized {
        return Err(VerifyError::WrongStage {
            expected: OfferStage::Finalized.to_string(),
            found: offer.stage.to_string(),
        });
    }
    let password = offer
        .password
        .as_deref()
        .ok_or(VerifyError::PasswordNotRevealed)?;
    match &offer.hashed_password {
        Some(lock) if lock.matches(password) => Ok(password),
        _ => Err(VerifyError::PasswordNotRevealed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::CreateEscrow;
    use crate::ledger::EscrowCreated;
    use crate::offer::{CallContext, CreateOffer, OfferState};
    use crate::ledger::Holder;

    /// Payment ledger stub where only balance lookups are answered.
    struct Balances(u64);

    impl PaymentLedger for Balances {
        fn latest_block(&self) -> Result<u64, LedgerError> {
            unimplemented!()
        }
        fn create_escrow(
            &self,
            _: &Address,
            _: &CreateEscrow,
        ) -> Result<Address, LedgerError> {
            unimplemented!()
        }
        fn escrow_state(&self, _: &Address) -> Result<EscrowState, LedgerError> {
            unimplemented!()
        }
        fn finalize_escrow(&self, _: &Address, _: &Address, _: &str) -> Result<(), LedgerError> {
            unimplemented!()
        }
        fn cancel_escrow(&self, _: &Address, _: &Address) -> Result<(), LedgerError> {
            unimplemented!()
        }
        fn transfer_token(
            &self,
            _: &Address,
            _: &Address,
            _: &Address,
            _: u64,
        ) -> Result<(), LedgerError> {
            unimplemented!()
        }
        fn balance_of(&self, _: &Address, _: &Address) -> Result<u64, LedgerError> {
            Ok(self.0)
        }
        fn escrow_created_events(&self, _: u64, _: u64) -> Result<Vec<EscrowCreated>, LedgerError> {
            unimplemented!()
        }
    }

    fn offer_id() -> ContractId {
        "f".repeat(43).parse().unwrap()
    }

    fn accepted_offer(buyer: Address, lock: HashLock) -> OfferState {
        let seller = Address::from_low_u64_be(1);
        let ctx = CallContext {
            caller: seller,
            timestamp: 100,
            contract: offer_id(),
        };
        let params = CreateOffer {
            nft_contract_id: "n".repeat(43).parse().unwrap(),
            nft_id: "a".into(),
            price: 10,
            price_token_id: Address::from_low_u64_be(12),
            expire_period: 3600,
            receiver: None,
            delegate: None,
        };
        let custody = Holder::Contract(ctx.contract.clone());
        let mut state = OfferState::create(None, &ctx, &params, &custody).unwrap();
        state
            .accept_seller(
                &CallContext {
                    caller: seller,
                    timestamp: 200,
                    contract: offer_id(),
                },
                lock,
                buyer,
            )
            .unwrap();
        state
    }

    fn pending_offer() -> OfferState {
        let mut state = accepted_offer(Address::from_low_u64_be(2), HashLock::commit("x"));
        state.stage = OfferStage::Pending;
        state.buyer = None;
        state.hashed_password = None;
        state.expire_at = None;
        state
    }

    fn matching_escrow(offer: &OfferState) -> EscrowState {
        EscrowState {
            stage: EscrowStage::Pending,
            offer_id_hash: OfferIdHash::commit(&offer_id()),
            owner: Address::from_low_u64_be(2),
            receiver: offer.owner,
            hashed_password: HashLock::commit("secret"),
            token: offer.price_token_id,
            amount: offer.price,
            lock_expire_at: 7200,
        }
    }

    #[test]
    fn escrow_check_accepts_well_formed_escrow() {
        let offer = pending_offer();
        let escrow = matching_escrow(&offer);
        let payment = Balances(10);
        check_escrow_for_offer(
            &payment,
            &Address::from_low_u64_be(77),
            &escrow,
            &offer_id(),
            &offer,
        )
        .unwrap();
    }

    #[test]
    fn escrow_check_rejects_foreign_commitment() {
        let offer = pending_offer();
        let mut escrow = matching_escrow(&offer);
        let other: ContractId = "g".repeat(43).parse().unwrap();
        escrow.offer_id_hash = OfferIdHash::commit(&other);
        let res = check_escrow_for_offer(
            &Balances(10),
            &Address::from_low_u64_be(77),
            &escrow,
            &offer_id(),
            &offer,
        );
        assert!(matches!(res, Err(VerifyError::EscrowMismatch)));
    }

    #[test]
    fn escrow_check_rejects_wrong_receiver_and_underfunding() {
        let offer = pending_offer();
        let mut escrow = matching_escrow(&offer);
        escrow.receiver = Address::from_low_u64_be(66);
        let res = check_escrow_for_offer(
            &Balances(10),
            &Address::from_low_u64_be(77),
            &escrow,
            &offer_id(),
            &offer,
        );
        assert!(matches!(res, Err(VerifyError::ReceiverMismatch)));

        let escrow = matching_escrow(&offer);
        let res = check_escrow_for_offer(
            &Balances(9),
            &Address::from_low_u64_be(77),
            &escrow,
            &offer_id(),
            &offer,
        );
        assert!(matches!(
            res,
            Err(VerifyError::NotFunded { balance: 9, price: 10 })
        ));
    }

    #[test]
    fn finalizable_check_guards_secret_reveal() {
        let me = Address::from_low_u64_be(2);
        let my_lock = HashLock::commit("secret");

        let offer = accepted_offer(me, my_lock);
        check_offer_finalizable(&offer, &my_lock, &me).unwrap();

        // seller accepted someone else's escrow
        let foreign = accepted_offer(Address::from_low_u64_be(3), HashLock::commit("other"));
        assert!(matches!(
            check_offer_finalizable(&foreign, &my_lock, &me),
            Err(VerifyError::PasswordMismatch)
        ));

        // same lock but another buyer recorded
        let hijacked = accepted_offer(Address::from_low_u64_be(3), my_lock);
        assert!(matches!(
            check_offer_finalizable(&hijacked, &my_lock, &me),
            Err(VerifyError::NotBuyer)
        ));
    }

    #[test]
    fn revealed_password_requires_consistent_final_state() {
        let buyer = Address::from_low_u64_be(2);
        let mut offer = accepted_offer(buyer, HashLock::commit("secret"));
        assert!(matches!(
            revealed_password(&offer),
            Err(VerifyError::WrongStage { .. })
        ));

        offer
            .finalize(
                &CallContext {
                    caller: buyer,
                    timestamp: 300,
                    contract: offer_id(),
                },
                "secret",
            )
            .unwrap();
        assert_eq!(revealed_password(&offer).unwrap(), "secret");

        offer.password = Some("tampered".into());
        assert!(matches!(
            revealed_password(&offer),
            Err(VerifyError::PasswordNotRevealed)
        ));
    }
}
