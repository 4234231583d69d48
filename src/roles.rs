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

//! Swap roles. A [`Seller`] and a [`Buyer`] each drive their own half of the
//! protocol against both ledgers; every irreversible step is preceded by the
//! corresponding [`crate::verify`] check. Both roles are plain drivers with
//! no state of their own, everything they need is re-read from the ledgers.

use std::sync::Arc;

use log::{debug, info};

use crate::escrow::CreateEscrow;
use crate::hash::{HashLock, OfferIdHash};
use crate::ledger::{Address, AssetLedger, ContractId, Holder, PaymentLedger};
use crate::offer::{CreateOffer, OfferInteraction, OfferStage, OfferState};
use crate::verify;
use crate::Error;

/// The party selling an NFT for tokens.
pub struct Seller<A, P>
where
    A: AssetLedger + ?Sized,
    P: PaymentLedger + ?Sized,
{
    pub asset: Arc<A>,
    pub payment: Arc<P>,
    /// Key identity of the seller on both ledgers.
    pub signer: Address,
    /// Source transaction trusted offer instances are deployed from.
    pub offer_source: ContractId,
}

impl<A, P> Seller<A, P>
where
    A: AssetLedger + ?Sized,
    P: PaymentLedger + ?Sized,
{
    /// Deploy a fresh offer instance, move the NFT into its custody and
    /// initialize it. Returns the new offer id buyers are pointed at.
    pub fn create_offer(&self, params: CreateOffer) -> Result<ContractId, Error> {
        let offer_id = self.asset.deploy_offer(&self.offer_source, &self.signer)?;
        debug!("deployed offer instance {}", offer_id);
        self.asset.transfer_nft(
            &params.nft_contract_id,
            &self.signer,
            &params.nft_id,
            &Holder::Contract(offer_id.clone()),
        )?;
        self.asset.submit_offer_interaction(
            &offer_id,
            &self.signer,
            &OfferInteraction::Create(params),
        )?;
        info!("offer {} created", offer_id);
        Ok(offer_id)
    }

    /// Verify an announced escrow against the offer and, when it holds up,
    /// commit to it with `acceptSeller`. The hash-lock and buyer identity are
    /// copied from the verified escrow state, never from the announcement.
    pub fn accept_escrow(
        &self,
        offer_id: &ContractId,
        escrow_address: &Address,
    ) -> Result<OfferState, Error> {
        let offer = self.asset.read_offer_state(offer_id)?;
        let escrow = self.payment.escrow_state(escrow_address)?;
        verify::check_escrow_for_offer(
            self.payment.as_ref(),
            escrow_address,
            &escrow,
            offer_id,
            &offer,
        )?;
        let state = self.asset.submit_offer_interaction(
            offer_id,
            &self.signer,
            &OfferInteraction::AcceptSeller {
                hashed_password: escrow.hashed_password,
                buyer: escrow.owner,
            },
        )?;
        info!(
            "offer {} accepted against escrow {:#x}",
            offer_id, escrow_address
        );
        Ok(state)
    }

    /// Pull the secret the buyer revealed on the finalized offer and use it
    /// to finalize the escrow, collecting the payment.
    pub fn claim_escrow(
        &self,
        offer_id: &ContractId,
        escrow_address: &Address,
    ) -> Result<(), Error> {
        let offer = self.asset.read_offer_state(offer_id)?;
        let password = verify::revealed_password(&offer)?;
        self.payment
            .finalize_escrow(&self.signer, escrow_address, password)?;
        info!(
            "escrow {:#x} finalized with secret from offer {}",
            escrow_address, offer_id
        );
        Ok(())
    }

    /// Cancel the offer and take the NFT back. Succeeds immediately for a
    /// pending offer, after expiry for an accepted one.
    pub fn cancel_offer(&self, offer_id: &ContractId) -> Result<OfferState, Error> {
        let state = self.asset.submit_offer_interaction(
            offer_id,
            &self.signer,
            &OfferInteraction::Cancel,
        )?;
        info!("offer {} canceled", offer_id);
        Ok(state)
    }
}

/// The party paying tokens for an NFT. The buyer generates the swap secret
/// and is the only participant who knows it until they choose to reveal it.
pub struct Buyer<A, P>
where
    A: AssetLedger + ?Sized,
    P: PaymentLedger + ?Sized,
{
    pub asset: Arc<A>,
    pub payment: Arc<P>,
    pub signer: Address,
    pub offer_source: ContractId,
}

impl<A, P> Buyer<A, P>
where
    A: AssetLedger + ?Sized,
    P: PaymentLedger + ?Sized,
{
    /// Respond to an offer: verify its provenance, deploy an escrow bound to
    /// it and fund the escrow with the full price. `secret` stays local, only
    /// its commitment leaves this call. Returns the escrow address to
    /// announce to the seller.
    pub fn accept_offer(
        &self,
        offer_id: &ContractId,
        secret: &str,
        lock_time: u64,
    ) -> Result<Address, Error> {
        verify::check_offer_origin(self.asset.as_ref(), offer_id, &self.offer_source)?;
        let offer = self.asset.read_offer_state(offer_id)?;
        if offer.stage != OfferStage::Pending {
            return Err(verify::VerifyError::WrongStage {
                expected: OfferStage::Pending.to_string(),
                found: offer.stage.to_string(),
            }
            .into());
        }
        let escrow_address = self.payment.create_escrow(
            &self.signer,
            &CreateEscrow {
                offer_id_hash: OfferIdHash::commit(offer_id),
                receiver: offer.owner,
                hashed_password: HashLock::commit(secret),
                lock_time,
                token: offer.price_token_id,
                amount: offer.price,
            },
        )?;
        debug!("escrow {:#x} deployed for offer {}", escrow_address, offer_id);
        self.payment.transfer_token(
            &self.signer,
            &offer.price_token_id,
            &escrow_address,
            offer.price,
        )?;
        info!(
            "escrow {:#x} funded with {} for offer {}",
            escrow_address, offer.price, offer_id
        );
        Ok(escrow_address)
    }

    /// Reveal the secret on the offer and take the NFT. Refuses to reveal
    /// unless the seller accepted *this* buyer's escrow.
    pub fn finalize_offer(
        &self,
        offer_id: &ContractId,
        secret: &str,
    ) -> Result<OfferState, Error> {
        let offer = self.asset.read_offer_state(offer_id)?;
        verify::check_offer_finalizable(&offer, &HashLock::commit(secret), &self.signer)?;
        let state = self.asset.submit_offer_interaction(
            offer_id,
            &self.signer,
            &OfferInteraction::Finalize {
                password: secret.to_string(),
            },
        )?;
        info!("offer {} finalized, secret revealed", offer_id);
        Ok(state)
    }

    /// Reclaim the funds of an expired escrow the seller never claimed.
    pub fn reclaim_escrow(&self, escrow_address: &Address) -> Result<(), Error> {
        self.payment.cancel_escrow(&self.signer, escrow_address)?;
        info!("escrow {:#x} canceled, funds reclaimed", escrow_address);
        Ok(())
    }
}
