//! In-memory stand-ins for both ledgers and the interaction index. The asset
//! ledger evaluates offers the way the real one does, by folding interaction
//! logs; the payment ledger keeps balances and an append-only event log.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use teleport_core::escrow::{CreateEscrow, EscrowState};
use teleport_core::ledger::{
    Address, AssetLedger, ContractId, Deployment, EscrowCreated, Holder, InteractionIndex,
    InteractionRecord, LedgerError, Page, PaymentLedger, StateHandler,
};
use teleport_core::offer::{self, CallContext, LogEntry, OfferEffect, OfferInteraction, OfferState};

/// Shared wall clock, seconds. Both ledgers stamp with the same time so
/// expiries line up across them.
#[derive(Clone, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl TestClock {
    pub fn new(start: u64) -> Self {
        TestClock(Arc::new(AtomicU64::new(start)))
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

pub fn contract_id(tag: &str) -> ContractId {
    format!("{:_<43}", tag).parse().unwrap()
}

struct OfferContract {
    source: ContractId,
    init_state: serde_json::Value,
    log: Vec<LogEntry>,
}

/// Log-structured asset ledger: contracts hold interaction logs, reads fold
/// them. NFTs live in a flat registry keyed by contract and token id.
pub struct MemoryAssetLedger {
    clock: TestClock,
    contracts: Mutex<HashMap<ContractId, OfferContract>>,
    nfts: Mutex<HashMap<(ContractId, String), Holder>>,
    subscribers: Mutex<HashMap<ContractId, Vec<StateHandler>>>,
    index: Arc<MemoryIndex>,
    counter: AtomicU64,
}

impl MemoryAssetLedger {
    pub fn new(clock: TestClock, index: Arc<MemoryIndex>) -> Self {
        MemoryAssetLedger {
            clock,
            contracts: Mutex::new(HashMap::new()),
            nfts: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            index,
            counter: AtomicU64::new(0),
        }
    }

    pub fn mint_nft(&self, nft_contract: &ContractId, nft_id: &str, owner: Holder) {
        self.nfts
            .lock()
            .unwrap()
            .insert((nft_contract.clone(), nft_id.to_string()), owner);
    }

    /// Number of committed interactions on an offer instance.
    pub fn log_len(&self, contract: &ContractId) -> usize {
        self.contracts
            .lock()
            .unwrap()
            .get(contract)
            .map(|c| c.log.len())
            .unwrap_or(0)
    }

    fn next_id(&self, prefix: &str) -> ContractId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        contract_id(&format!("{}-{}", prefix, n))
    }

    fn apply_effect(&self, effect: OfferEffect) {
        match effect {
            OfferEffect::TransferNft {
                nft_contract,
                nft_id,
                to,
            } => {
                self.nfts.lock().unwrap().insert((nft_contract, nft_id), to);
            }
        }
    }

    fn notify(&self, contract: &ContractId, state: &OfferState) {
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(handlers) = subscribers.get(contract) {
            for handler in handlers {
                handler(state.clone());
            }
        }
    }
}

impl AssetLedger for MemoryAssetLedger {
    fn deploy_offer(
        &self,
        source: &ContractId,
        _signer: &Address,
    ) -> Result<ContractId, LedgerError> {
        let id = self.next_id("offer");
        self.contracts.lock().unwrap().insert(
            id.clone(),
            OfferContract {
                source: source.clone(),
                init_state: serde_json::json!({}),
                log: Vec::new(),
            },
        );
        Ok(id)
    }

    fn submit_offer_interaction(
        &self,
        contract: &ContractId,
        signer: &Address,
        input: &OfferInteraction,
    ) -> Result<OfferState, LedgerError> {
        let state = {
            let mut contracts = self.contracts.lock().unwrap();
            let instance = contracts
                .get_mut(contract)
                .ok_or_else(|| LedgerError::NotFound(contract.to_string()))?;
            let ctx = CallContext {
                caller: *signer,
                timestamp: self.clock.now(),
                contract: contract.clone(),
            };
            let nft_owner = match input {
                OfferInteraction::Create(params) => self
                    .nfts
                    .lock()
                    .unwrap()
                    .get(&(params.nft_contract_id.clone(), params.nft_id.clone()))
                    .cloned(),
                _ => None,
            };
            let entry = LogEntry {
                ctx,
                input: input.clone(),
                nft_owner,
            };
            let current = offer::replay(&instance.log)
                .map_err(|e| LedgerError::Rejected(e.to_string()))?;
            let (next, effect) =
                offer::apply(current, &entry).map_err(|e| LedgerError::Rejected(e.to_string()))?;
            instance.log.push(entry);
            if let Some(effect) = effect {
                self.apply_effect(effect);
            }
            if let OfferInteraction::Create(params) = input {
                if let Some(delegate) = params.delegate {
                    self.index.push(
                        delegate,
                        InteractionRecord {
                            id: format!("ix-{}", self.counter.fetch_add(1, Ordering::Relaxed)),
                            contract: contract.clone(),
                            block_height: self.clock.now(),
                            owner: *signer,
                        },
                    );
                }
            }
            next
        };
        self.notify(contract, &state);
        Ok(state)
    }

    fn read_offer_state(&self, contract: &ContractId) -> Result<OfferState, LedgerError> {
        let contracts = self.contracts.lock().unwrap();
        let instance = contracts
            .get(contract)
            .ok_or_else(|| LedgerError::NotFound(contract.to_string()))?;
        offer::replay(&instance.log)
            .map_err(|e| LedgerError::Rejected(e.to_string()))?
            .ok_or_else(|| LedgerError::NotFound(contract.to_string()))
    }

    fn subscribe_offer_state(
        &self,
        contract: &ContractId,
        handler: StateHandler,
    ) -> Result<(), LedgerError> {
        self.subscribers
            .lock()
            .unwrap()
            .entry(contract.clone())
            .or_default()
            .push(handler);
        Ok(())
    }

    fn deployment(&self, contract: &ContractId) -> Result<Deployment, LedgerError> {
        let contracts = self.contracts.lock().unwrap();
        let instance = contracts
            .get(contract)
            .ok_or_else(|| LedgerError::NotFound(contract.to_string()))?;
        Ok(Deployment {
            source: instance.source.clone(),
            init_state: instance.init_state.clone(),
        })
    }

    fn transfer_nft(
        &self,
        nft_contract: &ContractId,
        signer: &Address,
        nft_id: &str,
        to: &Holder,
    ) -> Result<(), LedgerError> {
        let mut nfts = self.nfts.lock().unwrap();
        let key = (nft_contract.clone(), nft_id.to_string());
        match nfts.get(&key) {
            Some(holder) if *holder == Holder::Wallet(*signer) => {
                nfts.insert(key, to.clone());
                Ok(())
            }
            Some(_) => Err(LedgerError::Rejected("not NFT owner".into())),
            None => Err(LedgerError::NotFound(nft_id.to_string())),
        }
    }

    fn nft_owner(&self, nft_contract: &ContractId, nft_id: &str) -> Result<Holder, LedgerError> {
        self.nfts
            .lock()
            .unwrap()
            .get(&(nft_contract.clone(), nft_id.to_string()))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(nft_id.to_string()))
    }
}

/// Account-based payment ledger: balances, deployed escrows, a block counter
/// and the escrow-creation event log.
pub struct MemoryPaymentLedger {
    clock: TestClock,
    block: AtomicU64,
    balances: Mutex<HashMap<(Address, Address), u64>>,
    escrows: Mutex<HashMap<Address, EscrowState>>,
    events: Mutex<Vec<EscrowCreated>>,
    counter: AtomicU64,
}

impl MemoryPaymentLedger {
    pub fn new(clock: TestClock) -> Self {
        MemoryPaymentLedger {
            clock,
            block: AtomicU64::new(0),
            balances: Mutex::new(HashMap::new()),
            escrows: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0x1000),
        }
    }

    pub fn mint(&self, token: &Address, holder: &Address, amount: u64) {
        *self
            .balances
            .lock()
            .unwrap()
            .entry((*token, *holder))
            .or_insert(0) += amount;
    }

    pub fn advance_blocks(&self, n: u64) {
        self.block.fetch_add(n, Ordering::Relaxed);
    }

    fn move_tokens(
        &self,
        token: &Address,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let mut balances = self.balances.lock().unwrap();
        let src = balances.entry((*token, *from)).or_insert(0);
        if *src < amount {
            return Err(LedgerError::Rejected("insufficient balance".into()));
        }
        *src -= amount;
        *balances.entry((*token, *to)).or_insert(0) += amount;
        Ok(())
    }
}

impl PaymentLedger for MemoryPaymentLedger {
    fn latest_block(&self) -> Result<u64, LedgerError> {
        Ok(self.block.load(Ordering::Relaxed))
    }

    fn create_escrow(
        &self,
        signer: &Address,
        params: &CreateEscrow,
    ) -> Result<Address, LedgerError> {
        let state = EscrowState::create(params, *signer, self.clock.now())
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;
        let address = Address::from_low_u64_be(self.counter.fetch_add(1, Ordering::Relaxed));
        self.escrows.lock().unwrap().insert(address, state);
        let block = self.block.fetch_add(1, Ordering::Relaxed) + 1;
        self.events.lock().unwrap().push(EscrowCreated {
            escrow: address,
            offer_id_hash: params.offer_id_hash,
            block,
        });
        Ok(address)
    }

    fn escrow_state(&self, escrow: &Address) -> Result<EscrowState, LedgerError> {
        self.escrows
            .lock()
            .unwrap()
            .get(escrow)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("{:#x}", escrow)))
    }

    fn finalize_escrow(
        &self,
        _signer: &Address,
        escrow: &Address,
        password: &str,
    ) -> Result<(), LedgerError> {
        let effect = {
            let mut escrows = self.escrows.lock().unwrap();
            let state = escrows
                .get_mut(escrow)
                .ok_or_else(|| LedgerError::NotFound(format!("{:#x}", escrow)))?;
            state
                .finalize(password)
                .map_err(|e| LedgerError::Rejected(e.to_string()))?
        };
        match effect {
            teleport_core::escrow::EscrowEffect::PayOut { token, to, amount } => {
                self.move_tokens(&token, escrow, &to, amount)
            }
            _ => unreachable!("finalize only pays out"),
        }
    }

    fn cancel_escrow(&self, signer: &Address, escrow: &Address) -> Result<(), LedgerError> {
        let effect = {
            let mut escrows = self.escrows.lock().unwrap();
            let state = escrows
                .get_mut(escrow)
                .ok_or_else(|| LedgerError::NotFound(format!("{:#x}", escrow)))?;
            state
                .cancel(*signer, self.clock.now())
                .map_err(|e| LedgerError::Rejected(e.to_string()))?
        };
        match effect {
            teleport_core::escrow::EscrowEffect::RefundAll { token, to } => {
                let balance = self
                    .balances
                    .lock()
                    .unwrap()
                    .get(&(token, *escrow))
                    .copied()
                    .unwrap_or(0);
                self.move_tokens(&token, escrow, &to, balance)
            }
            _ => unreachable!("cancel only refunds"),
        }
    }

    fn transfer_token(
        &self,
        signer: &Address,
        token: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<(), LedgerError> {
        self.move_tokens(token, signer, to, amount)
    }

    fn balance_of(&self, token: &Address, holder: &Address) -> Result<u64, LedgerError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(*token, *holder))
            .copied()
            .unwrap_or(0))
    }

    fn escrow_created_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EscrowCreated>, LedgerError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block >= from_block && e.block < to_block)
            .cloned()
            .collect())
    }
}

/// Index over create-offer interactions, filterable by delegate tag.
#[derive(Default)]
pub struct MemoryIndex {
    records: Mutex<Vec<(Address, InteractionRecord)>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, delegate: Address, record: InteractionRecord) {
        self.records.lock().unwrap().push((delegate, record));
    }
}

impl InteractionIndex for MemoryIndex {
    fn delegated_offers(
        &self,
        delegate: &Address,
        page: usize,
        limit: usize,
    ) -> Result<Page<InteractionRecord>, LedgerError> {
        let records = self.records.lock().unwrap();
        let items = records
            .iter()
            .filter(|(d, _)| d == delegate)
            .map(|(_, r)| r.clone())
            .skip((page - 1) * limit)
            .take(limit)
            .collect();
        Ok(Page { items, page, limit })
    }
}
