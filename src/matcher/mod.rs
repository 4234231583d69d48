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

//! The matcher: a daemon driving swaps to completion on behalf of passive
//! participants. Offer discovery, state subscriptions and the notification
//! endpoint feed one event bus consumed by a core loop; the escrow scanner
//! handles its events inline so the scan checkpoint only advances once the
//! escrows of a range were acted on. A serializing gate inside the engine
//! keeps handling single-writer across those threads.
//!
//! Every side effect is guarded by a durable marker written *after* the
//! effect succeeds. Duplicated events, rescanned block ranges and restarts
//! therefore collapse into no-ops, and a failed action is retried when its
//! trigger is re-delivered.

pub mod discovery;
pub mod scanner;
pub mod server;
pub mod store;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use self::discovery::OfferDiscovery;
use self::scanner::EscrowScanner;
use self::server::{Notification, NotificationServer};
use self::store::{MarkerStore, PendingPassword, Store};
use crate::hash::HashLock;
use crate::ledger::{
    Address, AssetLedger, ContractId, EscrowCreated, InteractionIndex, PaymentLedger,
};
use crate::offer::{OfferInteraction, OfferStage, OfferState};
use crate::verify;
use crate::Error;

/// Tuning of the matcher's polling sources.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Blocks covered by one payment-ledger scan pass.
    pub block_limit: u64,
    /// How far behind the chain head a fresh matcher starts scanning.
    pub lookback: u64,
    /// Delay between polls when a source is caught up.
    pub poll_interval: Duration,
    /// Page size for interaction-index queries.
    pub page_limit: usize,
    /// Address of the notification endpoint, if one should be served.
    pub listen: Option<SocketAddr>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            block_limit: 500,
            lookback: 25_000,
            poll_interval: Duration::from_millis(500),
            page_limit: 1000,
            listen: None,
        }
    }
}

/// Everything the core loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherEvent {
    /// An offer naming us as delegate was discovered, or a seller asked us
    /// to track one.
    OfferDiscovered(ContractId),
    /// An escrow bound to a tracked offer appeared on the payment ledger.
    EscrowObserved {
        offer_id: ContractId,
        created: EscrowCreated,
    },
    /// A tracked offer instance moved to a new evaluated state.
    OfferStateChanged {
        offer_id: ContractId,
        state: OfferState,
    },
    /// A buyer handed over their secret for an offer.
    BuyerSecret {
        offer_id: ContractId,
        password: String,
        from: Address,
    },
    Shutdown,
}

type SharedSender = Arc<Mutex<mpsc::Sender<MatcherEvent>>>;

/// The core engine. Holds no swap state of its own: tracking, correlation
/// and progress all live in the [`MarkerStore`], so a restarted matcher
/// resumes from where the durable markers say it was.
pub struct Matcher<A, P, S>
where
    A: AssetLedger + ?Sized,
    P: PaymentLedger + ?Sized,
    S: Store,
{
    pub asset: Arc<A>,
    pub payment: Arc<P>,
    pub markers: Arc<MarkerStore<S>>,
    /// The matcher's key identity: the operator's own address when selling,
    /// or the address sellers name as delegate.
    pub signer: Address,
    bus: SharedSender,
    serial: Mutex<()>,
}

impl<A, P, S> Matcher<A, P, S>
where
    A: AssetLedger + ?Sized,
    P: PaymentLedger + ?Sized,
    S: Store,
{
    pub fn new(
        asset: Arc<A>,
        payment: Arc<P>,
        markers: Arc<MarkerStore<S>>,
        signer: Address,
        bus: mpsc::Sender<MatcherEvent>,
    ) -> Self {
        Matcher {
            asset,
            payment,
            markers,
            signer,
            bus: Arc::new(Mutex::new(bus)),
            serial: Mutex::new(()),
        }
    }

    /// Resume after a restart: re-subscribe to every tracked offer, re-run
    /// the pending steps its current state calls for and replay persisted
    /// buyer secrets. Per-offer failures are logged and skipped, the next
    /// state change retries them.
    pub fn bootstrap(&self) -> Result<(), Error> {
        for offer_id in self.markers.tracked_offers()? {
            if let Err(e) = self.resume_offer(&offer_id) {
                warn!("resuming offer {} failed: {}", offer_id, e);
            }
        }
        for (offer_id, _) in self.markers.pending_passwords()? {
            if let Err(e) = self.try_finalize_offer(&offer_id) {
                warn!("replaying secret for offer {} failed: {}", offer_id, e);
            }
        }
        Ok(())
    }

    fn resume_offer(&self, offer_id: &ContractId) -> Result<(), Error> {
        self.subscribe(offer_id)?;
        let state = self.asset.read_offer_state(offer_id)?;
        self.on_state(offer_id, &state)
    }

    /// Consume events until [`MatcherEvent::Shutdown`]. Handler failures are
    /// logged, never fatal: the triggering condition is re-observed by a
    /// later scan, poll or state change.
    pub fn run(&self, events: mpsc::Receiver<MatcherEvent>) {
        for event in events {
            if event == MatcherEvent::Shutdown {
                break;
            }
            if let Err(e) = self.handle_event(&event) {
                warn!("handling {:?} failed: {}", event, e);
            }
        }
        info!("matcher core loop stopped");
    }

    pub fn handle_event(&self, event: &MatcherEvent) -> Result<(), Error> {
        // the scanner thread calls in here next to the core loop
        let _guard = self.serial.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            MatcherEvent::OfferDiscovered(offer_id) => self.track(offer_id),
            MatcherEvent::EscrowObserved { offer_id, created } => {
                self.on_escrow(offer_id, created)
            }
            MatcherEvent::OfferStateChanged { offer_id, state } => self.on_state(offer_id, state),
            MatcherEvent::BuyerSecret {
                offer_id,
                password,
                from,
            } => {
                // durable before any use: a crash must not lose the secret
                self.markers.save_password(
                    offer_id,
                    &PendingPassword {
                        password: password.clone(),
                        from: *from,
                    },
                )?;
                self.track(offer_id)?;
                self.try_finalize_offer(offer_id)
            }
            MatcherEvent::Shutdown => Ok(()),
        }
    }

    /// Start tracking an offer: index it for escrow correlation and
    /// subscribe to its state. Offers already in a terminal stage are left
    /// alone.
    fn track(&self, offer_id: &ContractId) -> Result<(), Error> {
        if self.markers.offer_tracked(offer_id)? {
            return Ok(());
        }
        let state = self.asset.read_offer_state(offer_id)?;
        if matches!(state.stage, OfferStage::Finalized | OfferStage::Canceled) {
            debug!("offer {} already {}, not tracking", offer_id, state.stage);
            return Ok(());
        }
        self.markers.track_offer(offer_id)?;
        self.subscribe(offer_id)?;
        info!("tracking offer {}", offer_id);
        Ok(())
    }

    fn subscribe(&self, offer_id: &ContractId) -> Result<(), Error> {
        let bus = self.bus.clone();
        let id = offer_id.clone();
        self.asset.subscribe_offer_state(
            offer_id,
            Box::new(move |state| {
                if let Ok(tx) = bus.lock() {
                    let _ = tx.send(MatcherEvent::OfferStateChanged {
                        offer_id: id.clone(),
                        state,
                    });
                }
            }),
        )?;
        Ok(())
    }

    /// React to an escrow deployed against a tracked offer. When the offer
    /// is still open and our signer may run `acceptSeller` on it, as its
    /// owner or as its delegate, verify the escrow and accept it; the first
    /// escrow to pass wins, later ones are ignored through the accepted
    /// marker.
    fn on_escrow(&self, offer_id: &ContractId, created: &EscrowCreated) -> Result<(), Error> {
        if self.markers.is_accepted(offer_id)? {
            return Ok(());
        }
        let offer = self.asset.read_offer_state(offer_id)?;
        match offer.stage {
            OfferStage::Pending => {
                let authorized =
                    offer.owner == self.signer || offer.delegate == Some(self.signer);
                if !authorized {
                    debug!("offer {} is not ours to accept", offer_id);
                    return Ok(());
                }
                let escrow = self.payment.escrow_state(&created.escrow)?;
                if let Err(e) = verify::check_escrow_for_offer(
                    self.payment.as_ref(),
                    &created.escrow,
                    &escrow,
                    offer_id,
                    &offer,
                ) {
                    warn!(
                        "escrow {:#x} for offer {} failed verification: {}",
                        created.escrow, offer_id, e
                    );
                    return Ok(());
                }
                self.asset.submit_offer_interaction(
                    offer_id,
                    &self.signer,
                    &OfferInteraction::AcceptSeller {
                        hashed_password: escrow.hashed_password,
                        buyer: escrow.owner,
                    },
                )?;
                self.markers.mark_accepted(offer_id, &created.escrow)?;
                info!(
                    "offer {} accepted against escrow {:#x}",
                    offer_id, created.escrow
                );
                self.try_finalize_offer(offer_id)
            }
            OfferStage::AcceptedBySeller => {
                // accept succeeded but the marker write was lost: recover the
                // correlation if this is the escrow the offer points at
                let escrow = self.payment.escrow_state(&created.escrow)?;
                if offer.hashed_password == Some(escrow.hashed_password)
                    && offer.buyer == Some(escrow.owner)
                {
                    self.markers.mark_accepted(offer_id, &created.escrow)?;
                    self.try_finalize_offer(offer_id)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_state(&self, offer_id: &ContractId, state: &OfferState) -> Result<(), Error> {
        match state.stage {
            OfferStage::Pending => Ok(()),
            OfferStage::AcceptedBySeller => self.try_finalize_offer(offer_id),
            OfferStage::Finalized => self.try_claim_escrow(offer_id, state),
            OfferStage::Canceled => {
                debug!("offer {} canceled", offer_id);
                Ok(())
            }
        }
    }

    /// Buyer-side step: when we hold a secret for this offer and the seller
    /// accepted the matching escrow, finalize the offer on the buyer's
    /// behalf. Gated by the finalized-offer marker.
    fn try_finalize_offer(&self, offer_id: &ContractId) -> Result<(), Error> {
        if self.markers.is_offer_finalized(offer_id)? {
            return Ok(());
        }
        let pending = match self.markers.password(offer_id)? {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let offer = self.asset.read_offer_state(offer_id)?;
        if offer.stage != OfferStage::AcceptedBySeller {
            return Ok(());
        }
        let lock = HashLock::commit(&pending.password);
        if let Err(e) = verify::check_offer_finalizable(&offer, &lock, &pending.from) {
            warn!(
                "not finalizing offer {} for buyer {:#x}: {}",
                offer_id, pending.from, e
            );
            return Ok(());
        }
        self.asset.submit_offer_interaction(
            offer_id,
            &self.signer,
            &OfferInteraction::Finalize {
                password: pending.password,
            },
        )?;
        self.markers.mark_offer_finalized(offer_id)?;
        info!("offer {} finalized for buyer {:#x}", offer_id, pending.from);
        Ok(())
    }

    /// Seller-side step: the offer is finalized, pull the revealed secret
    /// and finalize the correlated escrow. Gated by the finalized-escrow
    /// marker.
    fn try_claim_escrow(&self, offer_id: &ContractId, state: &OfferState) -> Result<(), Error> {
        let escrow = match self.markers.accepted_escrow(offer_id)? {
            Some(escrow) => escrow,
            // not accepted through us, nothing to claim
            None => return Ok(()),
        };
        if self.markers.is_escrow_finalized(&escrow)? {
            return Ok(());
        }
        let password = verify::revealed_password(state)?;
        self.payment
            .finalize_escrow(&self.signer, &escrow, password)?;
        self.markers.mark_escrow_finalized(&escrow)?;
        info!(
            "escrow {:#x} claimed with secret from offer {}",
            escrow, offer_id
        );
        Ok(())
    }
}

/// Handle over a running matcher's threads.
pub struct MatcherHandle {
    shutdown: Arc<AtomicBool>,
    bus: mpsc::Sender<MatcherEvent>,
    threads: Vec<JoinHandle<()>>,
}

impl MatcherHandle {
    /// A sender into the event bus, for injecting events programmatically.
    pub fn sender(&self) -> mpsc::Sender<MatcherEvent> {
        self.bus.clone()
    }

    /// Raise shutdown and join every thread.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.bus.send(MatcherEvent::Shutdown);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// Wire up and start a full matcher: core loop, offer discovery, escrow
/// scanner and, when configured, the notification endpoint. The engine
/// bootstraps from the marker store before any source is started.
pub fn start<A, P, I, S>(
    config: MatcherConfig,
    asset: Arc<A>,
    payment: Arc<P>,
    index: Arc<I>,
    markers: Arc<MarkerStore<S>>,
    signer: Address,
) -> Result<MatcherHandle, Error>
where
    A: AssetLedger + 'static,
    P: PaymentLedger + 'static,
    I: InteractionIndex + 'static,
    S: Store + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let mut threads = Vec::new();

    let engine = Arc::new(Matcher::new(
        asset.clone(),
        payment.clone(),
        markers.clone(),
        signer,
        tx.clone(),
    ));
    engine.bootstrap()?;
    let core = engine.clone();
    threads.push(std::thread::spawn(move || core.run(rx)));

    let scanner = EscrowScanner {
        payment,
        markers: markers.clone(),
        block_limit: config.block_limit,
        lookback: config.lookback,
    };
    let scan_engine = engine;
    let scan_shutdown = shutdown.clone();
    let poll_interval = config.poll_interval;
    threads.push(std::thread::spawn(move || {
        while !scan_shutdown.load(Ordering::Relaxed) {
            // handled inline, not enqueued: the checkpoint a successful pass
            // writes must only cover escrows that were already acted on
            let outcome = scanner.scan_once(|offer_id, created| {
                scan_engine.handle_event(&MatcherEvent::EscrowObserved { offer_id, created })
            });
            match outcome {
                // caught up with the chain head
                Ok(outcome) if outcome.from == outcome.to => {
                    std::thread::sleep(poll_interval)
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("escrow scan failed: {}", e);
                    std::thread::sleep(poll_interval);
                }
            }
        }
    }));

    let discovery = OfferDiscovery {
        index,
        markers,
        delegate: signer,
        limit: config.page_limit,
        poll_interval: config.poll_interval,
    };
    let disco_tx = tx.clone();
    let disco_shutdown = shutdown.clone();
    threads.push(std::thread::spawn(move || {
        while !disco_shutdown.load(Ordering::Relaxed) {
            let result = discovery.run(&disco_shutdown, |offer_id, _record| {
                disco_tx
                    .send(MatcherEvent::OfferDiscovered(offer_id))
                    .map_err(|_| Error::Bus)
            });
            match result {
                Ok(()) | Err(Error::Bus) => break,
                Err(e) => {
                    warn!("offer discovery failed: {}", e);
                    std::thread::sleep(discovery.poll_interval);
                }
            }
        }
    }));

    if let Some(listen) = config.listen {
        let server =
            NotificationServer::bind(listen).map_err(crate::ledger::LedgerError::new)?;
        info!(
            "notification endpoint on {}",
            server.local_addr().map_err(crate::ledger::LedgerError::new)?
        );
        let http_tx = tx.clone();
        let http_shutdown = shutdown.clone();
        threads.push(std::thread::spawn(move || {
            let result = server.run(&http_shutdown, |notification| {
                let event = match notification {
                    Notification::TrackSeller { offer_id } => {
                        MatcherEvent::OfferDiscovered(offer_id)
                    }
                    Notification::TrackBuyer {
                        offer_id,
                        password,
                        from,
                    } => MatcherEvent::BuyerSecret {
                        offer_id,
                        password,
                        from,
                    },
                };
                http_tx.send(event).map_err(|_| Error::Bus)
            });
            if let Err(e) = result {
                warn!("notification server stopped: {}", e);
            }
        }));
    }

    Ok(MatcherHandle {
        shutdown,
        bus: tx,
        threads,
    })
}
