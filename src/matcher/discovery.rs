//! Discovery of delegated offers through the interaction index. The index is
//! an append-only view of mined create-offer interactions, paginated oldest
//! first: a full page means older history remains and pagination advances, a
//! short page means we are at the frontier and keep re-polling the same page
//! until new entries land on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use super::store::{MarkerStore, Store};
use crate::ledger::{Address, ContractId, InteractionIndex, InteractionRecord};
use crate::Error;

/// Polls the interaction index for offers that name this matcher as their
/// delegate.
pub struct OfferDiscovery<I, S>
where
    I: InteractionIndex + ?Sized,
    S: Store,
{
    pub index: Arc<I>,
    pub markers: Arc<MarkerStore<S>>,
    /// The delegate address offers must be tagged with.
    pub delegate: Address,
    /// Page size requested from the index.
    pub limit: usize,
    /// Delay between polls of a non-full frontier page.
    pub poll_interval: Duration,
}

impl<I, S> OfferDiscovery<I, S>
where
    I: InteractionIndex + ?Sized,
    S: Store,
{
    /// Query one page and surface every offer on it that is not tracked yet.
    /// Advances `page` when the page came back full. Returns the number of
    /// new offers surfaced.
    pub fn poll_once<F>(&self, page: &mut usize, mut sink: F) -> Result<usize, Error>
    where
        F: FnMut(ContractId, InteractionRecord) -> Result<(), Error>,
    {
        let result = self
            .index
            .delegated_offers(&self.delegate, *page, self.limit)?;
        let mut surfaced = 0;
        for record in &result.items {
            if self.markers.offer_tracked(&record.contract)? {
                continue;
            }
            debug!(
                "discovered delegated offer {} at block {}",
                record.contract, record.block_height
            );
            sink(record.contract.clone(), record.clone())?;
            surfaced += 1;
        }
        if result.is_full() {
            *page += 1;
        }
        Ok(surfaced)
    }

    /// Poll until `shutdown` is raised. Pages through history as fast as the
    /// index answers, then settles into polling the frontier page at
    /// `poll_interval`. Errors are returned to the caller; the loop holds no
    /// state beyond the page cursor, so it is safe to restart from page 1.
    pub fn run<F>(&self, shutdown: &AtomicBool, mut sink: F) -> Result<(), Error>
    where
        F: FnMut(ContractId, InteractionRecord) -> Result<(), Error>,
    {
        let mut page = 1;
        info!("offer discovery started for delegate {:#x}", self.delegate);
        while !shutdown.load(Ordering::Relaxed) {
            let before = page;
            self.poll_once(&mut page, &mut sink)?;
            if page == before {
                std::thread::sleep(self.poll_interval);
            }
        }
        Ok(())
    }
}
