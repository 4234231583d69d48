//! Checkpointed scan of the payment ledger for escrow-creation events.
//! Progress is tracked as the first *unscanned* block height, persisted only
//! after every event of a range was handed off, so a crash re-delivers the
//! whole range and idempotency downstream absorbs the duplicates.

use std::sync::Arc;

use log::{debug, warn};

use super::store::{MarkerStore, Store};
use crate::ledger::{ContractId, EscrowCreated, PaymentLedger};
use crate::Error;

/// Result of one scan pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Scanned half-open block range.
    pub from: u64,
    pub to: u64,
    /// Events that correlated to a tracked offer.
    pub matched: usize,
}

/// Scans the payment ledger in bounded chunks and surfaces the escrow events
/// whose offer id hash resolves to a tracked offer. Uncorrelated events are
/// dropped; an escrow for an untracked offer is someone else's business.
pub struct EscrowScanner<P, S>
where
    P: PaymentLedger + ?Sized,
    S: Store,
{
    pub payment: Arc<P>,
    pub markers: Arc<MarkerStore<S>>,
    /// Maximum number of blocks covered by one pass.
    pub block_limit: u64,
    /// How far behind the chain head a fresh matcher starts.
    pub lookback: u64,
}

impl<P, S> EscrowScanner<P, S>
where
    P: PaymentLedger + ?Sized,
    S: Store,
{
    /// Run one pass. Correlated events are handed to `sink` in block order;
    /// if the sink or any lookup fails the checkpoint stays put and the same
    /// range is rescanned on the next pass.
    pub fn scan_once<F>(&self, mut sink: F) -> Result<ScanOutcome, Error>
    where
        F: FnMut(ContractId, EscrowCreated) -> Result<(), Error>,
    {
        let latest = self.payment.latest_block()?;
        let from = match self.markers.scan_checkpoint()? {
            Some(height) => height,
            None => latest.saturating_sub(self.lookback),
        };
        let to = (from + self.block_limit).min(latest + 1);
        if from >= to {
            return Ok(ScanOutcome {
                from,
                to: from,
                matched: 0,
            });
        }

        let events = self.payment.escrow_created_events(from, to)?;
        debug!(
            "scanned blocks [{}, {}), {} escrow events",
            from,
            to,
            events.len()
        );

        let mut matched = 0;
        for event in events {
            match self.markers.offer_by_hash(&event.offer_id_hash)? {
                Some(offer_id) => {
                    sink(offer_id, event)?;
                    matched += 1;
                }
                None => {
                    warn!(
                        "escrow {:#x} at block {} targets an untracked offer",
                        event.escrow, event.block
                    );
                }
            }
        }

        self.markers.set_scan_checkpoint(to)?;
        Ok(ScanOutcome { from, to, matched })
    }
}
