use crate::client_trait::{cadence, ChainClient};
use crate::config::Config;
use crate::database::Store;
use crate::error::{IndexerError, IndexerResult};
use crate::models::{Address, BlockGap};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ACCOUNT_KEY_ADDED: &str = "flow.AccountKeyAdded";
pub const ACCOUNT_KEY_REMOVED: &str = "flow.AccountKeyRemoved";

/// Widest event query sent in one request; the access node rejects ranges
/// over 250 blocks.
pub const EVENT_RANGE_WIDTH: u64 = 245;

/// Most recent block range skipped by a lag reseed, surfaced in `/status`.
pub type GapCell = Arc<RwLock<Option<BlockGap>>>;

/// High-priority event follower.
///
/// Each tick scans `(loaded, tip]` for key-lifecycle events and emits the
/// affected addresses. Add and remove events take the same path: the fetch
/// re-reads the account, which subsumes both. The cursor only advances after
/// the addresses were handed off, so a failed tick is retried by the next
/// one.
pub struct Scanner {
    client: Arc<dyn ChainClient>,
    store: Store,
    config: Config,
    high_tx: mpsc::Sender<Vec<Address>>,
    gap: GapCell,
}

impl Scanner {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Store,
        config: Config,
        high_tx: mpsc::Sender<Vec<Address>>,
        gap: GapCell,
    ) -> Self {
        Scanner {
            client,
            store,
            config,
            high_tx,
            gap,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Incremental scanner started");
        self.tick_with_retry().await;

        let mut ticker = tokio::time::interval(self.config.block_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick was handled above

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Incremental scanner stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick_with_retry().await;
                }
            }
        }
    }

    /// A failed pass gets one same-tick retry before waiting for the next
    /// interval.
    async fn tick_with_retry(&self) {
        if let Err(e) = self.tick().await {
            error!("Incremental pass failed, retrying: {}", e);
            if let Err(e) = self.tick().await {
                error!("Incremental retry failed, waiting for next tick: {}", e);
            }
        }
    }

    pub async fn tick(&self) -> IndexerResult<()> {
        let loaded = self.store.get_loaded_block_height()?;
        let tip = self.client.get_latest_block_header().await?.height;

        if tip.saturating_sub(loaded) <= self.config.wait_num_blocks {
            debug!(
                "Tip {} within {} blocks of loaded {}, skipping tick",
                tip, self.config.wait_num_blocks, loaded
            );
            return Ok(());
        }

        let scanned_to = self.scan_range(loaded, tip).await?;

        // The scan itself takes time; if the chain moved on meaningfully in
        // the meantime, run one extra pass now instead of drifting until the
        // next tick. The pass starts at tip minus max_block_range; re-scanned
        // blocks are idempotent. Taking the lower of that and the scanned
        // height keeps the reseed accounting in scan_range authoritative when
        // the drift exceeded the ceiling.
        let new_tip = self.client.get_latest_block_header().await?.height;
        if new_tip.saturating_sub(scanned_to) > self.config.wait_num_blocks {
            info!(
                "Tip moved from {} to {} during scan, running recovery pass",
                scanned_to, new_tip
            );
            let recovery_from = scanned_to.min(new_tip.saturating_sub(self.config.max_block_range));
            self.scan_range(recovery_from, new_tip).await?;
        }

        Ok(())
    }

    /// Scans `(loaded, tip]`, emits affected addresses and advances the
    /// cursor to `tip`. Returns the height scanned to.
    async fn scan_range(&self, loaded: u64, tip: u64) -> IndexerResult<u64> {
        let mut start = loaded + 1;
        if tip.saturating_sub(loaded) > self.config.max_block_range {
            let reseeded = tip - self.config.max_block_range;
            warn!(
                "Loaded height {} is more than {} blocks behind tip {}, reseeding to {}; blocks {}..{} will not be scanned",
                loaded,
                self.config.max_block_range,
                tip,
                reseeded,
                start,
                reseeded
            );
            *self.gap.write().unwrap() = Some(BlockGap {
                from_block: start,
                to_block: reseeded,
            });
            start = reseeded + 1;
        }

        let mut addresses = Vec::new();
        for event_type in [ACCOUNT_KEY_ADDED, ACCOUNT_KEY_REMOVED] {
            for (chunk_start, chunk_end) in chunk_event_ranges(EVENT_RANGE_WIDTH, start, tip) {
                let found = self
                    .query_chunk_with_split(event_type, chunk_start, chunk_end)
                    .await?;
                addresses.extend(found);
            }
        }

        let addresses = unique(addresses);
        info!(
            "Scanned blocks {}..{}: {} affected addresses",
            start,
            tip,
            addresses.len()
        );

        if !addresses.is_empty() {
            for address in &addresses {
                self.store.remove_account_for_reloading(&address.canonical())?;
            }
            self.high_tx
                .send(addresses)
                .await
                .map_err(|_| IndexerError::Other("High priority channel closed".to_string()))?;
        }

        self.store.advance_loaded_block_height(tip)?;
        Ok(tip)
    }

    /// Queries one chunk; on failure splits it in half and retries each half
    /// once. A failing half fails the whole tick so the cursor stays put.
    async fn query_chunk_with_split(
        &self,
        event_type: &str,
        start: u64,
        end: u64,
    ) -> IndexerResult<Vec<Address>> {
        match self.query_chunk(event_type, start, end).await {
            Ok(addresses) => Ok(addresses),
            Err(e) if end > start => {
                warn!(
                    "Event query {} {}..{} failed, splitting: {}",
                    event_type, start, end, e
                );
                let mid = start + (end - start) / 2;
                let mut addresses = self.query_chunk(event_type, start, mid).await?;
                addresses.extend(self.query_chunk(event_type, mid + 1, end).await?);
                Ok(addresses)
            }
            Err(e) => Err(e),
        }
    }

    async fn query_chunk(
        &self,
        event_type: &str,
        start: u64,
        end: u64,
    ) -> IndexerResult<Vec<Address>> {
        let events = self
            .client
            .get_events_for_height_range(event_type, start, end)
            .await?;
        let mut addresses = Vec::new();
        for event in &events {
            match extract_event_address(&event.payload) {
                Some(address) => addresses.push(address),
                None => warn!(
                    "Event {} in {}..{} carries no address field",
                    event.event_type, start, end
                ),
            }
        }
        debug!(
            "{} events, {} addresses in {} {}..{}",
            events.len(),
            addresses.len(),
            event_type,
            start,
            end
        );
        Ok(addresses)
    }
}

/// Splits `[start, end]` into inclusive sub-ranges no wider than `width`
/// (measured as `end - start`), in ascending order.
pub fn chunk_event_ranges(width: u64, start: u64, end: u64) -> Vec<(u64, u64)> {
    let mut chunks = Vec::new();
    let mut low = start;
    while low <= end {
        let high = (low + width).min(end);
        chunks.push((low, high));
        low = high + 1;
    }
    chunks
}

/// Key-lifecycle events carry the account as their first field, named
/// `address`.
pub fn extract_event_address(payload: &serde_json::Value) -> Option<Address> {
    let field = cadence::composite_field(payload, "address")?;
    Address::parse(field.get("value")?.as_str()?)
}

fn unique(addresses: Vec<Address>) -> Vec<Address> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|addr| seen.insert(*addr))
        .collect()
}
