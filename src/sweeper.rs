use crate::addresses::{AddressProvider, IndexAddressGenerator};
use crate::client_trait::ChainClient;
use crate::config::{Config, SyncMode};
use crate::database::Store;
use crate::error::IndexerResult;
use crate::models::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(250);

/// Low-priority address source.
///
/// Enumeration mode walks the dense address space through the provider;
/// backfill mode re-feeds addresses queued for processing or stored with
/// missing algorithm columns. Sends that would block past the timeout are
/// dropped: a stalled pass trades completeness for liveness and the next
/// pass re-covers the range.
pub struct Sweeper {
    client: Arc<dyn ChainClient>,
    store: Store,
    config: Config,
    low_tx: mpsc::Sender<Vec<Address>>,
    send_timeout: Duration,
    /// Highest account index seen by a completed search; the next pass
    /// seeds its search there instead of starting over.
    last_known_index: AtomicU64,
}

impl Sweeper {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Store,
        config: Config,
        low_tx: mpsc::Sender<Vec<Address>>,
    ) -> Self {
        Sweeper {
            client,
            store,
            config,
            low_tx,
            send_timeout: SEND_TIMEOUT,
            last_known_index: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        match self.config.sync_mode {
            SyncMode::Enumeration => self.run_enumeration(cancel).await,
            SyncMode::Backfill => self.run_backfill(cancel).await,
        }
    }

    async fn run_enumeration(&self, cancel: CancellationToken) {
        info!("Bulk sweeper started in enumeration mode");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let started = Instant::now();
            match self.enumeration_pass(&cancel).await {
                Ok(batches) => info!(
                    "Enumeration pass emitted {} batches in {:.1} min",
                    batches,
                    started.elapsed().as_secs_f64() / 60.0
                ),
                Err(e) => error!("Enumeration pass failed: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.sync_poll_interval()) => {}
            }
        }
        info!("Bulk sweeper stopped");
    }

    async fn enumeration_pass(&self, cancel: &CancellationToken) -> IndexerResult<usize> {
        let seed = self
            .config
            .address_search_seed
            .max(self.last_known_index.load(Ordering::Relaxed));
        let provider = AddressProvider::init(
            self.client.clone(),
            Arc::new(IndexAddressGenerator),
            seed,
            self.config.fetch_slow_down(),
        )
        .await?;
        self.last_known_index
            .store(provider.last_index(), Ordering::Relaxed);
        let mut batch_rx = provider.generate_batches(self.config.sweep_batch_size, cancel.clone());

        let mut batches = 0;
        while let Some(batch) = batch_rx.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            self.send_or_drop(batch).await;
            batches += 1;
            tokio::time::sleep(self.config.fetch_slow_down()).await;
        }
        Ok(batches)
    }

    async fn run_backfill(&self, cancel: CancellationToken) {
        info!("Bulk sweeper started in backfill mode");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idle = match self.backfill_pass(&cancel).await {
                Ok(0) => {
                    debug!("No addresses pending backfill");
                    true
                }
                Ok(count) => {
                    info!("Backfill pass processed {} addresses", count);
                    false
                }
                Err(e) => {
                    error!("Backfill pass failed: {}", e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.sync_poll_interval()) => {}
                }
            }
        }
        info!("Bulk sweeper stopped");
    }

    /// Emits one batch of queued or incomplete addresses, waits for the
    /// channel to drain, then clears the processed queue entries and
    /// refreshes the distinct-key count.
    async fn backfill_pass(&self, cancel: &CancellationToken) -> IndexerResult<usize> {
        let mut accounts = self
            .store
            .get_addresses_to_process(self.config.sweep_batch_size)?;
        if accounts.is_empty() {
            accounts = self.store.get_addresses_without_algos(
                self.config.sweep_batch_size,
                &crate::fetcher::ignored_accounts(),
            )?;
        }
        if accounts.is_empty() {
            return Ok(0);
        }

        let addresses: Vec<Address> = accounts
            .iter()
            .filter_map(|account| {
                let parsed = Address::parse(account);
                if parsed.is_none() {
                    warn!("Skipping unparseable queued account {}", account);
                }
                parsed
            })
            .collect();
        self.send_or_drop(addresses).await;
        self.wait_for_drain(cancel).await;

        self.store.remove_addresses_from_processing(&accounts)?;
        self.store.update_distinct_count().await;
        Ok(accounts.len())
    }

    async fn send_or_drop(&self, batch: Vec<Address>) {
        let size = batch.len();
        match tokio::time::timeout(self.send_timeout, self.low_tx.send(batch)).await {
            Ok(Ok(())) => debug!("Queued batch of {} addresses", size),
            Ok(Err(_)) => warn!("Low priority channel closed, dropped {} addresses", size),
            Err(_) => warn!(
                "Low priority channel blocked for {:?}, dropped batch of {} addresses",
                self.send_timeout, size
            ),
        }
    }

    /// Polls channel occupancy until the fetcher catches up or the drain
    /// timeout passes.
    async fn wait_for_drain(&self, cancel: &CancellationToken) {
        let deadline = Instant::now() + self.config.sync_poll_interval();
        while Instant::now() < deadline && !cancel.is_cancelled() {
            if self.low_tx.capacity() == self.low_tx.max_capacity() {
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        warn!("Low priority channel did not drain before the timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_trait::mock::MockChainClient;
    use tempfile::tempdir;

    fn test_config() -> Config {
        Config {
            batch_size: 2,
            sweep_batch_size: 10,
            fetch_slow_down_ms: 0,
            address_search_seed: 2,
            sync_poll_interval_mins: 1,
            ..Config::default()
        }
    }

    fn test_store(dir: &tempfile::TempDir) -> Store {
        let store = Store::open(
            dir.path().join("sweeper.db"),
            4,
            1,
            Duration::from_millis(10),
        )
        .unwrap();
        store.start(false).unwrap();
        store
    }

    #[tokio::test]
    async fn test_enumeration_pass_feeds_low_priority() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let client = Arc::new(MockChainClient::new(100));
        client.set_last_live_index(5);

        let (low_tx, mut low_rx) = mpsc::channel(10);
        let sweeper = Sweeper::new(client, store, test_config(), low_tx);

        let batches = sweeper
            .enumeration_pass(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batches, 1);

        let batch = low_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0], Address::from_index(1));
        assert_eq!(batch[4], Address::from_index(5));
    }

    #[tokio::test]
    async fn test_blocked_send_drops_batch() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let client = Arc::new(MockChainClient::new(100));

        let (low_tx, _low_rx) = mpsc::channel(1);
        // fill the only slot so the next send blocks
        low_tx.send(vec![Address::from_index(99)]).await.unwrap();

        let sweeper = Sweeper::new(client, store, test_config(), low_tx.clone())
            .with_send_timeout(Duration::from_millis(50));
        sweeper.send_or_drop(vec![Address::from_index(1)]).await;

        // the batch was dropped, not queued
        assert_eq!(low_tx.capacity(), 0);
    }

    #[tokio::test]
    async fn test_backfill_pass_processes_queue() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let client = Arc::new(MockChainClient::new(100));

        store
            .store_addresses_for_processing(&[
                "0x0000000000000001".to_string(),
                "0x0000000000000002".to_string(),
            ])
            .unwrap();

        let (low_tx, mut low_rx) = mpsc::channel(10);
        let consumer = tokio::spawn(async move { low_rx.recv().await });

        let sweeper = Sweeper::new(client, store.clone(), test_config(), low_tx);
        let processed = sweeper
            .backfill_pass(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(processed, 2);
        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(store.get_addresses_to_process(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_falls_back_to_incomplete_rows() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let client = Arc::new(MockChainClient::new(100));

        store
            .insert_public_key_accounts(&[crate::models::PublicKeyAccountRow {
                public_key: "aa".to_string(),
                account: "0x0000000000000003".to_string(),
                key_id: 0,
                weight: 1000,
                sig_algo: None,
                hash_algo: None,
                is_revoked: false,
            }])
            .unwrap();

        let (low_tx, mut low_rx) = mpsc::channel(10);
        let consumer = tokio::spawn(async move { low_rx.recv().await });

        let sweeper = Sweeper::new(client, store.clone(), test_config(), low_tx);
        let processed = sweeper
            .backfill_pass(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(processed, 1);
        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch[0], Address::parse("0x0000000000000003").unwrap());
    }

    #[tokio::test]
    async fn test_backfill_pass_idles_on_empty_store() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let client = Arc::new(MockChainClient::new(100));
        let (low_tx, _low_rx) = mpsc::channel(10);

        let sweeper = Sweeper::new(client, store, test_config(), low_tx);
        assert_eq!(
            sweeper
                .backfill_pass(&CancellationToken::new())
                .await
                .unwrap(),
            0
        );
    }
}
