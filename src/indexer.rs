use crate::access_api::AccessApiClient;
use crate::addresses::{AddressProvider, IndexAddressGenerator};
use crate::client_trait::ChainClient;
use crate::config::Config;
use crate::database::Store;
use crate::error::{IndexerError, IndexerResult};
use crate::fetcher::FetcherPool;
use crate::rest::{self, ApiState};
use crate::scanner::{GapCell, Scanner};
use crate::sweeper::Sweeper;
use crate::writer::Writer;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const HIGH_PRIORITY_CAPACITY: usize = 100;
const LOW_PRIORITY_CAPACITY: usize = 1000;
const RESULTS_CAPACITY: usize = 1000;
const GET_ADDRESSES_BATCH_SIZE: usize = 1000;

/// Wires the pipeline together: scanner and sweeper feed the two priority
/// channels, the fetcher pool turns addresses into key records, the writer
/// persists them, and the REST server reads alongside.
pub struct App {
    config: Config,
    store: Store,
    client: Arc<dyn ChainClient>,
    gap: GapCell,
}

impl App {
    pub fn new(config: Config) -> IndexerResult<Self> {
        config.validate().map_err(IndexerError::Config)?;

        let store = Store::open(
            config.database_path(),
            config.db_pool_size,
            config.db_retry_times,
            Duration::from_millis(config.db_retry_sleep_ms),
        )?;
        store.start(config.purge_on_start)?;

        let client: Arc<dyn ChainClient> = Arc::new(AccessApiClient::new(&config.access_node_url)?);

        Ok(App {
            config,
            store,
            client,
            gap: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn run(&self) -> IndexerResult<()> {
        let cancel = CancellationToken::new();

        // The incremental path only covers recent history; everything older
        // is the sweeper's job, so the cursor starts near the tip.
        match self.client.get_latest_block_header().await {
            Ok(header) => {
                let start = header.height.saturating_sub(self.config.max_block_range);
                info!("Current block {}, seeding cursor at {}", header.height, start);
                self.store.seed_block_heights(start)?;
            }
            Err(e) => error!("Could not get current block height: {}", e),
        }

        let (high_tx, high_rx) = mpsc::channel(HIGH_PRIORITY_CAPACITY);
        let (low_tx, low_rx) = mpsc::channel(LOW_PRIORITY_CAPACITY);
        let (results_tx, results_rx) = mpsc::channel(RESULTS_CAPACITY);

        let pool = FetcherPool::new(self.client.clone(), self.config.clone(), results_tx);
        let mut handles = pool.spawn(high_rx, low_rx, cancel.clone());

        let writer = Writer::new(self.store.clone(), &self.config);
        handles.push(tokio::spawn(writer.run(results_rx, cancel.clone())));

        if self.config.enable_incremental {
            info!("Incremental service is enabled");
            let scanner = Scanner::new(
                self.client.clone(),
                self.store.clone(),
                self.config.clone(),
                high_tx,
                self.gap.clone(),
            );
            handles.push(tokio::spawn(scanner.run(cancel.clone())));
        }

        if self.config.enable_sync_data {
            info!("Data sync service is enabled");
            let sweeper = Sweeper::new(
                self.client.clone(),
                self.store.clone(),
                self.config.clone(),
                low_tx,
            );
            handles.push(tokio::spawn(sweeper.run(cancel.clone())));
        }

        let rest_state = ApiState {
            store: self.store.clone(),
            client: self.client.clone(),
            gap: self.gap.clone(),
        };
        let port = self.config.port;
        let rest_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = rest::serve(rest_state, port, rest_cancel).await {
                error!("REST server failed: {}", e);
            }
        }));

        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, draining workers");
        cancel.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed to join: {}", e);
            }
        }
        info!("Clean shutdown complete");
        Ok(())
    }

    /// Offline mode: enumerate the address space once and seed the
    /// processing queue, leaving the fetch work to a later indexer run.
    pub async fn run_get_addresses(&self) -> IndexerResult<()> {
        let provider = AddressProvider::init(
            self.client.clone(),
            Arc::new(IndexAddressGenerator),
            self.config.address_search_seed,
            self.config.fetch_slow_down(),
        )
        .await?;

        let mut batch_rx =
            provider.generate_batches(GET_ADDRESSES_BATCH_SIZE, CancellationToken::new());
        let mut stored = 0usize;
        while let Some(batch) = batch_rx.recv().await {
            let accounts: Vec<String> = batch.iter().map(|a| a.canonical()).collect();
            stored += self.store.store_addresses_for_processing(&accounts)?;
            info!("Storing {} addresses in the processing queue", accounts.len());
        }
        info!("Processing queue seeded with {} new addresses", stored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert!(matches!(App::new(config), Err(IndexerError::Config(_))));
    }

    #[test]
    fn test_new_opens_store() {
        let dir = tempdir().unwrap();
        let config = Config {
            database_path: dir
                .path()
                .join("app.db")
                .to_string_lossy()
                .into_owned(),
            db_pool_size: 4,
            ..Config::default()
        };
        assert!(App::new(config).is_ok());
    }
}
