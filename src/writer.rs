use crate::config::Config;
use crate::database::Store;
use crate::models::PublicKeyAccountRow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Batches at least this large stream through the staging table instead of
/// row-by-row upserts.
const BULK_LOAD_THRESHOLD: usize = 1000;

/// Consumes key-record batches off the results channel and persists them.
///
/// A failed batch is chopped into insert-sized fragments and each fragment
/// retried on its own; fragments that still fail are logged and dropped for
/// this cycle, to be rediscovered on the next visit of their addresses.
pub struct Writer {
    store: Store,
    batch_size: usize,
}

impl Writer {
    pub fn new(store: Store, config: &Config) -> Self {
        Writer {
            store,
            batch_size: config.batch_size,
        }
    }

    pub async fn run(self, mut results_rx: mpsc::Receiver<Vec<PublicKeyAccountRow>>, cancel: CancellationToken) {
        info!("Writer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_rows = results_rx.recv() => {
                    let Some(rows) = maybe_rows else { break };
                    self.persist(rows);
                }
            }
        }
        // drain what the fetchers already produced before shutting down
        while let Ok(rows) = results_rx.try_recv() {
            self.persist(rows);
        }
        info!("Writer stopped");
    }

    pub fn persist(&self, rows: Vec<PublicKeyAccountRow>) {
        if rows.is_empty() {
            return;
        }
        let result = if rows.len() >= BULK_LOAD_THRESHOLD {
            self.store.bulk_load_public_key_accounts(&rows)
        } else {
            self.store.insert_public_key_accounts(&rows)
        };
        match result {
            Ok(affected) => debug!("Stored {} of {} key rows", affected, rows.len()),
            Err(e) => {
                warn!(
                    "Insert of {} rows failed, fragmenting into chunks of {}: {}",
                    rows.len(),
                    self.batch_size,
                    e
                );
                for chunk in rows.chunks(self.batch_size) {
                    if let Err(e) = self.store.insert_public_key_accounts(chunk) {
                        error!(
                            "Dropping {} key rows after failed fragment insert: {}",
                            chunk.len(),
                            e
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_store(dir: &tempfile::TempDir) -> Store {
        let store = Store::open(
            dir.path().join("writer.db"),
            4,
            1,
            Duration::from_millis(10),
        )
        .unwrap();
        store.start(false).unwrap();
        store
    }

    fn row(public_key: &str, account: &str) -> PublicKeyAccountRow {
        PublicKeyAccountRow {
            public_key: public_key.to_string(),
            account: account.to_string(),
            key_id: 0,
            weight: 1000,
            sig_algo: Some(1),
            hash_algo: Some(3),
            is_revoked: false,
        }
    }

    #[test]
    fn test_persist_small_batch() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let writer = Writer::new(store.clone(), &Config::default());

        writer.persist(vec![row("key1", "0xa"), row("key2", "0xb")]);
        assert_eq!(store.get_accounts_by_public_key("key1").unwrap().len(), 1);
        assert_eq!(store.get_accounts_by_public_key("key2").unwrap().len(), 1);
    }

    #[test]
    fn test_persist_large_batch_takes_bulk_path() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let writer = Writer::new(store.clone(), &Config::default());

        let rows: Vec<PublicKeyAccountRow> = (0..BULK_LOAD_THRESHOLD + 10)
            .map(|i| row(&format!("key{}", i), "0xa"))
            .collect();
        writer.persist(rows);
        assert_eq!(store.count_distinct_public_keys().unwrap() as usize, BULK_LOAD_THRESHOLD + 10);
    }

    #[tokio::test]
    async fn test_run_consumes_results_channel() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let writer = Writer::new(store.clone(), &Config::default());

        let (results_tx, results_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(results_rx, cancel.clone()));

        results_tx.send(vec![row("key1", "0xa")]).await.unwrap();
        drop(results_tx);
        handle.await.unwrap();

        assert_eq!(store.get_accounts_by_public_key("key1").unwrap().len(), 1);
    }
}
