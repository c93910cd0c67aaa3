use crate::client_trait::{cadence, ChainClient};
use crate::config::Config;
use crate::error::{IndexerError, IndexerResult};
use crate::models::{
    hashing_algo_index, signature_algo_index, strip_0x_prefix, Address, PublicKeyAccountRow,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Read-only script listing the keys of a batch of accounts.
const GET_KEYS_SCRIPT: &str = include_str!("../scripts/get_keys.cdc");

const MAX_SCRIPT_ATTEMPTS: u32 = 5;

/// Accounts that keep re-surfacing with the same keys and are not worth
/// re-fetching. The zero address is a placeholder entry.
const IGNORE_ACCOUNTS: &[&str] = &["0x0000000000000000"];

/// Converts address batches into key-record batches.
///
/// Two workers share this pool: the high-priority one walks scanner batches
/// address by address through `get_account`, the low-priority one runs the
/// batch key script for sweeper batches. Both push their records onto the
/// bounded results channel consumed by the writer.
#[derive(Clone)]
pub struct FetcherPool {
    client: Arc<dyn ChainClient>,
    config: Config,
    results_tx: mpsc::Sender<Vec<PublicKeyAccountRow>>,
}

impl FetcherPool {
    pub fn new(
        client: Arc<dyn ChainClient>,
        config: Config,
        results_tx: mpsc::Sender<Vec<PublicKeyAccountRow>>,
    ) -> Self {
        FetcherPool {
            client,
            config,
            results_tx,
        }
    }

    pub fn spawn(
        &self,
        high_rx: mpsc::Receiver<Vec<Address>>,
        low_rx: mpsc::Receiver<Vec<Address>>,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let high = {
            let pool = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run_high_priority(high_rx, cancel).await })
        };
        let low = {
            let pool = self.clone();
            tokio::spawn(async move { pool.run_low_priority(low_rx, cancel).await })
        };
        vec![high, low]
    }

    /// Scanner batches are small and freshness-critical; each one gets its
    /// own task so a slow account walk never delays the next batch.
    async fn run_high_priority(
        &self,
        mut high_rx: mpsc::Receiver<Vec<Address>>,
        cancel: CancellationToken,
    ) {
        info!("High-priority fetch worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_batch = high_rx.recv() => {
                    let Some(batch) = maybe_batch else { break };
                    if batch.is_empty() {
                        continue;
                    }
                    let pool = self.clone();
                    tokio::spawn(async move {
                        debug!("High-priority batch of {} addresses", batch.len());
                        let rows = pool.fetch_accounts_individually(&batch).await;
                        pool.emit(rows).await;
                    });
                }
            }
        }
        info!("High-priority fetch worker stopped");
    }

    async fn run_low_priority(
        &self,
        mut low_rx: mpsc::Receiver<Vec<Address>>,
        cancel: CancellationToken,
    ) {
        info!("Low-priority fetch worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_batch = low_rx.recv() => {
                    let Some(batch) = maybe_batch else { break };
                    if batch.is_empty() {
                        continue;
                    }
                    debug!("Low-priority batch of {} addresses", batch.len());
                    let rows = self.fetch_with_script(batch).await;
                    self.emit(rows).await;
                }
            }
        }
        info!("Low-priority fetch worker stopped");
    }

    async fn emit(&self, rows: Vec<PublicKeyAccountRow>) {
        if rows.is_empty() {
            return;
        }
        if self.results_tx.send(rows).await.is_err() {
            error!("Results channel closed, dropping fetched keys");
        }
    }

    /// Narrow path: one `get_account` per address with a rate-limit sleep.
    /// Failures are skipped; a still-active account re-surfaces on a later
    /// scanner tick.
    pub async fn fetch_accounts_individually(
        &self,
        addresses: &[Address],
    ) -> Vec<PublicKeyAccountRow> {
        let mut rows = Vec::new();
        for address in addresses {
            if is_ignored(address) {
                continue;
            }
            tokio::time::sleep(self.config.fetch_slow_down()).await;
            let account = match self.client.get_account(*address).await {
                Ok(account) => account,
                Err(e) => {
                    warn!("Failed to get account {}: {}", address, e);
                    continue;
                }
            };
            if account.keys.is_empty() {
                rows.push(PublicKeyAccountRow::blank(&address.canonical()));
                continue;
            }
            for key in &account.keys {
                rows.push(PublicKeyAccountRow {
                    public_key: strip_0x_prefix(&key.public_key).to_lowercase(),
                    account: address.canonical(),
                    key_id: key.index,
                    weight: key.weight,
                    sig_algo: Some(signature_algo_index(&key.sig_algo)),
                    hash_algo: Some(hashing_algo_index(&key.hash_algo)),
                    is_revoked: key.revoked,
                });
            }
        }
        debug!(
            "Fetched {} keys for {} addresses",
            rows.len(),
            addresses.len()
        );
        rows
    }

    /// Wide path: the key script over script-sized chunks. A failing chunk
    /// is halved and both halves re-queued; an explicit work stack keeps
    /// pathological single-address splits off the call stack. Unrecoverable
    /// single addresses are logged and dropped.
    pub async fn fetch_with_script(&self, addresses: Vec<Address>) -> Vec<PublicKeyAccountRow> {
        let filtered: Vec<Address> = addresses
            .into_iter()
            .filter(|address| !is_ignored(address))
            .collect();

        let mut stack: Vec<Vec<Address>> = filtered
            .chunks(self.config.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let mut rows = Vec::new();

        while let Some(chunk) = stack.pop() {
            match self.run_keys_script(&chunk).await {
                Ok(decoded) => rows.extend(decoded),
                Err(e) if chunk.len() > 1 => {
                    warn!(
                        "Script failed for {} addresses, subdividing: {}",
                        chunk.len(),
                        e
                    );
                    let mid = chunk.len() / 2;
                    stack.push(chunk[mid..].to_vec());
                    stack.push(chunk[..mid].to_vec());
                }
                Err(e) => {
                    error!("Giving up on address {}: {}", chunk[0], e);
                }
            }
        }
        rows
    }

    /// One script invocation with the adaptive retry loop: up to five
    /// attempts, doubling the pause while the node reports exhaustion;
    /// deadline and transport terminations abort straight away.
    async fn run_keys_script(
        &self,
        addresses: &[Address],
    ) -> IndexerResult<Vec<PublicKeyAccountRow>> {
        let arguments = vec![
            cadence::array_value(addresses.iter().map(cadence::address_value).collect()),
            cadence::int_value(self.config.max_acct_keys),
            cadence::bool_value(self.config.ignore_zero_weight),
            cadence::bool_value(self.config.ignore_revoked),
        ];

        let mut pause = self.config.fetch_slow_down();
        let mut attempts = 0u32;
        loop {
            match self
                .client
                .execute_script_at_latest_block(GET_KEYS_SCRIPT, arguments.clone())
                .await
            {
                Ok(value) => return decode_account_keys(&value),
                Err(e) => {
                    attempts += 1;
                    warn!(
                        "Script attempt {} failed for {} addresses: {}",
                        attempts,
                        addresses.len(),
                        e
                    );
                    if attempts >= MAX_SCRIPT_ATTEMPTS
                        || e.is_connection_termination()
                        || e.is_deadline_exceeded()
                    {
                        return Err(e);
                    }
                    tokio::time::sleep(pause).await;
                    if e.is_resource_exhausted() {
                        pause *= 2;
                    }
                }
            }
        }
    }
}

fn is_ignored(address: &Address) -> bool {
    IGNORE_ACCOUNTS.contains(&address.canonical().as_str())
}

/// The deny-list in owned form, for store queries that must exclude it.
pub fn ignored_accounts() -> Vec<String> {
    IGNORE_ACCOUNTS.iter().map(|a| a.to_string()).collect()
}

/// Decodes the key script's `{Address: [KeyEntry]}` dictionary. An account
/// mapped to an empty array becomes one blank sentinel row so it is not
/// queried again.
pub fn decode_account_keys(value: &serde_json::Value) -> IndexerResult<Vec<PublicKeyAccountRow>> {
    let malformed = |what: &str| IndexerError::Chain(format!("malformed script result: {}", what));

    let pairs = value
        .get("value")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| malformed("not a dictionary"))?;

    let mut rows = Vec::new();
    for pair in pairs {
        let account = pair
            .get("key")
            .and_then(|k| k.get("value"))
            .and_then(serde_json::Value::as_str)
            .and_then(Address::parse)
            .ok_or_else(|| malformed("dictionary key is not an address"))?;
        let entries = pair
            .get("value")
            .and_then(|v| v.get("value"))
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| malformed("dictionary value is not an array"))?;

        if entries.is_empty() {
            rows.push(PublicKeyAccountRow::blank(&account.canonical()));
            continue;
        }

        for entry in entries {
            let str_field = |name: &str| -> IndexerResult<String> {
                cadence::composite_field(entry, name)
                    .and_then(|f| f.get("value"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| malformed(name))
            };
            let int_field = |name: &str| -> IndexerResult<i64> {
                str_field(name)?
                    .parse()
                    .map_err(|_| malformed(name))
            };

            let public_key = str_field("publicKey")?;
            let weight = cadence::ufix64_to_weight(&str_field("weight")?)
                .ok_or_else(|| malformed("weight"))?;
            let revoked = cadence::composite_field(entry, "isRevoked")
                .and_then(|f| f.get("value"))
                .and_then(serde_json::Value::as_bool)
                .ok_or_else(|| malformed("isRevoked"))?;

            rows.push(PublicKeyAccountRow {
                public_key: strip_0x_prefix(&public_key).to_lowercase(),
                account: account.canonical(),
                key_id: int_field("keyIndex")?,
                weight,
                sig_algo: Some(int_field("signatureAlgorithm")?),
                hash_algo: Some(int_field("hashAlgorithm")?),
                is_revoked: revoked,
            });
        }
    }
    Ok(rows)
}
