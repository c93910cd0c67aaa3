use crate::client_trait::{cadence, ChainClient};
use crate::error::IndexerResult;
use crate::models::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const GET_STORAGE_USED_SCRIPT: &str = include_str!("../scripts/get_storage_used.cdc");

/// The probe script fails with one of these messages when the account at the
/// probed index does not exist yet.
const END_OF_ACCOUNTS_ERROR: &str =
    "storage used is not initialized or not initialized correctly";
const STORAGE_USED_FAILED_ERROR: &str =
    "get storage used failed: failed to get storage used";

/// Addresses known to make access nodes fail server-side; skipped during
/// enumeration.
pub const BROKEN_ADDRESSES: &[&str] = &[
    "0xbf48a20670f179b8",
    "0x5eba0297874a2bfd",
    "0x474ec037bcd8accf",
    "0xb0e80595d267f4eb",
];

/// Maps a dense account index onto an address. The chain's derivation is a
/// collaborator contract; networks that permute indices through a code word
/// plug in their own implementation.
pub trait AddressGenerator: Send + Sync {
    fn address_at(&self, index: u64) -> Address;
}

/// Generator for chains whose account index is the address payload itself.
pub struct IndexAddressGenerator;

impl AddressGenerator for IndexAddressGenerator {
    fn address_at(&self, index: u64) -> Address {
        Address::from_index(index)
    }
}

/// Finds the highest live account index, then enumerates `1..=last` in
/// batches.
///
/// The search doubles an upper probe until it falls off the end of the
/// address space, then bisects; it needs at most `2·log₂(last)` probes. The
/// result is not persisted, so a restart re-runs the search.
pub struct AddressProvider {
    client: Arc<dyn ChainClient>,
    generator: Arc<dyn AddressGenerator>,
    pause: Duration,
    last_index: u64,
}

impl AddressProvider {
    pub async fn init(
        client: Arc<dyn ChainClient>,
        generator: Arc<dyn AddressGenerator>,
        seed_index: u64,
        pause: Duration,
    ) -> IndexerResult<Self> {
        let mut provider = AddressProvider {
            client,
            generator,
            pause,
            last_index: 0,
        };
        let mut steps = 0usize;
        provider.last_index = provider.find_last_index(seed_index, &mut steps).await?;
        info!(
            "Highest live account index {} ({}) found in {} probes",
            provider.last_index,
            provider.last_address(),
            steps
        );
        Ok(provider)
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_address(&self) -> Address {
        self.generator.address_at(self.last_index)
    }

    async fn find_last_index(&self, seed: u64, steps: &mut usize) -> IndexerResult<u64> {
        if !self.address_exists(seed, steps).await? {
            warn!("Seed index {} has no account, searching below it", seed);
            return self.bisect(1, seed, steps).await;
        }
        let mut lower = seed;
        let mut upper = seed.saturating_mul(2);
        while self.address_exists(upper, steps).await? {
            lower = upper;
            upper = upper.saturating_mul(2);
        }
        self.bisect(lower, upper, steps).await
    }

    /// Narrows `(exists, missing)` until they are adjacent.
    async fn bisect(&self, mut lower: u64, mut upper: u64, steps: &mut usize) -> IndexerResult<u64> {
        loop {
            let mid = lower + (upper - lower) / 2;
            if mid == lower {
                return Ok(lower);
            }
            if self.address_exists(mid, steps).await? {
                lower = mid;
            } else {
                upper = mid;
            }
        }
    }

    async fn address_exists(&self, index: u64, steps: &mut usize) -> IndexerResult<bool> {
        tokio::time::sleep(self.pause).await;
        *steps += 1;
        let address = self.generator.address_at(index);
        debug!("Probing address {} at index {}", address, index);
        match self
            .client
            .execute_script_at_latest_block(
                GET_STORAGE_USED_SCRIPT,
                vec![cadence::address_value(&address)],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains(END_OF_ACCOUNTS_ERROR)
                    || message.contains(STORAGE_USED_FAILED_ERROR)
                {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Lazily produces address batches for `1..=last_index`, skipping the
    /// deny-list. The channel closes when the range is exhausted or the
    /// token cancels.
    pub fn generate_batches(
        self,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Vec<Address>> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(batch_size);
            for index in 1..=self.last_index {
                let address = self.generator.address_at(index);
                if BROKEN_ADDRESSES.contains(&address.canonical().as_str()) {
                    continue;
                }
                batch.push(address);
                if batch.len() == batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(full) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx.send(batch).await;
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_trait::mock::MockChainClient;
    use std::sync::atomic::Ordering;

    async fn provider_for(last_live: u64, seed: u64) -> (AddressProvider, Arc<MockChainClient>) {
        let client = Arc::new(MockChainClient::new(100));
        client.set_last_live_index(last_live);
        let provider = AddressProvider::init(
            client.clone(),
            Arc::new(IndexAddressGenerator),
            seed,
            Duration::from_millis(0),
        )
        .await
        .unwrap();
        (provider, client)
    }

    #[tokio::test]
    async fn test_search_finds_exact_boundary() {
        let (provider, client) = provider_for(3_000_007, 3_000_000).await;
        assert_eq!(provider.last_index(), 3_000_007);

        // 2·log2(3_000_007) is about 44
        let probes = client.probe_count.load(Ordering::SeqCst);
        assert!(probes <= 44, "search took {} probes", probes);
    }

    #[tokio::test]
    async fn test_search_doubles_past_small_seed() {
        let (provider, _client) = provider_for(1_000, 10).await;
        assert_eq!(provider.last_index(), 1_000);
    }

    #[tokio::test]
    async fn test_search_below_missing_seed() {
        let (provider, _client) = provider_for(7, 3_000_000).await;
        assert_eq!(provider.last_index(), 7);
    }

    #[tokio::test]
    async fn test_batch_generation() {
        let (provider, _client) = provider_for(7, 2).await;
        let mut rx = provider.generate_batches(3, CancellationToken::new());

        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 3);
        assert_eq!(batches[2], vec![Address::from_index(7)]);
        assert_eq!(batches[0][0], Address::from_index(1));
    }

    struct BrokenAtTwo;

    impl AddressGenerator for BrokenAtTwo {
        fn address_at(&self, index: u64) -> Address {
            if index == 2 {
                Address::parse(BROKEN_ADDRESSES[0]).unwrap()
            } else {
                Address::from_index(index)
            }
        }
    }

    #[tokio::test]
    async fn test_deny_listed_addresses_are_skipped() {
        let client = Arc::new(MockChainClient::new(100));
        client.set_last_live_index(4);
        let provider = AddressProvider::init(
            client,
            Arc::new(BrokenAtTwo),
            3,
            Duration::from_millis(0),
        )
        .await
        .unwrap();

        let mut rx = provider.generate_batches(10, CancellationToken::new());
        let batch = rx.recv().await.unwrap();
        assert_eq!(
            batch,
            vec![
                Address::from_index(1),
                Address::from_index(3),
                Address::from_index(4),
            ]
        );
    }
}
