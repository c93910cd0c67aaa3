use std::path::PathBuf;
use std::time::Duration;

/// Which bulk feed the sweeper drives. Only one runs per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Walk the dense address index from 1 to the highest live account.
    Enumeration,
    /// Re-fetch addresses queued for processing or missing algo columns.
    Backfill,
}

impl SyncMode {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "enumeration" => Ok(SyncMode::Enumeration),
            "backfill" => Ok(SyncMode::Backfill),
            other => Err(format!(
                "Invalid sync mode '{}', expected 'enumeration' or 'backfill'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub port: u16,
    pub access_node_url: String,
    pub chain_id: String,

    pub max_acct_keys: i64,
    pub batch_size: usize,
    pub sweep_batch_size: usize,
    pub ignore_zero_weight: bool,
    pub ignore_revoked: bool,

    pub wait_num_blocks: u64,
    pub block_poll_interval_secs: u64,
    pub sync_poll_interval_mins: u64,
    pub max_block_range: u64,
    pub fetch_slow_down_ms: u64,

    pub purge_on_start: bool,
    pub enable_sync_data: bool,
    pub enable_incremental: bool,
    pub sync_mode: SyncMode,
    pub address_search_seed: u64,

    pub database_path: String,
    pub db_pool_size: u32,
    pub db_retry_times: u32,
    pub db_retry_sleep_ms: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.access_node_url.is_empty() {
            return Err("Access node URL cannot be empty".to_string());
        }
        if self.database_path.is_empty() {
            return Err("Database path cannot be empty".to_string());
        }
        if self.batch_size == 0 {
            return Err("Batch size must be greater than zero".to_string());
        }
        if self.sweep_batch_size < self.batch_size {
            return Err("Sweep batch size must be at least the batch size".to_string());
        }
        if self.max_block_range < self.wait_num_blocks {
            return Err("Max block range must be at least the wait-num-blocks gap".to_string());
        }
        if self.db_pool_size == 0 {
            return Err("Database pool size must be greater than zero".to_string());
        }
        if self.address_search_seed == 0 {
            return Err("Address search seed must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database_path)
    }

    pub fn fetch_slow_down(&self) -> Duration {
        Duration::from_millis(self.fetch_slow_down_ms)
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_secs(self.block_poll_interval_secs)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync_poll_interval_mins * 60)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            port: 8080,
            access_node_url: "https://rest-mainnet.onflow.org".to_string(),
            chain_id: "flow-mainnet".to_string(),
            max_acct_keys: 1000,
            batch_size: 100,
            sweep_batch_size: 50_000,
            ignore_zero_weight: true,
            ignore_revoked: true,
            wait_num_blocks: 200,
            block_poll_interval_secs: 180,
            sync_poll_interval_mins: 5,
            max_block_range: 600,
            fetch_slow_down_ms: 50,
            purge_on_start: false,
            enable_sync_data: true,
            enable_incremental: true,
            sync_mode: SyncMode::Backfill,
            address_search_seed: 3_000_000,
            database_path: "keyindexer.db".to_string(),
            db_pool_size: 100,
            db_retry_times: 30,
            db_retry_sleep_ms: 1000,
        }
    }
}
