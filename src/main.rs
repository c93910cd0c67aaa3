use anyhow::Result;
use clap::{ArgAction, Parser};
use flow_key_indexer::{App, Config, SyncMode};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, env = "KEYIDX_LOGLEVEL", default_value = "info")]
    log_level: String,

    #[arg(short, long, env = "KEYIDX_PORT", default_value = "8080")]
    port: u16,

    #[arg(long, env = "KEYIDX_FLOWURL", default_value = "https://rest-mainnet.onflow.org")]
    access_node_url: String,

    #[arg(long, env = "KEYIDX_CHAINID", default_value = "flow-mainnet")]
    chain_id: String,

    /// Cap on keys fetched per account by the batch script.
    #[arg(long, env = "KEYIDX_MAXACCTKEYS", default_value = "1000")]
    max_acct_keys: i64,

    /// Addresses per script invocation and per insert fragment.
    #[arg(long, env = "KEYIDX_BATCHSIZE", default_value = "100")]
    batch_size: usize,

    /// Addresses per batch emitted by the sweeper.
    #[arg(long, env = "KEYIDX_SWEEPBATCHSIZE", default_value = "50000")]
    sweep_batch_size: usize,

    #[arg(long, env = "KEYIDX_IGNOREZEROWEIGHT", default_value_t = true, action = ArgAction::Set)]
    ignore_zero_weight: bool,

    #[arg(long, env = "KEYIDX_IGNOREREVOKED", default_value_t = true, action = ArgAction::Set)]
    ignore_revoked: bool,

    /// Minimum tip-vs-cursor gap before an incremental tick does work.
    #[arg(long, env = "KEYIDX_WAITNUMBLOCKS", default_value = "200")]
    wait_num_blocks: u64,

    #[arg(long, env = "KEYIDX_BLOCKPOLINTERVALSEC", default_value = "180")]
    block_poll_interval_sec: u64,

    #[arg(long, env = "KEYIDX_SYNCDATAPOLINTERVALMIN", default_value = "5")]
    sync_data_poll_interval_min: u64,

    /// Hard ceiling on a single incremental pass; also the reseed distance.
    #[arg(long, env = "KEYIDX_MAXBLOCKRANGE", default_value = "600")]
    max_block_range: u64,

    #[arg(long, env = "KEYIDX_FETCHSLOWDOWNMS", default_value = "50")]
    fetch_slow_down_ms: u64,

    /// Drop and recreate all tables at startup.
    #[arg(long, env = "KEYIDX_PURGEONSTART")]
    purge_on_start: bool,

    #[arg(long, env = "KEYIDX_ENABLESYNCDATA", default_value_t = true, action = ArgAction::Set)]
    enable_sync_data: bool,

    #[arg(long, env = "KEYIDX_ENABLEINCREMENTAL", default_value_t = true, action = ArgAction::Set)]
    enable_incremental: bool,

    /// Bulk feed the sweeper drives: "enumeration" or "backfill".
    #[arg(long, env = "KEYIDX_SYNCMODE", default_value = "backfill")]
    sync_mode: String,

    /// Account index where the last-address search starts probing.
    #[arg(long, env = "KEYIDX_ADDRESSSEARCHSEED", default_value = "3000000")]
    address_search_seed: u64,

    #[arg(short, long, env = "KEYIDX_DATABASE", default_value = "keyindexer.db")]
    database: String,

    #[arg(long, env = "KEYIDX_DBPOOLSIZE", default_value = "100")]
    db_pool_size: u32,

    #[arg(long, env = "KEYIDX_DBRETRYNUMTIMES", default_value = "30")]
    db_retry_num_times: u32,

    #[arg(long, env = "KEYIDX_DBRETRYSLEEPMS", default_value = "1000")]
    db_retry_sleep_ms: u64,

    /// Run the offline address enumeration instead of the indexer,
    /// persisting discovered addresses into the processing queue.
    #[arg(long)]
    get_addresses: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: tracing::Level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let sync_mode = SyncMode::parse(&args.sync_mode).map_err(|e| anyhow::anyhow!(e))?;

    let config = Config {
        log_level: args.log_level,
        port: args.port,
        access_node_url: args.access_node_url,
        chain_id: args.chain_id,
        max_acct_keys: args.max_acct_keys,
        batch_size: args.batch_size,
        sweep_batch_size: args.sweep_batch_size,
        ignore_zero_weight: args.ignore_zero_weight,
        ignore_revoked: args.ignore_revoked,
        wait_num_blocks: args.wait_num_blocks,
        block_poll_interval_secs: args.block_poll_interval_sec,
        sync_poll_interval_mins: args.sync_data_poll_interval_min,
        max_block_range: args.max_block_range,
        fetch_slow_down_ms: args.fetch_slow_down_ms,
        purge_on_start: args.purge_on_start,
        enable_sync_data: args.enable_sync_data,
        enable_incremental: args.enable_incremental,
        sync_mode,
        address_search_seed: args.address_search_seed,
        database_path: args.database,
        db_pool_size: args.db_pool_size,
        db_retry_times: args.db_retry_num_times,
        db_retry_sleep_ms: args.db_retry_sleep_ms,
    };

    info!("Starting public key indexer ({})", config.chain_id);
    let app = App::new(config)?;

    if args.get_addresses {
        app.run_get_addresses().await?;
    } else {
        app.run().await?;
    }

    Ok(())
}
