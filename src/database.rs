use crate::error::{IndexerError, IndexerResult};
use crate::models::{PublicKeyAccountRow, BLANK_PUBLIC_KEY};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const DDL_BUSY_TIMEOUT: Duration = Duration::from_secs(2);
const CONN_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_MIN_IDLE: u32 = 20;
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(3600);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(900);

/// Persistent store for key records, the processing queue and the cursor.
///
/// Uniqueness lives on the `(publickey, account, keyid)` triple; conflicting
/// inserts update only the algorithm columns. The cursor row in the stats
/// table is the single piece of state shared between the scanner and the
/// writer, and `advance_loaded_block_height` refuses to move it backwards.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    distinct_refresh: Arc<Semaphore>,
}

impl Store {
    /// Opens the database, retrying the initial connection. Exhausting the
    /// retries is a fatal init error surfaced to the caller.
    pub fn open<P: AsRef<Path>>(
        path: P,
        pool_size: u32,
        retry_times: u32,
        retry_sleep: Duration,
    ) -> IndexerResult<Self> {
        let mut attempt = 0u32;
        loop {
            match Self::try_open(path.as_ref(), pool_size) {
                Ok(store) => return Ok(store),
                Err(e) => {
                    attempt += 1;
                    if attempt >= retry_times.max(1) {
                        error!("Database could not be opened after {} attempts: {}", attempt, e);
                        return Err(e);
                    }
                    warn!(
                        "Database open failed (attempt {}/{}), retrying: {}",
                        attempt, retry_times, e
                    );
                    std::thread::sleep(retry_sleep);
                }
            }
        }
    }

    fn try_open(path: &Path, pool_size: u32) -> IndexerResult<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(CONN_BUSY_TIMEOUT));
        let pool = Pool::builder()
            .max_size(pool_size)
            .min_idle(Some(POOL_MIN_IDLE.min(pool_size)))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .build(manager)?;
        let conn = pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(Store {
            pool,
            distinct_refresh: Arc::new(Semaphore::new(1)),
        })
    }

    /// Creates (optionally recreating) the schema and applies migrations.
    pub fn start(&self, purge_on_start: bool) -> IndexerResult<()> {
        let conn = self.pool.get()?;
        conn.busy_timeout(DDL_BUSY_TIMEOUT)?;

        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if journal_mode != "wal" {
            warn!("Could not enable WAL mode, got: {}", journal_mode);
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA temp_store = MEMORY;")?;

        if purge_on_start {
            info!("Purge on start requested, dropping all tables");
            conn.execute_batch(
                "DROP INDEX IF EXISTS idx_publickeyindexer_account;
                 DROP TABLE IF EXISTS publickeyindexer;
                 DROP TABLE IF EXISTS publickeyindexer_stats;
                 DROP TABLE IF EXISTS addressprocessing;",
            )?;
        }

        Self::init_schema(&conn)?;
        Self::migrate(&conn)?;
        info!("Database schema initialized");
        Ok(())
    }

    fn init_schema(conn: &Connection) -> IndexerResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS publickeyindexer (
                publickey TEXT NOT NULL,
                account TEXT NOT NULL,
                keyid INTEGER NOT NULL,
                weight INTEGER NOT NULL DEFAULT 0,
                sigalgo INTEGER,
                hashalgo INTEGER,
                isrevoked INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (publickey, account, keyid)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_publickeyindexer_account
             ON publickeyindexer(account)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS publickeyindexer_stats (
                pendingblockheight INTEGER NOT NULL DEFAULT 0,
                updatedblockheight INTEGER NOT NULL DEFAULT 0,
                uniquepublickeys INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "INSERT INTO publickeyindexer_stats (pendingblockheight, updatedblockheight, uniquepublickeys)
             SELECT 0, 0, 0
             WHERE (SELECT COUNT(*) FROM publickeyindexer_stats) = 0",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS addressprocessing (
                account TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Backfills columns added after the first deployment and normalizes
    /// legacy NULL revocation flags to false.
    fn migrate(conn: &Connection) -> IndexerResult<()> {
        let mut existing = Vec::new();
        {
            let mut stmt = conn.prepare("PRAGMA table_info(publickeyindexer)")?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            for name in names {
                existing.push(name?);
            }
        }
        for (column, ddl) in [
            ("sigalgo", "ALTER TABLE publickeyindexer ADD COLUMN sigalgo INTEGER"),
            ("hashalgo", "ALTER TABLE publickeyindexer ADD COLUMN hashalgo INTEGER"),
            (
                "isrevoked",
                "ALTER TABLE publickeyindexer ADD COLUMN isrevoked INTEGER NOT NULL DEFAULT 0",
            ),
        ] {
            if !existing.iter().any(|c| c == column) {
                info!("Migrating: adding column {}", column);
                conn.execute(ddl, [])?;
            }
        }
        conn.execute(
            "UPDATE publickeyindexer SET isrevoked = 0 WHERE isrevoked IS NULL",
            [],
        )?;
        Ok(())
    }

    /// Conflict-aware batch upsert. On a `(publickey, account, keyid)`
    /// conflict only the algorithm columns are updated; weight and the
    /// revocation flag keep their first-written values.
    pub fn insert_public_key_accounts(&self, rows: &[PublicKeyAccountRow]) -> IndexerResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO publickeyindexer
                 (publickey, account, keyid, weight, sigalgo, hashalgo, isrevoked)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (publickey, account, keyid)
                 DO UPDATE SET sigalgo = excluded.sigalgo, hashalgo = excluded.hashalgo",
            )?;
            for row in rows {
                affected += stmt.execute(params![
                    row.public_key,
                    row.account,
                    row.key_id,
                    row.weight,
                    row.sig_algo,
                    row.hash_algo,
                    row.is_revoked,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Upserted {} of {} key rows", affected, rows.len());
        Ok(affected)
    }

    /// Bulk path for very large batches: rows stream into a staging table
    /// and merge into the main table in one transaction, so a failure leaves
    /// nothing partially visible.
    pub fn bulk_load_public_key_accounts(
        &self,
        rows: &[PublicKeyAccountRow],
    ) -> IndexerResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DROP TABLE IF EXISTS staging_publickeyindexer", [])?;
        tx.execute(
            "CREATE TEMP TABLE staging_publickeyindexer (
                publickey TEXT NOT NULL,
                account TEXT NOT NULL,
                keyid INTEGER NOT NULL,
                weight INTEGER NOT NULL,
                sigalgo INTEGER,
                hashalgo INTEGER,
                isrevoked INTEGER NOT NULL
            )",
            [],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO staging_publickeyindexer
                 (publickey, account, keyid, weight, sigalgo, hashalgo, isrevoked)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.public_key,
                    row.account,
                    row.key_id,
                    row.weight,
                    row.sig_algo,
                    row.hash_algo,
                    row.is_revoked,
                ])?;
            }
        }
        let affected = tx.execute(
            "INSERT INTO publickeyindexer
             (publickey, account, keyid, weight, sigalgo, hashalgo, isrevoked)
             SELECT publickey, account, keyid, weight, sigalgo, hashalgo, isrevoked
             FROM staging_publickeyindexer
             WHERE true
             GROUP BY publickey, account, keyid
             ON CONFLICT (publickey, account, keyid)
             DO UPDATE SET sigalgo = excluded.sigalgo, hashalgo = excluded.hashalgo",
            [],
        )?;
        tx.execute("DROP TABLE staging_publickeyindexer", [])?;
        tx.commit()?;
        info!("Bulk loaded {} of {} key rows", affected, rows.len());
        Ok(affected)
    }

    pub fn get_accounts_by_public_key(
        &self,
        public_key: &str,
    ) -> IndexerResult<Vec<PublicKeyAccountRow>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT publickey, account, keyid, weight, sigalgo, hashalgo, isrevoked
             FROM publickeyindexer
             WHERE publickey = ?
             ORDER BY account, keyid",
        )?;
        let rows = stmt.query_map(params![public_key], row_from_sql)?;
        collect_rows(rows)
    }

    /// Deletes every row of an address the scanner re-surfaced so the
    /// authoritative re-fetch replaces the whole key set.
    pub fn remove_account_for_reloading(&self, account: &str) -> IndexerResult<usize> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM publickeyindexer WHERE account = ?",
            params![account],
        )?;
        if deleted > 0 {
            debug!("Removed {} rows of {} for reload", deleted, account);
        }
        Ok(deleted)
    }

    pub fn store_addresses_for_processing(&self, accounts: &[String]) -> IndexerResult<usize> {
        if accounts.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().timestamp();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO addressprocessing (account, created_at) VALUES (?, ?)",
            )?;
            for account in accounts {
                inserted += stmt.execute(params![account, now])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_addresses_to_process(&self, limit: usize) -> IndexerResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT account FROM addressprocessing ORDER BY created_at, account LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }

    pub fn remove_addresses_from_processing(&self, accounts: &[String]) -> IndexerResult<usize> {
        if accounts.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM addressprocessing WHERE account = ?")?;
            for account in accounts {
                deleted += stmt.execute(params![account])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Accounts whose stored rows are missing algorithm columns, excluding
    /// the blank sentinel and anything on the ignore list.
    pub fn get_addresses_without_algos(
        &self,
        limit: usize,
        ignore: &[String],
    ) -> IndexerResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut query = String::from(
            "SELECT DISTINCT account FROM publickeyindexer
             WHERE (sigalgo IS NULL OR hashalgo IS NULL) AND publickey != ?",
        );
        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(BLANK_PUBLIC_KEY.to_string())];
        if !ignore.is_empty() {
            let placeholders = vec!["?"; ignore.len()].join(", ");
            query.push_str(&format!(" AND account NOT IN ({})", placeholders));
            for account in ignore {
                bindings.push(Box::new(account.clone()));
            }
        }
        query.push_str(" ORDER BY account ASC LIMIT ?");
        bindings.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bindings.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        collect_rows(rows)
    }

    pub fn get_unique_addresses(&self) -> IndexerResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT account FROM publickeyindexer")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }

    /// Unconditional cursor write used once at startup.
    pub fn seed_block_heights(&self, height: u64) -> IndexerResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE publickeyindexer_stats
             SET pendingblockheight = ?1, updatedblockheight = ?1",
            params![height as i64],
        )?;
        Ok(())
    }

    /// Compare-and-set style cursor advance. Returns false (and leaves the
    /// row untouched) when the stored height is already past the target.
    pub fn advance_loaded_block_height(&self, height: u64) -> IndexerResult<bool> {
        let conn = self.pool.get()?;
        let affected = conn.execute(
            "UPDATE publickeyindexer_stats
             SET pendingblockheight = ?1
             WHERE pendingblockheight <= ?1",
            params![height as i64],
        )?;
        if affected == 0 {
            warn!("Refusing to regress loaded block height to {}", height);
        }
        Ok(affected > 0)
    }

    pub fn get_loaded_block_height(&self) -> IndexerResult<u64> {
        let conn = self.pool.get()?;
        let height: i64 = conn.query_row(
            "SELECT pendingblockheight FROM publickeyindexer_stats",
            [],
            |row| row.get(0),
        )?;
        Ok(height.max(0) as u64)
    }

    pub fn update_updated_block_height(&self, height: u64) -> IndexerResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE publickeyindexer_stats SET updatedblockheight = ?",
            params![height as i64],
        )?;
        Ok(())
    }

    /// Cached distinct-key count plus the loaded cursor height.
    pub fn get_public_key_stats(&self) -> IndexerResult<(i64, u64)> {
        let conn = self.pool.get()?;
        let (count, loaded): (i64, i64) = conn.query_row(
            "SELECT uniquepublickeys, pendingblockheight FROM publickeyindexer_stats",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count, loaded.max(0) as u64))
    }

    pub fn count_distinct_public_keys(&self) -> IndexerResult<i64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT publickey) FROM publickeyindexer",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Refreshes the cached distinct count. Guarded by a single-slot
    /// semaphore; concurrent requests are dropped rather than queued.
    pub async fn update_distinct_count(&self) {
        let Ok(_permit) = self.distinct_refresh.try_acquire() else {
            debug!("Distinct count refresh already running, skipping");
            return;
        };
        let result = self.count_distinct_public_keys().and_then(|count| {
            let conn = self.pool.get()?;
            conn.execute(
                "UPDATE publickeyindexer_stats SET uniquepublickeys = ?",
                params![count],
            )?;
            debug!("Updated unique public key count to {}", count);
            Ok(())
        });
        if let Err(e) = result {
            error!("Could not update unique public key count: {}", e);
        }
    }
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublicKeyAccountRow> {
    Ok(PublicKeyAccountRow {
        public_key: row.get(0)?,
        account: row.get(1)?,
        key_id: row.get(2)?,
        weight: row.get(3)?,
        sig_algo: row.get(4)?,
        hash_algo: row.get(5)?,
        is_revoked: row.get(6)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> IndexerResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(IndexerError::Database)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        let store = Store::open(
            dir.path().join("test.db"),
            4,
            1,
            Duration::from_millis(10),
        )
        .unwrap();
        store.start(false).unwrap();
        store
    }

    fn row(public_key: &str, account: &str, key_id: i64) -> PublicKeyAccountRow {
        PublicKeyAccountRow {
            public_key: public_key.to_string(),
            account: account.to_string(),
            key_id,
            weight: 1000,
            sig_algo: Some(1),
            hash_algo: Some(3),
            is_revoked: false,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let rows = vec![
            row("key1", "0x0000000000000001", 0),
            row("key1", "0x0000000000000002", 0),
            row("key2", "0x0000000000000001", 1),
        ];
        assert_eq!(store.insert_public_key_accounts(&rows).unwrap(), 3);

        let found = store.get_accounts_by_public_key("key1").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].account, "0x0000000000000001");
        assert_eq!(found[1].account, "0x0000000000000002");
        assert!(store.get_accounts_by_public_key("nope").unwrap().is_empty());
    }

    #[test]
    fn test_conflict_updates_algos_only() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut first = row("key1", "0xa", 0);
        first.weight = 1000;
        first.sig_algo = Some(0);
        first.hash_algo = Some(0);
        store.insert_public_key_accounts(&[first]).unwrap();

        let mut second = row("key1", "0xa", 0);
        second.weight = 500;
        second.sig_algo = Some(1);
        second.hash_algo = Some(1);
        store.insert_public_key_accounts(&[second]).unwrap();

        let found = store.get_accounts_by_public_key("key1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sig_algo, Some(1));
        assert_eq!(found[0].hash_algo, Some(1));
        // first write wins for weight
        assert_eq!(found[0].weight, 1000);
    }

    #[test]
    fn test_duplicate_triple_in_one_batch_yields_one_row() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let rows = vec![row("key1", "0xa", 0), row("key1", "0xa", 0)];
        store.insert_public_key_accounts(&rows).unwrap();
        assert_eq!(store.get_accounts_by_public_key("key1").unwrap().len(), 1);
    }

    #[test]
    fn test_bulk_load_staging_path() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut seeded = row("key1", "0xa", 0);
        seeded.sig_algo = Some(0);
        seeded.hash_algo = Some(0);
        store.insert_public_key_accounts(&[seeded]).unwrap();

        let rows = vec![
            row("key1", "0xa", 0), // conflicts, updates algos
            row("key2", "0xb", 0),
            row("key2", "0xb", 0), // duplicate collapses in staging
            row("key3", "0xc", 2),
        ];
        store.bulk_load_public_key_accounts(&rows).unwrap();

        let updated = store.get_accounts_by_public_key("key1").unwrap();
        assert_eq!(updated[0].sig_algo, Some(1));
        assert_eq!(store.get_accounts_by_public_key("key2").unwrap().len(), 1);
        assert_eq!(store.get_accounts_by_public_key("key3").unwrap().len(), 1);
    }

    #[test]
    fn test_processing_queue_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let accounts = vec![
            "0x0000000000000001".to_string(),
            "0x0000000000000002".to_string(),
            "0x0000000000000001".to_string(), // dedup on insert
        ];
        assert_eq!(store.store_addresses_for_processing(&accounts).unwrap(), 2);

        let queued = store.get_addresses_to_process(10).unwrap();
        assert_eq!(queued.len(), 2);

        assert_eq!(store.remove_addresses_from_processing(&queued).unwrap(), 2);
        assert!(store.get_addresses_to_process(10).unwrap().is_empty());
    }

    #[test]
    fn test_addresses_without_algos() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let mut incomplete = row("key1", "0xaaa", 0);
        incomplete.sig_algo = None;
        incomplete.hash_algo = None;
        let complete = row("key2", "0xbbb", 0);
        let blank = PublicKeyAccountRow::blank("0xccc");
        let mut ignored = row("key3", "0xddd", 0);
        ignored.sig_algo = None;
        store
            .insert_public_key_accounts(&[incomplete, complete, blank, ignored])
            .unwrap();

        let found = store.get_addresses_without_algos(10, &[]).unwrap();
        assert_eq!(found, vec!["0xaaa".to_string(), "0xddd".to_string()]);

        let filtered = store
            .get_addresses_without_algos(10, &["0xddd".to_string()])
            .unwrap();
        assert_eq!(filtered, vec!["0xaaa".to_string()]);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.seed_block_heights(1000).unwrap();
        assert_eq!(store.get_loaded_block_height().unwrap(), 1000);

        assert!(store.advance_loaded_block_height(1200).unwrap());
        assert_eq!(store.get_loaded_block_height().unwrap(), 1200);

        // regress refused
        assert!(!store.advance_loaded_block_height(900).unwrap());
        assert_eq!(store.get_loaded_block_height().unwrap(), 1200);

        // startup reseed may move it anywhere
        store.seed_block_heights(500).unwrap();
        assert_eq!(store.get_loaded_block_height().unwrap(), 500);
    }

    #[test]
    fn test_distinct_count_refresh() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store
            .insert_public_key_accounts(&[
                row("key1", "0xa", 0),
                row("key1", "0xb", 0),
                row("key2", "0xa", 1),
            ])
            .unwrap();

        let (count, _) = store.get_public_key_stats().unwrap();
        assert_eq!(count, 0); // cached value not refreshed yet

        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(store.update_distinct_count());

        let (count, _) = store.get_public_key_stats().unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_remove_account_for_reloading() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store
            .insert_public_key_accounts(&[row("key1", "0xa", 0), row("key2", "0xa", 1)])
            .unwrap();
        assert_eq!(store.remove_account_for_reloading("0xa").unwrap(), 2);
        assert!(store.get_accounts_by_public_key("key1").unwrap().is_empty());
    }

    #[test]
    fn test_purge_on_start() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .insert_public_key_accounts(&[row("key1", "0xa", 0)])
            .unwrap();

        store.start(true).unwrap();
        assert!(store.get_accounts_by_public_key("key1").unwrap().is_empty());
        assert_eq!(store.get_loaded_block_height().unwrap(), 0);
    }

    #[test]
    fn test_migration_adds_missing_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "CREATE TABLE publickeyindexer (
                    publickey TEXT NOT NULL,
                    account TEXT NOT NULL,
                    keyid INTEGER NOT NULL,
                    weight INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (publickey, account, keyid)
                )",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO publickeyindexer (publickey, account, keyid, weight)
                 VALUES ('key1', '0xa', 0, 1000)",
                [],
            )
            .unwrap();
        }

        let store = Store::open(&path, 2, 1, Duration::from_millis(10)).unwrap();
        store.start(false).unwrap();

        let found = store.get_accounts_by_public_key("key1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sig_algo, None);
        assert!(!found[0].is_revoked);

        // the migrated row now shows up as incomplete
        let incomplete = store.get_addresses_without_algos(10, &[]).unwrap();
        assert_eq!(incomplete, vec!["0xa".to_string()]);
    }

    #[test]
    fn test_unique_addresses() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .insert_public_key_accounts(&[
                row("key1", "0xa", 0),
                row("key2", "0xa", 1),
                row("key3", "0xb", 0),
            ])
            .unwrap();
        let mut unique = store.get_unique_addresses().unwrap();
        unique.sort();
        assert_eq!(unique, vec!["0xa".to_string(), "0xb".to_string()]);
    }
}
