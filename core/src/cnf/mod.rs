use once_cell::sync::Lazy;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
	std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// The on-disk format version, written to `_version` on create.
pub const DATABASE_VERSION: i64 = 8;

/// How many objects a batched put/del/merge may touch before the request
/// auto-commits its transaction and starts a new one.
pub const AUTO_BATCH_SIZE: u32 = 256;

/// How many records `load` applies before checkpointing its transaction.
/// An arbitrary number in the high hundreds; primality is not required,
/// just handy to avoid synchronizing with loaded data sets.
pub const LOAD_STEP_SIZE: u32 = 173;

/// How many values the revision / index-id sequences allocate per page.
/// A crash costs at most one page of ids.
pub const SEQUENCE_PAGE_SIZE: i64 = 100;

/// How many times the facade retries a whole request after a deadlock.
pub const DEADLOCK_RETRIES: u32 = 20;

/// Sleep between deadlock retries, in milliseconds.
pub const DEADLOCK_SLEEP_MS: u64 = 20;

/// How many times an index entry delete is retried before escalating.
pub const INDEX_DEL_RETRIES: u32 = 3;

/// The default purge window, in days.
pub const PURGE_WINDOW_DAYS: i64 = 14;

/// The default result limit for a find without an explicit limit.
pub const FIND_LIMIT_DEFAULT: u32 = 500;

/// How many index ranges one query may expand into.
pub const MAX_QUERY_GROUPS: usize = 128;

/// Specifies how many rows the search cursor will materialize before
/// failing with [`crate::err::Error::SearchCapExceeded`].
pub static SEARCH_MAX_RESULTS: Lazy<usize> =
	Lazy::new(|| env_parse("MOJODB_SEARCH_MAX_RESULTS", 10_000));

/// Specifies the fan-out of the search cursor's object materializer.
pub static SEARCH_FANOUT: Lazy<usize> =
	Lazy::new(|| env_parse("MOJODB_SEARCH_FANOUT", 4).clamp(1, num_cpus::get()));

/// The name of the sub-database holding primary object records.
pub const OBJECTS_DB_NAME: &str = "objects.db";

/// The name of the sub-database holding all secondary index entries.
pub const INDEXES_DB_NAME: &str = "indexes.db";

/// The name of the sub-database holding per-kind state (tokens).
pub const KINDS_DB_NAME: &str = "kinds.db";

/// The name of the sub-database mapping index signatures to index ids.
pub const INDEX_IDS_DB_NAME: &str = "indexIds.db";

/// The name of the sub-database holding per-owner storage usage.
pub const QUOTAS_DB_NAME: &str = "quotas.db";

/// The name of the sequence allocating database revisions.
pub const REV_SEQ_NAME: &str = "rev";

/// The name of the sequence allocating index and kind tokens.
pub const INDEX_ID_SEQ_NAME: &str = "indexId";

/// The file recording the database version, under the database path.
pub const VERSION_FILE_NAME: &str = "_version";

/// The lock file giving a single-writer-per-directory guarantee.
pub const LOCK_FILE_NAME: &str = "_lock";

/// Environment variable selecting a registered storage engine.
pub const ENGINE_ENV: &str = "MOJODB_ENGINE";
