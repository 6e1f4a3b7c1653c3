//! The capability traits every storage engine satisfies.
//!
//! Shard-aware methods take an explicit [`ShardId`]; an engine without
//! native multi-tenant storage simply ignores it, which keeps all data
//! in one physical store and leaves shard isolation to the id-prefix
//! scheme. This mirrors the extended / non-extended split of the
//! original storage interface.

use crate::err::Result;
use crate::kvs::txn::StorageTxn;
use crate::kvs::Key;
use crate::kvs::ShardId;
use crate::kvs::StorageEntry;
use crate::kvs::Val;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;

/// An ordered key value storage engine.
pub trait StorageEngine: Send + Sync {
	/// The registered name of this engine flavour.
	fn name(&self) -> &'static str;

	/// Apply engine-specific configuration before open.
	fn configure(&self, conf: &JsonValue) -> Result<()>;

	/// Open the store rooted at the given path.
	fn open(&self, path: &Path) -> Result<()>;

	/// Close the store, flushing anything buffered.
	fn close(&self) -> Result<()>;

	/// Reclaim space. Serialised against writers by the facade.
	fn compact(&self) -> Result<()>;

	/// Destroy the store at the given path.
	fn drop_store(&self, path: &Path) -> Result<()>;

	/// Begin a top-level transaction.
	fn begin(&self, write: bool) -> Result<StorageTxn>;

	/// Open (lazily creating) a named sub-database of primary records.
	fn open_database(&self, name: &str, txn: &mut StorageTxn) -> Result<Arc<dyn StorageDatabase>>;

	/// Open (lazily creating) a named sub-database of index entries.
	fn open_index(&self, name: &str, txn: &mut StorageTxn) -> Result<Arc<dyn StorageIndex>>;

	/// Open a named monotone sequence.
	fn open_sequence(&self, name: &str, txn: &mut StorageTxn) -> Result<Arc<dyn StorageSeq>>;

	/// Attach a per-shard store. Engines without native multi-tenant
	/// storage accept the call and keep everything in the main store.
	fn mount_shard(&self, _shard: ShardId, _database_path: &str) -> Result<()> {
		Ok(())
	}

	/// Detach a per-shard store.
	fn unmount_shard(&self, _shard: ShardId) -> Result<()> {
		Ok(())
	}

	/// Drop every record belonging to a shard. Engines with one physical
	/// store rely on the id-prefix delete the shard engine performs.
	fn drop_shard(&self, _shard: ShardId, _txn: &mut StorageTxn) -> Result<()> {
		Ok(())
	}
}

/// A sub-database of primary records keyed by document id.
pub trait StorageDatabase: Send + Sync {
	fn name(&self) -> &str;

	/// Fetch a record by id.
	fn get(&self, shard: ShardId, id: &[u8], txn: &mut StorageTxn, for_update: bool) -> Result<Option<StorageEntry>>;

	/// Insert a new record.
	fn insert(&self, shard: ShardId, id: &[u8], val: &[u8], txn: &mut StorageTxn) -> Result<()>;

	/// Replace an existing record.
	fn update(&self, shard: ShardId, id: &[u8], val: &[u8], txn: &mut StorageTxn) -> Result<()>;

	/// Delete a record, reporting whether it existed.
	fn del(&self, shard: ShardId, id: &[u8], txn: &mut StorageTxn) -> Result<bool>;

	/// Raw keyed write, for engine-internal state rows.
	fn set_raw(&self, key: &[u8], val: &[u8], txn: &mut StorageTxn) -> Result<()>;

	/// Raw keyed read.
	fn get_raw(&self, key: &[u8], txn: &mut StorageTxn) -> Result<Option<Val>>;

	/// Raw keyed delete.
	fn del_raw(&self, key: &[u8], txn: &mut StorageTxn) -> Result<bool>;

	/// Open a cursor over this sub-database within the transaction.
	fn cursor(&self, txn: &mut StorageTxn) -> Result<Box<dyn Cursor>>;

	/// Entry count and byte footprint.
	fn stats(&self, txn: &mut StorageTxn) -> Result<(u64, u64)>;

	/// Drop the whole sub-database.
	fn drop_db(&self, txn: &mut StorageTxn) -> Result<()>;
}

/// A sub-database of index entries: keys are the data.
pub trait StorageIndex: Send + Sync {
	fn name(&self) -> &str;

	/// Insert an entry key.
	fn insert(&self, shard: ShardId, key: &[u8], txn: &mut StorageTxn) -> Result<()>;

	/// Delete an entry key, reporting whether it existed.
	fn del(&self, shard: ShardId, key: &[u8], txn: &mut StorageTxn) -> Result<bool>;

	/// Delete every entry under a prefix, returning the count removed.
	fn del_prefix(&self, prefix: &[u8], txn: &mut StorageTxn) -> Result<u64>;

	/// Open a cursor over the entries within the transaction.
	fn cursor(&self, txn: &mut StorageTxn) -> Result<Box<dyn Cursor>>;

	/// Entry count and byte footprint under a prefix.
	fn stats(&self, prefix: &[u8], txn: &mut StorageTxn) -> Result<(u64, u64)>;
}

/// A page-allocated monotone 64-bit counter.
pub trait StorageSeq: Send + Sync {
	/// Allocate the next value. Only the page refill touches storage.
	fn next(&self, txn: &mut StorageTxn) -> Result<i64>;

	/// Persist the exact cursor so a reopen wastes no ids.
	fn close(&self, txn: &mut StorageTxn) -> Result<()>;
}

/// A positioned cursor over one sub-database.
///
/// Returned pairs are owned copies; the cursor observes the transaction's
/// own uncommitted writes as of when it was opened.
pub trait Cursor: Send {
	/// Position at the first key `>=` the given key.
	fn seek(&mut self, key: &[u8]) -> Result<Option<(Key, Val)>>;

	/// Position at the last key `<=` the given key.
	fn seek_back(&mut self, key: &[u8]) -> Result<Option<(Key, Val)>>;

	/// Position at the first key.
	fn first(&mut self) -> Result<Option<(Key, Val)>>;

	/// Position at the last key.
	fn last(&mut self) -> Result<Option<(Key, Val)>>;

	/// Advance forward.
	fn next(&mut self) -> Result<Option<(Key, Val)>>;

	/// Step backward.
	fn prev(&mut self) -> Result<Option<(Key, Val)>>;

	/// The pair under the cursor, if positioned.
	fn current(&self) -> Option<(Key, Val)>;

	/// Delete the pair under the cursor through the transaction.
	fn del_current(&mut self, txn: &mut StorageTxn) -> Result<()>;
}

/// The engine-level transaction under a [`StorageTxn`] wrapper.
pub trait RawTxn: Send {
	/// Apply all buffered writes.
	fn commit(&mut self) -> Result<()>;

	/// Throw all buffered writes away. Called at most once; dropping an
	/// uncommitted transaction implies abort.
	fn abort(&mut self) -> Result<()>;

	/// Whether the transaction can still be used.
	fn is_valid(&self) -> bool;

	/// Begin a nested transaction that commits into this one.
	fn begin_nested(&mut self) -> Result<()>;

	/// Merge the innermost nested transaction into its parent.
	fn commit_nested(&mut self) -> Result<()>;

	/// Roll back the innermost nested transaction.
	fn abort_nested(&mut self) -> Result<()>;

	/// Engine-side downcast support.
	fn as_any(&self) -> &dyn Any;
	fn as_any_mut(&mut self) -> &mut dyn Any;
}
