#![cfg(feature = "kv-mem")]

//! The in-memory reference engine.
//!
//! Named sub-databases are ordered maps; a write transaction buffers its
//! changes in an overlay write-set applied on commit, with savepoints
//! backing nested transactions. Writers are serialised by one mutex, as
//! in the LMDB-style engines this stands in for, so a second writer on
//! the same thread (or a stuck one) surfaces as a deadlock after a
//! bounded wait.

use crate::err::Error;
use crate::err::Result;
use crate::kvs::api::Cursor;
use crate::kvs::api::RawTxn;
use crate::kvs::api::StorageDatabase;
use crate::kvs::api::StorageEngine;
use crate::kvs::api::StorageIndex;
use crate::kvs::api::StorageSeq;
use crate::kvs::txn::StorageTxn;
use crate::kvs::EngineFactory;
use crate::kvs::Key;
use crate::kvs::ShardId;
use crate::kvs::StorageEntry;
use crate::kvs::Val;
use crate::cnf;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Mutex;
use parking_lot::RawMutex;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// How long a second writer waits before reporting a deadlock.
const WRITER_WAIT: Duration = Duration::from_secs(2);

/// The hidden sub-database holding sequence cursors.
const SEQS_DB: &str = "_seqs";

type WriterGuard = ArcMutexGuard<RawMutex, ()>;

/// Buffered changes per sub-database; `None` marks a delete.
type WriteSet = HashMap<String, BTreeMap<Key, Option<Val>>>;

pub struct MemFactory;

impl EngineFactory for MemFactory {
	fn name(&self) -> &'static str {
		"mem"
	}

	fn create(&self) -> Result<Arc<dyn StorageEngine>> {
		Ok(Arc::new(MemEngine::new()))
	}
}

struct MemTree {
	tree: RwLock<BTreeMap<Key, Val>>,
}

struct MemInner {
	dbs: RwLock<HashMap<String, Arc<MemTree>>>,
	seqs: Mutex<HashMap<String, Arc<MemSeq>>>,
	writer: Arc<Mutex<()>>,
	open: AtomicBool,
	path: Mutex<Option<PathBuf>>,
}

#[non_exhaustive]
pub struct MemEngine {
	inner: Arc<MemInner>,
}

impl MemEngine {
	pub fn new() -> Self {
		MemEngine {
			inner: Arc::new(MemInner {
				dbs: RwLock::new(HashMap::new()),
				seqs: Mutex::new(HashMap::new()),
				writer: Arc::new(Mutex::new(())),
				open: AtomicBool::new(false),
				path: Mutex::new(None),
			}),
		}
	}
}

impl Default for MemEngine {
	fn default() -> Self {
		Self::new()
	}
}

impl MemInner {
	fn tree(&self, name: &str) -> Arc<MemTree> {
		if let Some(tree) = self.dbs.read().get(name) {
			return tree.clone();
		}
		let mut dbs = self.dbs.write();
		dbs.entry(name.to_string())
			.or_insert_with(|| {
				Arc::new(MemTree {
					tree: RwLock::new(BTreeMap::new()),
				})
			})
			.clone()
	}

	fn require_open(&self) -> Result<()> {
		if !self.open.load(Relaxed) {
			return Err(Error::DbNotOpen);
		}
		Ok(())
	}
}

impl StorageEngine for MemEngine {
	fn name(&self) -> &'static str {
		"mem"
	}

	fn configure(&self, _conf: &JsonValue) -> Result<()> {
		Ok(())
	}

	fn open(&self, path: &Path) -> Result<()> {
		*self.inner.path.lock() = Some(path.to_path_buf());
		self.inner.open.store(true, Relaxed);
		Ok(())
	}

	fn close(&self) -> Result<()> {
		self.inner.open.store(false, Relaxed);
		Ok(())
	}

	fn compact(&self) -> Result<()> {
		// nothing to reclaim in memory
		Ok(())
	}

	fn drop_store(&self, _path: &Path) -> Result<()> {
		self.inner.dbs.write().clear();
		self.inner.seqs.lock().clear();
		Ok(())
	}

	fn begin(&self, write: bool) -> Result<StorageTxn> {
		self.inner.require_open()?;
		let guard = if write {
			let deadline = Instant::now() + WRITER_WAIT;
			loop {
				if let Some(guard) = self.inner.writer.try_lock_arc() {
					break Some(guard);
				}
				if Instant::now() >= deadline {
					return Err(Error::Deadlock);
				}
				std::thread::sleep(Duration::from_millis(1));
			}
		} else {
			None
		};
		let raw = MemTxn {
			inner: self.inner.clone(),
			write,
			guard,
			ws: WriteSet::new(),
			savepoints: Vec::new(),
			done: false,
		};
		Ok(StorageTxn::new(Box::new(raw), write))
	}

	fn open_database(&self, name: &str, _txn: &mut StorageTxn) -> Result<Arc<dyn StorageDatabase>> {
		self.inner.require_open()?;
		Ok(Arc::new(MemDatabase {
			inner: self.inner.clone(),
			name: name.to_string(),
		}))
	}

	fn open_index(&self, name: &str, _txn: &mut StorageTxn) -> Result<Arc<dyn StorageIndex>> {
		self.inner.require_open()?;
		Ok(Arc::new(MemIndexDb {
			inner: self.inner.clone(),
			name: name.to_string(),
		}))
	}

	fn open_sequence(&self, name: &str, txn: &mut StorageTxn) -> Result<Arc<dyn StorageSeq>> {
		self.inner.require_open()?;
		if let Some(seq) = self.inner.seqs.lock().get(name) {
			return Ok(seq.clone());
		}
		let key = name.as_bytes().to_vec();
		let stored = view_get(&self.inner, SEQS_DB, &key, txn)?
			.map(|v| decode_i64(&v))
			.transpose()?
			.unwrap_or(0);
		let seq = Arc::new(MemSeq {
			inner: self.inner.clone(),
			key,
			next: AtomicI64::new(stored),
			allocated: AtomicI64::new(stored),
			refill: Mutex::new(()),
		});
		self.inner.seqs.lock().insert(name.to_string(), seq.clone());
		Ok(seq)
	}
}

pub struct MemTxn {
	inner: Arc<MemInner>,
	write: bool,
	guard: Option<WriterGuard>,
	ws: WriteSet,
	savepoints: Vec<WriteSet>,
	done: bool,
}

impl RawTxn for MemTxn {
	fn commit(&mut self) -> Result<()> {
		if self.done {
			return Err(Error::TxnFinished);
		}
		self.done = true;
		for (name, changes) in std::mem::take(&mut self.ws) {
			let tree = self.inner.tree(&name);
			let mut tree = tree.tree.write();
			for (key, val) in changes {
				match val {
					Some(val) => {
						tree.insert(key, val);
					}
					None => {
						tree.remove(&key);
					}
				}
			}
		}
		self.guard.take();
		Ok(())
	}

	fn abort(&mut self) -> Result<()> {
		if self.done {
			return Err(Error::TxnFinished);
		}
		self.done = true;
		self.ws.clear();
		self.savepoints.clear();
		self.guard.take();
		Ok(())
	}

	fn is_valid(&self) -> bool {
		!self.done
	}

	fn begin_nested(&mut self) -> Result<()> {
		self.savepoints.push(self.ws.clone());
		Ok(())
	}

	fn commit_nested(&mut self) -> Result<()> {
		// the child's writes are already buffered; just drop the savepoint
		self.savepoints.pop().map(|_| ()).ok_or(Error::TxnFinished)
	}

	fn abort_nested(&mut self) -> Result<()> {
		match self.savepoints.pop() {
			Some(saved) => {
				self.ws = saved;
				Ok(())
			}
			None => Err(Error::TxnFinished),
		}
	}

	fn as_any(&self) -> &dyn Any {
		self
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

fn mem_txn<'a>(txn: &'a mut StorageTxn) -> Result<&'a mut MemTxn> {
	txn.raw_mut()
		.as_any_mut()
		.downcast_mut::<MemTxn>()
		.ok_or_else(|| Error::UnsupportedValue("transaction belongs to another engine".into()))
}

fn mem_txn_ref<'a>(txn: &'a StorageTxn) -> Option<&'a MemTxn> {
	txn.raw().as_any().downcast_ref::<MemTxn>()
}

/// Read through the transaction's overlay, then the base tree.
fn view_get(inner: &Arc<MemInner>, db: &str, key: &[u8], txn: &StorageTxn) -> Result<Option<Val>> {
	if let Some(mem) = mem_txn_ref(txn) {
		if let Some(changes) = mem.ws.get(db) {
			if let Some(change) = changes.get(key) {
				return Ok(change.clone());
			}
		}
	}
	let tree = inner.tree(db);
	let tree = tree.tree.read();
	Ok(tree.get(key).cloned())
}

/// Write into the transaction's overlay.
fn view_set(db: &str, key: Key, val: Option<Val>, txn: &mut StorageTxn) -> Result<()> {
	if !txn.is_write() {
		return Err(Error::TxnReadonly);
	}
	let mem = mem_txn(txn)?;
	mem.ws.entry(db.to_string()).or_default().insert(key, val);
	Ok(())
}

/// Materialize the merged view of a sub-database for cursors and scans.
fn view_rows(inner: &Arc<MemInner>, db: &str, txn: &StorageTxn) -> Vec<(Key, Val)> {
	let tree = inner.tree(db);
	let mut merged = tree.tree.read().clone();
	if let Some(mem) = mem_txn_ref(txn) {
		if let Some(changes) = mem.ws.get(db) {
			for (key, val) in changes {
				match val {
					Some(val) => {
						merged.insert(key.clone(), val.clone());
					}
					None => {
						merged.remove(key);
					}
				}
			}
		}
	}
	merged.into_iter().collect()
}

fn decode_i64(val: &[u8]) -> Result<i64> {
	let bytes: [u8; 8] = val.try_into().map_err(|_| Error::CorruptHeader)?;
	Ok(i64::from_le_bytes(bytes))
}

pub struct MemDatabase {
	inner: Arc<MemInner>,
	name: String,
}

impl StorageDatabase for MemDatabase {
	fn name(&self) -> &str {
		&self.name
	}

	fn get(&self, _shard: ShardId, id: &[u8], txn: &mut StorageTxn, _for_update: bool) -> Result<Option<StorageEntry>> {
		Ok(view_get(&self.inner, &self.name, id, txn)?.map(|data| StorageEntry {
			id: id.to_vec(),
			data,
		}))
	}

	fn insert(&self, _shard: ShardId, id: &[u8], val: &[u8], txn: &mut StorageTxn) -> Result<()> {
		view_set(&self.name, id.to_vec(), Some(val.to_vec()), txn)
	}

	fn update(&self, _shard: ShardId, id: &[u8], val: &[u8], txn: &mut StorageTxn) -> Result<()> {
		view_set(&self.name, id.to_vec(), Some(val.to_vec()), txn)
	}

	fn del(&self, _shard: ShardId, id: &[u8], txn: &mut StorageTxn) -> Result<bool> {
		let found = view_get(&self.inner, &self.name, id, txn)?.is_some();
		if found {
			view_set(&self.name, id.to_vec(), None, txn)?;
		}
		Ok(found)
	}

	fn set_raw(&self, key: &[u8], val: &[u8], txn: &mut StorageTxn) -> Result<()> {
		view_set(&self.name, key.to_vec(), Some(val.to_vec()), txn)
	}

	fn get_raw(&self, key: &[u8], txn: &mut StorageTxn) -> Result<Option<Val>> {
		view_get(&self.inner, &self.name, key, txn)
	}

	fn del_raw(&self, key: &[u8], txn: &mut StorageTxn) -> Result<bool> {
		let found = view_get(&self.inner, &self.name, key, txn)?.is_some();
		if found {
			view_set(&self.name, key.to_vec(), None, txn)?;
		}
		Ok(found)
	}

	fn cursor(&self, txn: &mut StorageTxn) -> Result<Box<dyn Cursor>> {
		Ok(Box::new(MemCursor {
			name: self.name.clone(),
			rows: view_rows(&self.inner, &self.name, txn),
			pos: None,
		}))
	}

	fn stats(&self, txn: &mut StorageTxn) -> Result<(u64, u64)> {
		let rows = view_rows(&self.inner, &self.name, txn);
		let size = rows.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
		Ok((rows.len() as u64, size))
	}

	fn drop_db(&self, txn: &mut StorageTxn) -> Result<()> {
		for (key, _) in view_rows(&self.inner, &self.name, txn) {
			view_set(&self.name, key, None, txn)?;
		}
		Ok(())
	}
}

pub struct MemIndexDb {
	inner: Arc<MemInner>,
	name: String,
}

impl StorageIndex for MemIndexDb {
	fn name(&self) -> &str {
		&self.name
	}

	fn insert(&self, _shard: ShardId, key: &[u8], txn: &mut StorageTxn) -> Result<()> {
		view_set(&self.name, key.to_vec(), Some(Vec::new()), txn)
	}

	fn del(&self, _shard: ShardId, key: &[u8], txn: &mut StorageTxn) -> Result<bool> {
		let found = view_get(&self.inner, &self.name, key, txn)?.is_some();
		if found {
			view_set(&self.name, key.to_vec(), None, txn)?;
		}
		Ok(found)
	}

	fn del_prefix(&self, prefix: &[u8], txn: &mut StorageTxn) -> Result<u64> {
		let doomed: Vec<Key> = view_rows(&self.inner, &self.name, txn)
			.into_iter()
			.map(|(k, _)| k)
			.filter(|k| k.starts_with(prefix))
			.collect();
		let count = doomed.len() as u64;
		for key in doomed {
			view_set(&self.name, key, None, txn)?;
		}
		Ok(count)
	}

	fn cursor(&self, txn: &mut StorageTxn) -> Result<Box<dyn Cursor>> {
		Ok(Box::new(MemCursor {
			name: self.name.clone(),
			rows: view_rows(&self.inner, &self.name, txn),
			pos: None,
		}))
	}

	fn stats(&self, prefix: &[u8], txn: &mut StorageTxn) -> Result<(u64, u64)> {
		let rows = view_rows(&self.inner, &self.name, txn);
		let mut count = 0u64;
		let mut size = 0u64;
		for (key, val) in rows {
			if key.starts_with(prefix) {
				count += 1;
				size += (key.len() + val.len()) as u64;
			}
		}
		Ok((count, size))
	}
}

pub struct MemCursor {
	name: String,
	rows: Vec<(Key, Val)>,
	pos: Option<usize>,
}

impl MemCursor {
	fn at(&self, pos: usize) -> Option<(Key, Val)> {
		self.rows.get(pos).cloned()
	}
}

impl Cursor for MemCursor {
	fn seek(&mut self, key: &[u8]) -> Result<Option<(Key, Val)>> {
		let pos = self.rows.partition_point(|(k, _)| k.as_slice() < key);
		self.pos = (pos < self.rows.len()).then_some(pos);
		Ok(self.pos.and_then(|p| self.at(p)))
	}

	fn seek_back(&mut self, key: &[u8]) -> Result<Option<(Key, Val)>> {
		let pos = self.rows.partition_point(|(k, _)| k.as_slice() <= key);
		self.pos = pos.checked_sub(1);
		Ok(self.pos.and_then(|p| self.at(p)))
	}

	fn first(&mut self) -> Result<Option<(Key, Val)>> {
		self.pos = (!self.rows.is_empty()).then_some(0);
		Ok(self.pos.and_then(|p| self.at(p)))
	}

	fn last(&mut self) -> Result<Option<(Key, Val)>> {
		self.pos = self.rows.len().checked_sub(1);
		Ok(self.pos.and_then(|p| self.at(p)))
	}

	fn next(&mut self) -> Result<Option<(Key, Val)>> {
		match self.pos {
			Some(pos) if pos + 1 < self.rows.len() => {
				self.pos = Some(pos + 1);
				Ok(self.at(pos + 1))
			}
			_ => {
				self.pos = None;
				Ok(None)
			}
		}
	}

	fn prev(&mut self) -> Result<Option<(Key, Val)>> {
		match self.pos {
			Some(pos) => {
				self.pos = pos.checked_sub(1);
				Ok(self.pos.and_then(|p| self.at(p)))
			}
			None => Ok(None),
		}
	}

	fn current(&self) -> Option<(Key, Val)> {
		self.pos.and_then(|p| self.at(p))
	}

	fn del_current(&mut self, txn: &mut StorageTxn) -> Result<()> {
		match self.current() {
			Some((key, _)) => view_set(&self.name, key, None, txn),
			None => Err(Error::ObjectNotFound("cursor not positioned".into())),
		}
	}
}

pub struct MemSeq {
	inner: Arc<MemInner>,
	key: Key,
	next: AtomicI64,
	allocated: AtomicI64,
	refill: Mutex<()>,
}

impl MemSeq {
	fn store(&self, next: i64, txn: &mut StorageTxn) -> Result<()> {
		view_set(SEQS_DB, self.key.clone(), Some(next.to_le_bytes().to_vec()), txn)?;
		self.allocated.store(next, Relaxed);
		Ok(())
	}
}

impl StorageSeq for MemSeq {
	fn next(&self, txn: &mut StorageTxn) -> Result<i64> {
		// only atomicity of the increment is required here
		let val = self.next.fetch_add(1, Relaxed);
		if val >= self.allocated.load(Relaxed) {
			// everyone who drew from an unallocated range queues here
			let _guard = self.refill.lock();
			// re-read under the lock before allocating another page
			if val >= self.allocated.load(Relaxed) {
				self.store(val + cnf::SEQUENCE_PAGE_SIZE, txn)?;
			}
		}
		Ok(val)
	}

	fn close(&self, txn: &mut StorageTxn) -> Result<()> {
		let next = self.next.load(Relaxed);
		self.store(next, txn)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn new_engine() -> MemEngine {
		let engine = MemEngine::new();
		engine.open(Path::new("/tmp/mojodb-mem-test")).unwrap();
		engine
	}

	#[test]
	fn raw_round_trip() {
		let engine = new_engine();
		let mut txn = engine.begin(true).unwrap();
		let db = engine.open_database("objects.db", &mut txn).unwrap();
		db.set_raw(b"test", b"ok", &mut txn).unwrap();
		// uncommitted writes are visible inside the transaction
		assert_eq!(db.get_raw(b"test", &mut txn).unwrap().as_deref(), Some(&b"ok"[..]));
		txn.commit().unwrap();
		// and outside after commit
		let mut txn = engine.begin(false).unwrap();
		assert_eq!(db.get_raw(b"test", &mut txn).unwrap().as_deref(), Some(&b"ok"[..]));
		assert!(db.get_raw(b"none", &mut txn).unwrap().is_none());
	}

	#[test]
	fn abort_discards_writes() {
		let engine = new_engine();
		let mut txn = engine.begin(true).unwrap();
		let db = engine.open_database("objects.db", &mut txn).unwrap();
		db.set_raw(b"gone", b"soon", &mut txn).unwrap();
		txn.abort().unwrap();
		let mut txn = engine.begin(false).unwrap();
		assert!(db.get_raw(b"gone", &mut txn).unwrap().is_none());
	}

	#[test]
	fn drop_without_commit_aborts() {
		let engine = new_engine();
		let db = {
			let mut txn = engine.begin(true).unwrap();
			let db = engine.open_database("objects.db", &mut txn).unwrap();
			db.set_raw(b"gone", b"soon", &mut txn).unwrap();
			db
			// txn dropped here
		};
		let mut txn = engine.begin(false).unwrap();
		assert!(db.get_raw(b"gone", &mut txn).unwrap().is_none());
	}

	#[test]
	fn nested_txn_commits_into_parent() {
		let engine = new_engine();
		let mut txn = engine.begin(true).unwrap();
		let db = engine.open_database("objects.db", &mut txn).unwrap();
		db.set_raw(b"a", b"1", &mut txn).unwrap();
		txn.begin_nested().unwrap();
		db.set_raw(b"b", b"2", &mut txn).unwrap();
		txn.commit_nested().unwrap();
		txn.begin_nested().unwrap();
		db.set_raw(b"c", b"3", &mut txn).unwrap();
		txn.abort_nested().unwrap();
		txn.commit().unwrap();
		let mut txn = engine.begin(false).unwrap();
		assert!(db.get_raw(b"a", &mut txn).unwrap().is_some());
		assert!(db.get_raw(b"b", &mut txn).unwrap().is_some());
		assert!(db.get_raw(b"c", &mut txn).unwrap().is_none());
	}

	#[test]
	fn readonly_rejects_writes() {
		let engine = new_engine();
		let mut txn = engine.begin(false).unwrap();
		let db = engine.open_database("objects.db", &mut txn).unwrap();
		assert!(matches!(db.set_raw(b"k", b"v", &mut txn), Err(Error::TxnReadonly)));
	}

	#[test]
	fn second_writer_deadlocks() {
		let engine = new_engine();
		let _txn = engine.begin(true).unwrap();
		assert!(matches!(engine.begin(true), Err(Error::Deadlock)));
	}

	#[test]
	fn cursor_walks_in_order() {
		let engine = new_engine();
		let mut txn = engine.begin(true).unwrap();
		let db = engine.open_database("objects.db", &mut txn).unwrap();
		for key in [b"b".to_vec(), b"a".to_vec(), b"d".to_vec(), b"c".to_vec()] {
			db.set_raw(&key, b"", &mut txn).unwrap();
		}
		let mut cursor = db.cursor(&mut txn).unwrap();
		let (k, _) = cursor.first().unwrap().unwrap();
		assert_eq!(k, b"a");
		let (k, _) = cursor.next().unwrap().unwrap();
		assert_eq!(k, b"b");
		let (k, _) = cursor.seek(b"c").unwrap().unwrap();
		assert_eq!(k, b"c");
		let (k, _) = cursor.seek(b"cc").unwrap().unwrap();
		assert_eq!(k, b"d");
		let (k, _) = cursor.last().unwrap().unwrap();
		assert_eq!(k, b"d");
		assert!(cursor.next().unwrap().is_none());
		let (k, _) = cursor.seek_back(b"bb").unwrap().unwrap();
		assert_eq!(k, b"b");
		txn.abort().unwrap();
	}

	#[test]
	fn sequence_allocates_pages() {
		let engine = new_engine();
		let mut txn = engine.begin(true).unwrap();
		let seq = engine.open_sequence("rev", &mut txn).unwrap();
		for expect in 0..250 {
			assert_eq!(seq.next(&mut txn).unwrap(), expect);
		}
		txn.commit().unwrap();
		// values keep rising monotonically in a later transaction
		let mut txn = engine.begin(true).unwrap();
		let seq = engine.open_sequence("rev", &mut txn).unwrap();
		assert_eq!(seq.next(&mut txn).unwrap(), 250);
		txn.commit().unwrap();
	}

	#[test]
	fn configure_accepts_anything() {
		let engine = new_engine();
		engine.configure(&json!({"unused": true})).unwrap();
	}
}
