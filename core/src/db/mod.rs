//! The database facade: the top-level operations a service handler
//! drives, with request objects carrying caller identity, schema-lock
//! mode and batch state.
//!
//! Control flow for a mutation: begin request, begin or nest the
//! transaction, locate the kind, apply the index diff next to the
//! primary write, reconcile the token set, offset quotas, commit
//! (pre-commit signals, quota apply, engine commit, post-commit
//! signals, monitors), then watcher fan-out.

mod admin;
pub mod idgen;
mod perm;
mod quota;
mod req;
pub mod service;

pub use self::perm::PermissionEngine;
pub use self::quota::QuotaEngine;
pub use self::req::DbReq;
pub use self::req::ADMIN_CALLER;

use self::idgen::IdGenerator;
use self::req::SchemaGuard;
use crate::cnf;
use crate::err::Error;
use crate::err::Result;
use crate::kind::DbOp;
use crate::kind::Kind;
use crate::kind::KindEngine;
use crate::kvs;
use crate::kvs::ShardId;
use crate::kvs::StorageDatabase;
use crate::kvs::StorageEngine;
use crate::kvs::StorageSeq;
use crate::kvs::MAIN_SHARD;
use crate::obj;
use crate::query::aggregate::run_aggregate;
use crate::query::cursor::run_find;
use crate::query::plan::build_plan;
use crate::query::search::run_search;
use crate::query::FindResult;
use crate::query::Query;
use crate::shard::ShardEngine;
use crate::watch::WatchEngine;
use crate::watch::WatchHandle;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde_json::json;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// The id of the single database-state row.
const DB_STATE_DOC_ID: &str = "_state/db";

pub struct Db {
	engine: Arc<dyn StorageEngine>,
	obj_db: OnceCell<Arc<dyn StorageDatabase>>,
	rev_seq: OnceCell<Arc<dyn StorageSeq>>,
	id_gen: IdGenerator,
	kind_engine: Arc<KindEngine>,
	shard_engine: Arc<ShardEngine>,
	watch_engine: Arc<WatchEngine>,
	quota_engine: Arc<QuotaEngine>,
	perm_engine: Arc<PermissionEngine>,
	schema_lock: Arc<RwLock<()>>,
	compact_lock: Mutex<()>,
	open: AtomicBool,
	path: RwLock<Option<PathBuf>>,
	purge_window: AtomicI64,
	enable_purge: AtomicBool,
	database_id: RwLock<String>,
}

impl Db {
	/// Open (creating if necessary) a database at a path, using the
	/// engine named by the configuration, `MOJODB_ENGINE`, or the sole
	/// registered default.
	pub fn open(path: &Path, conf: &Value) -> Result<Db> {
		let engine = kvs::create_engine(conf.get("engine").and_then(Value::as_str))?;
		Self::open_with_engine(path, engine, conf)
	}

	/// Open on an explicitly supplied engine.
	pub fn open_with_engine(path: &Path, engine: Arc<dyn StorageEngine>, conf: &Value) -> Result<Db> {
		let db = Db {
			engine,
			obj_db: OnceCell::new(),
			rev_seq: OnceCell::new(),
			id_gen: IdGenerator::new(),
			kind_engine: Arc::new(KindEngine::new()),
			shard_engine: Arc::new(ShardEngine::new()),
			watch_engine: Arc::new(WatchEngine::new()),
			quota_engine: Arc::new(QuotaEngine::new()),
			perm_engine: Arc::new(PermissionEngine::new()),
			schema_lock: Arc::new(RwLock::new(())),
			compact_lock: Mutex::new(()),
			open: AtomicBool::new(false),
			path: RwLock::new(None),
			purge_window: AtomicI64::new(cnf::PURGE_WINDOW_DAYS),
			enable_purge: AtomicBool::new(true),
			database_id: RwLock::new(String::new()),
		};
		db.open_impl(path, conf)?;
		Ok(db)
	}

	fn open_impl(&self, path: &Path, conf: &Value) -> Result<()> {
		std::fs::create_dir_all(path)?;
		self.check_version(path)?;
		self.acquire_lock(path)?;
		*self.path.write() = Some(path.to_path_buf());
		if let Some(window) = conf.get("purge_window_days").and_then(Value::as_i64) {
			self.purge_window.store(window, Relaxed);
		}
		if let Some(enable) = conf.get("enable_purge").and_then(Value::as_bool) {
			self.enable_purge.store(enable, Relaxed);
		}
		let enable_root = conf.get("enable_root_kind").and_then(Value::as_bool).unwrap_or(false);

		self.engine.configure(conf)?;
		self.engine.open(path)?;
		self.open.store(true, Relaxed);

		let mut txn = self.engine.begin(true)?;
		let obj_db = self.engine.open_database(cnf::OBJECTS_DB_NAME, &mut txn)?;
		let _ = self.obj_db.set(obj_db.clone());
		let _ = self.rev_seq.set(self.engine.open_sequence(cnf::REV_SEQ_NAME, &mut txn)?);
		self.quota_engine.open(&self.engine, &mut txn)?;
		self.kind_engine.open(&self.engine, obj_db, "en_US", enable_root, &mut txn)?;

		// run the remaining bootstrap through a normal elevated request
		let mut req = DbReq::admin();
		req.txn = Some(txn);
		req.depth = 1;
		let booted = self.bootstrap(conf, &mut req);
		match booted {
			Ok(()) => self.end_req(&mut req)?,
			Err(e) => {
				self.fail_req(&mut req);
				self.open.store(false, Relaxed);
				return Err(e);
			}
		}
		info!(path = %path.display(), engine = self.engine.name(), "database open");
		Ok(())
	}

	fn bootstrap(&self, conf: &Value, req: &mut DbReq) -> Result<()> {
		// the stored locale wins over the boot default; entries on disk
		// were built under it
		if let Some(locale) = self.get_state("locale", req)?.and_then(|v| v.as_str().map(str::to_string)) {
			self.kind_engine.adopt_locale(&locale);
		}
		match self.get_state("databaseId", req)? {
			Some(Value::String(id)) => *self.database_id.write() = id,
			_ => {
				let id = self.id_gen.id(MAIN_SHARD);
				self.update_state("databaseId", json!(id), req)?;
				*self.database_id.write() = id;
			}
		}
		// persisted policy records hydrate their engines
		let perms = self.find_impl(&Query::new(crate::kind::engine::PERMISSION_ID), req)?;
		for doc in &perms.results {
			if let Err(e) = self.perm_engine.put(doc) {
				warn!(error = %e, "skipping bad permission record");
			}
		}
		let quotas = self.find_impl(&Query::new(crate::kind::engine::QUOTA_ID), req)?;
		for doc in &quotas.results {
			if let Err(e) = self.quota_engine.put_quota(doc) {
				warn!(error = %e, "skipping bad quota record");
			}
		}
		self.shard_engine.init(self, conf, req)?;
		Ok(())
	}

	fn check_version(&self, path: &Path) -> Result<()> {
		let file = path.join(cnf::VERSION_FILE_NAME);
		match std::fs::read_to_string(&file) {
			Ok(text) => {
				let found: i64 = text.trim().parse().unwrap_or(0);
				if found != cnf::DATABASE_VERSION {
					return Err(Error::DbVersionMismatch {
						found,
						expected: cnf::DATABASE_VERSION,
					});
				}
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				std::fs::write(&file, format!("{}\n", cnf::DATABASE_VERSION))?;
				Ok(())
			}
			Err(e) => Err(e.into()),
		}
	}

	fn acquire_lock(&self, path: &Path) -> Result<()> {
		let file = path.join(cnf::LOCK_FILE_NAME);
		if let Ok(text) = std::fs::read_to_string(&file) {
			let holder: u32 = text.trim().parse().unwrap_or(0);
			if holder != std::process::id() {
				return Err(Error::PathLocked(path.display().to_string()));
			}
		}
		std::fs::write(&file, format!("{}\n", std::process::id()))?;
		Ok(())
	}

	fn release_lock(&self) {
		if let Some(path) = self.path.read().as_ref() {
			let _ = std::fs::remove_file(path.join(cnf::LOCK_FILE_NAME));
		}
	}

	pub fn close(&self) -> Result<()> {
		if !self.is_open() {
			return Ok(());
		}
		// settle the revision cursor so a reopen wastes no page
		if let (Some(seq), Ok(mut txn)) = (self.rev_seq.get(), self.engine.begin(true)) {
			if seq.close(&mut txn).is_ok() {
				let _ = txn.commit();
			}
		}
		self.open.store(false, Relaxed);
		self.engine.close()?;
		self.release_lock();
		Ok(())
	}

	pub fn is_open(&self) -> bool {
		self.open.load(Relaxed)
	}

	fn require_open(&self) -> Result<()> {
		if !self.is_open() {
			return Err(Error::DbNotOpen);
		}
		Ok(())
	}

	pub fn version(&self) -> i64 {
		cnf::DATABASE_VERSION
	}

	pub fn database_id(&self) -> String {
		self.database_id.read().clone()
	}

	pub fn engine(&self) -> &Arc<dyn StorageEngine> {
		&self.engine
	}

	pub fn kind_engine(&self) -> &Arc<KindEngine> {
		&self.kind_engine
	}

	pub fn shard_engine(&self) -> &Arc<ShardEngine> {
		&self.shard_engine
	}

	pub fn watch_engine(&self) -> &Arc<WatchEngine> {
		&self.watch_engine
	}

	pub fn quota_engine(&self) -> &Arc<QuotaEngine> {
		&self.quota_engine
	}

	pub fn permission_engine(&self) -> &Arc<PermissionEngine> {
		&self.perm_engine
	}

	pub fn purge_window(&self) -> i64 {
		self.purge_window.load(Relaxed)
	}

	fn obj_db(&self) -> Result<&Arc<dyn StorageDatabase>> {
		self.obj_db.get().ok_or(Error::DbNotOpen)
	}

	fn rev_seq(&self) -> Result<&Arc<dyn StorageSeq>> {
		self.rev_seq.get().ok_or(Error::DbNotOpen)
	}

	// ------------------------------------------------------------------
	// request scaffolding

	fn begin_req(&self, req: &mut DbReq, write: bool, schema_write: bool) -> Result<()> {
		self.require_open()?;
		if req.schema_guard.is_none() {
			req.schema_guard = Some(if schema_write {
				SchemaGuard::Write(self.schema_lock.write_arc())
			} else {
				SchemaGuard::Read(self.schema_lock.read_arc())
			});
		}
		if req.txn.is_none() {
			let mut txn = self.engine.begin(write)?;
			if write {
				let quota = self.quota_engine.clone();
				txn.notify_pre_commit(Box::new(move |txn| quota.apply(txn)));
			}
			req.txn = Some(txn);
		} else if write && !req.txn.as_ref().map(|t| t.is_write()).unwrap_or(false) {
			return Err(Error::TxnReadonly);
		}
		req.depth += 1;
		Ok(())
	}

	fn end_req(&self, req: &mut DbReq) -> Result<()> {
		req.depth = req.depth.saturating_sub(1);
		if req.depth > 0 {
			return Ok(());
		}
		req.reset_batch();
		let result = match req.txn.take() {
			Some(mut txn) if txn.is_write() => {
				let flushed = self.kind_engine.flush_tokens(&mut txn);
				match flushed {
					Ok(()) => {
						let events = txn.take_watch_events();
						txn.commit()?;
						self.watch_engine.dispatch(&events);
						Ok(())
					}
					Err(e) => {
						let _ = txn.abort();
						Err(e)
					}
				}
			}
			Some(mut txn) => {
				let _ = txn.abort();
				Ok(())
			}
			None => Ok(()),
		};
		req.schema_guard = None;
		result
	}

	fn fail_req(&self, req: &mut DbReq) {
		req.depth = req.depth.saturating_sub(1);
		if req.depth > 0 {
			return;
		}
		if let Some(mut txn) = req.txn.take() {
			let _ = txn.abort();
		}
		req.schema_guard = None;
		req.reset_batch();
	}

	fn with_req<T>(
		&self,
		req: &mut DbReq,
		write: bool,
		schema_write: bool,
		f: impl FnOnce(&Self, &mut DbReq) -> Result<T>,
	) -> Result<T> {
		self.begin_req(req, write, schema_write)?;
		match f(self, req) {
			Ok(out) => {
				self.end_req(req)?;
				Ok(out)
			}
			Err(e) => {
				self.fail_req(req);
				Err(e)
			}
		}
	}

	/// Mid-batch checkpoint: commit the running transaction and open a
	/// fresh one so batches cannot grow transactions without bound.
	fn checkpoint(&self, req: &mut DbReq) -> Result<()> {
		if let Some(mut txn) = req.txn.take() {
			self.kind_engine.flush_tokens(&mut txn)?;
			let events = txn.take_watch_events();
			txn.commit()?;
			self.watch_engine.dispatch(&events);
		}
		let mut txn = self.engine.begin(true)?;
		let quota = self.quota_engine.clone();
		txn.notify_pre_commit(Box::new(move |txn| quota.apply(txn)));
		req.txn = Some(txn);
		req.reset_batch();
		Ok(())
	}

	// ------------------------------------------------------------------
	// object operations

	/// Store one document, allocating an id when absent.
	pub fn put(&self, doc: Value, req: &mut DbReq) -> Result<(String, i64)> {
		self.with_req(req, true, false, |db, req| db.put_impl(doc, false, MAIN_SHARD, req))
	}

	/// Store one document with fresh ids allocated under a shard.
	pub fn put_with_shard(&self, doc: Value, shard: ShardId, req: &mut DbReq) -> Result<(String, i64)> {
		self.with_req(req, true, false, |db, req| db.put_impl(doc, false, shard, req))
	}

	/// Store a batch; results are per item, failures included.
	pub fn put_many(&self, docs: Vec<Value>, shard: ShardId, req: &mut DbReq) -> Result<Vec<Result<(String, i64)>>> {
		self.with_req(req, true, false, |db, req| {
			let mut out = Vec::with_capacity(docs.len());
			for doc in docs {
				out.push(db.put_impl(doc, false, shard, req));
				if req.autobatch() && req.bump_batch() >= cnf::AUTO_BATCH_SIZE {
					db.checkpoint(req)?;
				}
			}
			Ok(out)
		})
	}

	/// Recursive merge into an existing document; insert when absent.
	pub fn merge(&self, doc: Value, req: &mut DbReq) -> Result<(String, i64)> {
		self.with_req(req, true, false, |db, req| db.put_impl(doc, true, MAIN_SHARD, req))
	}

	/// Merge the same properties into everything a query matches.
	pub fn merge_query(&self, query: &Query, props: &Value, req: &mut DbReq) -> Result<u32> {
		self.with_req(req, true, false, |db, req| {
			let found = db.find_impl(query, req)?;
			let mut count = 0;
			for doc in found.results {
				let mut item = props.clone();
				let map = item.as_object_mut().ok_or_else(|| {
					Error::UnsupportedValue("merge properties must be an object".into())
				})?;
				map.insert(obj::ID_KEY.into(), doc[obj::ID_KEY].clone());
				map.insert(obj::KIND_KEY.into(), doc[obj::KIND_KEY].clone());
				map.remove(obj::REV_KEY);
				db.put_impl(item, true, MAIN_SHARD, req)?;
				count += 1;
			}
			Ok(count)
		})
	}

	/// Fetch one document by id.
	pub fn get(&self, id: &str, req: &mut DbReq) -> Result<Option<Value>> {
		self.with_req(req, false, false, |db, req| db.get_impl(id, req))
	}

	pub fn get_many(&self, ids: &[String], req: &mut DbReq) -> Result<Vec<Value>> {
		self.with_req(req, false, false, |db, req| {
			let mut out = Vec::with_capacity(ids.len());
			for id in ids {
				if let Some(doc) = db.get_impl(id, req)? {
					out.push(doc);
				}
			}
			Ok(out)
		})
	}

	/// Delete by id: a tombstone normally, physical removal on purge.
	pub fn del(&self, id: &str, purge: bool, req: &mut DbReq) -> Result<bool> {
		self.with_req(req, true, false, |db, req| db.del_impl(id, purge, req))
	}

	pub fn del_many(&self, ids: &[String], purge: bool, req: &mut DbReq) -> Result<Vec<Result<(String, bool)>>> {
		self.with_req(req, true, false, |db, req| {
			let mut out = Vec::with_capacity(ids.len());
			for id in ids {
				out.push(db.del_impl(id, purge, req).map(|found| (id.clone(), found)));
				if req.autobatch() && req.bump_batch() >= cnf::AUTO_BATCH_SIZE {
					db.checkpoint(req)?;
				}
			}
			Ok(out)
		})
	}

	/// Delete everything a query matches.
	pub fn del_query(&self, query: &Query, purge: bool, req: &mut DbReq) -> Result<u32> {
		self.with_req(req, true, false, |db, req| {
			let found = db.find_impl(query, req)?;
			let mut count = 0;
			for doc in found.results {
				if let Some(id) = obj::id_of(&doc).map(str::to_string) {
					if db.del_impl(&id, purge, req)? {
						count += 1;
					}
				}
			}
			Ok(count)
		})
	}

	/// Run a query.
	pub fn find(&self, query: &Query, req: &mut DbReq) -> Result<FindResult> {
		self.with_req(req, false, false, |db, req| db.find_impl(query, req))
	}

	/// Run a query and arm a one-shot watch over its range.
	pub fn find_watch(&self, query: &Query, req: &mut DbReq) -> Result<(FindResult, WatchHandle)> {
		self.with_req(req, false, false, |db, req| {
			let kind = db.kind_engine.get_kind(&query.from)?;
			db.perm_engine.check(&kind, DbOp::Read, req)?;
			let (plan, _) = db.plan_for_watch(query, &kind)?;
			let handle = db.watch_engine.arm(&plan);
			let found = db.find_impl(query, req)?;
			Ok((found, handle))
		})
	}

	/// Arm a watch; fires immediately instead when the query already
	/// has results.
	pub fn watch(&self, query: &Query, req: &mut DbReq) -> Result<(bool, Option<WatchHandle>)> {
		self.with_req(req, false, false, |db, req| {
			let kind = db.kind_engine.get_kind(&query.from)?;
			db.perm_engine.check(&kind, DbOp::Read, req)?;
			let (plan, _) = db.plan_for_watch(query, &kind)?;
			let handle = db.watch_engine.arm(&plan);
			let found = db.find_impl(query, req)?;
			if found.count > 0 {
				handle.cancel();
				return Ok((true, None));
			}
			Ok((false, Some(handle)))
		})
	}

	/// Pre-allocate ids for callers that assemble objects client-side.
	pub fn reserve_ids(&self, count: u32) -> Result<Vec<String>> {
		self.require_open()?;
		Ok((0..count).map(|_| self.id_gen.id(MAIN_SHARD)).collect())
	}

	// ------------------------------------------------------------------
	// schema operations

	/// Register or update a kind.
	pub fn put_kind(&self, decl: Value, req: &mut DbReq) -> Result<()> {
		self.begin_req(req, true, true)?;
		let result = (|| -> Result<()> {
			let id = decl
				.get("id")
				.and_then(Value::as_str)
				.ok_or_else(|| Error::RequiredPropNotFound("id".into()))?
				.to_string();
			if !req.is_admin() {
				let owner = decl.get("owner").and_then(Value::as_str).unwrap_or_default();
				if owner != req.caller() {
					return Err(Error::PermissionDenied {
						caller: req.caller().to_string(),
						op: DbOp::KindUpdate.as_str().to_string(),
						object: id.clone(),
					});
				}
			}
			self.kind_engine.put_kind(&decl, false, req.txn_mut()?)?;
			// the kind document itself lives in the store, which is
			// what makes kinds reloadable
			let mut doc = decl;
			doc[obj::KIND_KEY] = json!(crate::kind::engine::KIND_KIND_ID);
			doc[obj::ID_KEY] = json!(format!("{}{}", crate::kind::engine::KIND_ID_PREFIX, id));
			doc.as_object_mut().map(|m| m.remove(obj::REV_KEY));
			let was = req.set_admin(true);
			let stored = self.put_impl(doc, false, MAIN_SHARD, req);
			let hashed = stored.and_then(|_| self.shard_engine.put_kind_hash(self, &id, req));
			req.set_admin(was);
			hashed
		})();
		match result {
			Ok(()) => self.end_req(req),
			Err(e) => {
				self.fail_req(req);
				// the registry may hold half-applied state now
				if let Err(reload) = self.reload_kinds() {
					error!(error = %reload, "kind reload after failed putKind");
				}
				Err(e)
			}
		}
	}

	/// Install a built-in kind; not persisted, present every boot.
	pub fn put_builtin_kind(&self, decl_json: &str, req: &mut DbReq) -> Result<()> {
		let decl: Value = serde_json::from_str(decl_json)?;
		self.with_req(req, true, false, |db, req| {
			db.kind_engine.put_kind(&decl, true, req.txn_mut()?)?;
			Ok(())
		})
	}

	/// Delete a kind, all of its rows and indexes.
	pub fn del_kind(&self, id: &str, req: &mut DbReq) -> Result<bool> {
		self.begin_req(req, true, true)?;
		let result = (|| -> Result<bool> {
			if !self.kind_engine.has_kind(id) {
				return Ok(false);
			}
			let kind = self.kind_engine.get_kind(id)?;
			self.perm_engine.check(&kind, DbOp::KindUpdate, req)?;
			self.kind_engine.del_kind(id, req.txn_mut()?)?;
			let doc_id = format!("{}{}", crate::kind::engine::KIND_ID_PREFIX, id);
			let was = req.set_admin(true);
			let removed = self.del_impl(&doc_id, true, req);
			req.set_admin(was);
			removed?;
			Ok(true)
		})();
		match result {
			Ok(found) => {
				self.end_req(req)?;
				Ok(found)
			}
			Err(e) => {
				self.fail_req(req);
				Err(e)
			}
		}
	}

	/// Delete a kind and every kind extending it, leaves first.
	pub fn recursive_del_kind(&self, id: &str, req: &mut DbReq) -> Result<bool> {
		self.begin_req(req, true, true)?;
		let result = (|| -> Result<bool> {
			if !self.kind_engine.has_kind(id) {
				return Ok(false);
			}
			let subs = self.kind_engine.get_kind(id)?.subs();
			for sub in subs {
				self.recursive_del_kind(&sub, req)?;
			}
			self.del_kind(id, req)
		})();
		match result {
			Ok(found) => {
				self.end_req(req)?;
				Ok(found)
			}
			Err(e) => {
				self.fail_req(req);
				Err(e)
			}
		}
	}

	/// Switch the database locale, re-collating every affected index.
	pub fn update_locale(&self, locale: &str, req: &mut DbReq) -> Result<()> {
		self.begin_req(req, true, true)?;
		let result = (|| -> Result<()> {
			let current = self
				.get_state("locale", req)?
				.and_then(|v| v.as_str().map(str::to_string))
				.unwrap_or_else(|| "en_US".to_string());
			if current == locale {
				return Ok(());
			}
			self.kind_engine.update_locale(locale, req.txn_mut()?)?;
			self.update_state("locale", json!(locale), req)
		})();
		match result {
			Ok(()) => self.end_req(req),
			Err(e) => {
				self.fail_req(req);
				// recover the registry from disk, as the entries on
				// disk still reflect the old locale
				if let Err(reload) = self.reload_kinds() {
					error!(error = %reload, "kind reload after failed locale update");
				}
				Err(e)
			}
		}
	}

	pub fn get_locale(&self, req: &mut DbReq) -> Result<String> {
		self.with_req(req, false, false, |db, req| {
			Ok(db
				.get_state("locale", req)?
				.and_then(|v| v.as_str().map(str::to_string))
				.unwrap_or_else(|| "en_US".to_string()))
		})
	}

	fn reload_kinds(&self) -> Result<()> {
		let mut txn = self.engine.begin(true)?;
		self.kind_engine.reload(&mut txn)?;
		txn.commit()
	}

	// ------------------------------------------------------------------
	// state row

	pub(crate) fn get_state(&self, key: &str, req: &mut DbReq) -> Result<Option<Value>> {
		let entry = self.obj_db()?.get(MAIN_SHARD, DB_STATE_DOC_ID.as_bytes(), req.txn_mut()?, false)?;
		match entry {
			Some(entry) => {
				let doc = self.kind_engine.decode_entry(&entry)?;
				Ok(doc.get(key).cloned())
			}
			None => Ok(None),
		}
	}

	pub(crate) fn update_state(&self, key: &str, val: Value, req: &mut DbReq) -> Result<()> {
		let entry = self.obj_db()?.get(MAIN_SHARD, DB_STATE_DOC_ID.as_bytes(), req.txn_mut()?, false)?;
		let mut doc = match entry {
			Some(entry) => self.kind_engine.decode_entry(&entry)?,
			None => json!({
				obj::ID_KEY: DB_STATE_DOC_ID,
				obj::KIND_KEY: crate::kind::engine::DB_STATE_ID,
			}),
		};
		doc[key] = val;
		doc.as_object_mut().map(|m| m.remove(obj::REV_KEY));
		let was = req.set_admin(true);
		let stored = self.put_impl(doc, false, MAIN_SHARD, req);
		req.set_admin(was);
		stored.map(|_| ())
	}

	// ------------------------------------------------------------------
	// inner operations, running on an already-begun request

	fn put_impl(&self, doc: Value, merge: bool, shard: ShardId, req: &mut DbReq) -> Result<(String, i64)> {
		if !doc.is_object() {
			return Err(Error::UnsupportedValue("document must be an object".into()));
		}
		let kind = self.kind_engine.kind_for_doc(&doc)?;
		let id = match obj::id_of(&doc) {
			Some(id) => id.to_string(),
			None => self.id_gen.id(shard),
		};
		let id_shard = idgen::shard_of(id.as_bytes());
		let obj_db = self.obj_db()?.clone();
		let old_entry = obj_db.get(id_shard, id.as_bytes(), req.txn_mut()?, true)?;
		let old_doc = old_entry.as_ref().map(|e| self.kind_engine.decode_entry(e)).transpose()?;
		let op = if old_doc.is_some() {
			DbOp::Update
		} else {
			DbOp::Create
		};
		self.perm_engine.check(&kind, op, req)?;
		// optimistic concurrency: a caller-provided revision must match
		if let (Some(expected), Some(old)) = (obj::rev_of(&doc), old_doc.as_ref()) {
			let found = obj::rev_of(old).unwrap_or(0);
			if expected != found && !req.fix_mode() {
				return Err(Error::RevMismatch {
					expected,
					found,
				});
			}
		}
		let mut new_doc = match (&old_doc, merge) {
			(Some(old), true) => {
				let mut merged = old.clone();
				obj::merge_into(&mut merged, &doc);
				merged
			}
			_ => doc,
		};
		let del = obj::is_tombstone(&new_doc);
		let rev = self.rev_seq()?.next(req.txn_mut()?)?;
		{
			let map = new_doc.as_object_mut().expect("checked above");
			map.insert(obj::ID_KEY.into(), json!(id));
			map.insert(obj::REV_KEY.into(), json!(rev));
		}
		self.kind_engine.update(Some(&new_doc), old_doc.as_ref(), op, req.txn_mut()?)?;
		let data = self.kind_engine.encode_doc(&kind, &new_doc, rev, del)?;
		let new_size = (id.len() + data.len()) as i64;
		let old_size = old_entry.as_ref().map(|e| e.size() as i64).unwrap_or(0);
		match old_entry {
			Some(_) => obj_db.update(id_shard, id.as_bytes(), &data, req.txn_mut()?)?,
			None => obj_db.insert(id_shard, id.as_bytes(), &data, req.txn_mut()?)?,
		}
		req.txn_mut()?.offset_quota(kind.owner(), kind.id(), new_size - old_size);
		if id_shard != MAIN_SHARD {
			self.shard_engine.note_kind_written(self, id_shard, kind.id(), req)?;
		}
		Ok((id, rev))
	}

	fn get_impl(&self, id: &str, req: &mut DbReq) -> Result<Option<Value>> {
		let shard = idgen::shard_of(id.as_bytes());
		let entry = self.obj_db()?.get(shard, id.as_bytes(), req.txn_mut()?, false)?;
		let Some(entry) = entry else {
			return Ok(None);
		};
		let doc = self.kind_engine.decode_entry(&entry)?;
		let kind = self.kind_engine.kind_for_doc(&doc)?;
		self.perm_engine.check(&kind, DbOp::Read, req)?;
		Ok(Some(doc))
	}

	fn del_impl(&self, id: &str, purge: bool, req: &mut DbReq) -> Result<bool> {
		let shard = idgen::shard_of(id.as_bytes());
		let obj_db = self.obj_db()?.clone();
		let entry = obj_db.get(shard, id.as_bytes(), req.txn_mut()?, true)?;
		let Some(entry) = entry else {
			return Ok(false);
		};
		let old_doc = self.kind_engine.decode_entry(&entry)?;
		let kind = self.kind_engine.kind_for_doc(&old_doc)?;
		self.perm_engine.check(&kind, DbOp::Delete, req)?;
		if purge {
			self.kind_engine.update(None, Some(&old_doc), DbOp::Delete, req.txn_mut()?)?;
			obj_db.del(shard, id.as_bytes(), req.txn_mut()?)?;
			req.txn_mut()?.offset_quota(kind.owner(), kind.id(), -(entry.size() as i64));
		} else {
			let mut tombstone = old_doc.clone();
			tombstone[obj::DEL_KEY] = json!(true);
			let rev = self.rev_seq()?.next(req.txn_mut()?)?;
			tombstone[obj::REV_KEY] = json!(rev);
			self.kind_engine.update(Some(&tombstone), Some(&old_doc), DbOp::Delete, req.txn_mut()?)?;
			let data = self.kind_engine.encode_doc(&kind, &tombstone, rev, true)?;
			let delta = (id.len() + data.len()) as i64 - entry.size() as i64;
			obj_db.update(shard, id.as_bytes(), &data, req.txn_mut()?)?;
			req.txn_mut()?.offset_quota(kind.owner(), kind.id(), delta);
		}
		Ok(true)
	}

	fn find_impl(&self, query: &Query, req: &mut DbReq) -> Result<FindResult> {
		query.validate()?;
		let kind = self.kind_engine.get_kind(&query.from)?;
		self.perm_engine.check(&kind, DbOp::Read, req)?;
		let active = self.active_filter(query);
		let obj_db = self.obj_db()?.clone();

		// aggregates stream over the whole matching set
		if let Some(agg) = query.aggregate.clone() {
			let mut inner = query.clone();
			inner.aggregate = None;
			inner.limit = Some(u32::MAX);
			inner.page = None;
			inner.select = Vec::new();
			let (plan, filter) = build_plan(&inner, &kind)?;
			let found = run_find(&inner, plan, &filter, &self.kind_engine, &obj_db, active, req.txn_mut()?)?;
			let rows = run_aggregate(&agg, &found.results)?;
			let count = rows.as_array().map(|a| a.len() as u32).unwrap_or(0);
			return Ok(FindResult {
				results: rows.as_array().cloned().unwrap_or_default(),
				next_page: None,
				count,
			});
		}

		// the distinct fold needs the whole set in order
		if query.distinct.is_some() {
			let (plan, filter) = self.plan_for_search(query, &kind)?;
			return run_search(
				query,
				plan,
				&filter,
				&kind,
				&self.kind_engine,
				&obj_db,
				&self.engine,
				active,
				req.txn_mut()?,
			);
		}

		match build_plan(query, &kind) {
			Ok((plan, filter)) => {
				run_find(query, plan, &filter, &self.kind_engine, &obj_db, active, req.txn_mut()?)
			}
			// no index can order this: fall back to the search cursor
			Err(Error::NoIndexForQuery(_)) if query.order.is_some() => {
				let (plan, filter) = self.plan_for_search(query, &kind)?;
				run_search(
					query,
					plan,
					&filter,
					&kind,
					&self.kind_engine,
					&obj_db,
					&self.engine,
					active,
					req.txn_mut()?,
				)
			}
			Err(e) => Err(e),
		}
	}

	/// The plan the search cursor scans: order dropped (it sorts in
	/// memory) and the page token withheld (it pages by id).
	fn plan_for_search(&self, query: &Query, kind: &Arc<Kind>) -> Result<(crate::query::QueryPlan, crate::query::Filter)> {
		let mut inner = query.clone();
		inner.order = None;
		inner.page = None;
		inner.distinct = None;
		build_plan(&inner, kind)
	}

	/// The plan a watcher arms over: the full range the query's own
	/// plan would touch, page position ignored.
	fn plan_for_watch(&self, query: &Query, kind: &Arc<Kind>) -> Result<(crate::query::QueryPlan, crate::query::Filter)> {
		let mut inner = query.clone();
		inner.page = None;
		match build_plan(&inner, kind) {
			Ok(out) => Ok(out),
			Err(Error::NoIndexForQuery(_)) if inner.order.is_some() => {
				inner.order = None;
				build_plan(&inner, kind)
			}
			Err(e) => Err(e),
		}
	}

	fn active_filter(&self, query: &Query) -> Option<HashSet<ShardId>> {
		if query.include_inactive_shards || !self.shard_engine.enabled() {
			return None;
		}
		Some(self.shard_engine.active_set().read().clone())
	}

	// ------------------------------------------------------------------
	// shard support

	/// Handle one media status transition, in one transaction under the
	/// exclusive schema lock.
	pub fn process_shard_info(
		&self,
		info: &crate::shard::ShardInfo,
		req: &mut DbReq,
	) -> Result<crate::shard::ShardInfo> {
		self.with_req(req, true, true, |db, req| {
			let shards = db.shard_engine.clone();
			let was = req.set_admin(true);
			let out = shards.process_shard_info(db, info, req);
			req.set_admin(was);
			out
		})
	}

	/// Physically remove every row of one kind under one shard prefix.
	pub(crate) fn purge_shard_docs(&self, shard: ShardId, kind_id: &str, req: &mut DbReq) -> Result<u32> {
		self.with_req(req, true, false, |db, req| {
			let kind = db.kind_engine.get_kind(kind_id)?;
			let mut ids: Vec<String> = Vec::new();
			db.kind_engine.scan_docs(&kind, req.txn_mut()?, &mut |_, id, _, _| {
				if idgen::shard_of(id) == shard {
					if let Ok(id) = std::str::from_utf8(id) {
						ids.push(id.to_string());
					}
				}
				Ok(())
			})?;
			let mut count = 0;
			for id in ids {
				if db.del_impl(&id, true, req)? {
					count += 1;
				}
			}
			Ok(count)
		})
	}
}

impl Drop for Db {
	fn drop(&mut self) {
		let _ = self.close();
	}
}
