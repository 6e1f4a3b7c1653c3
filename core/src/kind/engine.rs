//! The kind registry.
//!
//! Kinds are loaded from the object store itself: every kind document is
//! stored under the built-in `Kind:1`, which gives the system its
//! bootstrap fixed point. The engine owns the kind-token and index-id
//! books, and drives locale reconfiguration across every collated index.

use crate::cnf;
use crate::err::Error;
use crate::err::Result;
use crate::idx::Index;
use crate::key::Collation;
use crate::kind::kind::parse_kind_id;
use crate::kind::DbOp;
use crate::kind::Kind;
use crate::kind::TokenSet;
use crate::kvs::StorageDatabase;
use crate::kvs::StorageEngine;
use crate::kvs::StorageEntry;
use crate::kvs::StorageIndex;
use crate::kvs::StorageSeq;
use crate::kvs::StorageTxn;
use crate::obj;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::json;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Id prefix under which kind documents are stored.
pub const KIND_ID_PREFIX: &str = "_kinds/";

// Built-in kinds, installed at open.
pub const KIND_KIND_ID: &str = "Kind:1";
const KIND_KIND_JSON: &str = r#"{"id":"Kind:1","owner":"mojodb.admin",
	"indexes":[{"name":"_rev","props":[{"name":"_rev"}],"incDel":true},{"name":"kindId","props":[{"name":"id"}]}]}"#;
pub const ROOT_KIND_ID: &str = "Object:1";
const ROOT_KIND_JSON: &str = r#"{"id":"Object:1","owner":"mojodb.admin",
	"indexes":[{"name":"_sync_revIncDel","props":[{"name":"_sync","default":false},{"name":"_rev"}],"incDel":true}]}"#;
pub const REV_TIMESTAMP_ID: &str = "RevTimestamp:1";
const REV_TIMESTAMP_JSON: &str = r#"{"id":"RevTimestamp:1","owner":"mojodb.admin",
	"indexes":[{"name":"timestamp","props":[{"name":"timestamp"}]}]}"#;
pub const DB_STATE_ID: &str = "DbState:1";
const DB_STATE_JSON: &str = r#"{"id":"DbState:1","owner":"mojodb.admin"}"#;
pub const PERMISSION_ID: &str = "Permission:1";
const PERMISSION_JSON: &str = r#"{"id":"Permission:1","owner":"mojodb.admin","sync":true,
	"indexes":[{"name":"permissionIdx","props":[{"name":"object"},{"name":"type"},{"name":"caller"}]}]}"#;
pub const QUOTA_ID: &str = "Quota:1";
const QUOTA_JSON: &str = r#"{"id":"Quota:1","owner":"mojodb.admin"}"#;

/// The implicit per-kind revision index, added when a kind declares no
/// index leading with `_rev`. Dump, purge and from-only queries use it.
const DEFAULT_INDEX_JSON: &str = r#"{"name":"_default","props":[{"name":"_rev"}],"incDel":true}"#;

struct Stores {
	obj_db: Arc<dyn StorageDatabase>,
	kinds_db: Arc<dyn StorageDatabase>,
	index_ids_db: Arc<dyn StorageDatabase>,
	index_store: Arc<dyn StorageIndex>,
	index_id_seq: Arc<dyn StorageSeq>,
}

pub struct KindEngine {
	kinds: RwLock<HashMap<String, Arc<Kind>>>,
	toks: RwLock<HashMap<i64, String>>,
	stores: OnceCell<Stores>,
	locale: RwLock<String>,
	root_enabled: AtomicBool,
}

impl KindEngine {
	pub fn new() -> Self {
		KindEngine {
			kinds: RwLock::new(HashMap::new()),
			toks: RwLock::new(HashMap::new()),
			stores: OnceCell::new(),
			locale: RwLock::new("en_US".to_string()),
			root_enabled: AtomicBool::new(false),
		}
	}

	/// Open the kind books, install the built-ins and reload every
	/// persisted kind. Runs under the schema write lock.
	pub fn open(
		&self,
		engine: &Arc<dyn StorageEngine>,
		obj_db: Arc<dyn StorageDatabase>,
		locale: &str,
		enable_root_kind: bool,
		txn: &mut StorageTxn,
	) -> Result<()> {
		let stores = Stores {
			obj_db,
			kinds_db: engine.open_database(cnf::KINDS_DB_NAME, txn)?,
			index_ids_db: engine.open_database(cnf::INDEX_IDS_DB_NAME, txn)?,
			index_store: engine.open_index(cnf::INDEXES_DB_NAME, txn)?,
			index_id_seq: engine.open_sequence(cnf::INDEX_ID_SEQ_NAME, txn)?,
		};
		if self.stores.set(stores).is_err() {
			return Err(Error::InvalidSchema("kind engine already open".into()));
		}
		*self.locale.write() = locale.to_string();
		self.root_enabled.store(enable_root_kind, Relaxed);
		if enable_root_kind {
			self.add_builtin(ROOT_KIND_JSON, txn)?;
		}
		self.add_builtin(KIND_KIND_JSON, txn)?;
		self.add_builtin(REV_TIMESTAMP_JSON, txn)?;
		self.add_builtin(DB_STATE_JSON, txn)?;
		self.add_builtin(PERMISSION_JSON, txn)?;
		self.add_builtin(QUOTA_JSON, txn)?;
		self.load_kinds(txn)
	}

	/// Throw the registry away and rebuild it from disk: the recovery
	/// path after a failed schema change or locale update.
	pub fn reload(&self, txn: &mut StorageTxn) -> Result<()> {
		self.kinds.write().clear();
		self.toks.write().clear();
		if self.root_enabled.load(Relaxed) {
			self.add_builtin(ROOT_KIND_JSON, txn)?;
		}
		self.add_builtin(KIND_KIND_JSON, txn)?;
		self.add_builtin(REV_TIMESTAMP_JSON, txn)?;
		self.add_builtin(DB_STATE_JSON, txn)?;
		self.add_builtin(PERMISSION_JSON, txn)?;
		self.add_builtin(QUOTA_JSON, txn)?;
		self.load_kinds(txn)
	}

	/// Take over a stored locale at open time. The entries on disk were
	/// already built under it, so only the collators change hands.
	pub fn adopt_locale(&self, locale: &str) {
		let current = self.locale.read().clone();
		if current == locale {
			return;
		}
		*self.locale.write() = locale.to_string();
		let kinds: Vec<Arc<Kind>> = self.kinds.read().values().cloned().collect();
		for kind in kinds {
			let swapped = kind.indexes().iter().map(|ix| Arc::new(ix.with_locale(locale))).collect();
			kind.set_indexes(swapped);
		}
	}

	pub fn is_open(&self) -> bool {
		self.stores.get().is_some()
	}

	pub fn locale(&self) -> String {
		self.locale.read().clone()
	}

	/// Persist every dirty token set; called before the facade commits.
	pub fn flush_tokens(&self, txn: &mut StorageTxn) -> Result<()> {
		let kinds: Vec<Arc<Kind>> = self.kinds.read().values().cloned().collect();
		for kind in kinds {
			let mut tokens = kind.tokens().write();
			if tokens.is_dirty() {
				self.save_kind_state(&kind, &tokens, txn)?;
				tokens.mark_clean();
			}
		}
		Ok(())
	}

	fn stores(&self) -> Result<&Stores> {
		self.stores.get().ok_or(Error::DbNotOpen)
	}

	/// The shared index entry store.
	pub fn index_store(&self) -> Result<Arc<dyn StorageIndex>> {
		Ok(self.stores()?.index_store.clone())
	}

	fn add_builtin(&self, decl: &str, txn: &mut StorageTxn) -> Result<()> {
		let obj: Value = serde_json::from_str(decl)?;
		self.put_kind(&obj, true, txn)?;
		Ok(())
	}

	/// Register a new kind or reconfigure an existing one. New indexes
	/// are built by scanning existing rows, dropped ones are erased, all
	/// inside the caller's write transaction.
	pub fn put_kind(&self, decl: &Value, builtin: bool, txn: &mut StorageTxn) -> Result<Arc<Kind>> {
		let id = decl
			.get("id")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::RequiredPropNotFound("id".into()))?
			.to_string();
		parse_kind_id(&id)?;
		let owner = match decl.get("owner").and_then(Value::as_str) {
			Some(owner) if !owner.is_empty() => owner.to_string(),
			_ if builtin => "mojodb.admin".to_string(),
			_ => return Err(Error::RequiredPropNotFound("owner".into())),
		};
		let existing = self.kinds.read().get(&id).cloned();
		match existing {
			None => self.create_kind(&id, &owner, decl, builtin, txn),
			Some(kind) => {
				debug!(kind = %id, "reconfiguring kind");
				self.configure_indexes(&kind, decl, txn)?;
				kind.set_decl(decl.clone());
				Ok(kind)
			}
		}
	}

	fn create_kind(&self, id: &str, owner: &str, decl: &Value, builtin: bool, txn: &mut StorageTxn) -> Result<Arc<Kind>> {
		let stores = self.stores()?;
		// reuse the persisted kind state if this is a reopen
		let state = stores.kinds_db.get_raw(id.as_bytes(), txn)?;
		let (tok, tokens) = match state {
			Some(raw) => {
				let val: Value = serde_json::from_slice(&raw)?;
				let tok = val.get("tok").and_then(Value::as_i64).ok_or(Error::CorruptHeader)?;
				(tok, TokenSet::from_stored(&val)?)
			}
			None => (stores.index_id_seq.next(txn)?, TokenSet::default()),
		};
		let kind = Arc::new(Kind::new(id, owner, tok, builtin, decl)?);
		kind.set_tokens(tokens);
		self.configure_indexes(&kind, decl, txn)?;
		{
			let tokens = kind.tokens().read();
			self.save_kind_state(&kind, &tokens, txn)?;
		}
		kind.tokens().write().mark_clean();
		// register, then wire the extends graph in both directions
		self.kinds.write().insert(id.to_string(), kind.clone());
		self.toks.write().insert(tok, id.to_string());
		let kinds = self.kinds.read();
		for parent in kind.extends() {
			if let Some(parent) = kinds.get(parent) {
				parent.add_sub(id);
			}
		}
		for other in kinds.values() {
			if other.extends().iter().any(|p| p == id) {
				kind.add_sub(other.id());
			}
		}
		Ok(kind)
	}

	fn save_kind_state(&self, kind: &Kind, tokens: &TokenSet, txn: &mut StorageTxn) -> Result<()> {
		let stores = self.stores()?;
		let mut state = tokens.to_stored();
		state["tok"] = json!(kind.token());
		stores.kinds_db.set_raw(kind.id().as_bytes(), state.to_string().as_bytes(), txn)
	}

	/// Diff the declared index list against the current one.
	fn configure_indexes(&self, kind: &Arc<Kind>, decl: &Value, txn: &mut StorageTxn) -> Result<()> {
		let locale = self.locale();
		let mut decls: Vec<Value> = match decl.get("indexes") {
			None => Vec::new(),
			Some(Value::Array(items)) => items.clone(),
			Some(_) => return Err(Error::InvalidSchema("'indexes' must be an array".into())),
		};
		let has_rev = decls.iter().any(|d| {
			d.get("props")
				.and_then(Value::as_array)
				.and_then(|p| p.first())
				.and_then(|p| p.get("name"))
				.and_then(Value::as_str)
				== Some("_rev")
		});
		if !has_rev {
			decls.push(serde_json::from_str(DEFAULT_INDEX_JSON)?);
		}
		let old = kind.indexes();
		let mut new_list: Vec<Arc<Index>> = Vec::with_capacity(decls.len());
		let mut seen: Vec<u32> = Vec::new();
		for d in &decls {
			let probe = Index::from_decl(d, 0, &locale, self.stores()?.index_store.clone())?;
			match old.iter().find(|ix| ix.name() == probe.name() && ix.hash() == probe.hash()) {
				Some(keep) => {
					seen.push(keep.id());
					new_list.push(keep.clone());
				}
				None => {
					let (id, existed) = self.alloc_index_id(kind.id(), probe.name(), probe.hash(), txn)?;
					let ix = Arc::new(Index::from_decl(d, id, &locale, self.stores()?.index_store.clone())?);
					if !existed {
						self.build_index(kind, &ix, txn)?;
					}
					seen.push(id);
					new_list.push(ix);
				}
			}
		}
		for ix in old.iter().filter(|ix| !seen.contains(&ix.id())) {
			debug!(kind = kind.id(), index = ix.name(), "dropping index");
			ix.drop_entries(txn)?;
		}
		kind.set_indexes(new_list);
		Ok(())
	}

	/// Assign (or recover) the engine-wide id of one index.
	fn alloc_index_id(&self, kind_id: &str, name: &str, hash: u64, txn: &mut StorageTxn) -> Result<(u32, bool)> {
		let stores = self.stores()?;
		let key = format!("{kind_id}/{name}/{hash:016x}");
		if let Some(raw) = stores.index_ids_db.get_raw(key.as_bytes(), txn)? {
			let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| Error::CorruptHeader)?;
			return Ok((u32::from_be_bytes(bytes), true));
		}
		let id = stores.index_id_seq.next(txn)? as u32;
		stores.index_ids_db.set_raw(key.as_bytes(), &id.to_be_bytes(), txn)?;
		Ok((id, false))
	}

	/// Populate a brand-new index from every existing row of the kind
	/// and of every kind extending it.
	fn build_index(&self, kind: &Arc<Kind>, ix: &Arc<Index>, txn: &mut StorageTxn) -> Result<()> {
		for member in self.family(kind) {
			self.scan_docs(&member, txn, &mut |txn, id, doc, _| {
				if ix.inc_del() || !obj::is_tombstone(&doc) {
					ix.insert_all(crate::db::idgen::shard_of(id), &doc, id, txn)?;
				}
				Ok(())
			})?;
		}
		Ok(())
	}

	/// A kind plus every kind transitively extending it.
	fn family(&self, kind: &Arc<Kind>) -> Vec<Arc<Kind>> {
		let kinds = self.kinds.read();
		let mut out = vec![kind.clone()];
		let mut queue = kind.subs();
		while let Some(id) = queue.pop() {
			if let Some(sub) = kinds.get(&id) {
				if !out.iter().any(|k| k.id() == sub.id()) {
					queue.extend(sub.subs());
					out.push(sub.clone());
				}
			}
		}
		out
	}

	/// Iterate every document of one kind through its revision index.
	/// The callback receives the transaction back, the id, the decoded
	/// document and the record's byte footprint.
	pub fn scan_docs(
		&self,
		kind: &Arc<Kind>,
		txn: &mut StorageTxn,
		f: &mut dyn FnMut(&mut StorageTxn, &[u8], Value, usize) -> Result<()>,
	) -> Result<()> {
		let Some(rev_ix) = kind.indexes().into_iter().find(|ix| ix.prop_names().next() == Some("_rev")) else {
			return Ok(());
		};
		let stores = self.stores()?;
		let prefix = crate::key::index_prefix(rev_ix.id());
		let mut cursor = stores.index_store.cursor(txn)?;
		let mut row = cursor.seek(&prefix)?;
		let mut ids = Vec::new();
		while let Some((key, _)) = row {
			if !key.starts_with(&prefix) {
				break;
			}
			ids.push(crate::key::entry_id(&key, rev_ix.props().len())?.to_vec());
			row = cursor.next()?;
		}
		drop(cursor);
		for id in ids {
			let shard = crate::db::idgen::shard_of(&id);
			if let Some(entry) = stores.obj_db.get(shard, &id, txn, false)? {
				let doc = self.decode_entry(&entry)?;
				f(txn, &id, doc, entry.size())?;
			}
		}
		Ok(())
	}

	/// Iterate the raw records of one kind without decoding, so callers
	/// like dump can degrade decode failures to warnings.
	pub fn scan_entries(
		&self,
		kind: &Arc<Kind>,
		txn: &mut StorageTxn,
		f: &mut dyn FnMut(&mut StorageTxn, StorageEntry) -> Result<()>,
	) -> Result<()> {
		let Some(rev_ix) = kind.indexes().into_iter().find(|ix| ix.prop_names().next() == Some("_rev")) else {
			return Ok(());
		};
		let stores = self.stores()?;
		let prefix = crate::key::index_prefix(rev_ix.id());
		let mut cursor = stores.index_store.cursor(txn)?;
		let mut row = cursor.seek(&prefix)?;
		let mut ids = Vec::new();
		while let Some((key, _)) = row {
			if !key.starts_with(&prefix) {
				break;
			}
			ids.push(crate::key::entry_id(&key, rev_ix.props().len())?.to_vec());
			row = cursor.next()?;
		}
		drop(cursor);
		for id in ids {
			let shard = crate::db::idgen::shard_of(&id);
			if let Some(entry) = stores.obj_db.get(shard, &id, txn, false)? {
				f(txn, entry)?;
			}
		}
		Ok(())
	}

	/// Reload the persisted kind documents, stored under `_kinds/`.
	fn load_kinds(&self, txn: &mut StorageTxn) -> Result<()> {
		let stores = self.stores()?;
		let mut cursor = stores.obj_db.cursor(txn)?;
		let mut row = cursor.seek(KIND_ID_PREFIX.as_bytes())?;
		let mut docs = Vec::new();
		while let Some((key, val)) = row {
			if !key.starts_with(KIND_ID_PREFIX.as_bytes()) {
				break;
			}
			docs.push(StorageEntry {
				id: key,
				data: val,
			});
			row = cursor.next()?;
		}
		drop(cursor);
		for entry in docs {
			match self.decode_entry(&entry).and_then(|doc| self.put_kind(&doc, false, txn)) {
				Ok(_) => {}
				Err(e) => {
					error!(id = %String::from_utf8_lossy(&entry.id), error = %e, "error loading kind");
				}
			}
		}
		Ok(())
	}

	/// Route one document write to its kind (old and new may differ when
	/// `_kind` changed) and fan index updates up the extends chain.
	pub fn update(
		&self,
		new_doc: Option<&Value>,
		old_doc: Option<&Value>,
		_op: DbOp,
		txn: &mut StorageTxn,
	) -> Result<Arc<Kind>> {
		let old_kind = match old_doc {
			Some(doc) => Some(self.kind_for_doc(doc)?),
			None => None,
		};
		let primary = match new_doc.or(old_doc) {
			Some(doc) => self.kind_for_doc(doc)?,
			None => return Err(Error::KindNotSpecified),
		};
		let id = new_doc
			.or(old_doc)
			.and_then(obj::id_of)
			.ok_or_else(|| Error::RequiredPropNotFound(obj::ID_KEY.into()))?
			.as_bytes()
			.to_vec();
		let shard = crate::db::idgen::shard_of(&id);
		match old_kind {
			Some(old_kind) if old_kind.id() != primary.id() => {
				// the document moved kinds: remove there, add here
				self.fan(&old_kind, None, old_doc, &id, shard, txn)?;
				self.fan(&primary, new_doc, None, &id, shard, txn)?;
			}
			_ => {
				self.fan(&primary, new_doc, old_doc, &id, shard, txn)?;
			}
		}
		Ok(primary)
	}

	/// Apply index updates on a kind and all of its ancestors.
	fn fan(
		&self,
		kind: &Arc<Kind>,
		new_doc: Option<&Value>,
		old_doc: Option<&Value>,
		id: &[u8],
		shard: crate::kvs::ShardId,
		txn: &mut StorageTxn,
	) -> Result<()> {
		kind.update_indexes(shard, new_doc, old_doc, id, txn)?;
		let mut queue: Vec<String> = kind.extends().to_vec();
		let mut visited: Vec<String> = Vec::new();
		while let Some(parent_id) = queue.pop() {
			if visited.contains(&parent_id) {
				continue;
			}
			visited.push(parent_id.clone());
			let parent = self.kinds.read().get(&parent_id).cloned();
			if let Some(parent) = parent {
				parent.update_indexes(shard, new_doc, old_doc, id, txn)?;
				queue.extend(parent.extends().to_vec());
			}
		}
		Ok(())
	}

	/// Remove a kind: all index entries, all rows, the registry slot.
	/// Kinds with live sub-kinds must have the children deleted first.
	pub fn del_kind(&self, id: &str, txn: &mut StorageTxn) -> Result<()> {
		let kind = self.get_kind(id)?;
		if kind.is_builtin() {
			return Err(Error::InvalidSchema(format!("cannot delete built-in kind '{id}'")));
		}
		if !kind.subs().is_empty() {
			return Err(Error::InvalidSchema(format!("kind '{id}' still has sub-kinds")));
		}
		let stores = self.stores()?;
		// purge every row, keeping ancestor indexes consistent
		let mut rows: Vec<(Vec<u8>, Value, usize)> = Vec::new();
		self.scan_docs(&kind, txn, &mut |_, id, doc, size| {
			rows.push((id.to_vec(), doc, size));
			Ok(())
		})?;
		for (row_id, doc, size) in rows {
			let shard = crate::db::idgen::shard_of(&row_id);
			self.fan(&kind, None, Some(&doc), &row_id, shard, txn)?;
			txn.offset_quota(kind.owner(), kind.id(), -(size as i64));
			stores.obj_db.del(shard, &row_id, txn)?;
		}
		for ix in kind.indexes() {
			ix.drop_entries(txn)?;
		}
		stores.kinds_db.del_raw(id.as_bytes(), txn)?;
		self.kinds.write().remove(id);
		self.toks.write().remove(&kind.token());
		let kinds = self.kinds.read();
		for parent in kind.extends() {
			if let Some(parent) = kinds.get(parent) {
				parent.remove_sub(id);
			}
		}
		Ok(())
	}

	/// Reconfigure the collator of every collated index and rewrite the
	/// affected entries. A mid-way failure aborts the transaction; the
	/// facade then reopens the engine from disk.
	pub fn update_locale(&self, locale: &str, txn: &mut StorageTxn) -> Result<()> {
		info!(locale, "updating database locale");
		*self.locale.write() = locale.to_string();
		let kinds: Vec<Arc<Kind>> = self.kinds.read().values().cloned().collect();
		for kind in kinds {
			let mut changed = false;
			let mut new_list: Vec<Arc<Index>> = Vec::new();
			for ix in kind.indexes() {
				let collated = ix.props().iter().any(|p| p.collation != Collation::Default);
				if collated && ix.locale() != locale {
					let rebuilt = Arc::new(ix.with_locale(locale));
					ix.drop_entries(txn)?;
					self.build_index(&kind, &rebuilt, txn)?;
					new_list.push(rebuilt);
					changed = true;
				} else {
					new_list.push(ix);
				}
			}
			if changed {
				kind.set_indexes(new_list);
			}
		}
		Ok(())
	}

	/// Resolve a kind by id.
	pub fn get_kind(&self, id: &str) -> Result<Arc<Kind>> {
		self.kinds.read().get(id).cloned().ok_or_else(|| Error::KindNotRegistered(id.to_string()))
	}

	pub fn has_kind(&self, id: &str) -> bool {
		self.kinds.read().contains_key(id)
	}

	/// Resolve the kind a document belongs to.
	pub fn kind_for_doc(&self, doc: &Value) -> Result<Arc<Kind>> {
		let id = obj::kind_of(doc).ok_or(Error::KindNotSpecified)?;
		self.get_kind(id)
	}

	/// All registered kind ids.
	pub fn kind_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.kinds.read().keys().cloned().collect();
		ids.sort();
		ids
	}

	/// kind name -> engine token.
	pub fn token_from_id(&self, id: &str) -> Result<i64> {
		Ok(self.get_kind(id)?.token())
	}

	/// engine token -> kind name.
	pub fn id_from_token(&self, tok: i64) -> Result<String> {
		self.toks.read().get(&tok).cloned().ok_or(Error::InvalidKindToken(tok))
	}

	/// Frame a document for storage, extending the kind's token set.
	pub fn encode_doc(&self, kind: &Kind, doc: &Value, rev: i64, del: bool) -> Result<Vec<u8>> {
		let mut tokens = kind.tokens().write();
		obj::encode_record(doc, kind.token(), rev, del, &mut tokens)
	}

	/// Decode a stored record into a full document with reserved keys.
	pub fn decode_entry(&self, entry: &StorageEntry) -> Result<Value> {
		let header = entry.header()?;
		let kind_id = self.id_from_token(header.kind_tok)?;
		let kind = self.get_kind(&kind_id)?;
		let tokens = kind.tokens().read();
		let (_, mut doc) = obj::decode_record(&entry.data, &tokens)?;
		let id = std::str::from_utf8(&entry.id).map_err(|_| Error::CorruptHeader)?;
		let map = doc.as_object_mut().ok_or(Error::CorruptHeader)?;
		map.insert(obj::ID_KEY.into(), json!(id));
		map.insert(obj::KIND_KEY.into(), json!(kind_id));
		map.insert(obj::REV_KEY.into(), json!(header.rev));
		if header.del {
			map.insert(obj::DEL_KEY.into(), json!(true));
		}
		Ok(doc)
	}

	/// Per-kind stats: row count and size plus per-index entry stats.
	pub fn stats(&self, only: Option<&str>, txn: &mut StorageTxn) -> Result<Value> {
		let mut out = serde_json::Map::new();
		let kinds: Vec<Arc<Kind>> = self.kinds.read().values().cloned().collect();
		for kind in kinds {
			if only.is_some_and(|id| id != kind.id()) {
				continue;
			}
			let mut count = 0u64;
			let mut size = 0u64;
			self.scan_docs(&kind, txn, &mut |_, _, _, entry_size| {
				count += 1;
				size += entry_size as u64;
				Ok(())
			})?;
			let mut indexes = serde_json::Map::new();
			for ix in kind.indexes() {
				let (icount, isize) = ix.stats(txn)?;
				indexes.insert(ix.name().to_string(), json!({"count": icount, "size": isize}));
			}
			out.insert(
				kind.id().to_string(),
				json!({"count": count, "size": size, "indexes": Value::Object(indexes)}),
			);
		}
		Ok(Value::Object(out))
	}

	/// The structural hash of a kind, for shard drift detection.
	pub fn kind_hash(&self, id: &str) -> Result<u64> {
		Ok(self.get_kind(id)?.structural_hash())
	}
}

impl Default for KindEngine {
	fn default() -> Self {
		Self::new()
	}
}
