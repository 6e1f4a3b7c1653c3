//! A kind: one named, versioned schema and its indexes.

use crate::err::Error;
use crate::err::Result;
use crate::idx::fnv1a;
use crate::idx::Index;
use crate::kind::TokenSet;
use crate::kvs::ShardId;
use crate::kvs::StorageTxn;
use crate::obj;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// The operation a write performs, for permission checks and hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOp {
	Create,
	Read,
	Update,
	Delete,
	KindUpdate,
}

impl DbOp {
	pub fn as_str(self) -> &'static str {
		match self {
			DbOp::Create => "create",
			DbOp::Read => "read",
			DbOp::Update => "update",
			DbOp::Delete => "delete",
			DbOp::KindUpdate => "kindUpdate",
		}
	}
}

pub struct Kind {
	id: String,
	name: String,
	version: u32,
	owner: String,
	extends: Vec<String>,
	sync: bool,
	builtin: bool,
	tok: i64,
	indexes: RwLock<Vec<Arc<Index>>>,
	tokens: RwLock<TokenSet>,
	subs: RwLock<Vec<String>>,
	decl: RwLock<Value>,
}

impl Kind {
	pub fn new(id: &str, owner: &str, tok: i64, builtin: bool, decl: &Value) -> Result<Kind> {
		let (name, version) = parse_kind_id(id)?;
		let extends = match decl.get("extends") {
			None => Vec::new(),
			Some(Value::Array(items)) => items
				.iter()
				.map(|v| v.as_str().map(str::to_string).ok_or_else(|| Error::InvalidSchema("bad 'extends'".into())))
				.collect::<Result<_>>()?,
			Some(Value::String(s)) => vec![s.clone()],
			Some(_) => return Err(Error::InvalidSchema("bad 'extends'".into())),
		};
		let sync = decl.get("sync").and_then(Value::as_bool).unwrap_or(false);
		Ok(Kind {
			id: id.to_string(),
			name,
			version,
			owner: owner.to_string(),
			extends,
			sync,
			builtin,
			tok,
			indexes: RwLock::new(Vec::new()),
			tokens: RwLock::new(TokenSet::default()),
			subs: RwLock::new(Vec::new()),
			decl: RwLock::new(decl.clone()),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn version(&self) -> u32 {
		self.version
	}

	pub fn owner(&self) -> &str {
		&self.owner
	}

	pub fn extends(&self) -> &[String] {
		&self.extends
	}

	pub fn sync(&self) -> bool {
		self.sync
	}

	pub fn is_builtin(&self) -> bool {
		self.builtin
	}

	/// The engine-level token identifying this kind in record headers.
	pub fn token(&self) -> i64 {
		self.tok
	}

	pub fn decl(&self) -> Value {
		self.decl.read().clone()
	}

	pub fn set_decl(&self, decl: Value) {
		*self.decl.write() = decl;
	}

	pub fn indexes(&self) -> Vec<Arc<Index>> {
		self.indexes.read().clone()
	}

	pub fn set_indexes(&self, indexes: Vec<Arc<Index>>) {
		*self.indexes.write() = indexes;
	}

	pub fn tokens(&self) -> &RwLock<TokenSet> {
		&self.tokens
	}

	pub fn set_tokens(&self, tokens: TokenSet) {
		*self.tokens.write() = tokens;
	}

	/// Ids of kinds directly extending this one.
	pub fn subs(&self) -> Vec<String> {
		self.subs.read().clone()
	}

	pub fn add_sub(&self, id: &str) {
		let mut subs = self.subs.write();
		if !subs.iter().any(|s| s == id) {
			subs.push(id.to_string());
		}
	}

	pub fn remove_sub(&self, id: &str) {
		self.subs.write().retain(|s| s != id);
	}

	/// The structural hash: schema-relevant fields plus every index
	/// declaration. Shards compare it to detect drift while unmounted.
	pub fn structural_hash(&self) -> u64 {
		let mut hash = fnv1a(0xcbf29ce484222325, self.id.as_bytes());
		hash = fnv1a(hash, self.owner.as_bytes());
		for parent in &self.extends {
			hash = fnv1a(hash, parent.as_bytes());
		}
		for ix in self.indexes.read().iter() {
			hash = fnv1a(hash, &ix.hash().to_be_bytes());
		}
		hash
	}

	/// Fan one document write out to every index of this kind.
	///
	/// Tombstones only reach indexes that asked for them.
	pub fn update_indexes(
		&self,
		shard: ShardId,
		new_doc: Option<&Value>,
		old_doc: Option<&Value>,
		id: &[u8],
		txn: &mut StorageTxn,
	) -> Result<()> {
		for ix in self.indexes.read().iter() {
			let n = new_doc.filter(|d| ix.inc_del() || !obj::is_tombstone(d));
			let o = old_doc.filter(|d| ix.inc_del() || !obj::is_tombstone(d));
			if n.is_some() || o.is_some() {
				ix.update(shard, n, o, id, txn)?;
			}
		}
		Ok(())
	}
}

/// Split `Name:Version`, validating both halves.
pub fn parse_kind_id(id: &str) -> Result<(String, u32)> {
	let (name, version) = id
		.split_once(':')
		.ok_or_else(|| Error::InvalidSchema(format!("kind id '{id}' missing version")))?;
	if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '.' || c == '_' || c == '-') {
		return Err(Error::InvalidSchema(format!("bad kind name '{name}'")));
	}
	let version: u32 = version
		.parse()
		.map_err(|_| Error::InvalidSchema(format!("bad kind version in '{id}'")))?;
	Ok((name.to_string(), version))
}
