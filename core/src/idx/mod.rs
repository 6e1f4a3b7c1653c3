//! Secondary indexes.
//!
//! Each index maps a document to a set of entry keys. On every write the
//! old and new key sets are diffed and the difference applied to the
//! shared entry store inside the surrounding transaction, so indexes are
//! never stale past a commit. Touched keys are recorded on the
//! transaction for watcher evaluation.

pub mod extract;

pub use self::extract::PropExtractor;
pub use self::extract::Tokenize;

use crate::cnf;
use crate::err::Error;
use crate::err::Result;
use crate::key;
use crate::key::Collation;
use crate::key::Collator;
use crate::kvs::ShardId;
use crate::kvs::StorageIndex;
use crate::kvs::StorageTxn;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One property of an index declaration.
#[derive(Debug, Clone)]
pub struct IndexProp {
	pub name: String,
	pub collation: Collation,
	pub tokenize: Tokenize,
	pub default: Option<Value>,
}

/// A configured index of one kind.
pub struct Index {
	id: u32,
	name: String,
	props: Vec<IndexProp>,
	inc_del: bool,
	hash: u64,
	locale: String,
	extractors: Vec<PropExtractor>,
	store: Arc<dyn StorageIndex>,
}

impl Index {
	/// Parse an index declaration, as found in a kind document.
	pub fn from_decl(decl: &Value, id: u32, locale: &str, store: Arc<dyn StorageIndex>) -> Result<Index> {
		let name = decl
			.get("name")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::InvalidSchema("index missing 'name'".into()))?;
		let props_decl = decl
			.get("props")
			.and_then(Value::as_array)
			.filter(|p| !p.is_empty())
			.ok_or_else(|| Error::InvalidSchema(format!("index '{name}' missing 'props'")))?;
		let mut props = Vec::with_capacity(props_decl.len());
		for prop in props_decl {
			let prop_name = prop
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| Error::InvalidSchema(format!("index '{name}' prop missing 'name'")))?;
			let collation = match prop.get("collate").and_then(Value::as_str) {
				None => Collation::Default,
				Some(c) => serde_json::from_value(Value::String(c.to_string()))
					.map_err(|_| Error::InvalidSchema(format!("bad collation '{c}'")))?,
			};
			let tokenize = match prop.get("tokenize").and_then(Value::as_str) {
				None | Some("none") => Tokenize::None,
				Some("all") => Tokenize::All,
				Some("words") => Tokenize::Words,
				Some(t) => return Err(Error::InvalidSchema(format!("bad tokenize '{t}'"))),
			};
			props.push(IndexProp {
				name: prop_name.to_string(),
				collation,
				tokenize,
				default: prop.get("default").cloned(),
			});
		}
		let inc_del = decl.get("incDel").and_then(Value::as_bool).unwrap_or(false);
		let hash = decl_hash(name, &props, inc_del);
		let extractors = build_extractors(&props, locale);
		Ok(Index {
			id,
			name: name.to_string(),
			props,
			inc_del,
			hash,
			locale: locale.to_string(),
			extractors,
			store,
		})
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn props(&self) -> &[IndexProp] {
		&self.props
	}

	pub fn prop_names(&self) -> impl Iterator<Item = &str> {
		self.props.iter().map(|p| p.name.as_str())
	}

	pub fn inc_del(&self) -> bool {
		self.inc_del
	}

	/// A stable hash of the declaration, used to detect schema drift.
	pub fn hash(&self) -> u64 {
		self.hash
	}

	pub fn locale(&self) -> &str {
		&self.locale
	}

	/// The collator of the named property, when it collates.
	pub fn collator_for(&self, prop: &str) -> Option<&Collator> {
		self.props
			.iter()
			.position(|p| p.name == prop)
			.and_then(|i| self.extractors[i].collator())
	}

	/// A copy of this index configured for another locale.
	pub fn with_locale(&self, locale: &str) -> Index {
		Index {
			id: self.id,
			name: self.name.clone(),
			props: self.props.clone(),
			inc_del: self.inc_del,
			hash: self.hash,
			locale: locale.to_string(),
			extractors: build_extractors(&self.props, locale),
			store: self.store.clone(),
		}
	}

	/// Every entry key this document produces in this index.
	pub fn entries(&self, doc: &Value, id: &[u8]) -> BTreeSet<Vec<u8>> {
		let mut out = BTreeSet::new();
		let per_prop: Vec<Vec<Vec<u8>>> =
			self.extractors.iter().map(|ex| ex.parts(doc).into_iter().collect()).collect();
		// a document with no value and no default in some property
		// contributes nothing at all
		if per_prop.iter().any(Vec::is_empty) {
			return out;
		}
		// cartesian product across properties, one entry per combination
		let mut cursors = vec![0usize; per_prop.len()];
		loop {
			let parts: Vec<Vec<u8>> =
				per_prop.iter().zip(&cursors).map(|(vals, &i)| vals[i].clone()).collect();
			out.insert(key::index_entry(self.id, &parts, id));
			let mut dim = per_prop.len();
			loop {
				if dim == 0 {
					return out;
				}
				dim -= 1;
				cursors[dim] += 1;
				if cursors[dim] < per_prop[dim].len() {
					break;
				}
				cursors[dim] = 0;
			}
		}
	}

	/// Apply the diff between the old and new state of one document.
	pub fn update(
		&self,
		shard: ShardId,
		new_doc: Option<&Value>,
		old_doc: Option<&Value>,
		id: &[u8],
		txn: &mut StorageTxn,
	) -> Result<bool> {
		let old_keys = match old_doc {
			Some(doc) => self.entries(doc, id),
			None => BTreeSet::new(),
		};
		let new_keys = match new_doc {
			Some(doc) => self.entries(doc, id),
			None => BTreeSet::new(),
		};
		let mut changed = false;
		for key in old_keys.difference(&new_keys) {
			self.del_entry(shard, key, txn)?;
			txn.push_watch_event(self.id, key.clone());
			changed = true;
		}
		for key in new_keys.difference(&old_keys) {
			self.store.insert(shard, key, txn)?;
			txn.push_watch_event(self.id, key.clone());
			changed = true;
		}
		Ok(changed)
	}

	fn del_entry(&self, shard: ShardId, key: &[u8], txn: &mut StorageTxn) -> Result<()> {
		for attempt in 0..cnf::INDEX_DEL_RETRIES {
			match self.store.del(shard, key, txn) {
				Ok(true) => return Ok(()),
				Ok(false) => {
					warn!(index = self.id, attempt, "index entry missing on delete");
				}
				Err(e) => return Err(e),
			}
		}
		Err(Error::InternalIndexOnDel(self.id))
	}

	/// Insert every entry for one document; used when building a new
	/// index over existing rows.
	pub fn insert_all(&self, shard: ShardId, doc: &Value, id: &[u8], txn: &mut StorageTxn) -> Result<()> {
		for key in self.entries(doc, id) {
			self.store.insert(shard, &key, txn)?;
		}
		Ok(())
	}

	/// Remove every entry of this index.
	pub fn drop_entries(&self, txn: &mut StorageTxn) -> Result<u64> {
		self.store.del_prefix(&key::index_prefix(self.id), txn)
	}

	/// Entry count and byte footprint.
	pub fn stats(&self, txn: &mut StorageTxn) -> Result<(u64, u64)> {
		self.store.stats(&key::index_prefix(self.id), txn)
	}
}

fn build_extractors(props: &[IndexProp], locale: &str) -> Vec<PropExtractor> {
	props
		.iter()
		.map(|p| {
			let collator = match p.collation {
				Collation::Default => None,
				strength => Some(Collator::new(locale, strength)),
			};
			PropExtractor::new(&p.name, collator, p.tokenize, p.default.clone())
		})
		.collect()
}

/// FNV-1a over the schema-relevant parts of the declaration. Stable
/// across processes, unlike the std hasher.
fn decl_hash(name: &str, props: &[IndexProp], inc_del: bool) -> u64 {
	let mut hash = fnv1a(0xcbf29ce484222325, name.as_bytes());
	for prop in props {
		hash = fnv1a(hash, prop.name.as_bytes());
		hash = fnv1a(hash, &[prop.collation as u8, prop.tokenize as u8]);
		if let Some(default) = &prop.default {
			hash = fnv1a(hash, default.to_string().as_bytes());
		}
	}
	fnv1a(hash, &[u8::from(inc_del)])
}

pub(crate) fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
	for &b in bytes {
		hash ^= u64::from(b);
		hash = hash.wrapping_mul(0x100000001b3);
	}
	hash
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kvs::mem::MemEngine;
	use crate::kvs::StorageEngine;
	use serde_json::json;

	fn test_store() -> (MemEngine, Arc<dyn StorageIndex>) {
		let engine = MemEngine::new();
		engine.open(std::path::Path::new("/tmp/idx-test")).unwrap();
		let mut txn = engine.begin(true).unwrap();
		let store = engine.open_index("indexes.db", &mut txn).unwrap();
		txn.abort().unwrap();
		(engine, store)
	}

	#[test]
	fn compound_entries_fan_out_over_arrays() {
		let (_engine, store) = test_store();
		let ix = Index::from_decl(
			&json!({"name": "deptAge", "props": [{"name": "dept"}, {"name": "age"}]}),
			7,
			"en_US",
			store,
		)
		.unwrap();
		let doc = json!({"dept": ["HR", "SW"], "age": 30});
		let entries = ix.entries(&doc, b"id1");
		assert_eq!(entries.len(), 2);
		// one property missing, no default: nothing indexed
		let doc = json!({"dept": "HR"});
		assert!(ix.entries(&doc, b"id1").is_empty());
	}

	#[test]
	fn update_applies_set_difference() {
		let (engine, store) = test_store();
		let ix = Index::from_decl(
			&json!({"name": "salary", "props": [{"name": "salary"}]}),
			3,
			"en_US",
			store.clone(),
		)
		.unwrap();
		let mut txn = engine.begin(true).unwrap();
		let old = json!({"salary": 500});
		let new = json!({"salary": 600});
		ix.update(0, Some(&old), None, b"id1", &mut txn).unwrap();
		ix.update(0, Some(&new), Some(&old), b"id1", &mut txn).unwrap();
		let (count, _) = ix.stats(&mut txn).unwrap();
		assert_eq!(count, 1);
		// touched keys were recorded for the watcher
		assert_eq!(txn.take_watch_events().len(), 3);
		ix.update(0, None, Some(&new), b"id1", &mut txn).unwrap();
		let (count, _) = ix.stats(&mut txn).unwrap();
		assert_eq!(count, 0);
		txn.commit().unwrap();
	}

	#[test]
	fn missing_entry_on_delete_is_integrity_error() {
		let (engine, store) = test_store();
		let ix = Index::from_decl(
			&json!({"name": "x", "props": [{"name": "x"}]}),
			4,
			"en_US",
			store,
		)
		.unwrap();
		let mut txn = engine.begin(true).unwrap();
		let err = ix.update(0, None, Some(&json!({"x": 1})), b"id1", &mut txn).unwrap_err();
		assert!(matches!(err, Error::InternalIndexOnDel(4)));
		txn.abort().unwrap();
	}

	#[test]
	fn declaration_hash_tracks_schema() {
		let (_engine, store) = test_store();
		let a = Index::from_decl(
			&json!({"name": "x", "props": [{"name": "x"}]}),
			1,
			"en_US",
			store.clone(),
		)
		.unwrap();
		let same = Index::from_decl(
			&json!({"name": "x", "props": [{"name": "x"}]}),
			2,
			"fr_CA",
			store.clone(),
		)
		.unwrap();
		let different = Index::from_decl(
			&json!({"name": "x", "props": [{"name": "x", "collate": "primary"}]}),
			3,
			"en_US",
			store,
		)
		.unwrap();
		assert_eq!(a.hash(), same.hash());
		assert_ne!(a.hash(), different.hash());
	}
}
