//! Per-owner storage quotas.
//!
//! Writes accumulate signed byte deltas on their transaction; just
//! before the engine commit the deltas land on the persistent per-owner
//! counters, and a grow past the configured limit fails the commit.
//! Aborted transactions discard their deltas untouched.

use crate::cnf;
use crate::err::Error;
use crate::err::Result;
use crate::kvs::StorageDatabase;
use crate::kvs::StorageEngine;
use crate::kvs::StorageTxn;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct QuotaEngine {
	db: OnceCell<Arc<dyn StorageDatabase>>,
	limits: RwLock<Vec<(String, i64)>>,
}

impl QuotaEngine {
	pub fn new() -> Self {
		QuotaEngine {
			db: OnceCell::new(),
			limits: RwLock::new(Vec::new()),
		}
	}

	pub fn open(&self, engine: &Arc<dyn StorageEngine>, txn: &mut StorageTxn) -> Result<()> {
		let db = engine.open_database(cnf::QUOTAS_DB_NAME, txn)?;
		let _ = self.db.set(db);
		Ok(())
	}

	fn db(&self) -> Result<&Arc<dyn StorageDatabase>> {
		self.db.get().ok_or(Error::DbNotOpen)
	}

	/// Install or replace a quota from a `Quota:1` record:
	/// `{"owner": "com.acme.*", "size": bytes}`.
	pub fn put_quota(&self, doc: &Value) -> Result<()> {
		let owner = doc
			.get("owner")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::RequiredPropNotFound("owner".into()))?;
		let size = doc
			.get("size")
			.and_then(Value::as_i64)
			.ok_or_else(|| Error::RequiredPropNotFound("size".into()))?;
		let mut limits = self.limits.write();
		limits.retain(|(o, _)| o != owner);
		limits.push((owner.to_string(), size));
		Ok(())
	}

	/// The tightest limit whose owner pattern matches, if any.
	fn limit_for(&self, owner: &str) -> Option<i64> {
		let limits = self.limits.read();
		let mut best: Option<(usize, i64)> = None;
		for (pattern, size) in limits.iter() {
			if owner_matches(pattern, owner) && best.map_or(true, |(len, _)| pattern.len() > len) {
				best = Some((pattern.len(), *size));
			}
		}
		best.map(|(_, size)| size)
	}

	/// Fold a transaction's deltas into the persistent counters. Runs
	/// as the pre-commit signal of every write transaction.
	pub fn apply(&self, txn: &mut StorageTxn) -> Result<()> {
		// offsets are tracked per (owner, kind); usage is per owner
		let mut per_owner: BTreeMap<String, i64> = BTreeMap::new();
		for ((owner, _kind), delta) in txn.quota_offsets() {
			*per_owner.entry(owner.clone()).or_insert(0) += delta;
		}
		let db = self.db()?.clone();
		for (owner, delta) in per_owner {
			if delta == 0 {
				continue;
			}
			let used: i64 = db
				.get_raw(owner.as_bytes(), txn)?
				.and_then(|raw| raw.as_slice().try_into().ok().map(i64::from_le_bytes))
				.unwrap_or(0);
			let next = (used + delta).max(0);
			if delta > 0 {
				if let Some(limit) = self.limit_for(&owner) {
					if next > limit {
						return Err(Error::QuotaExceeded(owner));
					}
				}
			}
			db.set_raw(owner.as_bytes(), &next.to_le_bytes(), txn)?;
		}
		Ok(())
	}

	/// Current usage of one owner.
	pub fn usage(&self, owner: &str, txn: &mut StorageTxn) -> Result<i64> {
		Ok(self
			.db()?
			.get_raw(owner.as_bytes(), txn)?
			.and_then(|raw| raw.as_slice().try_into().ok().map(i64::from_le_bytes))
			.unwrap_or(0))
	}

	/// Usage and limit per configured owner, for `quotaStats`.
	pub fn stats(&self, txn: &mut StorageTxn) -> Result<Value> {
		let mut out = serde_json::Map::new();
		let limits = self.limits.read().clone();
		for (owner, size) in limits {
			let used = self.usage(&owner, txn)?;
			out.insert(owner, json!({"size": size, "used": used}));
		}
		Ok(Value::Object(out))
	}
}

impl Default for QuotaEngine {
	fn default() -> Self {
		Self::new()
	}
}

/// `com.acme.*` matches the owner itself and anything under it.
fn owner_matches(pattern: &str, owner: &str) -> bool {
	match pattern.strip_suffix(".*") {
		Some(stem) => owner == stem || owner.starts_with(pattern.trim_end_matches('*')),
		None => owner == pattern,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn owner_patterns() {
		assert!(owner_matches("com.acme", "com.acme"));
		assert!(!owner_matches("com.acme", "com.acme.app"));
		assert!(owner_matches("com.acme.*", "com.acme.app"));
		assert!(owner_matches("com.acme.*", "com.acme"));
		assert!(!owner_matches("com.acme.*", "com.acmeco"));
	}
}
