//! Per-shard kind hashes.
//!
//! When a shard is mounted, every kind that ever wrote to it has the
//! kind's structural hash recorded. On reattach a differing hash means
//! the schema drifted while the medium was away, and the shard's rows
//! of that kind are dropped as garbage.

use crate::db::Db;
use crate::db::DbReq;
use crate::err::Result;
use crate::query::CompOp;
use crate::query::Query;
use crate::obj;
use serde_json::json;
use serde_json::Value;

pub const KIND_HASH_KIND_ID: &str = "KindHashMap:1";
pub const KIND_HASH_KIND_JSON: &str = r#"{"id":"KindHashMap:1","owner":"mojodb.admin",
	"indexes":[{"name":"shardKind","props":[{"name":"shardId"},{"name":"kindId"}]}]}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindHash {
	pub shard_id: u32,
	pub kind_id: String,
	pub hash: u64,
}

impl KindHash {
	pub fn to_doc(&self) -> Value {
		json!({
			obj::KIND_KEY: KIND_HASH_KIND_ID,
			"shardId": self.shard_id,
			"kindId": self.kind_id,
			// u64 round-trips as hex, json numbers would truncate
			"hash": format!("{:016x}", self.hash),
		})
	}

	pub fn from_doc(doc: &Value) -> Option<KindHash> {
		Some(KindHash {
			shard_id: doc.get("shardId")?.as_u64()? as u32,
			kind_id: doc.get("kindId")?.as_str()?.to_string(),
			hash: u64::from_str_radix(doc.get("hash")?.as_str()?, 16).ok()?,
		})
	}

	/// The recorded hash for one (shard, kind), if any.
	pub fn load(db: &Db, shard_id: u32, kind_id: &str, req: &mut DbReq) -> Result<Option<(KindHash, String)>> {
		let query = Query::new(KIND_HASH_KIND_ID)
			.filter("shardId", CompOp::Eq, json!(shard_id))
			.filter("kindId", CompOp::Eq, json!(kind_id));
		let found = db.find(&query, req)?;
		Ok(found.results.first().and_then(|doc| {
			let id = obj::id_of(doc)?.to_string();
			Some((KindHash::from_doc(doc)?, id))
		}))
	}

	/// Every recorded hash of one shard.
	pub fn load_all(db: &Db, shard_id: u32, req: &mut DbReq) -> Result<Vec<KindHash>> {
		let query = Query::new(KIND_HASH_KIND_ID).filter("shardId", CompOp::Eq, json!(shard_id));
		let found = db.find(&query, req)?;
		Ok(found.results.iter().filter_map(KindHash::from_doc).collect())
	}

	/// Insert or update the recorded hash.
	pub fn save(&self, db: &Db, req: &mut DbReq) -> Result<()> {
		let mut doc = self.to_doc();
		if let Some((_, id)) = KindHash::load(db, self.shard_id, &self.kind_id, req)? {
			doc[obj::ID_KEY] = json!(id);
		}
		db.put(doc, req)?;
		Ok(())
	}

	/// Remove the recorded hash, if present.
	pub fn del(db: &Db, shard_id: u32, kind_id: &str, req: &mut DbReq) -> Result<()> {
		if let Some((_, id)) = KindHash::load(db, shard_id, kind_id, req)? {
			db.del(&id, true, req)?;
		}
		Ok(())
	}
}
