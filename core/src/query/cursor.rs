//! The user-visible find path: index scan, primary join, residual
//! filter, projection and pagination.

use crate::db::idgen;
use crate::err::Result;
use crate::kind::KindEngine;
use crate::kvs::ShardId;
use crate::kvs::StorageDatabase;
use crate::kvs::StorageTxn;
use crate::obj;
use crate::query::filter::Filter;
use crate::query::plan::QueryPlan;
use crate::query::storage::StorageQuery;
use crate::query::Query;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// What a find returns to the facade.
#[derive(Debug, Default)]
pub struct FindResult {
	pub results: Vec<Value>,
	pub next_page: Option<Vec<u8>>,
	pub count: u32,
}

/// Run an index-ordered find to completion.
pub fn run_find(
	query: &Query,
	plan: QueryPlan,
	filter: &Filter,
	kind_engine: &KindEngine,
	obj_db: &Arc<dyn StorageDatabase>,
	active_shards: Option<HashSet<ShardId>>,
	txn: &mut StorageTxn,
) -> Result<FindResult> {
	let index_store = kind_engine.index_store()?;
	let cursor = index_store.cursor(txn)?;
	let mut scan = StorageQuery::new(plan, cursor, active_shards);
	let limit = query.limit_or_default();
	let mut out = FindResult::default();
	let mut last_distinct: Option<Value> = None;
	while let Some((id, _group, entry_key)) = scan.next()? {
		let shard = idgen::shard_of(&id);
		let Some(entry) = obj_db.get(shard, &id, txn, false)? else {
			warn!(id = %String::from_utf8_lossy(&id), "index entry without a primary record");
			continue;
		};
		let doc = kind_engine.decode_entry(&entry)?;
		if !filter.test(&doc) {
			continue;
		}
		// adjacent fold when the scan dimension is the distinct prop
		if let Some(prop) = &query.distinct {
			let val = obj::path_val(&doc, prop).cloned().unwrap_or(Value::Null);
			if last_distinct.as_ref() == Some(&val) {
				continue;
			}
			last_distinct = Some(val);
		}
		if out.results.len() as u32 == limit {
			// the first unsent entry key is the resume position
			out.next_page = Some(entry_key);
			break;
		}
		out.results.push(emit(&doc, query));
	}
	out.count = out.results.len() as u32;
	Ok(out)
}

/// Apply the projection, if the query selects fields.
pub fn emit(doc: &Value, query: &Query) -> Value {
	if query.select.is_empty() {
		doc.clone()
	} else {
		obj::project(doc, &query.select)
	}
}
