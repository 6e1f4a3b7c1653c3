//! The search cursor: in-memory ordering for queries no index can order.
//!
//! Matching ids are materialized (bounded by a cap), the documents are
//! fetched and decoded by a small worker pool, sorted by the order
//! property under the right collation, folded by the distinct property,
//! and paged by id.

use crate::cnf;
use crate::db::idgen;
use crate::err::Error;
use crate::err::Result;
use crate::idx::PropExtractor;
use crate::idx::Tokenize;
use crate::kind::Kind;
use crate::kind::KindEngine;
use crate::kvs::ShardId;
use crate::kvs::StorageDatabase;
use crate::kvs::StorageEngine;
use crate::kvs::StorageTxn;
use crate::obj;
use crate::query::cursor::emit;
use crate::query::cursor::FindResult;
use crate::query::filter::Filter;
use crate::query::plan::QueryPlan;
use crate::query::storage::StorageQuery;
use crate::query::Query;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

pub fn run_search(
	query: &Query,
	plan: QueryPlan,
	filter: &Filter,
	kind: &Arc<Kind>,
	kind_engine: &KindEngine,
	obj_db: &Arc<dyn StorageDatabase>,
	engine: &Arc<dyn StorageEngine>,
	active_shards: Option<HashSet<ShardId>>,
	txn: &mut StorageTxn,
) -> Result<FindResult> {
	// pull the unique matching ids from the index
	let index_store = kind_engine.index_store()?;
	let cursor = index_store.cursor(txn)?;
	let mut scan = StorageQuery::new(plan, cursor, active_shards);
	let cap = *cnf::SEARCH_MAX_RESULTS;
	let mut ids: Vec<Vec<u8>> = Vec::new();
	while let Some((id, _, _)) = scan.next()? {
		if ids.len() >= cap {
			return Err(Error::SearchCapExceeded(cap));
		}
		ids.push(id);
	}

	// load the documents; a write transaction must see its own writes,
	// so only read transactions use the worker pool
	let mut items: Vec<Value> = if txn.is_write() {
		fetch_sequential(&ids, kind_engine, obj_db, txn)?
	} else {
		fetch_parallel(&ids, kind_engine, obj_db, engine)?
	};

	items.retain(|doc| filter.test(doc));

	// sort by the distinct prop when folding, else the order prop
	let sort_prop = query.distinct.clone().or_else(|| query.order.clone());
	if let Some(prop) = &sort_prop {
		let extractor = PropExtractor::new(prop, kind_sort_collator(kind, prop), Tokenize::None, None);
		let mut keyed: Vec<(Vec<Vec<u8>>, Value)> = items
			.into_iter()
			.map(|doc| {
				let keys: Vec<Vec<u8>> = extractor.parts(&doc).into_iter().collect();
				(keys, doc)
			})
			.collect();
		keyed.sort_by(|a, b| a.0.cmp(&b.0));
		items = keyed.into_iter().map(|(_, doc)| doc).collect();
	}

	if let Some(prop) = &query.distinct {
		let mut last: Option<Value> = None;
		items.retain(|doc| {
			let val = obj::path_val(doc, prop).cloned().unwrap_or(Value::Null);
			let keep = last.as_ref() != Some(&val);
			last = Some(val);
			keep
		});
	}

	if query.desc {
		items.reverse();
	}

	// the search page token is the id of the first item of the page
	let mut pos = 0usize;
	if let Some(page) = &query.page {
		let page_id = String::from_utf8_lossy(page);
		pos = items
			.iter()
			.position(|doc| obj::id_of(doc) == Some(page_id.as_ref()))
			.unwrap_or(items.len());
	}

	let limit = query.limit_or_default() as usize;
	let next_page = items
		.get(pos + limit)
		.and_then(obj::id_of)
		.map(|id| id.as_bytes().to_vec());
	// the count reported to the client is everything left after
	// filtering and folding, not just this page
	let count = items.len().saturating_sub(pos) as u32;
	let results = items.iter().skip(pos).take(limit).map(|doc| emit(doc, query)).collect();
	Ok(FindResult {
		results,
		next_page,
		count,
	})
}

/// The collator of the first index leading with this property, so the
/// in-memory sort agrees with what an index scan would have produced.
fn kind_sort_collator(kind: &Arc<Kind>, prop: &str) -> Option<crate::key::Collator> {
	kind.indexes()
		.iter()
		.find(|ix| ix.prop_names().next() == Some(prop))
		.and_then(|ix| ix.collator_for(prop))
		.cloned()
}

fn fetch_sequential(
	ids: &[Vec<u8>],
	kind_engine: &KindEngine,
	obj_db: &Arc<dyn StorageDatabase>,
	txn: &mut StorageTxn,
) -> Result<Vec<Value>> {
	let mut out = Vec::with_capacity(ids.len());
	for id in ids {
		if let Some(entry) = obj_db.get(idgen::shard_of(id), id, txn, false)? {
			out.push(kind_engine.decode_entry(&entry)?);
		}
	}
	Ok(out)
}

fn fetch_parallel(
	ids: &[Vec<u8>],
	kind_engine: &KindEngine,
	obj_db: &Arc<dyn StorageDatabase>,
	engine: &Arc<dyn StorageEngine>,
) -> Result<Vec<Value>> {
	let fanout = (*cnf::SEARCH_FANOUT).min(ids.len().max(1));
	let slots: Vec<Mutex<Option<Value>>> = ids.iter().map(|_| Mutex::new(None)).collect();
	let cursor = AtomicUsize::new(0);
	let failure: Mutex<Option<Error>> = Mutex::new(None);
	std::thread::scope(|scope| {
		for _ in 0..fanout {
			scope.spawn(|| {
				let mut txn = match engine.begin(false) {
					Ok(txn) => txn,
					Err(e) => {
						failure.lock().get_or_insert(e);
						return;
					}
				};
				loop {
					let i = cursor.fetch_add(1, Relaxed);
					if i >= ids.len() {
						break;
					}
					let id = &ids[i];
					let fetched = obj_db
						.get(idgen::shard_of(id), id, &mut txn, false)
						.and_then(|entry| entry.map(|e| kind_engine.decode_entry(&e)).transpose());
					match fetched {
						Ok(Some(doc)) => {
							*slots[i].lock() = Some(doc);
						}
						Ok(None) => {}
						Err(e) => {
							failure.lock().get_or_insert(e);
							break;
						}
					}
				}
			});
		}
	});
	if let Some(e) = failure.into_inner() {
		return Err(e);
	}
	Ok(slots.into_iter().filter_map(Mutex::into_inner).collect())
}
