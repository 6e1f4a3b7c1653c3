//! Maintenance operations on the facade: purge, dump, load, stats,
//! compaction, and the permission/quota configuration paths.

use crate::cnf;
use crate::db::Db;
use crate::db::DbReq;
use crate::err::Error;
use crate::err::Result;
use crate::kind::engine::KIND_ID_PREFIX;
use crate::kind::engine::KIND_KIND_ID;
use crate::kind::engine::PERMISSION_ID;
use crate::kind::engine::QUOTA_ID;
use crate::kind::engine::REV_TIMESTAMP_ID;
use crate::obj;
use crate::query::CompOp;
use crate::query::Query;
use chrono::Utc;
use serde_json::json;
use serde_json::Value;
use std::io::BufRead;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering::Relaxed;

impl Db {
	/// Remove tombstones older than the purge window, plus the
	/// RevTimestamp markers that dated them. Returns the count removed.
	pub fn purge(&self, num_days: i64, req: &mut DbReq) -> Result<u32> {
		if !self.enable_purge.load(Relaxed) {
			return Ok(0);
		}
		self.with_req(req, true, false, |db, req| {
			// tombstones span kinds the caller may not own; purge is a
			// maintenance pass, not a data access
			let was = req.set_admin(true);
			let out = db.purge_body(num_days, req);
			req.set_admin(was);
			out
		})
	}

	fn purge_body(&self, num_days: i64, req: &mut DbReq) -> Result<u32> {
		let window = if num_days < 0 {
			self.purge_window()
		} else {
			num_days
		};
		let now = Utc::now().timestamp();
		let cutoff = now - window * 24 * 3600;
		// map the cutoff time onto a revision via the markers
		let marker_query = Query::new(REV_TIMESTAMP_ID)
			.filter("timestamp", CompOp::Lt, json!(cutoff))
			.order_by("timestamp")
			.descending()
			.with_limit(1);
		let markers = self.find_impl(&marker_query, req)?;
		let purge_rev = markers.results.first().and_then(|m| m.get("rev")).and_then(Value::as_i64);
		let mut count = 0;
		if let Some(purge_rev) = purge_rev {
			for kind_id in self.kind_engine().kind_ids() {
				if kind_id == REV_TIMESTAMP_ID {
					continue;
				}
				// only mounted shards are eligible; an absent medium
				// keeps its tombstones until it returns
				let mut query = Query::new(&kind_id)
					.filter(obj::REV_KEY, CompOp::Le, json!(purge_rev))
					.with_limit(u32::MAX);
				query.include_deleted = true;
				let found = self.find_impl(&query, req)?;
				for doc in found.results {
					if obj::is_tombstone(&doc) {
						if let Some(id) = obj::id_of(&doc).map(str::to_string) {
							self.del_impl(&id, true, req)?;
							count += 1;
						}
					}
				}
			}
			// spent markers go with the tombstones they dated
			let old_markers = Query::new(REV_TIMESTAMP_ID).filter("timestamp", CompOp::Lt, json!(cutoff));
			self.del_query(&old_markers, true, req)?;
			self.update_state("last_purged_rev", json!(purge_rev), req)?;
		}
		// stamp this purge so the next one can date today's writes
		let rev = self.rev_seq()?.next(req.txn_mut()?)?;
		self.put_impl(
			json!({
				obj::KIND_KEY: REV_TIMESTAMP_ID,
				"timestamp": now,
				"rev": rev,
			}),
			false,
			crate::kvs::MAIN_SHARD,
			req,
		)?;
		info!(count, window, "purge complete");
		Ok(count)
	}

	/// The revision up to which tombstones have been purged.
	pub fn purge_status(&self, req: &mut DbReq) -> Result<Value> {
		self.with_req(req, false, false, |db, req| {
			let rev = db.get_state("last_purged_rev", req)?.unwrap_or(json!(0));
			Ok(json!({ "rev": rev }))
		})
	}

	/// Dump to a file of newline-terminated JSON objects: every backed
	/// up kind document first, then the rows. An incremental dump emits
	/// only records past the given watermark; a byte budget turns into
	/// `hasMore` plus a continuation, never an error.
	pub fn dump(
		&self,
		path: &Path,
		inc_del: bool,
		max_bytes: u64,
		incremental_key: Option<&Value>,
		req: &mut DbReq,
	) -> Result<Value> {
		self.with_req(req, false, false, |db, req| {
			let watermark = incremental_key.and_then(|k| k.get("rev")).and_then(Value::as_i64);
			let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
			let mut count = 0u32;
			let mut bytes = 0u64;
			let mut warns = 0u32;
			let mut max_rev = watermark.unwrap_or(0);
			let mut has_more = false;

			let kind_ids: Vec<String> = db
				.kind_engine()
				.kind_ids()
				.into_iter()
				.filter(|id| !db.kind_engine().get_kind(id).map(|k| k.is_builtin()).unwrap_or(true))
				.collect();

			// every kind document leads, so a load can re-create the
			// schemas before it sees their rows
			for kind_id in &kind_ids {
				let doc_id = format!("{KIND_ID_PREFIX}{kind_id}");
				if let Some(doc) = db.get_impl(&doc_id, req)? {
					bytes += write_line(&mut file, &doc)?;
					count += 1;
				}
			}

			'kinds: for kind_id in &kind_ids {
				let kind = db.kind_engine().get_kind(kind_id)?;
				let mut rows: Vec<crate::kvs::StorageEntry> = Vec::new();
				db.kind_engine().scan_entries(&kind, req.txn_mut()?, &mut |_, entry| {
					rows.push(entry);
					Ok(())
				})?;
				for entry in rows {
					// the kind document already went out above
					if entry.id.starts_with(KIND_ID_PREFIX.as_bytes()) {
						continue;
					}
					// rows on unmounted media stay out of the backup
					let shard = crate::db::idgen::shard_of(&entry.id);
					if !db.shard_engine().is_active(shard) {
						continue;
					}
					let doc = match db.kind_engine().decode_entry(&entry) {
						Ok(doc) => doc,
						Err(e) => {
							warn!(error = %e, "skipping undecodable record in dump");
							warns += 1;
							continue;
						}
					};
					let rev = obj::rev_of(&doc).unwrap_or(0);
					if watermark.is_some_and(|w| rev <= w) {
						continue;
					}
					if !inc_del && obj::is_tombstone(&doc) {
						continue;
					}
					if max_bytes > 0 && bytes >= max_bytes {
						has_more = true;
						break 'kinds;
					}
					bytes += write_line(&mut file, &doc)?;
					count += 1;
					max_rev = max_rev.max(rev);
				}
			}
			file.flush()?;

			let mut response = json!({
				"files": [path.display().to_string()],
				"count": count,
				"version": db.version(),
				"full": watermark.is_none() && !has_more,
				"warnings": warns,
				"description": "mojodb dump",
				"incrementalKey": { "rev": max_rev },
			});
			if has_more {
				response["hasMore"] = json!(true);
			}
			Ok(response)
		})
	}

	/// Load a dump file: kind documents first, then the rows, with a
	/// transaction checkpoint every few records.
	pub fn load(&self, path: &Path, req: &mut DbReq) -> Result<u32> {
		let file = std::io::BufReader::new(std::fs::File::open(path)?);
		let mut kinds: Vec<Value> = Vec::new();
		let mut rows: Vec<Value> = Vec::new();
		for line in file.lines() {
			let line = line?;
			if line.trim().is_empty() {
				continue;
			}
			let doc: Value = serde_json::from_str(&line)?;
			if obj::kind_of(&doc) == Some(KIND_KIND_ID) {
				kinds.push(doc);
			} else {
				rows.push(doc);
			}
		}
		// schemas first, so their rows find a registered kind
		for mut kind in kinds {
			if let Some(map) = kind.as_object_mut() {
				map.remove(obj::ID_KEY);
				map.remove(obj::KIND_KEY);
				map.remove(obj::REV_KEY);
			}
			self.put_kind(kind, req)?;
		}
		self.begin_req(req, true, false)?;
		let result = (|| -> Result<u32> {
			let mut count = 0;
			for mut doc in rows {
				// revisions are reassigned on load
				if let Some(map) = doc.as_object_mut() {
					map.remove(obj::REV_KEY);
				}
				self.put_impl(doc, false, crate::kvs::MAIN_SHARD, req)?;
				count += 1;
				if count % cnf::LOAD_STEP_SIZE == 0 {
					self.checkpoint(req)?;
				}
			}
			Ok(count)
		})();
		match result {
			Ok(count) => {
				self.end_req(req)?;
				Ok(count)
			}
			Err(e) => {
				self.fail_req(req);
				Err(e)
			}
		}
	}

	/// Per-kind row and index statistics.
	pub fn stats(&self, kind: Option<&str>, req: &mut DbReq) -> Result<Value> {
		self.with_req(req, false, false, |db, req| db.kind_engine().stats(kind, req.txn_mut()?))
	}

	/// Per-owner quota usage.
	pub fn quota_stats(&self, req: &mut DbReq) -> Result<Value> {
		self.with_req(req, false, false, |db, req| db.quota_engine().stats(req.txn_mut()?))
	}

	/// Reclaim engine space; serialised against other compactions.
	pub fn compact(&self) -> Result<()> {
		self.require_open()?;
		let _guard = self.compact_lock.lock();
		self.engine().compact()
	}

	/// Install permission records (admin only).
	pub fn put_permissions(&self, docs: Vec<Value>, req: &mut DbReq) -> Result<u32> {
		if !req.is_admin() {
			return Err(Error::PermissionDenied {
				caller: req.caller().to_string(),
				op: "putPermissions".into(),
				object: PERMISSION_ID.into(),
			});
		}
		self.with_req(req, true, false, |db, req| {
			let mut count = 0;
			for mut doc in docs {
				db.permission_engine().put(&doc)?;
				doc[obj::KIND_KEY] = json!(PERMISSION_ID);
				db.put_impl(doc, false, crate::kvs::MAIN_SHARD, req)?;
				count += 1;
			}
			Ok(count)
		})
	}

	/// Install quota records (admin only).
	pub fn put_quotas(&self, docs: Vec<Value>, req: &mut DbReq) -> Result<u32> {
		if !req.is_admin() {
			return Err(Error::PermissionDenied {
				caller: req.caller().to_string(),
				op: "putQuotas".into(),
				object: QUOTA_ID.into(),
			});
		}
		self.with_req(req, true, false, |db, req| {
			let mut count = 0;
			for mut doc in docs {
				db.quota_engine().put_quota(&doc)?;
				doc[obj::KIND_KEY] = json!(QUOTA_ID);
				db.put_impl(doc, false, crate::kvs::MAIN_SHARD, req)?;
				count += 1;
			}
			Ok(count)
		})
	}
}

fn write_line(file: &mut impl Write, doc: &Value) -> Result<u64> {
	let line = serde_json::to_string(doc)?;
	file.write_all(line.as_bytes())?;
	file.write_all(b"\n")?;
	Ok(line.len() as u64 + 1)
}
