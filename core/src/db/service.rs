//! The request/response envelope.
//!
//! The transport itself lives outside the core; this maps one decoded
//! JSON request onto a facade call and shapes the JSON reply, retrying
//! the whole request on deadlock. Failures carry the numeric error code
//! and a readable message; batch items fail individually.

use crate::cnf;
use crate::db::Db;
use crate::db::DbReq;
use crate::err::Error;
use crate::err::Result;
use crate::query::page_token;
use crate::query::Query;
use crate::watch::WatchHandle;
use serde_json::json;
use serde_json::Value;
use std::path::Path;

/// The reply to one request, plus the armed watch when one was asked
/// for. The transport holds the handle and relays the single fire.
pub struct Reply {
	pub body: Value,
	pub watch: Option<WatchHandle>,
}

impl Reply {
	fn of(body: Value) -> Reply {
		Reply {
			body,
			watch: None,
		}
	}
}

/// Dispatch one operation, retrying the whole request on deadlock.
pub fn handle_request(db: &Db, op: &str, payload: &Value, caller: &str, admin: bool) -> Reply {
	let mut attempt = 0;
	loop {
		let mut req = match DbReq::new(caller) {
			Ok(req) => {
				if admin {
					req.with_admin()
				} else {
					req
				}
			}
			Err(e) => return error_reply(&e),
		};
		match dispatch(db, op, payload, &mut req) {
			Ok(reply) => return reply,
			Err(e) if e.is_retryable() && attempt < cnf::DEADLOCK_RETRIES => {
				attempt += 1;
				trace!(op, attempt, "retrying request after deadlock");
				std::thread::sleep(std::time::Duration::from_millis(cnf::DEADLOCK_SLEEP_MS));
			}
			Err(Error::Deadlock) => {
				return error_reply(&Error::MaxRetriesExceeded(op.to_string()));
			}
			Err(e) => return error_reply(&e),
		}
	}
}

fn error_reply(e: &Error) -> Reply {
	Reply::of(json!({
		"returnValue": false,
		"errorCode": e.code(),
		"errorText": e.to_string(),
	}))
}

fn dispatch(db: &Db, op: &str, payload: &Value, req: &mut DbReq) -> Result<Reply> {
	match op {
		"put" | "merge" => {
			let objects = payload
				.get("objects")
				.and_then(Value::as_array)
				.cloned()
				.ok_or_else(|| Error::RequiredPropNotFound("objects".into()))?;
			let shard = parse_shard(payload)?;
			let merge = op == "merge";
			let mut results = Vec::with_capacity(objects.len());
			if merge {
				for doc in objects {
					match db.merge(doc, req) {
						Ok((id, rev)) => results.push(json!({"id": id, "rev": rev})),
						Err(e) => results.push(item_error(&e)),
					}
				}
			} else {
				for item in db.put_many(objects, shard, req)? {
					match item {
						Ok((id, rev)) => results.push(json!({"id": id, "rev": rev})),
						Err(e) => results.push(item_error(&e)),
					}
				}
			}
			Ok(Reply::of(json!({ "returnValue": true, "results": results })))
		}
		"get" => {
			let ids = string_array(payload, "ids")?;
			let results = db.get_many(&ids, req)?;
			Ok(Reply::of(json!({ "returnValue": true, "results": results })))
		}
		"del" => {
			let purge = payload.get("purge").and_then(Value::as_bool).unwrap_or(false);
			if let Some(query) = payload.get("query") {
				let query = Query::from_value(query)?;
				let count = db.del_query(&query, purge, req)?;
				return Ok(Reply::of(json!({ "returnValue": true, "count": count })));
			}
			let ids = string_array(payload, "ids")?;
			let mut results = Vec::with_capacity(ids.len());
			for item in db.del_many(&ids, purge, req)? {
				match item {
					Ok((id, found)) => results.push(json!({"id": id, "found": found})),
					Err(e) => results.push(item_error(&e)),
				}
			}
			Ok(Reply::of(json!({ "returnValue": true, "results": results })))
		}
		"find" => {
			let query = payload
				.get("query")
				.ok_or_else(|| Error::RequiredPropNotFound("query".into()))?;
			let query = Query::from_value(query)?;
			let wants_watch = payload.get("watch").and_then(Value::as_bool).unwrap_or(false);
			if wants_watch {
				let (found, handle) = db.find_watch(&query, req)?;
				let mut reply = Reply::of(find_body(&found));
				reply.watch = Some(handle);
				return Ok(reply);
			}
			let found = db.find(&query, req)?;
			Ok(Reply::of(find_body(&found)))
		}
		"search" => {
			// find with in-memory ordering semantics; same envelope
			let query = payload
				.get("query")
				.ok_or_else(|| Error::RequiredPropNotFound("query".into()))?;
			let query = Query::from_value(query)?;
			let found = db.find(&query, req)?;
			Ok(Reply::of(find_body(&found)))
		}
		"watch" => {
			let query = payload
				.get("query")
				.ok_or_else(|| Error::RequiredPropNotFound("query".into()))?;
			let query = Query::from_value(query)?;
			let (fired, handle) = db.watch(&query, req)?;
			let mut reply = Reply::of(if fired {
				json!({"returnValue": true, "fired": true})
			} else {
				json!({"returnValue": true})
			});
			reply.watch = handle;
			Ok(reply)
		}
		"putKind" => {
			db.put_kind(payload.clone(), req)?;
			Ok(Reply::of(json!({"returnValue": true})))
		}
		"delKind" => {
			let id = payload
				.get("id")
				.and_then(Value::as_str)
				.ok_or_else(|| Error::RequiredPropNotFound("id".into()))?;
			let found = db.del_kind(id, req)?;
			if !found {
				return Err(Error::KindNotRegistered(id.to_string()));
			}
			Ok(Reply::of(json!({"returnValue": true})))
		}
		"putPermissions" => {
			let docs = payload
				.get("permissions")
				.and_then(Value::as_array)
				.cloned()
				.ok_or_else(|| Error::RequiredPropNotFound("permissions".into()))?;
			let count = db.put_permissions(docs, req)?;
			Ok(Reply::of(json!({"returnValue": true, "count": count})))
		}
		"putQuotas" => {
			let docs = payload
				.get("quotas")
				.and_then(Value::as_array)
				.cloned()
				.ok_or_else(|| Error::RequiredPropNotFound("quotas".into()))?;
			let count = db.put_quotas(docs, req)?;
			Ok(Reply::of(json!({"returnValue": true, "count": count})))
		}
		"reserveIds" => {
			let count = payload.get("count").and_then(Value::as_u64).unwrap_or(1) as u32;
			let ids = db.reserve_ids(count)?;
			Ok(Reply::of(json!({"returnValue": true, "ids": ids})))
		}
		"purge" => {
			let window = payload.get("window").and_then(Value::as_i64).unwrap_or(-1);
			let count = db.purge(window, req)?;
			Ok(Reply::of(json!({"returnValue": true, "count": count})))
		}
		"purgeStatus" => {
			let status = db.purge_status(req)?;
			Ok(Reply::of(json!({"returnValue": true, "rev": status["rev"]})))
		}
		"dump" => {
			let path = payload
				.get("path")
				.and_then(Value::as_str)
				.ok_or_else(|| Error::RequiredPropNotFound("path".into()))?;
			let inc_del = payload.get("incDel").and_then(Value::as_bool).unwrap_or(true);
			let max_bytes = payload.get("bytes").and_then(Value::as_u64).unwrap_or(0);
			let mut body = db.dump(Path::new(path), inc_del, max_bytes, payload.get("incrementalKey"), req)?;
			body["returnValue"] = json!(true);
			Ok(Reply::of(body))
		}
		"load" => {
			let path = payload
				.get("path")
				.and_then(Value::as_str)
				.ok_or_else(|| Error::RequiredPropNotFound("path".into()))?;
			let count = db.load(Path::new(path), req)?;
			Ok(Reply::of(json!({"returnValue": true, "count": count})))
		}
		"stats" => {
			let kind = payload.get("kind").and_then(Value::as_str);
			let body = db.stats(kind, req)?;
			Ok(Reply::of(json!({"returnValue": true, "results": body})))
		}
		"quotaStats" => {
			let body = db.quota_stats(req)?;
			Ok(Reply::of(json!({"returnValue": true, "results": body})))
		}
		"compact" => {
			db.compact()?;
			Ok(Reply::of(json!({"returnValue": true})))
		}
		"updateLocale" => {
			let locale = payload
				.get("locale")
				.and_then(Value::as_str)
				.ok_or_else(|| Error::RequiredPropNotFound("locale".into()))?;
			db.update_locale(locale, req)?;
			Ok(Reply::of(json!({"returnValue": true})))
		}
		_ => Err(Error::InvalidQuery(format!("unknown operation '{op}'"))),
	}
}

fn find_body(found: &crate::query::FindResult) -> Value {
	let mut body = json!({
		"returnValue": true,
		"results": found.results,
		"count": found.count,
	});
	if let Some(next) = &found.next_page {
		body["next"] = json!({ "page": page_token(next) });
	}
	body
}

fn item_error(e: &Error) -> Value {
	json!({"errorCode": e.code(), "errorText": e.to_string()})
}

fn string_array(payload: &Value, key: &str) -> Result<Vec<String>> {
	payload
		.get(key)
		.and_then(Value::as_array)
		.map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
		.ok_or_else(|| Error::RequiredPropNotFound(key.into()))
}

fn parse_shard(payload: &Value) -> Result<crate::kvs::ShardId> {
	match payload.get("shardId") {
		None => Ok(crate::kvs::MAIN_SHARD),
		Some(Value::Number(n)) => Ok(n.as_u64().unwrap_or(0) as crate::kvs::ShardId),
		Some(Value::String(s)) => {
			use base64::engine::general_purpose::STANDARD_NO_PAD as B64;
			use base64::Engine as _;
			let raw = B64.decode(s).map_err(|_| Error::InvalidQuery("bad shardId".into()))?;
			let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| Error::InvalidQuery("bad shardId".into()))?;
			Ok(crate::kvs::ShardId::from_be_bytes(bytes))
		}
		Some(_) => Err(Error::InvalidQuery("bad shardId".into())),
	}
}
