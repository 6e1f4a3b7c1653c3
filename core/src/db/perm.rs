//! Permission hook points.
//!
//! The policy layer itself lives outside the core; what lives here is
//! the enforcement seam: owners and the administrator pass, everyone
//! else needs a matching `Permission:1` record.

use crate::db::DbReq;
use crate::err::Error;
use crate::err::Result;
use crate::kind::DbOp;
use crate::kind::Kind;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// The permission record type guarding kind access.
const KIND_TYPE: &str = "db.kind";

#[derive(Default)]
pub struct PermissionEngine {
	// (object, type, caller) -> operation -> allowed
	records: RwLock<HashMap<(String, String, String), HashMap<String, bool>>>,
}

impl PermissionEngine {
	pub fn new() -> Self {
		Self::default()
	}

	/// Install a `Permission:1` record:
	/// `{"type": "db.kind", "object": "Contact:1", "caller": "com.x.*",
	///   "operations": {"read": "allow", "create": "allow"}}`.
	pub fn put(&self, doc: &Value) -> Result<()> {
		let object = require_str(doc, "object")?;
		let type_ = require_str(doc, "type")?;
		let caller = require_str(doc, "caller")?;
		let ops = doc
			.get("operations")
			.and_then(Value::as_object)
			.ok_or_else(|| Error::RequiredPropNotFound("operations".into()))?;
		let mut parsed = HashMap::with_capacity(ops.len());
		for (op, decision) in ops {
			parsed.insert(op.clone(), decision.as_str() == Some("allow"));
		}
		self.records
			.write()
			.insert((object.to_string(), type_.to_string(), caller.to_string()), parsed);
		Ok(())
	}

	/// Whether a caller may perform an operation on a kind.
	pub fn check(&self, kind: &Kind, op: DbOp, req: &DbReq) -> Result<()> {
		if req.is_admin() {
			return Ok(());
		}
		// built-ins take admin to modify, anyone to read
		if kind.is_builtin() {
			return match op {
				DbOp::Read => Ok(()),
				_ => Err(self.denied(kind, op, req)),
			};
		}
		if caller_matches(kind.owner(), req.caller()) {
			return Ok(());
		}
		let records = self.records.read();
		for caller_key in [req.caller().to_string(), wildcard_of(req.caller())] {
			let key = (kind.id().to_string(), KIND_TYPE.to_string(), caller_key);
			if let Some(ops) = records.get(&key) {
				if ops.get(op.as_str()).copied().unwrap_or(false) || ops.get("*").copied().unwrap_or(false) {
					return Ok(());
				}
			}
		}
		Err(self.denied(kind, op, req))
	}

	fn denied(&self, kind: &Kind, op: DbOp, req: &DbReq) -> Error {
		Error::PermissionDenied {
			caller: req.caller().to_string(),
			op: op.as_str().to_string(),
			object: kind.id().to_string(),
		}
	}
}

fn require_str<'a>(doc: &'a Value, key: &str) -> Result<&'a str> {
	doc.get(key).and_then(Value::as_str).ok_or_else(|| Error::RequiredPropNotFound(key.into()))
}

/// Owner `com.acme.*` spans every caller underneath it.
fn caller_matches(owner: &str, caller: &str) -> bool {
	match owner.strip_suffix(".*") {
		Some(stem) => caller == stem || caller.starts_with(&owner[..owner.len() - 1]),
		None => caller == owner,
	}
}

fn wildcard_of(caller: &str) -> String {
	match caller.rsplit_once('.') {
		Some((stem, _)) => format!("{stem}.*"),
		None => caller.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn kind(owner: &str) -> Kind {
		Kind::new("Contact:1", owner, 1, false, &json!({})).unwrap()
	}

	#[test]
	fn owner_and_admin_pass() {
		let perms = PermissionEngine::new();
		let k = kind("com.acme");
		let owner = DbReq::new("com.acme").unwrap();
		perms.check(&k, DbOp::Create, &owner).unwrap();
		let admin = DbReq::admin();
		perms.check(&k, DbOp::Delete, &admin).unwrap();
		let other = DbReq::new("com.other").unwrap();
		assert!(matches!(
			perms.check(&k, DbOp::Read, &other),
			Err(Error::PermissionDenied { .. })
		));
	}

	#[test]
	fn granted_records_open_access() {
		let perms = PermissionEngine::new();
		let k = kind("com.acme");
		perms
			.put(&json!({
				"type": "db.kind",
				"object": "Contact:1",
				"caller": "com.other",
				"operations": {"read": "allow"},
			}))
			.unwrap();
		let other = DbReq::new("com.other").unwrap();
		perms.check(&k, DbOp::Read, &other).unwrap();
		assert!(perms.check(&k, DbOp::Create, &other).is_err());
	}

	#[test]
	fn wildcard_owner_spans_children() {
		let perms = PermissionEngine::new();
		let k = kind("com.acme.*");
		let child = DbReq::new("com.acme.mail").unwrap();
		perms.check(&k, DbOp::Update, &child).unwrap();
	}
}
