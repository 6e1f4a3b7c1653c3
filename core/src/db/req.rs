//! The request object: caller identity, schema-lock mode, the active
//! transaction, and batch state. Every facade operation takes one.

use crate::err::Error;
use crate::err::Result;
use crate::kvs::StorageTxn;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::RawRwLock;

/// The administrative caller identity.
pub const ADMIN_CALLER: &str = "mojodb.admin";

pub(crate) enum SchemaGuard {
	Read(ArcRwLockReadGuard<RawRwLock, ()>),
	Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

pub struct DbReq {
	caller: String,
	admin: bool,
	fix_mode: bool,
	autobatch: bool,
	batch_count: u32,
	pub(crate) txn: Option<StorageTxn>,
	pub(crate) schema_guard: Option<SchemaGuard>,
	pub(crate) depth: u32,
}

impl DbReq {
	/// A request on behalf of a caller domain.
	pub fn new(caller: &str) -> Result<DbReq> {
		if caller.is_empty() || !caller.chars().all(|c| c.is_ascii_alphanumeric() || ".-_".contains(c)) {
			return Err(Error::InvalidCaller(caller.to_string()));
		}
		Ok(DbReq {
			caller: caller.to_string(),
			admin: false,
			fix_mode: false,
			autobatch: false,
			batch_count: 0,
			txn: None,
			schema_guard: None,
			depth: 0,
		})
	}

	/// An elevated request, as used by internal maintenance paths.
	pub fn admin() -> DbReq {
		let mut req = DbReq::new(ADMIN_CALLER).expect("admin caller is valid");
		req.admin = true;
		req
	}

	pub fn with_admin(mut self) -> DbReq {
		self.admin = true;
		self
	}

	/// Force deletes through index mismatches, as load and repair do.
	pub fn with_fix_mode(mut self) -> DbReq {
		self.fix_mode = true;
		self
	}

	pub fn with_autobatch(mut self) -> DbReq {
		self.autobatch = true;
		self
	}

	/// Swap the elevation flag, returning the previous value. Internal
	/// paths that write built-in kinds on a caller's behalf elevate
	/// around the write and restore after.
	pub(crate) fn set_admin(&mut self, admin: bool) -> bool {
		std::mem::replace(&mut self.admin, admin)
	}

	pub fn caller(&self) -> &str {
		&self.caller
	}

	pub fn is_admin(&self) -> bool {
		self.admin
	}

	pub fn fix_mode(&self) -> bool {
		self.fix_mode
	}

	pub fn autobatch(&self) -> bool {
		self.autobatch
	}

	pub(crate) fn bump_batch(&mut self) -> u32 {
		self.batch_count += 1;
		self.batch_count
	}

	pub(crate) fn reset_batch(&mut self) {
		self.batch_count = 0;
	}

	/// The active transaction; an error outside a begun request.
	pub fn txn_mut(&mut self) -> Result<&mut StorageTxn> {
		self.txn.as_mut().ok_or(Error::TxnFinished)
	}

	pub fn has_txn(&self) -> bool {
		self.txn.is_some()
	}
}
