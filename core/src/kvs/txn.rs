//! The storage transaction wrapper.
//!
//! A [`StorageTxn`] owns the engine transaction and everything the core
//! layers hang off it: a monitor set notified on commit and destroy,
//! single-fire pre- and post-commit signals, the accumulated quota byte
//! deltas per (owner, kind), and the index keys touched by this
//! transaction, which drive watcher evaluation after commit.
//!
//! Dropping an unfinished write transaction aborts it.

use crate::err::Error;
use crate::err::Result;
use crate::kvs::api::RawTxn;
use crate::kvs::Key;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Observes transaction lifetime events.
pub trait TxnMonitor: Send + Sync {
	/// After the transaction committed successfully.
	fn committed(&self, _txn: &StorageTxn) {}

	/// When the transaction is destroyed; if `committed` was never
	/// called first, the transaction aborted.
	fn destroy(&self, _txn: &StorageTxn) {}
}

/// A single-fire commit signal.
pub type CommitHook = Box<dyn FnOnce(&mut StorageTxn) -> Result<()> + Send>;

/// An index key touched by a committed write, for watcher fan-out.
#[derive(Debug, Clone)]
pub struct WatchEvent {
	pub index_id: u32,
	pub key: Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
	Active,
	Committed,
	Aborted,
}

pub struct StorageTxn {
	raw: Box<dyn RawTxn>,
	write: bool,
	state: TxnState,
	monitors: Vec<Arc<dyn TxnMonitor>>,
	pre_commit: Vec<CommitHook>,
	post_commit: Vec<CommitHook>,
	quota_enabled: bool,
	quota_offsets: BTreeMap<(String, String), i64>,
	watch_events: Vec<WatchEvent>,
}

impl StorageTxn {
	pub fn new(raw: Box<dyn RawTxn>, write: bool) -> Self {
		StorageTxn {
			raw,
			write,
			state: TxnState::Active,
			monitors: Vec::new(),
			pre_commit: Vec::new(),
			post_commit: Vec::new(),
			quota_enabled: true,
			quota_offsets: BTreeMap::new(),
			watch_events: Vec::new(),
		}
	}

	/// Whether this transaction may write.
	pub fn is_write(&self) -> bool {
		self.write
	}

	/// Whether commit or abort already ran.
	pub fn is_finished(&self) -> bool {
		self.state != TxnState::Active
	}

	/// The engine transaction, for engine-side downcasting.
	pub fn raw(&self) -> &dyn RawTxn {
		self.raw.as_ref()
	}

	pub fn raw_mut(&mut self) -> &mut dyn RawTxn {
		self.raw.as_mut()
	}

	/// Subscribe a monitor. Monitors outlive the transaction.
	pub fn subscribe(&mut self, monitor: Arc<dyn TxnMonitor>) {
		self.monitors.push(monitor);
	}

	/// Register a signal fired just before the engine commit.
	pub fn notify_pre_commit(&mut self, hook: CommitHook) {
		self.pre_commit.push(hook);
	}

	/// Register a signal fired just after a successful engine commit.
	pub fn notify_post_commit(&mut self, hook: CommitHook) {
		self.post_commit.push(hook);
	}

	/// Enable or disable quota accounting for this transaction.
	pub fn quota_enabled(&mut self, enabled: bool) {
		self.quota_enabled = enabled;
	}

	/// Account a signed byte delta against an owner's quota. Called by
	/// every write that grows or shrinks persistent storage.
	pub fn offset_quota(&mut self, owner: &str, kind: &str, bytes: i64) {
		if self.quota_enabled && bytes != 0 {
			*self.quota_offsets.entry((owner.to_string(), kind.to_string())).or_insert(0) += bytes;
		}
	}

	/// The accumulated quota deltas.
	pub fn quota_offsets(&self) -> &BTreeMap<(String, String), i64> {
		&self.quota_offsets
	}

	/// Record an index key touched by this transaction.
	pub fn push_watch_event(&mut self, index_id: u32, key: Key) {
		self.watch_events.push(WatchEvent {
			index_id,
			key,
		});
	}

	/// Take the touched-key list, normally right before commit.
	pub fn take_watch_events(&mut self) -> Vec<WatchEvent> {
		std::mem::take(&mut self.watch_events)
	}

	/// Begin a nested transaction; writes land in the parent on
	/// [`StorageTxn::commit_nested`].
	pub fn begin_nested(&mut self) -> Result<()> {
		self.ensure_active()?;
		self.raw.begin_nested()
	}

	pub fn commit_nested(&mut self) -> Result<()> {
		self.ensure_active()?;
		self.raw.commit_nested()
	}

	pub fn abort_nested(&mut self) -> Result<()> {
		self.ensure_active()?;
		self.raw.abort_nested()
	}

	/// Commit: pre-commit signals, engine commit, post-commit signals,
	/// then the monitors' `committed`, in registration order.
	pub fn commit(&mut self) -> Result<()> {
		self.ensure_active()?;
		if !self.write {
			return Err(Error::TxnReadonly);
		}
		for hook in std::mem::take(&mut self.pre_commit) {
			hook(self)?;
		}
		self.raw.commit()?;
		self.state = TxnState::Committed;
		for hook in std::mem::take(&mut self.post_commit) {
			if let Err(e) = hook(self) {
				warn!("post-commit signal failed: {e}");
			}
		}
		for monitor in self.monitors.clone() {
			monitor.committed(self);
		}
		Ok(())
	}

	/// Abort, discarding buffered writes and quota deltas.
	pub fn abort(&mut self) -> Result<()> {
		self.ensure_active()?;
		self.state = TxnState::Aborted;
		self.quota_offsets.clear();
		self.watch_events.clear();
		self.raw.abort()
	}

	fn ensure_active(&self) -> Result<()> {
		if self.state != TxnState::Active {
			return Err(Error::TxnFinished);
		}
		Ok(())
	}
}

impl Drop for StorageTxn {
	fn drop(&mut self) {
		if self.state == TxnState::Active {
			if self.write {
				trace!("a write transaction was dropped without commit; aborting");
			}
			self.state = TxnState::Aborted;
			if let Err(e) = self.raw.abort() {
				warn!("abort on drop failed: {e}");
			}
		}
		for monitor in &self.monitors {
			monitor.destroy(self);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kvs::mem::MemEngine;
	use crate::kvs::StorageEngine;
	use std::sync::atomic::AtomicU32;
	use std::sync::atomic::Ordering::Relaxed;

	#[derive(Default)]
	struct CountingMonitor {
		committed: AtomicU32,
		destroyed: AtomicU32,
	}

	impl TxnMonitor for CountingMonitor {
		fn committed(&self, _txn: &StorageTxn) {
			self.committed.fetch_add(1, Relaxed);
		}

		fn destroy(&self, _txn: &StorageTxn) {
			self.destroyed.fetch_add(1, Relaxed);
		}
	}

	fn engine() -> MemEngine {
		let engine = MemEngine::new();
		engine.open(std::path::Path::new("/tmp/txn-test")).unwrap();
		engine
	}

	#[test]
	fn monitors_see_commit_then_destroy() {
		let engine = engine();
		let monitor = Arc::new(CountingMonitor::default());
		{
			let mut txn = engine.begin(true).unwrap();
			txn.subscribe(monitor.clone());
			txn.commit().unwrap();
			assert_eq!(monitor.committed.load(Relaxed), 1);
			assert_eq!(monitor.destroyed.load(Relaxed), 0);
		}
		assert_eq!(monitor.destroyed.load(Relaxed), 1);
	}

	#[test]
	fn destroy_without_commit_signals_abort() {
		let engine = engine();
		let monitor = Arc::new(CountingMonitor::default());
		{
			let mut txn = engine.begin(true).unwrap();
			txn.subscribe(monitor.clone());
			// dropped uncommitted
		}
		assert_eq!(monitor.committed.load(Relaxed), 0);
		assert_eq!(monitor.destroyed.load(Relaxed), 1);
	}

	#[test]
	fn signals_fire_in_order_around_commit() {
		let engine = engine();
		let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let mut txn = engine.begin(true).unwrap();
		for tag in ["pre-1", "pre-2"] {
			let order = order.clone();
			txn.notify_pre_commit(Box::new(move |_| {
				order.lock().push(tag);
				Ok(())
			}));
		}
		for tag in ["post-1", "post-2"] {
			let order = order.clone();
			txn.notify_post_commit(Box::new(move |_| {
				order.lock().push(tag);
				Ok(())
			}));
		}
		txn.commit().unwrap();
		assert_eq!(*order.lock(), vec!["pre-1", "pre-2", "post-1", "post-2"]);
	}

	#[test]
	fn aborted_quota_offsets_are_discarded() {
		let engine = engine();
		let mut txn = engine.begin(true).unwrap();
		txn.offset_quota("com.acme", "Contact:1", 128);
		txn.offset_quota("com.acme", "Contact:1", -28);
		assert_eq!(
			txn.quota_offsets().get(&("com.acme".to_string(), "Contact:1".to_string())),
			Some(&100)
		);
		txn.abort().unwrap();
		assert!(txn.quota_offsets().is_empty());
	}
}
