//! One-shot watches over query result sets.
//!
//! A watcher remembers the key range its query's plan can touch and a
//! send-half to its consumer. After every commit the touched index keys
//! are replayed against the armed watchers of that index; an in-range
//! key fires the watcher exactly once and detaches it. Re-arming is the
//! consumer's business. Watchers are registered before commit but only
//! ever fire after one, so an aborted transaction fires nothing.

use crate::kvs::WatchEvent;
use crate::query::QueryPlan;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// The message a fired watch delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchFire;

pub struct Watcher {
	id: u64,
	index_id: u32,
	start: Vec<u8>,
	end: Vec<u8>,
	fired: AtomicBool,
	cancelled: AtomicBool,
	tx: Sender<WatchFire>,
}

impl Watcher {
	fn in_range(&self, key: &[u8]) -> bool {
		key >= self.start.as_slice() && key <= self.end.as_slice()
	}
}

/// The consumer's half of a watch; dropping it cancels silently.
pub struct WatchHandle {
	rx: Receiver<WatchFire>,
	watcher: Arc<Watcher>,
}

impl WatchHandle {
	/// The channel the single fire arrives on.
	pub fn receiver(&self) -> &Receiver<WatchFire> {
		&self.rx
	}

	/// Whether the watch has fired already.
	pub fn has_fired(&self) -> bool {
		self.watcher.fired.load(Relaxed)
	}

	pub fn cancel(&self) {
		self.watcher.cancelled.store(true, Relaxed);
	}
}

impl Drop for WatchHandle {
	fn drop(&mut self) {
		self.watcher.cancelled.store(true, Relaxed);
	}
}

#[derive(Default)]
pub struct WatchEngine {
	next_id: AtomicU64,
	by_index: Mutex<HashMap<u32, Vec<Arc<Watcher>>>>,
}

impl WatchEngine {
	pub fn new() -> Self {
		Self::default()
	}

	/// Arm a watcher over the key range a plan can touch.
	pub fn arm(&self, plan: &QueryPlan) -> WatchHandle {
		let (tx, rx) = crossbeam_channel::bounded(1);
		let watcher = Arc::new(Watcher {
			id: self.next_id.fetch_add(1, Relaxed),
			index_id: plan.index_id,
			start: plan.start_key().to_vec(),
			end: plan.end_key().to_vec(),
			fired: AtomicBool::new(false),
			cancelled: AtomicBool::new(false),
			tx,
		});
		self.by_index.lock().entry(plan.index_id).or_default().push(watcher.clone());
		trace!(watcher = watcher.id, index = plan.index_id, "armed watcher");
		WatchHandle {
			rx,
			watcher,
		}
	}

	/// Evaluate the keys a committed transaction touched. Each armed
	/// watcher fires at most once, then detaches.
	pub fn dispatch(&self, events: &[WatchEvent]) {
		if events.is_empty() {
			return;
		}
		let mut by_index = self.by_index.lock();
		for event in events {
			let Some(watchers) = by_index.get_mut(&event.index_id) else { continue };
			for watcher in watchers.iter() {
				if watcher.cancelled.load(Relaxed) || watcher.fired.load(Relaxed) {
					continue;
				}
				if watcher.in_range(&event.key) && !watcher.fired.swap(true, Relaxed) {
					trace!(watcher = watcher.id, "watcher fired");
					// a gone consumer is indistinguishable from a
					// cancelled one
					let _ = watcher.tx.try_send(WatchFire);
				}
			}
			watchers.retain(|w| !w.fired.load(Relaxed) && !w.cancelled.load(Relaxed));
			if watchers.is_empty() {
				by_index.remove(&event.index_id);
			}
		}
	}

	/// Armed watcher count, for stats.
	pub fn armed(&self) -> usize {
		self.by_index.lock().values().map(Vec::len).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::query::plan::KeyRange;

	fn plan(index_id: u32, start: &[u8], end: &[u8]) -> QueryPlan {
		QueryPlan {
			kind_id: "K:1".into(),
			index_id,
			index_prop_count: 1,
			ranges: vec![KeyRange {
				start: start.to_vec(),
				end: end.to_vec(),
			}],
			desc: false,
			page: None,
		}
	}

	fn event(index_id: u32, key: &[u8]) -> WatchEvent {
		WatchEvent {
			index_id,
			key: key.to_vec(),
		}
	}

	#[test]
	fn fires_once_in_range() {
		let engine = WatchEngine::new();
		let handle = engine.arm(&plan(1, b"a", b"m"));
		engine.dispatch(&[event(1, b"f")]);
		assert!(handle.has_fired());
		assert_eq!(handle.receiver().try_recv().ok(), Some(WatchFire));
		// a second matching commit does not fire again
		engine.dispatch(&[event(1, b"g")]);
		assert!(handle.receiver().try_recv().is_err());
		assert_eq!(engine.armed(), 0);
	}

	#[test]
	fn out_of_range_keys_do_not_fire() {
		let engine = WatchEngine::new();
		let handle = engine.arm(&plan(1, b"a", b"m"));
		engine.dispatch(&[event(1, b"z")]);
		engine.dispatch(&[event(2, b"f")]);
		assert!(!handle.has_fired());
		assert!(handle.receiver().try_recv().is_err());
	}

	#[test]
	fn cancelled_watchers_detach_silently() {
		let engine = WatchEngine::new();
		let handle = engine.arm(&plan(1, b"a", b"m"));
		handle.cancel();
		engine.dispatch(&[event(1, b"f")]);
		assert!(!handle.has_fired());
		assert_eq!(engine.armed(), 0);
	}
}
