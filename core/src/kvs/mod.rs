//! The pluggable key value storage layer.
//!
//! The core treats its engine as an opaque ordered byte-key store with
//! named sub-databases, nestable transactions, cursors and sequences.
//! Engines register a factory in the process-wide registry; the
//! `MOJODB_ENGINE` environment variable selects one at startup, and a
//! lone registered engine is the default. Everything transactional is
//! defined in the `txn.rs` file.

pub mod api;
pub mod mem;
pub mod txn;

pub use self::api::Cursor;
pub use self::api::RawTxn;
pub use self::api::StorageDatabase;
pub use self::api::StorageEngine;
pub use self::api::StorageIndex;
pub use self::api::StorageSeq;
pub use self::txn::StorageTxn;
pub use self::txn::TxnMonitor;
pub use self::txn::WatchEvent;

use crate::cnf;
use crate::err::Error;
use crate::err::Result;
use crate::obj::ObjectHeader;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

/// The key part of a key-value pair.
pub type Key = Vec<u8>;

/// The value part of a key-value pair.
pub type Val = Vec<u8>;

/// A 32-bit shard prefix; zero is the main shard.
pub type ShardId = u32;

/// The magical shard id that is never used as an `_id` prefix.
pub const MAIN_SHARD: ShardId = 0;

/// A primary record as read from the store.
#[derive(Debug, Clone)]
pub struct StorageEntry {
	pub id: Key,
	pub data: Val,
}

impl StorageEntry {
	/// Parse the record header without decoding the body.
	pub fn header(&self) -> Result<ObjectHeader> {
		crate::obj::peek_header(&self.data)
	}

	/// The persistent footprint of this record, for quota accounting.
	pub fn size(&self) -> usize {
		self.id.len() + self.data.len()
	}
}

/// Creates engines of one registered flavour.
pub trait EngineFactory: Send + Sync {
	fn name(&self) -> &'static str;
	fn create(&self) -> Result<Arc<dyn StorageEngine>>;
}

static FACTORIES: Lazy<RwLock<HashMap<String, Arc<dyn EngineFactory>>>> = Lazy::new(|| {
	let mut map: HashMap<String, Arc<dyn EngineFactory>> = HashMap::new();
	#[cfg(feature = "kv-mem")]
	{
		let factory = Arc::new(mem::MemFactory);
		map.insert(factory.name().to_string(), factory as Arc<dyn EngineFactory>);
	}
	RwLock::new(map)
});

/// Register a storage engine factory under its name.
pub fn register_engine(factory: Arc<dyn EngineFactory>) {
	let mut factories = FACTORIES.write().unwrap();
	factories.insert(factory.name().to_string(), factory);
}

/// Create an engine by name, by `MOJODB_ENGINE`, or the sole registered
/// default, in that order of preference.
pub fn create_engine(name: Option<&str>) -> Result<Arc<dyn StorageEngine>> {
	let factories = FACTORIES.read().unwrap();
	let chosen = match name.map(str::to_string).or_else(|| std::env::var(cnf::ENGINE_ENV).ok()) {
		Some(name) => factories.get(&name).ok_or(Error::EngineNotRegistered(name))?,
		None => match factories.len() {
			1 => factories.values().next().unwrap(),
			_ => factories.get("mem").ok_or_else(|| Error::EngineNotRegistered("<default>".into()))?,
		},
	};
	chosen.create()
}
