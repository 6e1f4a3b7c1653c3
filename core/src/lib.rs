//! The core of the mojodb document database.
//!
//! mojodb is a schema-aware, transactional JSON object store used by
//! embedded platforms as the sole system database. Documents belong to
//! typed *kinds*, each with user-declared secondary indexes, and are
//! queried by predicate + ordering + pagination. Live *watches* fire once
//! when a query's result set could have changed, and data may be
//! partitioned across mountable *shards* identified by an id prefix.
//!
//! The storage layer is pluggable: any ordered key/value engine with
//! transactions can back the database. The built-in `mem` engine is the
//! reference implementation used by the test suite.

#[macro_use]
extern crate tracing;

pub mod cnf;
pub mod db;
pub mod err;
pub mod idx;
pub mod key;
pub mod kind;
pub mod kvs;
pub mod obj;
pub mod query;
pub mod shard;
pub mod watch;

pub use self::db::Db;
pub use self::db::DbReq;
pub use self::err::Error;
pub use self::err::Result;
pub use self::query::Query;
