use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors surfaced by the database core.
///
/// Every variant maps to a stable numeric code via [`Error::code`], which
/// is what the service envelope reports to callers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
	/// The database has not been opened yet, or was already closed
	#[error("database is not open")]
	DbNotOpen,

	/// The on-disk version does not match this build
	#[error("database version mismatch: found {found}, expected {expected}")]
	DbVersionMismatch {
		found: i64,
		expected: i64,
	},

	/// Another process holds the database directory
	#[error("database path is locked: {0}")]
	PathLocked(String),

	/// The named storage engine was never registered
	#[error("storage engine not registered: '{0}'")]
	EngineNotRegistered(String),

	/// A request referenced a kind that is not registered
	#[error("kind not registered: '{0}'")]
	KindNotRegistered(String),

	/// A document carried no `_kind` property
	#[error("kind not specified")]
	KindNotSpecified,

	/// A stored record referenced an unknown kind token
	#[error("invalid kind token: {0}")]
	InvalidKindToken(i64),

	/// A kind document failed validation
	#[error("invalid schema: {0}")]
	InvalidSchema(String),

	/// A malformed query was submitted
	#[error("invalid query: {0}")]
	InvalidQuery(String),

	/// No index of the kind can satisfy the query
	#[error("no index for query on '{0}'")]
	NoIndexForQuery(String),

	/// The caller string failed validation
	#[error("invalid caller: '{0}'")]
	InvalidCaller(String),

	/// A required property was absent
	#[error("required property not found: '{0}'")]
	RequiredPropNotFound(String),

	/// An aggregate was requested over a property of the wrong type
	#[error("invalid aggregate type for property '{0}'")]
	InvalidAggregateType(String),

	/// The operation was denied by the permission policy
	#[error("permission denied: '{caller}' may not {op} on '{object}'")]
	PermissionDenied {
		caller: String,
		op: String,
		object: String,
	},

	/// The owner's storage quota would be exceeded
	#[error("quota exceeded for owner '{0}'")]
	QuotaExceeded(String),

	/// The storage engine reported a deadlock; the request is retried
	#[error("deadlock detected")]
	Deadlock,

	/// The deadlock retry budget was exhausted
	#[error("too many retries: {0}")]
	MaxRetriesExceeded(String),

	/// An optimistic update found a different revision than expected
	#[error("revision mismatch: expected {expected}, found {found}")]
	RevMismatch {
		expected: i64,
		found: i64,
	},

	/// An object was not found where one was required
	#[error("object not found: '{0}'")]
	ObjectNotFound(String),

	/// An index entry that should exist could not be deleted
	#[error("index entry missing on delete for index {0}")]
	InternalIndexOnDel(u32),

	/// The index content disagrees with the primary store
	#[error("inconsistent index: {0}")]
	InconsistentIndex(String),

	/// A stored record header could not be parsed
	#[error("corrupt object header")]
	CorruptHeader,

	/// The transaction was already committed or aborted
	#[error("transaction already finished")]
	TxnFinished,

	/// A write was attempted on a read-only transaction
	#[error("transaction is read-only")]
	TxnReadonly,

	/// The search cursor hit its materialization cap
	#[error("search result cap exceeded ({0})")]
	SearchCapExceeded(usize),

	/// A shard id was referenced that is not known
	#[error("shard not found: {0:#x}")]
	ShardNotFound(u32),

	/// A document value cannot be used where it appeared
	#[error("unsupported value: {0}")]
	UnsupportedValue(String),

	/// The main store ran out of disk space; fatal for the process
	#[error("out of space")]
	NoSpace,

	/// Any I/O failure on the main store
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON (de)serialization failure
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// The stable numeric code reported in service responses.
	pub fn code(&self) -> i32 {
		match self {
			Error::DbNotOpen => -1000,
			Error::DbVersionMismatch {
				..
			} => -1001,
			Error::PathLocked(_) => -1002,
			Error::EngineNotRegistered(_) => -1003,
			Error::KindNotRegistered(_) => -1100,
			Error::KindNotSpecified => -1101,
			Error::InvalidKindToken(_) => -1102,
			Error::InvalidSchema(_) => -1103,
			Error::InvalidQuery(_) => -1200,
			Error::NoIndexForQuery(_) => -1201,
			Error::InvalidCaller(_) => -1202,
			Error::RequiredPropNotFound(_) => -1203,
			Error::InvalidAggregateType(_) => -1204,
			Error::PermissionDenied {
				..
			} => -1300,
			Error::QuotaExceeded(_) => -1400,
			Error::Deadlock => -1500,
			Error::MaxRetriesExceeded(_) => -1501,
			Error::RevMismatch {
				..
			} => -1502,
			Error::ObjectNotFound(_) => -1600,
			Error::InternalIndexOnDel(_) => -1700,
			Error::InconsistentIndex(_) => -1701,
			Error::CorruptHeader => -1702,
			Error::TxnFinished => -1800,
			Error::TxnReadonly => -1801,
			Error::SearchCapExceeded(_) => -1900,
			Error::ShardNotFound(_) => -2000,
			Error::UnsupportedValue(_) => -2100,
			Error::NoSpace => -3000,
			Error::Io(_) => -3001,
			Error::Json(_) => -3002,
		}
	}

	/// Whether the whole request should be retried locally.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::Deadlock)
	}

	/// Whether this failure should shut the host process down.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Error::NoSpace)
	}
}
