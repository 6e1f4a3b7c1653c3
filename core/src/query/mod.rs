//! The declarative query model and its execution machinery.

pub mod aggregate;
pub mod cursor;
pub mod filter;
pub mod plan;
pub mod search;
pub mod storage;

pub use self::cursor::FindResult;
pub use self::filter::Filter;
pub use self::plan::QueryPlan;
pub use self::storage::StorageQuery;

use crate::cnf;
use crate::err::Error;
use crate::err::Result;
use crate::key::Collation;
use base64::engine::general_purpose::STANDARD_NO_PAD as B64;
use base64::Engine as _;
use serde_json::Value;

/// A comparison operator in a where clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	/// String prefix match.
	Prefix,
	/// Scalar property is a member of the given array.
	In,
	/// Array property shares at least one element with the given array.
	ContainsAny,
}

impl CompOp {
	pub fn parse(op: &str) -> Result<CompOp> {
		Ok(match op {
			"=" => CompOp::Eq,
			"!=" => CompOp::Ne,
			"<" => CompOp::Lt,
			"<=" => CompOp::Le,
			">" => CompOp::Gt,
			">=" => CompOp::Ge,
			"prefix" => CompOp::Prefix,
			"in" | "IN" => CompOp::In,
			"%" => CompOp::ContainsAny,
			_ => return Err(Error::InvalidQuery(format!("unknown operator '{op}'"))),
		})
	}
}

/// One predicate of a query.
#[derive(Debug, Clone)]
pub struct WhereClause {
	pub prop: String,
	pub op: CompOp,
	pub val: Value,
	pub collation: Option<Collation>,
}

/// The aggregate specification of a query.
#[derive(Debug, Clone, Default)]
pub struct AggregateSpec {
	pub cnt: Vec<String>,
	pub min: Vec<String>,
	pub max: Vec<String>,
	pub sum: Vec<String>,
	pub avg: Vec<String>,
	pub first: Vec<String>,
	pub last: Vec<String>,
	pub group_by: Vec<String>,
}

impl AggregateSpec {
	pub fn is_empty(&self) -> bool {
		self.cnt.is_empty()
			&& self.min.is_empty()
			&& self.max.is_empty()
			&& self.sum.is_empty()
			&& self.avg.is_empty()
			&& self.first.is_empty()
			&& self.last.is_empty()
	}
}

/// A parsed, validated query.
#[derive(Debug, Clone, Default)]
pub struct Query {
	pub from: String,
	pub wheres: Vec<WhereClause>,
	pub order: Option<String>,
	pub limit: Option<u32>,
	pub desc: bool,
	pub distinct: Option<String>,
	pub page: Option<Vec<u8>>,
	pub select: Vec<String>,
	pub aggregate: Option<AggregateSpec>,
	pub include_deleted: bool,
	pub include_inactive_shards: bool,
}

impl Query {
	/// A bare query over one kind.
	pub fn new(from: &str) -> Query {
		Query {
			from: from.to_string(),
			..Query::default()
		}
	}

	pub fn filter(mut self, prop: &str, op: CompOp, val: Value) -> Query {
		self.wheres.push(WhereClause {
			prop: prop.to_string(),
			op,
			val,
			collation: None,
		});
		self
	}

	pub fn order_by(mut self, prop: &str) -> Query {
		self.order = Some(prop.to_string());
		self
	}

	pub fn descending(mut self) -> Query {
		self.desc = true;
		self
	}

	pub fn with_limit(mut self, limit: u32) -> Query {
		self.limit = Some(limit);
		self
	}

	/// The effective result limit.
	pub fn limit_or_default(&self) -> u32 {
		self.limit.unwrap_or(cnf::FIND_LIMIT_DEFAULT)
	}

	/// Parse the request envelope form of a query.
	pub fn from_value(val: &Value) -> Result<Query> {
		let from = val
			.get("from")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::InvalidQuery("missing 'from'".into()))?
			.to_string();
		let mut wheres = Vec::new();
		if let Some(clauses) = val.get("where") {
			let clauses = clauses.as_array().ok_or_else(|| Error::InvalidQuery("'where' must be an array".into()))?;
			for clause in clauses {
				let prop = clause
					.get("prop")
					.and_then(Value::as_str)
					.ok_or_else(|| Error::InvalidQuery("where clause missing 'prop'".into()))?;
				let op = clause
					.get("op")
					.and_then(Value::as_str)
					.ok_or_else(|| Error::InvalidQuery("where clause missing 'op'".into()))?;
				let mut op = CompOp::parse(op)?;
				let cmp_val = clause.get("val").cloned().unwrap_or(Value::Null);
				// an equality against an array is membership
				if op == CompOp::Eq && cmp_val.is_array() {
					op = CompOp::In;
				}
				let collation = match clause.get("collate").and_then(Value::as_str) {
					None => None,
					Some(c) => Some(
						serde_json::from_value(Value::String(c.to_string()))
							.map_err(|_| Error::InvalidQuery(format!("bad collation '{c}'")))?,
					),
				};
				wheres.push(WhereClause {
					prop: prop.to_string(),
					op,
					val: cmp_val,
					collation,
				});
			}
		}
		let order = val
			.get("orderBy")
			.or_else(|| val.get("order"))
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
			.map(str::to_string);
		let limit = match val.get("limit") {
			None => None,
			Some(l) => Some(
				l.as_u64()
					.filter(|&l| l <= u32::MAX as u64)
					.ok_or_else(|| Error::InvalidQuery("bad 'limit'".into()))? as u32,
			),
		};
		let page = match val.get("page").and_then(Value::as_str) {
			None => None,
			Some(p) => Some(B64.decode(p).map_err(|_| Error::InvalidQuery("bad 'page' token".into()))?),
		};
		let select = match val.get("select") {
			None => Vec::new(),
			Some(Value::Array(items)) => items
				.iter()
				.map(|s| s.as_str().map(str::to_string).ok_or_else(|| Error::InvalidQuery("bad 'select'".into())))
				.collect::<Result<_>>()?,
			Some(_) => return Err(Error::InvalidQuery("'select' must be an array".into())),
		};
		let aggregate = match val.get("aggregate") {
			None => None,
			Some(spec) => Some(parse_aggregate(spec)?),
		};
		let query = Query {
			from,
			wheres,
			order,
			limit,
			desc: val.get("desc").and_then(Value::as_bool).unwrap_or(false),
			distinct: val.get("distinct").and_then(Value::as_str).map(str::to_string),
			page,
			select,
			aggregate,
			include_deleted: val.get("incDel").and_then(Value::as_bool).unwrap_or(false),
			include_inactive_shards: val.get("incInactive").and_then(Value::as_bool).unwrap_or(false),
		};
		query.validate()?;
		Ok(query)
	}

	pub fn validate(&self) -> Result<()> {
		if self.from.is_empty() {
			return Err(Error::InvalidQuery("missing 'from'".into()));
		}
		for clause in &self.wheres {
			match clause.op {
				CompOp::In | CompOp::ContainsAny => {
					let ok = clause.val.as_array().is_some_and(|a| !a.is_empty());
					if !ok {
						return Err(Error::InvalidQuery(format!(
							"operator on '{}' needs a non-empty array",
							clause.prop
						)));
					}
				}
				CompOp::Prefix => {
					if !clause.val.is_string() {
						return Err(Error::InvalidQuery(format!("prefix on '{}' needs a string", clause.prop)));
					}
				}
				_ => {}
			}
		}
		if let (Some(agg), Some(_)) = (&self.aggregate, &self.order) {
			if !agg.is_empty() {
				return Err(Error::InvalidQuery("aggregate queries cannot order".into()));
			}
		}
		Ok(())
	}
}

fn string_list(val: &Value, key: &str) -> Result<Vec<String>> {
	match val.get(key) {
		None => Ok(Vec::new()),
		Some(Value::String(s)) => Ok(vec![s.clone()]),
		Some(Value::Array(items)) => items
			.iter()
			.map(|s| {
				s.as_str()
					.map(str::to_string)
					.ok_or_else(|| Error::InvalidQuery(format!("bad aggregate '{key}'")))
			})
			.collect(),
		Some(_) => Err(Error::InvalidQuery(format!("bad aggregate '{key}'"))),
	}
}

fn parse_aggregate(spec: &Value) -> Result<AggregateSpec> {
	let agg = AggregateSpec {
		cnt: string_list(spec, "cnt")?,
		min: string_list(spec, "min")?,
		max: string_list(spec, "max")?,
		sum: string_list(spec, "sum")?,
		avg: string_list(spec, "avg")?,
		first: string_list(spec, "first")?,
		last: string_list(spec, "last")?,
		group_by: string_list(spec, "groupBy")?,
	};
	if agg.is_empty() && agg.group_by.is_empty() {
		return Err(Error::InvalidQuery("empty aggregate".into()));
	}
	Ok(agg)
}

/// Encode a page token for the response envelope.
pub fn page_token(key: &[u8]) -> String {
	B64.encode(key)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn parse_full_envelope() {
		let q = Query::from_value(&json!({
			"from": "Employee:1",
			"where": [
				{"prop": "dept", "op": "=", "val": "HR"},
				{"prop": "age", "op": ">", "val": 30},
			],
			"orderBy": "age",
			"limit": 10,
			"desc": true,
			"select": ["name", "age"],
		}))
		.unwrap();
		assert_eq!(q.from, "Employee:1");
		assert_eq!(q.wheres.len(), 2);
		assert_eq!(q.wheres[0].op, CompOp::Eq);
		assert_eq!(q.wheres[1].op, CompOp::Gt);
		assert_eq!(q.order.as_deref(), Some("age"));
		assert!(q.desc);
	}

	#[test]
	fn equality_on_array_becomes_membership() {
		let q = Query::from_value(&json!({
			"from": "K:1",
			"where": [{"prop": "x", "op": "=", "val": [1, 2, 3]}],
		}))
		.unwrap();
		assert_eq!(q.wheres[0].op, CompOp::In);
	}

	#[test]
	fn invalid_queries_are_rejected() {
		assert!(Query::from_value(&json!({})).is_err());
		assert!(Query::from_value(&json!({
			"from": "K:1",
			"where": [{"prop": "x", "op": "~", "val": 1}],
		}))
		.is_err());
		assert!(Query::from_value(&json!({
			"from": "K:1",
			"where": [{"prop": "x", "op": "%", "val": 1}],
		}))
		.is_err());
		assert!(Query::from_value(&json!({
			"from": "K:1",
			"aggregate": {},
		}))
		.is_err());
	}
}
