//! Turning a query into an index scan plan.
//!
//! The planner picks the index whose property list best covers the
//! predicates (longest match wins), folds combinable predicates into key
//! ranges — one range per equality combination, so membership operators
//! produce groups — and leaves everything else to a residual post-filter.

use crate::cnf;
use crate::err::Error;
use crate::err::Result;
use crate::idx::Index;
use crate::key;
use crate::kind::Kind;
use crate::obj;
use crate::query::filter::Filter;
use crate::query::CompOp;
use crate::query::Query;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One contiguous index-key range; the end is exclusive.
#[derive(Debug, Clone)]
pub struct KeyRange {
	pub start: Vec<u8>,
	pub end: Vec<u8>,
}

/// The executable plan for one query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
	pub kind_id: String,
	pub index_id: u32,
	pub index_prop_count: usize,
	pub ranges: Vec<KeyRange>,
	pub desc: bool,
	pub page: Option<Vec<u8>>,
}

impl QueryPlan {
	/// The lowest key this plan can touch; watchers arm on this.
	pub fn start_key(&self) -> &[u8] {
		self.ranges.first().map(|r| r.start.as_slice()).unwrap_or_default()
	}

	/// The highest key this plan can touch.
	pub fn end_key(&self) -> &[u8] {
		self.ranges.last().map(|r| r.end.as_slice()).unwrap_or_default()
	}
}

#[derive(Default)]
struct PropCon<'a> {
	eq_vals: Vec<&'a Value>,
	eq_clause: Option<usize>,
	lo: Option<(&'a Value, bool)>,
	hi: Option<(&'a Value, bool)>,
	prefix: Option<(&'a str, usize)>,
	bound_clauses: Vec<usize>,
}

impl<'a> PropCon<'a> {
	fn has_eq(&self) -> bool {
		!self.eq_vals.is_empty()
	}

	fn has_range(&self) -> bool {
		self.lo.is_some() || self.hi.is_some() || self.prefix.is_some()
	}
}

/// Build the plan plus the residual filter for a query against a kind.
pub fn build_plan(query: &Query, kind: &Arc<Kind>) -> Result<(QueryPlan, Filter)> {
	// fold clauses into per-property constraints
	let mut cons: BTreeMap<&str, PropCon> = BTreeMap::new();
	for (i, clause) in query.wheres.iter().enumerate() {
		let con = cons.entry(clause.prop.as_str()).or_default();
		match clause.op {
			CompOp::Eq if con.eq_clause.is_none() => {
				con.eq_vals.push(&clause.val);
				con.eq_clause = Some(i);
			}
			CompOp::In | CompOp::ContainsAny if con.eq_clause.is_none() => {
				con.eq_vals.extend(clause.val.as_array().into_iter().flatten());
				con.eq_clause = Some(i);
			}
			CompOp::Lt | CompOp::Le => {
				let incl = clause.op == CompOp::Le;
				let tighter = match con.hi {
					None => true,
					Some((v, _)) => obj::cmp_vals(&clause.val, v) == Ordering::Less,
				};
				if tighter {
					con.hi = Some((&clause.val, incl));
				}
				con.bound_clauses.push(i);
			}
			CompOp::Gt | CompOp::Ge => {
				let incl = clause.op == CompOp::Ge;
				let tighter = match con.lo {
					None => true,
					Some((v, _)) => obj::cmp_vals(&clause.val, v) == Ordering::Greater,
				};
				if tighter {
					con.lo = Some((&clause.val, incl));
				}
				con.bound_clauses.push(i);
			}
			CompOp::Prefix if con.prefix.is_none() => {
				con.prefix = Some((clause.val.as_str().unwrap_or_default(), i));
			}
			// second predicate on an already-claimed slot, and `!=`,
			// fall through to the post-filter
			_ => {}
		}
	}

	// choose the index with the longest covered chain; a bare scan goes
	// through the revision index, the only one dense over every row
	let indexes = kind.indexes();
	let mut best: Option<(Arc<Index>, usize, bool, usize)> = None;
	if query.wheres.is_empty() && query.order.is_none() {
		best = indexes
			.iter()
			.find(|ix| ix.prop_names().next() == Some("_rev"))
			.map(|ix| (ix.clone(), 0, false, 0));
	}
	if best.is_none() {
		for ix in &indexes {
			let props: Vec<&str> = ix.prop_names().collect();
			let mut chain = 0usize;
			while chain < props.len() && cons.get(props[chain]).is_some_and(PropCon::has_eq) {
				chain += 1;
			}
			let ranged = chain < props.len() && cons.get(props[chain]).is_some_and(PropCon::has_range);
			if let Some(order) = &query.order {
				// the order property must be covered by the scan position
				match props.iter().position(|p| *p == order.as_str()) {
					Some(pos) if pos <= chain => {}
					_ => continue,
				}
			}
			let score = chain + usize::from(ranged);
			let better = match &best {
				None => true,
				Some((_, _, _, best_score)) => score > *best_score,
			};
			if better {
				best = Some((ix.clone(), chain, ranged, score));
			}
		}
	}

	let Some((ix, chain, ranged, score)) = best else {
		return Err(Error::NoIndexForQuery(query.order.clone().unwrap_or_else(|| query.from.clone())));
	};
	if score == 0 && !query.wheres.is_empty() && query.order.is_none() {
		let prop = query.wheres.first().map(|c| c.prop.clone()).unwrap_or_default();
		return Err(Error::NoIndexForQuery(prop));
	}

	let props: Vec<&str> = ix.prop_names().collect();
	// everything not consumed by the chosen index is filtered after the
	// primary join
	let mut consumed: Vec<usize> = Vec::new();
	for prop in props.iter().take(chain) {
		if let Some(con) = cons.get(prop) {
			consumed.extend(con.eq_clause);
		}
	}
	if ranged {
		if let Some(con) = cons.get(props[chain]) {
			consumed.extend(&con.bound_clauses);
			consumed.extend(con.prefix.map(|(_, i)| i));
		}
	}
	let residual_clauses: Vec<_> = query
		.wheres
		.iter()
		.enumerate()
		.filter(|(i, _)| !consumed.contains(i))
		.map(|(_, c)| c.clone())
		.collect();
	// a tombstone-carrying index needs the deleted filtered back out
	let filter_tombstones = ix.inc_del() && !query.include_deleted;
	let filter = Filter::new(residual_clauses, filter_tombstones);

	// expand the equality chain into range groups
	let mut combos: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
	for prop in props.iter().take(chain) {
		let con = &cons[prop];
		let collator = ix.collator_for(prop);
		let mut next = Vec::with_capacity(combos.len() * con.eq_vals.len());
		for combo in &combos {
			for val in &con.eq_vals {
				let mut extended = combo.clone();
				extended.push(key::encode_val(val, collator));
				next.push(extended);
			}
		}
		if next.len() > cnf::MAX_QUERY_GROUPS {
			return Err(Error::InvalidQuery(format!(
				"query expands into more than {} ranges",
				cnf::MAX_QUERY_GROUPS
			)));
		}
		combos = next;
	}

	let mut ranges = Vec::with_capacity(combos.len());
	for combo in combos {
		let mut base = key::index_prefix(ix.id());
		for part in &combo {
			base.extend_from_slice(&key::escape_part(part));
			base.push(0x00);
		}
		let range = if ranged {
			let prop = props[chain];
			let con = &cons[prop];
			let collator = ix.collator_for(prop);
			if let Some((prefix, _)) = con.prefix {
				let open = key::encode_string_prefix(prefix, collator);
				let mut start = base.clone();
				start.extend_from_slice(&key::escape_part(&open));
				let end = successor(&start)?;
				KeyRange {
					start,
					end,
				}
			} else {
				let start = match con.lo {
					None => base.clone(),
					Some((val, incl)) => {
						let mut k = base.clone();
						k.extend_from_slice(&key::escape_part(&key::encode_val(val, collator)));
						k.push(0x00);
						if incl {
							k
						} else {
							successor(&k)?
						}
					}
				};
				let end = match con.hi {
					None => successor(&base)?,
					Some((val, incl)) => {
						let mut k = base.clone();
						k.extend_from_slice(&key::escape_part(&key::encode_val(val, collator)));
						k.push(0x00);
						if incl {
							successor(&k)?
						} else {
							k
						}
					}
				};
				KeyRange {
					start,
					end,
				}
			}
		} else {
			KeyRange {
				start: base.clone(),
				end: successor(&base)?,
			}
		};
		if range.start < range.end {
			ranges.push(range);
		}
	}
	ranges.sort_by(|a, b| a.start.cmp(&b.start));

	Ok((
		QueryPlan {
			kind_id: kind.id().to_string(),
			index_id: ix.id(),
			index_prop_count: ix.props().len(),
			ranges,
			desc: query.desc,
			page: query.page.clone(),
		},
		filter,
	))
}

fn successor(key: &[u8]) -> Result<Vec<u8>> {
	key::prefix_successor(key).ok_or_else(|| Error::InvalidQuery("degenerate key range".into()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kvs::mem::MemEngine;
	use crate::kvs::StorageEngine;
	use crate::query::CompOp;
	use serde_json::json;

	fn kind_with_indexes(decl: Value) -> Arc<Kind> {
		let engine = MemEngine::new();
		engine.open(std::path::Path::new("/tmp/plan-test")).unwrap();
		let mut txn = engine.begin(true).unwrap();
		let store = engine.open_index("indexes.db", &mut txn).unwrap();
		let kind = Arc::new(Kind::new("Employee:1", "test", 1, false, &decl).unwrap());
		let mut indexes = Vec::new();
		for (i, ix) in decl["indexes"].as_array().unwrap().iter().enumerate() {
			indexes.push(Arc::new(Index::from_decl(ix, i as u32 + 1, "en_US", store.clone()).unwrap()));
		}
		kind.set_indexes(indexes);
		txn.abort().unwrap();
		kind
	}

	fn employee_kind() -> Arc<Kind> {
		kind_with_indexes(json!({
			"id": "Employee:1",
			"owner": "test",
			"indexes": [
				{"name": "_default", "props": [{"name": "_rev"}], "incDel": true},
				{"name": "salary", "props": [{"name": "salary"}]},
				{"name": "deptAge", "props": [{"name": "dept"}, {"name": "age"}]},
			],
		}))
	}

	#[test]
	fn picks_longest_matching_index() {
		let kind = employee_kind();
		let q = Query::new("Employee:1")
			.filter("dept", CompOp::Eq, json!("HR"))
			.filter("age", CompOp::Gt, json!(30));
		let (plan, filter) = build_plan(&q, &kind).unwrap();
		assert_eq!(plan.index_id, 3);
		assert_eq!(plan.ranges.len(), 1);
		assert!(filter.is_empty());
	}

	#[test]
	fn membership_expands_into_groups() {
		let kind = employee_kind();
		let q = Query::new("Employee:1").filter("dept", CompOp::In, json!(["HR", "SW"]));
		let (plan, _) = build_plan(&q, &kind).unwrap();
		assert_eq!(plan.ranges.len(), 2);
		assert!(plan.ranges[0].start < plan.ranges[1].start);
	}

	#[test]
	fn order_requires_matching_index() {
		let kind = employee_kind();
		let q = Query::new("Employee:1").order_by("salary");
		let (plan, _) = build_plan(&q, &kind).unwrap();
		assert_eq!(plan.index_id, 2);
		let q = Query::new("Employee:1").order_by("name");
		assert!(matches!(build_plan(&q, &kind), Err(Error::NoIndexForQuery(_))));
	}

	#[test]
	fn unindexed_predicate_fails() {
		let kind = employee_kind();
		let q = Query::new("Employee:1").filter("name", CompOp::Eq, json!("x"));
		assert!(matches!(build_plan(&q, &kind), Err(Error::NoIndexForQuery(_))));
	}

	#[test]
	fn residual_predicates_reach_the_filter() {
		let kind = employee_kind();
		let q = Query::new("Employee:1")
			.filter("dept", CompOp::Eq, json!("HR"))
			.filter("dept", CompOp::Ne, json!("SW"));
		let (_, filter) = build_plan(&q, &kind).unwrap();
		assert!(!filter.is_empty());
	}

	#[test]
	fn from_only_query_scans_rev_index() {
		let kind = employee_kind();
		let q = Query::new("Employee:1");
		let (plan, filter) = build_plan(&q, &kind).unwrap();
		assert_eq!(plan.index_id, 1);
		// the rev index carries tombstones, so the filter drops them
		assert!(!filter.is_empty());
	}
}
