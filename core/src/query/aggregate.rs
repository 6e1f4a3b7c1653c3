//! Streaming aggregation over a matching document set.
//!
//! One pass folds every document into its bucket; buckets are keyed by
//! the exact values at the `groupBy` paths (array values fan out, one
//! bucket per element) and the result is sorted by group key ascending.

use crate::err::Error;
use crate::err::Result;
use crate::key;
use crate::obj;
use crate::query::AggregateSpec;
use serde_json::json;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Default)]
struct PropAcc {
	cnt: u64,
	min: Option<Value>,
	max: Option<Value>,
	sum_int: i64,
	sum_float: f64,
	all_int: bool,
	num_count: u64,
	first: Option<(Value, Value)>,
	last: Option<(Value, Value)>,
}

struct Group {
	label: Option<Value>,
	props: BTreeMap<String, PropAcc>,
}

/// Fold the documents and emit the per-group result array.
pub fn run_aggregate(spec: &AggregateSpec, docs: &[Value]) -> Result<Value> {
	let mut groups: BTreeMap<Vec<u8>, Group> = BTreeMap::new();
	for doc in docs {
		for (bucket_key, label) in buckets(spec, doc) {
			let group = groups.entry(bucket_key).or_insert_with(|| Group {
				label,
				props: BTreeMap::new(),
			});
			fold(spec, doc, group)?;
		}
	}
	let mut out = Vec::with_capacity(groups.len());
	for group in groups.into_values() {
		let mut entry = Map::new();
		if let Some(label) = group.label {
			entry.insert("groupBy".to_string(), label);
		}
		for (prop, acc) in group.props {
			let mut agg = Map::new();
			if spec.cnt.contains(&prop) {
				agg.insert("cnt".to_string(), json!(acc.cnt));
			}
			if spec.min.contains(&prop) {
				if let Some(min) = acc.min {
					agg.insert("min".to_string(), min);
				}
			}
			if spec.max.contains(&prop) {
				if let Some(max) = acc.max {
					agg.insert("max".to_string(), max);
				}
			}
			if spec.sum.contains(&prop) {
				let sum = if acc.all_int {
					json!(acc.sum_int)
				} else {
					json!(acc.sum_float)
				};
				agg.insert("sum".to_string(), sum);
			}
			if spec.avg.contains(&prop) && acc.num_count > 0 {
				let total = if acc.all_int {
					acc.sum_int as f64
				} else {
					acc.sum_float
				};
				let avg = total / acc.num_count as f64;
				agg.insert("avg".to_string(), Number::from_f64(avg).map(Value::Number).unwrap_or(Value::Null));
			}
			if spec.first.contains(&prop) {
				if let Some((_, doc)) = acc.first {
					agg.insert("first".to_string(), doc);
				}
			}
			if spec.last.contains(&prop) {
				if let Some((_, doc)) = acc.last {
					agg.insert("last".to_string(), doc);
				}
			}
			entry.insert(prop, Value::Object(agg));
		}
		out.push(Value::Object(entry));
	}
	Ok(Value::Array(out))
}

/// The buckets one document lands in: the cartesian product over the
/// groupBy paths, fanning arrays out one bucket per element.
fn buckets(spec: &AggregateSpec, doc: &Value) -> Vec<(Vec<u8>, Option<Value>)> {
	if spec.group_by.is_empty() {
		return vec![(Vec::new(), None)];
	}
	let mut combos: Vec<(Vec<u8>, Map<String, Value>)> = vec![(Vec::new(), Map::new())];
	for path in &spec.group_by {
		let val = obj::path_val(doc, path).cloned().unwrap_or(Value::Null);
		let alternatives: Vec<Value> = match val {
			Value::Array(items) if !items.is_empty() => items,
			other => vec![other],
		};
		let mut next = Vec::with_capacity(combos.len() * alternatives.len());
		for (bucket_key, label) in &combos {
			for alt in &alternatives {
				let mut key = bucket_key.clone();
				key.extend(key::encode_val(alt, None));
				key.push(0x00);
				let mut label = label.clone();
				label.insert(path.clone(), alt.clone());
				next.push((key, label));
			}
		}
		combos = next;
	}
	combos.into_iter().map(|(key, label)| (key, Some(Value::Object(label)))).collect()
}

fn fold(spec: &AggregateSpec, doc: &Value, group: &mut Group) -> Result<()> {
	for prop in &spec.cnt {
		if obj::path_val(doc, prop).is_some() {
			group.props.entry(prop.clone()).or_default().cnt += 1;
		}
	}
	for prop in spec.min.iter().chain(&spec.max) {
		let Some(val) = obj::path_val(doc, prop) else { continue };
		if !val.is_number() && !val.is_string() {
			return Err(Error::InvalidAggregateType(prop.clone()));
		}
		let acc = group.props.entry(prop.clone()).or_default();
		if spec.min.contains(prop) {
			let smaller = acc.min.as_ref().map_or(true, |m| obj::cmp_vals(val, m) == Ordering::Less);
			if smaller {
				acc.min = Some(val.clone());
			}
		}
		if spec.max.contains(prop) {
			let larger = acc.max.as_ref().map_or(true, |m| obj::cmp_vals(val, m) == Ordering::Greater);
			if larger {
				acc.max = Some(val.clone());
			}
		}
	}
	for prop in spec.sum.iter().chain(&spec.avg) {
		let Some(val) = obj::path_val(doc, prop) else { continue };
		let Some(num) = val.as_f64() else {
			return Err(Error::InvalidAggregateType(prop.clone()));
		};
		let acc = group.props.entry(prop.clone()).or_default();
		if acc.num_count == 0 {
			acc.all_int = true;
		}
		match val.as_i64() {
			Some(i) if acc.all_int => acc.sum_int += i,
			_ => {
				if acc.all_int {
					acc.all_int = false;
					acc.sum_float = acc.sum_int as f64;
				}
				acc.sum_float += num;
			}
		}
		acc.num_count += 1;
	}
	for prop in spec.first.iter().chain(&spec.last) {
		let Some(val) = obj::path_val(doc, prop) else { continue };
		let acc = group.props.entry(prop.clone()).or_default();
		if spec.first.contains(prop) {
			let earlier = acc.first.as_ref().map_or(true, |(v, _)| obj::cmp_vals(val, v) == Ordering::Less);
			if earlier {
				acc.first = Some((val.clone(), doc.clone()));
			}
		}
		if spec.last.contains(prop) {
			let later = acc.last.as_ref().map_or(true, |(v, _)| obj::cmp_vals(val, v) != Ordering::Less);
			if later {
				acc.last = Some((val.clone(), doc.clone()));
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::query::Query;
	use serde_json::json;

	fn staff() -> Vec<Value> {
		vec![
			json!({"dept": "HR", "salary": 500, "age": 39, "penalty": 10}),
			json!({"dept": "SW", "salary": 310, "age": 25}),
			json!({"dept": "SW", "salary": 400, "age": 45, "penalty": 0}),
			json!({"dept": "HR", "salary": 190, "age": 23, "penalty": 25}),
		]
	}

	fn spec(v: Value) -> AggregateSpec {
		Query::from_value(&json!({"from": "K:1", "aggregate": v})).unwrap().aggregate.unwrap()
	}

	#[test]
	fn plain_aggregates() {
		let spec = spec(json!({
			"cnt": ["penalty", "age"],
			"min": ["salary"],
			"max": ["salary"],
			"sum": ["salary"],
			"avg": ["salary"],
			"first": ["age"],
			"last": ["age"],
		}));
		let out = run_aggregate(&spec, &staff()).unwrap();
		let row = &out.as_array().unwrap()[0];
		// cnt counts only documents carrying the property
		assert_eq!(row["penalty"]["cnt"], json!(3));
		assert_eq!(row["age"]["cnt"], json!(4));
		assert_eq!(row["salary"]["min"], json!(190));
		assert_eq!(row["salary"]["max"], json!(500));
		assert_eq!(row["salary"]["sum"], json!(1400));
		assert_eq!(row["salary"]["avg"], json!(350.0));
		// first and last carry the whole document
		assert_eq!(row["age"]["first"]["age"], json!(23));
		assert_eq!(row["age"]["last"]["age"], json!(45));
	}

	#[test]
	fn group_by_buckets_sorted_by_key() {
		let spec = spec(json!({"sum": ["salary"], "groupBy": ["dept"]}));
		let out = run_aggregate(&spec, &staff()).unwrap();
		let rows = out.as_array().unwrap();
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[0]["groupBy"], json!({"dept": "HR"}));
		assert_eq!(rows[0]["salary"]["sum"], json!(690));
		assert_eq!(rows[1]["groupBy"], json!({"dept": "SW"}));
		assert_eq!(rows[1]["salary"]["sum"], json!(710));
	}

	#[test]
	fn array_group_by_fans_out() {
		let spec = spec(json!({"cnt": ["x"], "groupBy": ["tags"]}));
		let docs = vec![json!({"x": 1, "tags": ["a", "b"]}), json!({"x": 1, "tags": ["b"]})];
		let out = run_aggregate(&spec, &docs).unwrap();
		let rows = out.as_array().unwrap();
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[0]["groupBy"], json!({"tags": "a"}));
		assert_eq!(rows[0]["x"]["cnt"], json!(1));
		assert_eq!(rows[1]["groupBy"], json!({"tags": "b"}));
		assert_eq!(rows[1]["x"]["cnt"], json!(2));
	}

	#[test]
	fn sum_rejects_non_numeric() {
		let spec = spec(json!({"sum": ["dept"]}));
		let err = run_aggregate(&spec, &staff()).unwrap_err();
		assert!(matches!(err, Error::InvalidAggregateType(p) if p == "dept"));
	}

	#[test]
	fn min_rejects_objects() {
		let spec = spec(json!({"min": ["nested"]}));
		let docs = vec![json!({"nested": {"x": 1}})];
		assert!(run_aggregate(&spec, &docs).is_err());
	}

	#[test]
	fn float_sums_promote() {
		let spec = spec(json!({"sum": ["v"], "avg": ["v"]}));
		let docs = vec![json!({"v": 1}), json!({"v": 2.5})];
		let out = run_aggregate(&spec, &docs).unwrap();
		let row = &out.as_array().unwrap()[0];
		assert_eq!(row["v"]["sum"], json!(3.5));
		assert_eq!(row["v"]["avg"], json!(1.75));
	}
}
