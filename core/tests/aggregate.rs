mod common;

use common::*;
use mojodb_core::Query;
use serde_json::json;
use serde_json::Value;
use tempfile::tempdir;

fn seed(db: &mojodb_core::Db) {
	put_kind(
		db,
		json!({
			"id": "Staff:1",
			"owner": "com.test",
			"indexes": [{"name": "branch", "props": [{"name": "department.branch"}]}],
		}),
	);
	let rows = [
		("HR", 39, 500, Some(10), 180.0),
		("SWP", 25, 310, None, 167.8),
		("SWP", 45, 400, Some(0), 175.0),
		("HR", 23, 190, Some(25), 172.3),
		("SWP", 34, 600, Some(10), 155.9),
		("HR", 29, 450, None, 182.1),
	];
	for (branch, age, salary, penalty, tall) in rows {
		let mut doc = json!({
			"_kind": "Staff:1",
			"department": {"head": "CTO", "branch": branch},
			"age": age,
			"salary": salary,
			"tall": tall,
		});
		if let Some(penalty) = penalty {
			doc["penalty"] = json!(penalty);
		}
		db.put(doc, &mut admin()).unwrap();
	}
}

fn aggregate(db: &mojodb_core::Db, spec: Value) -> Vec<Value> {
	let query = Query::from_value(&json!({"from": "Staff:1", "aggregate": spec})).unwrap();
	db.find(&query, &mut admin()).unwrap().results
}

#[test]
fn whole_kind_aggregates() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	seed(&db);
	let rows = aggregate(
		&db,
		json!({
			"cnt": ["penalty", "age"],
			"min": ["salary"],
			"max": ["salary"],
			"sum": ["salary"],
			"avg": ["tall"],
			"first": ["age"],
			"last": ["age"],
		}),
	);
	assert_eq!(rows.len(), 1);
	let row = &rows[0];
	assert_eq!(row["penalty"]["cnt"], json!(4));
	assert_eq!(row["age"]["cnt"], json!(6));
	assert_eq!(row["salary"]["min"], json!(190));
	assert_eq!(row["salary"]["max"], json!(600));
	assert_eq!(row["salary"]["sum"], json!(2450));
	// first and last carry the whole winning document
	assert_eq!(row["age"]["first"]["age"], json!(23));
	assert_eq!(row["age"]["last"]["age"], json!(45));
	let avg = row["tall"]["avg"].as_f64().unwrap();
	assert!((avg - 172.183).abs() < 0.01);
}

#[test]
fn group_by_nested_path() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	seed(&db);
	let rows = aggregate(
		&db,
		json!({
			"avg": ["salary"],
			"min": ["penalty"],
			"max": ["penalty"],
			"groupBy": ["department.branch"],
		}),
	);
	assert_eq!(rows.len(), 2);
	// groups come back sorted by group key
	assert_eq!(rows[0]["groupBy"], json!({"department.branch": "HR"}));
	assert_eq!(rows[0]["penalty"]["min"], json!(10));
	assert_eq!(rows[0]["penalty"]["max"], json!(25));
	assert_eq!(rows[0]["salary"]["avg"].as_f64().unwrap(), 380.0);
	assert_eq!(rows[1]["groupBy"], json!({"department.branch": "SWP"}));
	assert!((rows[1]["salary"]["avg"].as_f64().unwrap() - 436.666).abs() < 0.01);
}

#[test]
fn aggregate_respects_predicates() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	seed(&db);
	let query = Query::from_value(&json!({
		"from": "Staff:1",
		"where": [{"prop": "department.branch", "op": "=", "val": "HR"}],
		"aggregate": {"cnt": ["age"]},
	}))
	.unwrap();
	let rows = db.find(&query, &mut admin()).unwrap().results;
	assert_eq!(rows[0]["age"]["cnt"], json!(3));
}

#[test]
fn non_numeric_sum_is_rejected() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	seed(&db);
	let query = Query::from_value(&json!({
		"from": "Staff:1",
		"aggregate": {"sum": ["department.branch"]},
	}))
	.unwrap();
	let err = db.find(&query, &mut admin()).unwrap_err();
	assert!(matches!(err, mojodb_core::Error::InvalidAggregateType(_)));
}
