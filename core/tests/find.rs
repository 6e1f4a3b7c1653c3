mod common;

use common::*;
use mojodb_core::query::CompOp;
use mojodb_core::Query;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn secondary_index_scan_with_order() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	put_employee(&db, 500, "HR", 39);
	put_employee(&db, 310, "SW", 25);
	put_employee(&db, 400, "SW", 45);

	let query = Query::new("Employee:1").order_by("salary");
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(salaries(&found.results), vec![310, 400, 500]);

	let query = Query::new("Employee:1").order_by("salary").descending();
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(salaries(&found.results), vec![500, 400, 310]);
}

#[test]
fn compound_predicate_with_range_and_equality() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	put_employee(&db, 100, "HR", 25);
	put_employee(&db, 200, "HR", 40);
	put_employee(&db, 300, "SW", 30);

	let query = Query::new("Employee:1")
		.filter("dept", CompOp::Eq, json!("HR"))
		.filter("age", CompOp::Gt, json!(30));
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 1);
	assert_eq!(found.results[0]["age"], json!(40));
	assert_eq!(found.results[0]["dept"], json!("HR"));
}

#[test]
fn membership_and_residual_predicates() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	put_employee(&db, 100, "HR", 25);
	put_employee(&db, 200, "SW", 40);
	put_employee(&db, 300, "QA", 30);

	// IN expands into groups, each dept one range
	let query = Query::new("Employee:1").filter("dept", CompOp::In, json!(["HR", "QA"]));
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 2);

	// != is residual and filters after the primary join
	let query = Query::new("Employee:1")
		.filter("salary", CompOp::Ge, json!(100))
		.filter("dept", CompOp::Ne, json!("SW"));
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 2);
	assert!(found.results.iter().all(|doc| doc["dept"] != json!("SW")));
}

#[test]
fn prefix_scan_over_strings() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	put_kind(
		&db,
		json!({
			"id": "Note:1",
			"owner": "com.test",
			"indexes": [{"name": "title", "props": [{"name": "title"}]}],
		}),
	);
	for title in ["alpha", "alps", "beta", "alphabet"] {
		db.put(json!({"_kind": "Note:1", "title": title}), &mut admin()).unwrap();
	}
	let query = Query::new("Note:1").filter("title", CompOp::Prefix, json!("alp"));
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 3);
	let query = Query::new("Note:1").filter("title", CompOp::Prefix, json!("alpha"));
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 2);
}

#[test]
fn pagination_round_trip() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	for salary in [10, 20, 30, 40, 50] {
		put_employee(&db, salary, "HR", 30);
	}
	let query = Query::new("Employee:1").order_by("salary").with_limit(2);
	let page1 = db.find(&query, &mut admin()).unwrap();
	assert_eq!(salaries(&page1.results), vec![10, 20]);
	let mut query = query.clone();
	query.page = page1.next_page.clone();
	let page2 = db.find(&query, &mut admin()).unwrap();
	assert_eq!(salaries(&page2.results), vec![30, 40]);
	let mut query = query.clone();
	query.page = page2.next_page.clone();
	let page3 = db.find(&query, &mut admin()).unwrap();
	assert_eq!(salaries(&page3.results), vec![50]);
	assert!(page3.next_page.is_none());
}

#[test]
fn query_round_trip_finds_each_inserted_doc_once() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	let id = put_employee(&db, 750, "HR", 51);
	let query = Query::new("Employee:1").filter("salary", CompOp::Eq, json!(750));
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 1);
	assert_eq!(found.results[0]["_id"], json!(id));
}

#[test]
fn select_projects_fields() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	put_employee(&db, 500, "HR", 39);
	let mut query = Query::new("Employee:1").order_by("salary");
	query.select = vec!["salary".to_string()];
	let found = db.find(&query, &mut admin()).unwrap();
	let doc = &found.results[0];
	assert_eq!(doc["salary"], json!(500));
	assert!(doc.get("dept").is_none());
	// the id always rides along
	assert!(doc.get("_id").is_some());
}

#[test]
fn search_cursor_orders_unindexed_property() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	let (id_c, _) = db.put(json!({"_kind": "Employee:1", "name": "carol", "salary": 1}), &mut admin()).unwrap();
	let (id_a, _) = db.put(json!({"_kind": "Employee:1", "name": "alice", "salary": 2}), &mut admin()).unwrap();
	let (id_b, _) = db.put(json!({"_kind": "Employee:1", "name": "bob", "salary": 3}), &mut admin()).unwrap();
	// no index covers `name`: the cursor materializes and sorts
	let query = Query::new("Employee:1").order_by("name");
	let found = db.find(&query, &mut admin()).unwrap();
	let ids: Vec<&str> = found.results.iter().map(|d| d["_id"].as_str().unwrap()).collect();
	assert_eq!(ids, vec![id_a.as_str(), id_b.as_str(), id_c.as_str()]);
}

#[test]
fn distinct_folds_duplicates() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	for dept in ["HR", "SW", "HR", "QA", "SW"] {
		put_employee(&db, 100, dept, 30);
	}
	let mut query = Query::new("Employee:1");
	query.distinct = Some("dept".to_string());
	let found = db.find(&query, &mut admin()).unwrap();
	let depts: Vec<&str> = found.results.iter().map(|d| d["dept"].as_str().unwrap()).collect();
	assert_eq!(depts, vec!["HR", "QA", "SW"]);
}

#[test]
fn tombstones_are_invisible_to_normal_queries() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	let id = put_employee(&db, 500, "HR", 39);
	put_employee(&db, 400, "SW", 25);
	assert!(db.del(&id, false, &mut admin()).unwrap());

	let query = Query::new("Employee:1").order_by("salary");
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(salaries(&found.results), vec![400]);

	// but an incDel query over the rev index still sees them
	let mut query = Query::new("Employee:1");
	query.include_deleted = true;
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 2);
}

#[test]
fn unindexed_predicate_is_rejected() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	let query = Query::new("Employee:1").filter("shoeSize", CompOp::Eq, json!(43));
	let err = db.find(&query, &mut admin()).unwrap_err();
	assert!(matches!(err, mojodb_core::Error::NoIndexForQuery(_)));
}

#[test]
fn revisions_increase_monotonically() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	let (id, rev1) = db.put(json!({"_kind": "Employee:1", "salary": 1}), &mut admin()).unwrap();
	let doc = db.get(&id, &mut admin()).unwrap().unwrap();
	let (_, rev2) = db.put(doc, &mut admin()).unwrap();
	assert!(rev2 > rev1);
	let (_, rev3) = db.put(json!({"_kind": "Employee:1", "salary": 2}), &mut admin()).unwrap();
	assert!(rev3 > rev2);
}
