#![allow(dead_code)]

use mojodb_core::Db;
use mojodb_core::DbReq;
use serde_json::json;
use serde_json::Value;
use std::path::Path;

pub fn open_db(dir: &Path) -> Db {
	Db::open(dir, &json!({})).unwrap()
}

pub fn admin() -> DbReq {
	DbReq::admin()
}

pub fn put_kind(db: &Db, decl: Value) {
	db.put_kind(decl, &mut admin()).unwrap();
}

/// A kind with a plain secondary index on `salary`.
pub fn employee_kind(db: &Db) {
	put_kind(
		db,
		json!({
			"id": "Employee:1",
			"owner": "com.test",
			"indexes": [
				{"name": "salary", "props": [{"name": "salary"}]},
				{"name": "deptAge", "props": [{"name": "dept"}, {"name": "age"}]},
			],
		}),
	);
}

pub fn put_employee(db: &Db, salary: i64, dept: &str, age: i64) -> String {
	let (id, _rev) = db
		.put(
			json!({"_kind": "Employee:1", "salary": salary, "dept": dept, "age": age}),
			&mut admin(),
		)
		.unwrap();
	id
}

pub fn salaries(results: &[Value]) -> Vec<i64> {
	results.iter().map(|doc| doc["salary"].as_i64().unwrap()).collect()
}
