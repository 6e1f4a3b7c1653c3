mod common;

use common::*;
use mojodb_core::kvs::mem::MemEngine;
use mojodb_core::query::CompOp;
use mojodb_core::Db;
use mojodb_core::Error;
use mojodb_core::Query;
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn adding_an_index_backfills_existing_rows() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	put_kind(
		&db,
		json!({
			"id": "Contact:1",
			"owner": "com.test",
			"indexes": [{"name": "name", "props": [{"name": "name"}]}],
		}),
	);
	db.put(json!({"_kind": "Contact:1", "name": "ann", "city": "Seoul"}), &mut admin()).unwrap();
	db.put(json!({"_kind": "Contact:1", "name": "bob", "city": "Busan"}), &mut admin()).unwrap();

	// a city query has no index yet
	let by_city = Query::new("Contact:1").filter("city", CompOp::Eq, json!("Seoul"));
	assert!(db.find(&by_city, &mut admin()).is_err());

	// updating the kind builds the new index over the existing rows
	put_kind(
		&db,
		json!({
			"id": "Contact:1",
			"owner": "com.test",
			"indexes": [
				{"name": "name", "props": [{"name": "name"}]},
				{"name": "city", "props": [{"name": "city"}]},
			],
		}),
	);
	let found = db.find(&by_city, &mut admin()).unwrap();
	assert_eq!(found.count, 1);
	assert_eq!(found.results[0]["name"], json!("ann"));
}

#[test]
fn dropping_an_index_stops_serving_it() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	put_kind(
		&db,
		json!({
			"id": "Contact:1",
			"owner": "com.test",
			"indexes": [
				{"name": "name", "props": [{"name": "name"}]},
				{"name": "city", "props": [{"name": "city"}]},
			],
		}),
	);
	db.put(json!({"_kind": "Contact:1", "name": "ann", "city": "Seoul"}), &mut admin()).unwrap();
	put_kind(
		&db,
		json!({
			"id": "Contact:1",
			"owner": "com.test",
			"indexes": [{"name": "name", "props": [{"name": "name"}]}],
		}),
	);
	let by_city = Query::new("Contact:1").filter("city", CompOp::Eq, json!("Seoul"));
	assert!(matches!(db.find(&by_city, &mut admin()), Err(Error::NoIndexForQuery(_))));
	// the surviving index still works
	let by_name = Query::new("Contact:1").filter("name", CompOp::Eq, json!("ann"));
	assert_eq!(db.find(&by_name, &mut admin()).unwrap().count, 1);
}

#[test]
fn del_kind_removes_rows_and_registration() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	employee_kind(&db);
	let id = put_employee(&db, 100, "HR", 30);
	assert!(db.del_kind("Employee:1", &mut admin()).unwrap());
	assert!(db.get(&id, &mut admin()).unwrap().is_none());
	assert!(matches!(
		db.find(&Query::new("Employee:1"), &mut admin()),
		Err(Error::KindNotRegistered(_))
	));
	// deleting again reports absence
	assert!(!db.del_kind("Employee:1", &mut admin()).unwrap());
}

#[test]
fn extends_makes_parent_queries_polymorphic() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	put_kind(
		&db,
		json!({
			"id": "Media:1",
			"owner": "com.test",
			"indexes": [{"name": "title", "props": [{"name": "title"}]}],
		}),
	);
	put_kind(
		&db,
		json!({
			"id": "Audio:1",
			"owner": "com.test",
			"extends": ["Media:1"],
			"indexes": [{"name": "artist", "props": [{"name": "artist"}]}],
		}),
	);
	db.put(json!({"_kind": "Media:1", "title": "clip"}), &mut admin()).unwrap();
	db.put(json!({"_kind": "Audio:1", "title": "song", "artist": "ann"}), &mut admin()).unwrap();

	// the parent's index carries the child's rows
	let query = Query::new("Media:1").order_by("title");
	let found = db.find(&query, &mut admin()).unwrap();
	assert_eq!(found.count, 2);
	// a child query sees only child rows
	let query = Query::new("Audio:1").filter("artist", CompOp::Eq, json!("ann"));
	assert_eq!(db.find(&query, &mut admin()).unwrap().count, 1);

	// a parent with live children refuses deletion; leaves first
	assert!(db.del_kind("Media:1", &mut admin()).is_err());
	assert!(db.recursive_del_kind("Media:1", &mut admin()).unwrap());
	assert!(!db.kind_engine().has_kind("Audio:1"));
}

#[test]
fn kind_documents_and_tokens_survive_reopen() {
	let dir = tempdir().unwrap();
	let engine = Arc::new(MemEngine::new());
	let id;
	{
		let db = Db::open_with_engine(dir.path(), engine.clone(), &json!({})).unwrap();
		employee_kind(&db);
		id = put_employee(&db, 123, "HR", 30);
		db.close().unwrap();
	}
	let db = Db::open_with_engine(dir.path(), engine, &json!({})).unwrap();
	// the kind is back, and old records still decode
	let doc = db.get(&id, &mut admin()).unwrap().unwrap();
	assert_eq!(doc["salary"], json!(123));
	assert_eq!(doc["dept"], json!("HR"));
	let query = Query::new("Employee:1").filter("salary", CompOp::Eq, json!(123));
	assert_eq!(db.find(&query, &mut admin()).unwrap().count, 1);
}

#[test]
fn kind_validation_rejects_garbage() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	// no version suffix
	assert!(db.put_kind(json!({"id": "NoVersion", "owner": "com.test"}), &mut admin()).is_err());
	// no owner
	assert!(db.put_kind(json!({"id": "K:1"}), &mut admin()).is_err());
	// index without props
	assert!(db
		.put_kind(
			json!({"id": "K:1", "owner": "com.test", "indexes": [{"name": "empty"}]}),
			&mut admin(),
		)
		.is_err());
	// a failed putKind leaves no registration behind
	assert!(!db.kind_engine().has_kind("K:1"));
}

#[test]
fn non_admin_callers_own_their_kinds() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	let mut caller = mojodb_core::DbReq::new("com.app").unwrap();
	// owner must match the caller
	let err = db
		.put_kind(json!({"id": "Mine:1", "owner": "com.other"}), &mut caller)
		.unwrap_err();
	assert!(matches!(err, Error::PermissionDenied { .. }));
	db.put_kind(json!({"id": "Mine:1", "owner": "com.app"}), &mut caller).unwrap();
	assert!(db.kind_engine().has_kind("Mine:1"));
}

#[test]
fn documents_moving_kinds_reindex_both_sides() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	put_kind(
		&db,
		json!({
			"id": "Draft:1",
			"owner": "com.test",
			"indexes": [{"name": "title", "props": [{"name": "title"}]}],
		}),
	);
	put_kind(
		&db,
		json!({
			"id": "Published:1",
			"owner": "com.test",
			"indexes": [{"name": "title", "props": [{"name": "title"}]}],
		}),
	);
	let (id, _) = db.put(json!({"_kind": "Draft:1", "title": "story"}), &mut admin()).unwrap();
	let mut doc = db.get(&id, &mut admin()).unwrap().unwrap();
	doc["_kind"] = json!("Published:1");
	db.put(doc, &mut admin()).unwrap();

	let drafts = Query::new("Draft:1").filter("title", CompOp::Eq, json!("story"));
	assert_eq!(db.find(&drafts, &mut admin()).unwrap().count, 0);
	let published = Query::new("Published:1").filter("title", CompOp::Eq, json!("story"));
	assert_eq!(db.find(&published, &mut admin()).unwrap().count, 1);
}
