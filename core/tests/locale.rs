mod common;

use common::*;
use mojodb_core::Query;
use serde_json::json;
use tempfile::tempdir;

fn collated_kind(db: &mojodb_core::Db) {
	put_kind(
		db,
		json!({
			"id": "Word:1",
			"owner": "com.test",
			"indexes": [{"name": "foo", "props": [{"name": "foo", "collate": "secondary"}]}],
		}),
	);
}

fn words(db: &mojodb_core::Db) -> Vec<String> {
	let query = Query::new("Word:1").order_by("foo");
	let found = db.find(&query, &mut admin()).unwrap();
	found.results.iter().map(|d| d["foo"].as_str().unwrap().to_string()).collect()
}

#[test]
fn locale_change_reorders_collated_index() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	collated_kind(&db);
	for word in ["côté", "cote", "coté", "côte"] {
		db.put(json!({"_kind": "Word:1", "foo": word}), &mut admin()).unwrap();
	}

	// English sorts accents left to right
	assert_eq!(words(&db), vec!["cote", "coté", "côte", "côté"]);

	// French sorts accents from the end of the word
	db.update_locale("fr_CA", &mut admin()).unwrap();
	assert_eq!(words(&db), vec!["cote", "côte", "coté", "côté"]);

	// and the switch is idempotent
	db.update_locale("fr_CA", &mut admin()).unwrap();
	assert_eq!(words(&db), vec!["cote", "côte", "coté", "côté"]);
}

#[test]
fn locale_survives_reopen() {
	let dir = tempdir().unwrap();
	let engine = std::sync::Arc::new(mojodb_core::kvs::mem::MemEngine::new());
	{
		let db = mojodb_core::Db::open_with_engine(dir.path(), engine.clone(), &json!({})).unwrap();
		collated_kind(&db);
		db.update_locale("fr_CA", &mut admin()).unwrap();
		db.close().unwrap();
	}
	let db = mojodb_core::Db::open_with_engine(dir.path(), engine, &json!({})).unwrap();
	assert_eq!(db.get_locale(&mut admin()).unwrap(), "fr_CA");
}

#[test]
fn primary_collation_folds_case() {
	let dir = tempdir().unwrap();
	let db = open_db(dir.path());
	put_kind(
		&db,
		json!({
			"id": "CaseWord:1",
			"owner": "com.test",
			"indexes": [{"name": "foo", "props": [{"name": "foo", "collate": "primary"}]}],
		}),
	);
	for word in ["Banana", "apple", "Cherry"] {
		db.put(json!({"_kind": "CaseWord:1", "foo": word}), &mut admin()).unwrap();
	}
	let query = Query::new("CaseWord:1").order_by("foo");
	let found = db.find(&query, &mut admin()).unwrap();
	let sorted: Vec<&str> = found.results.iter().map(|d| d["foo"].as_str().unwrap()).collect();
	assert_eq!(sorted, vec!["apple", "Banana", "Cherry"]);
}
