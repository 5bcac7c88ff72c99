mod common;

use txorm::prelude::*;
use txorm::{CacheErrorKind, TransactionErrorKind};

use common::{begin, row, student_row, university};

#[test]
fn get_returns_one_handle_per_primary_key() {
    let (mut tx, conn) = begin(university());
    conn.expect_query("FROM \"student\"", vec![student_row(1, "Ann", 101)]);

    let ann = tx.get("Student", [1i64]).unwrap().unwrap();
    assert_eq!(tx.get("Student", [1i64]).unwrap(), Some(ann));
    assert_eq!(tx.cached("Student", [1i64]).unwrap(), Some(ann));

    assert_eq!(
        conn.statements(),
        vec![r#"SELECT "id", "name", "gpa", "group" FROM "student" WHERE "id" = $1"#.to_string()]
    );
    assert_eq!(conn.executed()[0].1, vec![Value::BigInt(1)]);
    assert_eq!(tx.status(ann).unwrap(), Status::Loaded);
    assert_eq!(tx.read_value(ann, "name").unwrap(), Value::from("Ann"));
    assert_eq!(tx.read_value(ann, "gpa").unwrap(), Value::Null);
}

#[test]
fn references_resolve_to_seeds_loaded_on_demand() {
    let (mut tx, conn) = begin(university());
    conn.expect_query("FROM \"student\"", vec![student_row(1, "Ann", 101)]);
    let ann = tx.get("Student", [1i64]).unwrap().unwrap();

    let group = tx.read_object(ann, "group").unwrap().unwrap();
    assert_eq!(tx.primary_key(group).unwrap(), Some(vec![Value::Int(101)]));
    assert_eq!(tx.describe(group), "Group[101]");
    assert_eq!(conn.statements().len(), 1);

    conn.expect_query("FROM \"group\"", vec![row(&[("number", Value::Int(101))])]);
    assert_eq!(tx.get("Group", [101]).unwrap(), Some(group));
    assert_eq!(conn.count_matching("FROM \"group\""), 1);
    assert_eq!(tx.get("Group", [101]).unwrap(), Some(group));
    assert_eq!(conn.count_matching("FROM \"group\""), 1);
}

#[test]
fn rows_for_the_same_key_share_an_instance() {
    let (mut tx, conn) = begin(university());
    let group = tx.materialize("Group", &row(&[("number", Value::Int(101))])).unwrap();
    conn.expect_query(
        "FROM \"student\"",
        vec![student_row(1, "Ann", 101), student_row(2, "Bob", 101)],
    );
    let found = tx.find("Student", &[("group", Cell::from(group))]).unwrap();
    assert_eq!(found.len(), 2);
    assert!(conn.statements()[0].ends_with(r#"WHERE "group" = $1"#));
    assert_eq!(conn.executed()[0].1, vec![Value::Int(101)]);

    let again = tx.materialize("Student", &student_row(2, "Bob", 101)).unwrap();
    assert_eq!(again, found[1]);
    assert_eq!(tx.read_object(found[0], "group").unwrap(), Some(group));
    assert_eq!(tx.read_object(found[1], "group").unwrap(), Some(group));
    assert_eq!(tx.len(), 3);
}

#[test]
fn storage_values_do_not_overwrite_local_writes() {
    let (mut tx, _conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.write(ann, "name", "Anna").unwrap();

    tx.materialize("Student", &student_row(1, "Annette", 101)).unwrap();
    assert_eq!(tx.read_value(ann, "name").unwrap(), Value::from("Anna"));
    assert_eq!(tx.status(ann).unwrap(), Status::Updated);
}

#[test]
fn missing_rows_and_cache_misses() {
    let (mut tx, conn) = begin(university());
    assert_eq!(tx.cached("Student", [7i64]).unwrap(), None);
    assert!(conn.statements().is_empty());
    assert_eq!(tx.get("Student", [7i64]).unwrap(), None);
    assert_eq!(conn.statements().len(), 1);

    let err = tx.get("Student", [1i64, 2i64]).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn deleted_instances_are_hidden() {
    let (mut tx, _conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.delete(ann).unwrap();

    assert_eq!(tx.status(ann).unwrap(), Status::Deleted);
    assert_eq!(tx.get("Student", [1i64]).unwrap(), None);
    let err = tx.read(ann, "name").unwrap_err();
    assert_eq!(err.cache_kind(), Some(CacheErrorKind::ObjectDeleted));
    assert!(tx.delete(ann).is_err());
}

#[test]
fn handles_are_bound_to_their_transaction() {
    let db = std::sync::Arc::new(Database::new(university()));
    let mut first = db.begin(txorm::testing::MockConnection::new());
    let mut second = db.begin(txorm::testing::MockConnection::new());
    assert_ne!(first.id(), second.id());

    let ann = first.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    let err = second.read(ann, "name").unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(ref e) if e.kind == TransactionErrorKind::ForeignObject
    ));
}

#[test]
fn commit_keeps_the_map_and_rollback_closes_it() {
    let (mut tx, conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.commit().unwrap();
    assert!(!tx.is_closed());
    assert_eq!(conn.commits(), 1);
    assert_eq!(tx.get("Student", [1i64]).unwrap(), Some(ann));

    tx.rollback().unwrap();
    assert!(tx.is_closed());
    assert!(tx.is_empty());
    assert_eq!(conn.rollbacks(), 1);

    let err = tx.get("Student", [1i64]).unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(ref e) if e.kind == TransactionErrorKind::Closed
    ));
    assert!(tx.commit().is_err());
}

fn people() -> Schema {
    let mut b = SchemaBuilder::new();
    b.entity("Person").required("name", ValueKind::Text);
    b.entity("Student")
        .extends("Person")
        .optional("gpa", ValueKind::Double);
    b.build().unwrap()
}

#[test]
fn discriminator_selects_the_instance_class() {
    let (mut tx, conn) = begin(people());
    conn.expect_query(
        "FROM \"person\"",
        vec![row(&[
            ("id", Value::BigInt(1)),
            ("name", Value::from("Ann")),
            ("classtype", Value::from("Student")),
            ("gpa", Value::Double(3.5)),
        ])],
    );
    let ann = tx.get("Person", [1i64]).unwrap().unwrap();
    assert_eq!(tx.entity_of(ann).unwrap().name(), "Student");
    assert_eq!(tx.read_value(ann, "gpa").unwrap(), Value::Double(3.5));
    assert_eq!(tx.get("Student", [1i64]).unwrap(), Some(ann));
    assert_eq!(conn.statements().len(), 1);

    conn.expect_query(
        "FROM \"person\"",
        vec![row(&[
            ("id", Value::BigInt(2)),
            ("name", Value::from("Bob")),
            ("classtype", Value::from("Person")),
            ("gpa", Value::Null),
        ])],
    );
    assert_eq!(tx.get("Student", [2i64]).unwrap(), None);
    let bob = tx.cached("Person", [2i64]).unwrap().unwrap();
    assert_eq!(tx.entity_of(bob).unwrap().name(), "Person");
}
