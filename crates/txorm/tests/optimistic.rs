mod common;

use std::sync::Arc;

use txorm::prelude::*;
use txorm::testing::MockConnection;
use txorm::{CacheErrorKind, TransactionConfig};

use common::{begin, row, school, student_row, university, writes};

fn bit(tx: &Transaction<MockConnection>, entity: &str, attr: &str) -> u128 {
    let schema = tx.schema();
    let entity = schema.entity_by_name(entity).unwrap().id();
    schema.attr(schema.attr_by_name(entity, attr).unwrap()).bit()
}

#[test]
fn update_checks_the_values_it_read() {
    let (mut tx, conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    assert_eq!(tx.read_value(ann, "name").unwrap(), Value::from("Ann"));
    tx.write(ann, "gpa", 3.9).unwrap();

    let (rbits, wbits) = tx.dirty_bits(ann).unwrap();
    assert_eq!(rbits, bit(&tx, "Student", "name"));
    assert_eq!(wbits, bit(&tx, "Student", "gpa"));

    tx.commit().unwrap();
    assert_eq!(
        conn.executed()[0],
        (
            r#"UPDATE "student" SET "gpa" = $1 WHERE "id" = $2 AND "name" = $3"#.to_string(),
            vec![Value::Double(3.9), Value::BigInt(1), Value::from("Ann")],
        )
    );
    assert_eq!(tx.status(ann).unwrap(), Status::Saved);
    assert_eq!(tx.dirty_bits(ann).unwrap().1, 0);
}

#[test]
fn doubles_are_not_checked() {
    let (mut tx, conn) = begin(university());
    let ann = tx
        .materialize(
            "Student",
            &row(&[
                ("id", Value::BigInt(1)),
                ("name", Value::from("Ann")),
                ("gpa", Value::Double(3.1)),
                ("group", Value::Int(101)),
            ]),
        )
        .unwrap();
    tx.read_value(ann, "gpa").unwrap();
    tx.write(ann, "name", "Anna").unwrap();
    tx.flush().unwrap();
    assert_eq!(
        conn.statements(),
        vec![r#"UPDATE "student" SET "name" = $1 WHERE "id" = $2"#.to_string()]
    );
}

#[test]
fn null_reads_become_is_null_checks() {
    let (mut tx, conn) = begin(school());
    let ann = tx
        .materialize(
            "Person",
            &row(&[
                ("id", Value::BigInt(5)),
                ("name", Value::from("Ann")),
                ("email", Value::Null),
            ]),
        )
        .unwrap();
    assert_eq!(tx.read(ann, "email").unwrap(), Cell::Null);
    tx.write(ann, "name", "Anna").unwrap();
    tx.flush().unwrap();
    assert_eq!(
        writes(&conn),
        vec![r#"UPDATE "person" SET "name" = $1 WHERE "id" = $2 AND "email" IS NULL"#.to_string()]
    );
}

#[test]
fn zero_affected_rows_is_a_stale_read() {
    let (mut tx, conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.read_value(ann, "name").unwrap();
    tx.write(ann, "gpa", 3.9).unwrap();
    conn.push_row_count(0);

    let err = tx.commit().unwrap_err();
    assert_eq!(err.cache_kind(), Some(CacheErrorKind::StaleRead));
    assert!(err.is_retryable());
    assert!(!tx.is_closed());
    assert_eq!(conn.commits(), 0);
}

#[test]
fn strict_transactions_roll_back_on_failure() {
    let (tx, conn) = begin(university());
    let db = Arc::clone(tx.database());
    drop(tx);
    let config = TransactionConfig {
        strict: true,
        ..TransactionConfig::default()
    };
    let mut tx = Transaction::with_config(db, conn.clone(), config);
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.read_value(ann, "name").unwrap();
    tx.write(ann, "gpa", 3.9).unwrap();
    conn.push_row_count(0);

    let err = tx.commit().unwrap_err();
    assert_eq!(err.cache_kind(), Some(CacheErrorKind::StaleRead));
    assert!(tx.is_closed());
    assert_eq!(conn.rollbacks(), 1);
    assert!(tx.read(ann, "name").is_err());
}

#[test]
fn changed_values_that_were_read_are_unrepeatable() {
    let (mut tx, conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.read_value(ann, "name").unwrap();

    conn.expect_query("FOR UPDATE", vec![student_row(1, "Annette", 101)]);
    let err = tx.get_for_update("Student", [1i64]).unwrap_err();
    assert_eq!(err.cache_kind(), Some(CacheErrorKind::UnrepeatableRead));
    assert!(conn.statements()[0].ends_with("FOR UPDATE"));
}

#[test]
fn unread_values_refresh_silently() {
    let (mut tx, conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();

    conn.expect_query("FOR UPDATE", vec![student_row(1, "Annette", 101)]);
    assert_eq!(tx.get_for_update("Student", [1i64]).unwrap(), Some(ann));
    assert_eq!(tx.read_value(ann, "name").unwrap(), Value::from("Annette"));
}

#[test]
fn rows_read_for_update_skip_optimistic_checks() {
    let (mut tx, conn) = begin(university());
    conn.expect_query("FOR UPDATE", vec![student_row(1, "Ann", 101)]);
    let ann = tx.get_for_update("Student", [1i64]).unwrap().unwrap();
    tx.read_value(ann, "name").unwrap();
    tx.write(ann, "gpa", 3.9).unwrap();
    tx.flush().unwrap();
    assert_eq!(
        writes(&conn),
        vec![r#"UPDATE "student" SET "gpa" = $1 WHERE "id" = $2"#.to_string()]
    );
}

#[test]
fn optimistic_checks_can_be_disabled() {
    let db = DatabaseBuilder::new().optimistic(false).build(university());
    let conn = MockConnection::new();
    let mut tx = db.begin(conn.clone());
    assert!(!tx.config().optimistic);
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.read_value(ann, "name").unwrap();
    tx.delete(ann).unwrap();
    tx.flush().unwrap();
    assert_eq!(
        writes(&conn),
        vec![r#"DELETE FROM "student" WHERE "id" = $1"#.to_string()]
    );
}

#[test]
fn locked_rows_are_verified_on_flush() {
    let (mut tx, conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    tx.read_value(ann, "name").unwrap();
    tx.lock(ann).unwrap();
    assert_eq!(tx.status(ann).unwrap(), Status::Locked);

    conn.expect_query(
        r#"SELECT "id" FROM "student""#,
        vec![row(&[("id", Value::BigInt(1))])],
    );
    tx.flush().unwrap();
    assert_eq!(
        conn.executed()[0],
        (
            r#"SELECT "id" FROM "student" WHERE "id" = $1 AND "name" = $2"#.to_string(),
            vec![Value::BigInt(1), Value::from("Ann")],
        )
    );
    assert_eq!(tx.status(ann).unwrap(), Status::Loaded);

    tx.lock(ann).unwrap();
    let err = tx.flush().unwrap_err();
    assert_eq!(err.cache_kind(), Some(CacheErrorKind::StaleRead));
}

#[test]
fn writing_the_current_value_is_a_no_op() {
    let (mut tx, conn) = begin(university());
    let ann = tx.materialize("Student", &student_row(1, "Ann", 101)).unwrap();
    let group = tx.cached("Group", [101]).unwrap().unwrap();

    tx.write(ann, "name", "Ann").unwrap();
    tx.write(ann, "group", group).unwrap();
    tx.write(ann, "gpa", Cell::Null).unwrap();

    assert_eq!(tx.status(ann).unwrap(), Status::Loaded);
    assert_eq!(tx.dirty_bits(ann).unwrap(), (0, 0));
    assert!(!tx.is_modified());
    let students = tx.set_data(group, "students").unwrap().unwrap();
    assert!(!students.has_deltas());

    tx.commit().unwrap();
    assert_eq!(conn.statements(), vec!["COMMIT".to_string()]);
}
