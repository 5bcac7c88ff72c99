mod common;

use std::sync::{Arc, Mutex};

use txorm::prelude::*;
use txorm::testing::MockConnection;
use txorm::CacheErrorKind;

use common::{begin, row, student_row, university, writes};

const ALL_EVENTS: [EntityEvent; 6] = [
    EntityEvent::BeforeInsert,
    EntityEvent::BeforeUpdate,
    EntityEvent::BeforeDelete,
    EntityEvent::AfterInsert,
    EntityEvent::AfterUpdate,
    EntityEvent::AfterDelete,
];

type Log = Arc<Mutex<Vec<(EntityEvent, ObjId, usize)>>>;

/// Record every event of `entity` with the number of writes issued so far.
fn record(tx: &mut Transaction<MockConnection>, entity: &str, conn: &MockConnection, log: &Log) {
    for event in ALL_EVENTS {
        let conn = conn.clone();
        let log = Arc::clone(log);
        tx.on_entity(entity, event, move |_, obj| {
            log.lock().unwrap().push((event, obj, writes(&conn).len()));
            Ok(())
        })
        .unwrap();
    }
}

fn drain(log: &Log) -> Vec<(EntityEvent, ObjId, usize)> {
    std::mem::take(&mut *log.lock().unwrap())
}

#[test]
fn hooks_run_around_each_kind_of_save() {
    let (mut tx, conn) = begin(university());
    let log = Log::default();
    record(&mut tx, "Group", &conn, &log);
    record(&mut tx, "Student", &conn, &log);

    let group = tx.create("Group", [("number", InitValue::from(5))]).unwrap();
    let ann = tx
        .create(
            "Student",
            [("name", InitValue::from("Ann")), ("group", InitValue::from(group))],
        )
        .unwrap();
    tx.flush().unwrap();
    assert_eq!(
        drain(&log),
        vec![
            (EntityEvent::BeforeInsert, group, 0),
            (EntityEvent::BeforeInsert, ann, 0),
            (EntityEvent::AfterInsert, group, 2),
            (EntityEvent::AfterInsert, ann, 2),
        ]
    );

    tx.write(ann, "name", "Ann B").unwrap();
    tx.flush().unwrap();
    assert_eq!(
        drain(&log),
        vec![
            (EntityEvent::BeforeUpdate, ann, 2),
            (EntityEvent::AfterUpdate, ann, 3),
        ]
    );

    tx.delete(ann).unwrap();
    tx.flush().unwrap();
    assert_eq!(
        drain(&log),
        vec![
            (EntityEvent::BeforeDelete, ann, 3),
            (EntityEvent::AfterDelete, ann, 4),
        ]
    );
}

#[test]
fn before_insert_hook_fills_in_values() {
    let (mut tx, conn) = begin(university());
    tx.on_entity("Student", EntityEvent::BeforeInsert, |tx, obj| {
        if !tx.peek(obj, "gpa")?.is_set() {
            tx.write(obj, "gpa", 4.0)?;
        }
        Ok(())
    })
    .unwrap();

    let group = tx.create("Group", [("number", InitValue::from(1))]).unwrap();
    tx.create(
        "Student",
        [("name", InitValue::from("Ann")), ("group", InitValue::from(group))],
    )
    .unwrap();
    tx.flush().unwrap();

    let executed = conn.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(
        executed[1].1,
        vec![Value::from("Ann"), Value::Double(4.0), Value::Int(1)]
    );
}

#[test]
fn changes_made_after_saving_are_flushed_too() {
    let (mut tx, conn) = begin(university());
    tx.on_entity("Student", EntityEvent::AfterInsert, |tx, obj| {
        tx.write(obj, "gpa", 1.0)
    })
    .unwrap();

    let group = tx.create("Group", [("number", InitValue::from(1))]).unwrap();
    let ann = tx
        .create(
            "Student",
            [("name", InitValue::from("Ann")), ("group", InitValue::from(group))],
        )
        .unwrap();
    tx.flush().unwrap();

    let statements = writes(&conn);
    assert_eq!(statements.len(), 3);
    assert_eq!(
        statements[2],
        r#"UPDATE "student" SET "gpa" = $1 WHERE "id" = $2 AND "name" = $3 AND "group" = $4"#
    );
    assert_eq!(tx.status(ann).unwrap(), Status::Saved);
    assert!(!tx.is_modified());
}

#[test]
fn hooks_that_never_settle_are_cut_off() {
    let (mut tx, _conn) = begin(university());
    let mut gpa = 0.0;
    tx.on_entity("Student", EntityEvent::AfterUpdate, move |tx, obj| {
        gpa += 1.0;
        tx.write(obj, "gpa", gpa)
    })
    .unwrap();

    tx.materialize("Group", &row(&[("number", Value::Int(1))]))
        .unwrap();
    let ann = tx.materialize("Student", &student_row(1, "Ann", 1)).unwrap();
    tx.write(ann, "gpa", 0.5).unwrap();

    let err = tx.flush().unwrap_err();
    assert_eq!(err.cache_kind(), Some(CacheErrorKind::Inconsistent));
    assert!(!tx.is_closed());
}

#[test]
fn failing_before_delete_hook_aborts_the_flush() {
    let (mut tx, conn) = begin(university());
    tx.on_entity("Student", EntityEvent::BeforeDelete, |_, _| {
        Err(Error::Custom("students are kept".to_string()))
    })
    .unwrap();

    tx.materialize("Group", &row(&[("number", Value::Int(1))]))
        .unwrap();
    let ann = tx.materialize("Student", &student_row(1, "Ann", 1)).unwrap();
    tx.delete(ann).unwrap();

    assert!(matches!(tx.flush(), Err(Error::Custom(_))));
    assert!(writes(&conn).is_empty());
    assert_eq!(tx.status(ann).unwrap(), Status::Deleted);
    assert!(tx.is_modified());
}

#[test]
fn hooks_of_a_base_entity_run_for_subtypes() {
    let mut b = SchemaBuilder::new();
    b.entity("Person").required("name", ValueKind::Text);
    b.entity("Student")
        .extends("Person")
        .optional("gpa", ValueKind::Double);
    let (mut tx, _conn) = begin(b.build().unwrap());

    let seen = Arc::new(Mutex::new(Vec::new()));
    for entity in ["Person", "Student"] {
        let seen = Arc::clone(&seen);
        tx.on_entity(entity, EntityEvent::BeforeInsert, move |tx, obj| {
            let name = tx.entity_of(obj)?.name().to_string();
            seen.lock().unwrap().push(format!("{entity}: {name}"));
            Ok(())
        })
        .unwrap();
    }
    assert!(tx.on_entity("Course", EntityEvent::AfterInsert, |_, _| Ok(())).is_err());

    tx.create("Person", [("name", InitValue::from("Ann"))]).unwrap();
    tx.create("Student", [("name", InitValue::from("Bob"))]).unwrap();
    tx.flush().unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "Person: Person".to_string(),
            "Person: Student".to_string(),
            "Student: Student".to_string(),
        ]
    );
}
