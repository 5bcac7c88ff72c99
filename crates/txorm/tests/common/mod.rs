#![allow(dead_code)]

use std::sync::Arc;

use txorm::testing::MockConnection;
use txorm::{Database, Row, Schema, SchemaBuilder, Transaction, Value, ValueKind};

pub fn university() -> Schema {
    let mut b = SchemaBuilder::new();
    let group = b.entity("Group");
    group.primary_key("number", ValueKind::Int);
    group.set("students", "Student");
    let student = b.entity("Student");
    student.required("name", ValueKind::Text);
    student.optional("gpa", ValueKind::Double);
    student.required("group", "Group");
    student.set("courses", "Course");
    let course = b.entity("Course");
    course.required("title", ValueKind::Text);
    course.required("semester", ValueKind::Int);
    course.composite_primary_key(&["title", "semester"]);
    course.set("students", "Student");
    b.build().unwrap()
}

/// Departments with an optional head teacher, and people with passports.
pub fn school() -> Schema {
    let mut b = SchemaBuilder::new();
    let department = b.entity("Department");
    department.unique("name", ValueKind::Text);
    department.optional("head_of_dept", "Teacher");
    let teacher = b.entity("Teacher");
    teacher.required("name", ValueKind::Text);
    teacher.set("departments", "Department");
    let person = b.entity("Person");
    person.required("name", ValueKind::Text);
    person.optional("email", ValueKind::Text).unique();
    person.optional("passport", "Passport");
    let passport = b.entity("Passport");
    passport.required("person", "Person");
    b.build().unwrap()
}

pub fn begin(schema: Schema) -> (Transaction<MockConnection>, MockConnection) {
    let conn = MockConnection::new();
    let db = Arc::new(Database::new(schema));
    (db.begin(conn.clone()), conn)
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(pairs.iter().map(|(name, value)| (*name, value.clone())))
}

pub fn student_row(id: i64, name: &str, group: i32) -> Row {
    row(&[
        ("id", Value::BigInt(id)),
        ("name", Value::from(name)),
        ("gpa", Value::Null),
        ("group", Value::Int(group)),
    ])
}

/// Statements other than SELECTs, in execution order.
pub fn writes(conn: &MockConnection) -> Vec<String> {
    conn.statements()
        .into_iter()
        .filter(|sql| !sql.starts_with("SELECT"))
        .collect()
}
