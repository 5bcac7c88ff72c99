//! txorm - a transactional object-relational mapping core.
//!
//! txorm keeps an in-memory image of the entity instances a transaction
//! works with and writes the accumulated changes back as SQL:
//!
//! - **Metamodel**: entities, attributes, keys, inheritance and relationship
//!   reverses, declared with [`SchemaBuilder`]
//! - **Identity map**: one instance per primary key per [`Transaction`]
//! - **Dirty tracking**: read and write bitmasks per instance, used for
//!   minimal UPDATEs and optimistic checks
//! - **Relationships**: both sides of one-to-one, one-to-many and
//!   many-to-many relationships kept consistent, with cascade and
//!   nullify rules on delete
//! - **Flush pipeline**: dependency-ordered INSERTs, UPDATEs, DELETEs and
//!   link-table maintenance, with per-entity save hooks
//!
//! # Quick Start
//!
//! ```ignore
//! use txorm::prelude::*;
//!
//! let mut schema = SchemaBuilder::new();
//! schema.entity("Group").primary_key("number", ValueKind::Int);
//! schema.entity("Group").set("students", "Student");
//! schema.entity("Student").required("name", ValueKind::Text);
//! schema.entity("Student").required("group", "Group");
//!
//! let db = DatabaseBuilder::new().dialect(Dialect::Sqlite).build(schema.build()?);
//! let mut tx = db.begin(conn);
//! let group = tx.create("Group", [("number", InitValue::from(101))])?;
//! tx.create("Student", [("name", InitValue::from("Ann")), ("group", group.into())])?;
//! tx.commit()?;
//! ```

mod builder;

pub use builder::DatabaseBuilder;

pub use txorm_core::{
    CacheError, CacheErrorKind, ConfigError, Connection, DependencyError, Error, QueryError,
    QueryErrorKind, Result, Row, SchemaError, SchemaErrorKind, TransactionError,
    TransactionErrorKind, TypeError, ValidationError, Value, ValueKind,
};
pub use txorm_query::{
    CacheStats, CompiledSql, Criterion, Dialect, GenericCompiler, Select, SqlAst, SqlCompiler,
    StatementCache,
};
pub use txorm_schema::{
    AttrId, AttrKind, AttrType, Attribute, EntityId, EntityType, KeyDef, KeyId, LinkTable,
    Schema, SchemaBuilder,
};
pub use txorm_session::{
    Cell, Database, DatabaseConfig, EntityEvent, InitValue, ObjId, SetData, Status, Transaction,
    TransactionConfig, TransactionEvent,
};

#[doc(hidden)]
pub use txorm_session::testing;

pub mod prelude {
    pub use crate::{
        Cell, Connection, Database, DatabaseBuilder, Dialect, EntityEvent, Error, InitValue, ObjId,
        Result, Row, Schema, SchemaBuilder, Status, Transaction, Value, ValueKind,
    };
}
