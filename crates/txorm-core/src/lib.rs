//! Core types and traits for txorm.
//!
//! This crate provides the foundational abstractions shared by the metamodel,
//! the SQL layer and the transaction engine:
//!
//! - `Value` / `ValueKind` for dynamically typed attribute values
//! - `Row` for result rows coming back from storage
//! - `Connection`, the synchronous storage driver interface
//! - the `Error` taxonomy used across the workspace

pub mod connection;
pub mod error;
pub mod row;
pub mod value;

pub use connection::Connection;
pub use error::{
    CacheError, CacheErrorKind, ConfigError, DependencyError, Error, QueryError, QueryErrorKind,
    Result, SchemaError, SchemaErrorKind, TransactionError, TransactionErrorKind, TypeError,
    ValidationError,
};
pub use row::{ColumnInfo, Row};
pub use value::{Value, ValueKind};
