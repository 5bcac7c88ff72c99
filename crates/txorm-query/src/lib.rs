//! SQL layer for txorm.
//!
//! `txorm-query` sits between the transaction engine and the storage driver:
//!
//! - **Syntax tree**: [`SqlAst`] describes a statement's shape without values.
//! - **Compiler**: [`SqlCompiler`] turns a tree into parameterized text plus an
//!   [`ArgumentAdapter`]; [`GenericCompiler`] covers Postgres, SQLite and MySQL
//!   placeholder and quoting rules.
//! - **Cache**: [`StatementCache`] memoizes compiled statements per shape.

pub mod ast;
pub mod cache;
pub mod compiler;

pub use ast::{Criterion, Delete, Insert, Select, SqlAst, Update};
pub use cache::{CacheStats, CachedStatement, StatementCache};
pub use compiler::{ArgumentAdapter, CompiledSql, Dialect, GenericCompiler, SqlCompiler};
