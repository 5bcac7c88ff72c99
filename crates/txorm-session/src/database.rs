//! Shared per-database state: schema, compiler and statement cache.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use txorm_core::{Connection, Result};
use txorm_query::{CacheStats, CompiledSql, GenericCompiler, SqlAst, SqlCompiler, StatementCache};
use txorm_schema::Schema;

use crate::config::DatabaseConfig;
use crate::transaction::Transaction;

/// Entry point for transactions against one database.
///
/// A `Database` is cheap to share behind an [`Arc`]; every transaction it
/// begins reuses its compiled statements.
pub struct Database {
    schema: Arc<Schema>,
    compiler: Box<dyn SqlCompiler>,
    statements: Mutex<StatementCache>,
    config: DatabaseConfig,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("entities", &self.schema.entities().count())
            .field("config", &self.config)
            .field("statements", &self.cache_stats())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn new(schema: impl Into<Arc<Schema>>) -> Self {
        Self::with_config(schema, DatabaseConfig::default())
    }

    pub fn with_config(schema: impl Into<Arc<Schema>>, config: DatabaseConfig) -> Self {
        let compiler = GenericCompiler::new(config.dialect);
        Self {
            schema: schema.into(),
            compiler: Box::new(compiler),
            statements: Mutex::new(StatementCache::new(config.statement_cache_size)),
            config,
        }
    }

    /// Replace the SQL compiler; cached statements are dropped.
    #[must_use]
    pub fn with_compiler(mut self, compiler: impl SqlCompiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self.clear_statement_cache();
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Compile a statement, reusing a cached translation when one exists.
    pub fn compile(&self, ast: &SqlAst) -> Result<CompiledSql> {
        let mut statements = self.statements.lock().unwrap_or_else(PoisonError::into_inner);
        statements.get_or_compile(ast, |ast| self.compiler.compile(ast))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    pub fn clear_statement_cache(&self) {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Start a transaction on `conn`.
    pub fn begin<C: Connection>(self: &Arc<Self>, conn: C) -> Transaction<C> {
        Transaction::new(Arc::clone(self), conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txorm_schema::SchemaBuilder;

    fn database() -> Database {
        let mut builder = SchemaBuilder::new();
        builder
            .entity("Person")
            .required("name", txorm_core::ValueKind::Text);
        Database::new(builder.build().unwrap())
    }

    #[test]
    fn test_compile_uses_cache() {
        let db = database();
        let ast = SqlAst::select_by("person", vec!["name".into()], &["id".into()]);
        let first = db.compile(&ast).unwrap();
        let second = db.compile(&ast).unwrap();
        assert_eq!(first.sql, second.sql);
        let stats = db.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_dialect_from_config() {
        let mut builder = SchemaBuilder::new();
        builder.entity("Person");
        let config = DatabaseConfig {
            dialect: txorm_query::Dialect::Sqlite,
            ..DatabaseConfig::default()
        };
        let db = Database::with_config(builder.build().unwrap(), config);
        let ast = SqlAst::select_by("person", vec!["id".into()], &["id".into()]);
        assert!(db.compile(&ast).unwrap().sql.contains("?1"));
    }
}
