//! Fluent construction of a shared [`Database`].

use std::sync::Arc;

use txorm_query::{Dialect, SqlCompiler};
use txorm_schema::Schema;
use txorm_session::{Database, DatabaseConfig};

/// Builder for a [`Database`] handle.
///
/// ```
/// use txorm::{DatabaseBuilder, Dialect, SchemaBuilder, ValueKind};
///
/// let mut schema = SchemaBuilder::new();
/// schema.entity("Person").required("name", ValueKind::Text);
/// let db = DatabaseBuilder::new()
///     .dialect(Dialect::Mysql)
///     .statement_cache_size(16)
///     .build(schema.build().unwrap());
/// assert_eq!(db.config().statement_cache_size, 16);
/// ```
#[derive(Default)]
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    compiler: Option<Box<dyn SqlCompiler>>,
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("config", &self.config)
            .field("custom_compiler", &self.compiler.is_some())
            .finish()
    }
}

impl DatabaseBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    #[must_use]
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.config.dialect = dialect;
        self
    }

    #[must_use]
    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.config.statement_cache_size = size;
        self
    }

    /// Default optimistic-check setting of new transactions.
    #[must_use]
    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.config.optimistic = optimistic;
        self
    }

    /// Use a custom compiler instead of the dialect's generic one.
    #[must_use]
    pub fn compiler(mut self, compiler: impl SqlCompiler + 'static) -> Self {
        self.compiler = Some(Box::new(compiler));
        self
    }

    pub fn build(self, schema: impl Into<Arc<Schema>>) -> Arc<Database> {
        let db = Database::with_config(schema, self.config);
        let db = match self.compiler {
            Some(compiler) => db.with_compiler(BoxedCompiler(compiler)),
            None => db,
        };
        tracing::debug!(dialect = ?db.config().dialect, "database configured");
        Arc::new(db)
    }
}

struct BoxedCompiler(Box<dyn SqlCompiler>);

impl SqlCompiler for BoxedCompiler {
    fn compile(&self, ast: &txorm_query::SqlAst) -> txorm_core::Result<txorm_query::CompiledSql> {
        self.0.compile(ast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txorm_core::{Error, Result, ValueKind};
    use txorm_query::{CompiledSql, GenericCompiler, SqlAst};
    use txorm_schema::SchemaBuilder;

    struct Uppercase(GenericCompiler);

    impl SqlCompiler for Uppercase {
        fn compile(&self, ast: &SqlAst) -> Result<CompiledSql> {
            let mut compiled = self.0.compile(ast)?;
            compiled.sql = compiled.sql.to_uppercase();
            Ok(compiled)
        }
    }

    fn schema() -> Schema {
        let mut b = SchemaBuilder::new();
        b.entity("Person").required("name", ValueKind::Text);
        b.build().unwrap()
    }

    #[test]
    fn test_custom_compiler() {
        let db = DatabaseBuilder::new()
            .compiler(Uppercase(GenericCompiler::new(Dialect::Postgres)))
            .build(schema());
        let ast = SqlAst::select_by("person", vec!["name".into()], &["id".into()]);
        assert!(db.compile(&ast).unwrap().sql.contains("\"PERSON\""));
    }

    #[test]
    fn test_config_from_json() {
        let config = DatabaseConfig::from_json(r#"{"optimistic": false}"#).unwrap();
        let db = DatabaseBuilder::new().config(config).build(schema());
        assert!(!db.config().optimistic);
        let err = DatabaseConfig::from_json("[1]").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
