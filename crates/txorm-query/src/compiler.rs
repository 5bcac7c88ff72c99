//! Translation of [`SqlAst`] trees into dialect text.
//!
//! The transaction engine only depends on the [`SqlCompiler`] trait; the
//! [`GenericCompiler`] is a reference implementation covering the statement
//! shapes the engine emits.

use serde::Deserialize;
use txorm_core::{Error, QueryError, QueryErrorKind, Result, Value};

use crate::ast::{Criterion, SqlAst};

/// SQL dialect used by [`GenericCompiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Whether generated keys come back through `RETURNING`.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}

/// Maps the engine's positional parameters to driver arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentAdapter {
    order: Vec<usize>,
}

impl ArgumentAdapter {
    /// Pass `count` parameters through unchanged.
    pub fn identity(count: usize) -> Self {
        Self {
            order: (0..count).collect(),
        }
    }

    /// Driver argument `i` is engine parameter `order[i]`.
    pub fn reordered(order: Vec<usize>) -> Self {
        Self { order }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Produce the driver argument list.
    pub fn adapt(&self, params: &[Value]) -> Result<Vec<Value>> {
        self.order
            .iter()
            .map(|&i| {
                params.get(i).cloned().ok_or_else(|| {
                    Error::Query(QueryError {
                        kind: QueryErrorKind::Syntax,
                        sql: None,
                        sqlstate: None,
                        message: format!(
                            "statement expects parameter #{} but only {} were supplied",
                            i + 1,
                            params.len()
                        ),
                        source: None,
                    })
                })
            })
            .collect()
    }
}

/// Parameterized statement text plus its argument adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSql {
    pub sql: String,
    pub adapter: ArgumentAdapter,
}

/// Turns value-free syntax trees into parameterized statement text.
pub trait SqlCompiler: Send + Sync {
    fn compile(&self, ast: &SqlAst) -> Result<CompiledSql>;
}

/// Reference compiler for the statement shapes the engine emits.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericCompiler {
    dialect: Dialect,
}

impl GenericCompiler {
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn push_criteria(&self, sql: &mut String, criteria: &[Criterion], next_param: &mut usize) {
        if criteria.is_empty() {
            return;
        }
        sql.push_str(" WHERE ");
        let parts: Vec<String> = criteria
            .iter()
            .map(|criterion| match criterion {
                Criterion::Eq(column) => {
                    *next_param += 1;
                    format!(
                        "{} = {}",
                        self.dialect.quote_identifier(column),
                        self.dialect.placeholder(*next_param)
                    )
                }
                Criterion::IsNull(column) => {
                    format!("{} IS NULL", self.dialect.quote_identifier(column))
                }
            })
            .collect();
        sql.push_str(&parts.join(" AND "));
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn syntax_error(message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: None,
        sqlstate: None,
        message: message.into(),
        source: None,
    })
}

impl SqlCompiler for GenericCompiler {
    fn compile(&self, ast: &SqlAst) -> Result<CompiledSql> {
        if ast.table().is_empty() {
            return Err(syntax_error("statement has no target table"));
        }
        let table = self.dialect.quote_identifier(ast.table());
        let mut next_param = 0usize;
        let mut sql = String::new();

        match ast {
            SqlAst::Select(select) => {
                if select.columns.is_empty() {
                    return Err(syntax_error(format!(
                        "SELECT from {} has no columns",
                        select.table
                    )));
                }
                sql.push_str("SELECT ");
                sql.push_str(&self.column_list(&select.columns));
                sql.push_str(" FROM ");
                sql.push_str(&table);
                self.push_criteria(&mut sql, &select.criteria, &mut next_param);
                if let Some(limit) = select.limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                if select.for_update && self.dialect != Dialect::Sqlite {
                    sql.push_str(" FOR UPDATE");
                }
            }
            SqlAst::Insert(insert) => {
                sql.push_str("INSERT INTO ");
                sql.push_str(&table);
                if insert.columns.is_empty() {
                    sql.push_str(" DEFAULT VALUES");
                } else {
                    sql.push_str(" (");
                    sql.push_str(&self.column_list(&insert.columns));
                    sql.push_str(") VALUES (");
                    let params: Vec<String> = (1..=insert.columns.len())
                        .map(|i| self.dialect.placeholder(i))
                        .collect();
                    sql.push_str(&params.join(", "));
                    sql.push(')');
                    next_param = insert.columns.len();
                }
                if let Some(returning) = &insert.returning {
                    if self.dialect.supports_returning() {
                        sql.push_str(" RETURNING ");
                        sql.push_str(&self.dialect.quote_identifier(returning));
                    }
                }
            }
            SqlAst::Update(update) => {
                if update.set.is_empty() {
                    return Err(syntax_error(format!(
                        "UPDATE of {} has no columns to set",
                        update.table
                    )));
                }
                sql.push_str("UPDATE ");
                sql.push_str(&table);
                sql.push_str(" SET ");
                let sets: Vec<String> = update
                    .set
                    .iter()
                    .map(|column| {
                        next_param += 1;
                        format!(
                            "{} = {}",
                            self.dialect.quote_identifier(column),
                            self.dialect.placeholder(next_param)
                        )
                    })
                    .collect();
                sql.push_str(&sets.join(", "));
                self.push_criteria(&mut sql, &update.criteria, &mut next_param);
            }
            SqlAst::Delete(delete) => {
                sql.push_str("DELETE FROM ");
                sql.push_str(&table);
                self.push_criteria(&mut sql, &delete.criteria, &mut next_param);
            }
        }

        debug_assert_eq!(next_param, ast.param_count());
        tracing::trace!(sql = %sql, params = next_param, "Compiled statement");
        Ok(CompiledSql {
            sql,
            adapter: ArgumentAdapter::identity(next_param),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Select;

    #[test]
    fn test_compile_update_with_optimistic_criteria() {
        let compiler = GenericCompiler::new(Dialect::Postgres);
        let ast = SqlAst::update(
            "department",
            vec!["head".into()],
            vec![
                Criterion::Eq("id".into()),
                Criterion::Eq("name".into()),
                Criterion::IsNull("budget".into()),
            ],
        );
        let compiled = compiler.compile(&ast).unwrap();
        assert_eq!(
            compiled.sql,
            "UPDATE \"department\" SET \"head\" = $1 WHERE \"id\" = $2 AND \"name\" = $3 AND \"budget\" IS NULL"
        );
        assert_eq!(compiled.adapter.len(), 3);
    }

    #[test]
    fn test_compile_insert_returning() {
        let ast = SqlAst::insert(
            "person",
            vec!["name".into(), "age".into()],
            Some("id".into()),
        );
        let pg = GenericCompiler::new(Dialect::Postgres).compile(&ast).unwrap();
        assert_eq!(
            pg.sql,
            "INSERT INTO \"person\" (\"name\", \"age\") VALUES ($1, $2) RETURNING \"id\""
        );
        let my = GenericCompiler::new(Dialect::Mysql).compile(&ast).unwrap();
        assert_eq!(my.sql, "INSERT INTO `person` (`name`, `age`) VALUES (?, ?)");
    }

    #[test]
    fn test_compile_insert_default_values() {
        let ast = SqlAst::insert("counter", Vec::new(), Some("id".into()));
        let compiled = GenericCompiler::new(Dialect::Sqlite).compile(&ast).unwrap();
        assert_eq!(
            compiled.sql,
            "INSERT INTO \"counter\" DEFAULT VALUES RETURNING \"id\""
        );
        assert!(compiled.adapter.is_empty());
    }

    #[test]
    fn test_compile_select_for_update_and_delete() {
        let compiler = GenericCompiler::default();
        let select = SqlAst::Select(Select {
            table: "person".into(),
            columns: vec!["id".into(), "name".into()],
            criteria: vec![Criterion::Eq("id".into())],
            for_update: true,
            limit: Some(2),
        });
        assert_eq!(
            compiler.compile(&select).unwrap().sql,
            "SELECT \"id\", \"name\" FROM \"person\" WHERE \"id\" = $1 LIMIT 2 FOR UPDATE"
        );

        let delete = SqlAst::delete(
            "person_course",
            vec![Criterion::Eq("person".into()), Criterion::Eq("course".into())],
        );
        assert_eq!(
            compiler.compile(&delete).unwrap().sql,
            "DELETE FROM \"person_course\" WHERE \"person\" = $1 AND \"course\" = $2"
        );
    }

    #[test]
    fn test_rejects_empty_update() {
        let ast = SqlAst::update("person", Vec::new(), vec![Criterion::Eq("id".into())]);
        let err = GenericCompiler::default().compile(&ast).unwrap_err();
        assert!(err.to_string().contains("no columns to set"));
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(Dialect::Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn test_adapter_reorders_and_checks_bounds() {
        let adapter = ArgumentAdapter::reordered(vec![1, 0, 1]);
        let args = adapter.adapt(&[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(args, vec![Value::Int(2), Value::Int(1), Value::Int(2)]);
        assert!(adapter.adapt(&[Value::Int(1)]).is_err());
    }
}
