//! Value-free abstract SQL syntax tree.
//!
//! Every statement the transaction engine emits is described by an [`SqlAst`]
//! that carries table and column names but never parameter values. Two saves
//! of the same shape produce equal trees, which makes the tree itself the key
//! of the statement cache.
//!
//! Parameters are positional, numbered in the order they appear:
//!
//! - `Insert`: one per column
//! - `Update`: one per SET column, then one per `Criterion::Eq`
//! - `Select` / `Delete`: one per `Criterion::Eq`

/// A single WHERE conjunct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Criterion {
    /// `column = ?`, consumes one parameter
    Eq(String),
    /// `column IS NULL`, consumes no parameter
    IsNull(String),
}

impl Criterion {
    pub fn column(&self) -> &str {
        match self {
            Criterion::Eq(c) | Criterion::IsNull(c) => c,
        }
    }

    const fn params(&self) -> usize {
        match self {
            Criterion::Eq(_) => 1,
            Criterion::IsNull(_) => 0,
        }
    }
}

/// `SELECT columns FROM table WHERE criteria`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Select {
    pub table: String,
    pub columns: Vec<String>,
    pub criteria: Vec<Criterion>,
    pub for_update: bool,
    pub limit: Option<u64>,
}

/// `INSERT INTO table (columns) VALUES (...)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    /// Column whose generated value should be returned
    pub returning: Option<String>,
}

/// `UPDATE table SET columns WHERE criteria`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Update {
    pub table: String,
    pub set: Vec<String>,
    pub criteria: Vec<Criterion>,
}

/// `DELETE FROM table WHERE criteria`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Delete {
    pub table: String,
    pub criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlAst {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl SqlAst {
    /// Build a SELECT with equality criteria on `key_columns`.
    pub fn select_by(
        table: impl Into<String>,
        columns: Vec<String>,
        key_columns: &[String],
    ) -> Self {
        SqlAst::Select(Select {
            table: table.into(),
            columns,
            criteria: key_columns.iter().cloned().map(Criterion::Eq).collect(),
            for_update: false,
            limit: None,
        })
    }

    pub fn insert(table: impl Into<String>, columns: Vec<String>, returning: Option<String>) -> Self {
        SqlAst::Insert(Insert {
            table: table.into(),
            columns,
            returning,
        })
    }

    pub fn update(table: impl Into<String>, set: Vec<String>, criteria: Vec<Criterion>) -> Self {
        SqlAst::Update(Update {
            table: table.into(),
            set,
            criteria,
        })
    }

    pub fn delete(table: impl Into<String>, criteria: Vec<Criterion>) -> Self {
        SqlAst::Delete(Delete {
            table: table.into(),
            criteria,
        })
    }

    /// Target table of the statement.
    pub fn table(&self) -> &str {
        match self {
            SqlAst::Select(s) => &s.table,
            SqlAst::Insert(i) => &i.table,
            SqlAst::Update(u) => &u.table,
            SqlAst::Delete(d) => &d.table,
        }
    }

    /// Number of positional parameters the statement consumes.
    pub fn param_count(&self) -> usize {
        let criteria_params =
            |criteria: &[Criterion]| criteria.iter().map(Criterion::params).sum::<usize>();
        match self {
            SqlAst::Select(s) => criteria_params(&s.criteria),
            SqlAst::Insert(i) => i.columns.len(),
            SqlAst::Update(u) => u.set.len() + criteria_params(&u.criteria),
            SqlAst::Delete(d) => criteria_params(&d.criteria),
        }
    }

    /// Statement kind label for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            SqlAst::Select(_) => "SELECT",
            SqlAst::Insert(_) => "INSERT",
            SqlAst::Update(_) => "UPDATE",
            SqlAst::Delete(_) => "DELETE",
        }
    }
}
