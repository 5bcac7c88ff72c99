//! Storage driver interface.

use crate::Result;
use crate::row::Row;
use crate::value::Value;

/// A synchronous database connection.
///
/// The transaction layer drives a single connection from one thread; every
/// round-trip blocks until the driver answers. Statement text arrives already
/// compiled, with positional arguments in driver order.
pub trait Connection {
    /// Execute a query and return all result rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute an INSERT and return the key generated by storage, if any.
    fn insert(&mut self, sql: &str, params: &[Value]) -> Result<Option<Value>>;

    /// Execute one statement for every argument list.
    ///
    /// Returns the total number of affected rows.
    fn execute_many(&mut self, sql: &str, params: &[Vec<Value>]) -> Result<u64> {
        let mut total = 0;
        for args in params {
            total += self.execute(sql, args)?;
        }
        Ok(total)
    }

    /// Commit the storage transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the storage transaction.
    fn rollback(&mut self) -> Result<()>;
}

impl<C: Connection + ?Sized> Connection for &mut C {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn insert(&mut self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        (**self).insert(sql, params)
    }

    fn execute_many(&mut self, sql: &str, params: &[Vec<Value>]) -> Result<u64> {
        (**self).execute_many(sql, params)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn insert(&mut self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        (**self).insert(sql, params)
    }

    fn execute_many(&mut self, sql: &str, params: &[Vec<Value>]) -> Result<u64> {
        (**self).execute_many(sql, params)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingConnection {
        executed: Vec<(String, Vec<Value>)>,
    }

    impl Connection for CountingConnection {
        fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
            self.executed.push((sql.to_string(), params.to_vec()));
            Ok(1)
        }

        fn insert(&mut self, _sql: &str, _params: &[Value]) -> Result<Option<Value>> {
            Ok(None)
        }

        fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_execute_many_default_runs_each_argument_list() {
        let mut conn = CountingConnection::default();
        let total = conn
            .execute_many(
                "DELETE FROM t WHERE a = $1",
                &[vec![Value::Int(1)], vec![Value::Int(2)]],
            )
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(conn.executed.len(), 2);
        assert_eq!(conn.executed[1].1, vec![Value::Int(2)]);
    }

    #[test]
    fn test_mut_ref_forwards() {
        fn run<C: Connection>(mut conn: C) {
            conn.execute("SELECT 1", &[]).unwrap();
        }

        let mut conn = CountingConnection::default();
        run(&mut conn);
        assert_eq!(conn.executed.len(), 1);
    }
}
