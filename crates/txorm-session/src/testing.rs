//! Scripted in-memory connection for tests.
//!
//! [`MockConnection`] records every statement it receives and answers from a
//! script: queued result sets matched by SQL fragment, row counts for
//! UPDATE/DELETE, generated keys for INSERT, and injected failures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use txorm_core::{Connection, Error, QueryError, QueryErrorKind, Result, Row, Value};

#[derive(Debug, Default)]
pub struct MockState {
    /// Every statement in execution order
    pub executed: Vec<(String, Vec<Value>)>,
    responses: Vec<(String, Vec<Row>)>,
    row_counts: VecDeque<u64>,
    keys: VecDeque<Value>,
    next_key: i64,
    failures: Vec<String>,
    pub commits: usize,
    pub rollbacks: usize,
}

/// Cloneable handle; clones share one script and one statement log.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer the next query whose SQL contains `fragment` with `rows`.
    pub fn expect_query(&self, fragment: &str, rows: Vec<Row>) {
        self.state().responses.push((fragment.to_string(), rows));
    }

    /// Answer the next query of any shape with `rows`.
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.expect_query("", rows);
    }

    /// Row count reported by the next UPDATE or DELETE.
    pub fn push_row_count(&self, count: u64) {
        self.state().row_counts.push_back(count);
    }

    /// Key returned by the next INSERT; unscripted inserts count up from 1.
    pub fn push_key(&self, key: impl Into<Value>) {
        self.state().keys.push_back(key.into());
    }

    /// Fail every statement whose SQL contains `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.state().failures.push(fragment.to_string());
    }

    pub fn statements(&self) -> Vec<String> {
        self.state().executed.iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state().executed.clone()
    }

    /// Number of recorded statements containing `fragment`.
    pub fn count_matching(&self, fragment: &str) -> usize {
        self.state()
            .executed
            .iter()
            .filter(|(sql, _)| sql.contains(fragment))
            .count()
    }

    /// Forget recorded statements; the script is kept.
    pub fn clear(&self) {
        self.state().executed.clear();
    }

    pub fn commits(&self) -> usize {
        self.state().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<()> {
        let mut state = self.state();
        state.executed.push((sql.to_string(), params.to_vec()));
        if state.failures.iter().any(|f| sql.contains(f.as_str())) {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(sql.to_string()),
                sqlstate: None,
                message: "scripted failure".to_string(),
                source: None,
            }));
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql, params)?;
        let mut state = self.state();
        let position = state
            .responses
            .iter()
            .position(|(fragment, _)| sql.contains(fragment.as_str()));
        Ok(position
            .map(|p| state.responses.remove(p).1)
            .unwrap_or_default())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(sql, params)?;
        Ok(self.state().row_counts.pop_front().unwrap_or(1))
    }

    fn insert(&mut self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        self.record(sql, params)?;
        let mut state = self.state();
        if let Some(key) = state.keys.pop_front() {
            return Ok(Some(key));
        }
        state.next_key += 1;
        Ok(Some(Value::BigInt(state.next_key)))
    }

    fn commit(&mut self) -> Result<()> {
        self.record("COMMIT", &[])?;
        self.state().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.record("ROLLBACK", &[])?;
        self.state().rollbacks += 1;
        Ok(())
    }
}
