//! Transactions for txorm.
//!
//! A [`Transaction`] is the unit of work: it keeps an identity map of every
//! instance it touches, tracks which attributes were read and written,
//! maintains both sides of bidirectional relationships, and on flush turns the
//! accumulated changes into INSERT, UPDATE and DELETE statements guarded by
//! optimistic checks.
//!
//! # Components
//!
//! - [`Database`]: schema, SQL compiler and statement cache shared by transactions
//! - [`Transaction`]: identity map, dirty tracking, relationship maintenance
//! - [`SetData`]: in-memory state of one to-many collection
//! - [`Cell`] / [`ObjId`]: attribute values and instance handles
//! - [`EntityEvent`]: per-entity insert, update and delete hooks
//!
//! # Example
//!
//! ```ignore
//! let db = Arc::new(Database::new(schema));
//! let mut tx = db.begin(conn);
//! let group = tx.create("Group", [("number", InitValue::from(101))])?;
//! let ann = tx.create("Student", [
//!     ("name", InitValue::from("Ann")),
//!     ("group", InitValue::from(group)),
//! ])?;
//! assert_eq!(tx.set_items(group, "students")?, vec![ann]);
//! tx.commit()?;
//! ```

pub mod config;
pub mod database;
mod flush;
pub mod instance;
pub mod setdata;
#[doc(hidden)]
pub mod testing;
pub mod transaction;
mod undo;

pub use config::{DatabaseConfig, TransactionConfig};
pub use database::Database;
pub use instance::{Cell, InitValue, ObjId, Status};
pub use setdata::SetData;
pub use transaction::Transaction;

use txorm_core::Result;

type TransactionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Registered transaction-level callbacks.
#[derive(Default)]
pub(crate) struct TransactionEventCallbacks {
    pub(crate) before_flush: Vec<TransactionEventFn>,
    pub(crate) after_flush: Vec<TransactionEventFn>,
    pub(crate) after_commit: Vec<TransactionEventFn>,
    pub(crate) after_rollback: Vec<TransactionEventFn>,
}

impl std::fmt::Debug for TransactionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl TransactionEventCallbacks {
    pub(crate) fn fire(&mut self, event: TransactionEvent) -> Result<()> {
        let callbacks = match event {
            TransactionEvent::BeforeFlush => &mut self.before_flush,
            TransactionEvent::AfterFlush => &mut self.after_flush,
            TransactionEvent::AfterCommit => &mut self.after_commit,
            TransactionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Save events of single instances, registered per entity with
/// [`Transaction::on_entity`]; hooks of an entity also run for its subtypes.
///
/// `Before*` hooks run for every queued instance before the flush emits any
/// statement and may still change instances. `After*` hooks run once the
/// flush has written everything; changes they make are flushed in turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityEvent {
    BeforeInsert,
    BeforeUpdate,
    BeforeDelete,
    AfterInsert,
    AfterUpdate,
    AfterDelete,
}

/// Transaction lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Before a flush with pending work; an error aborts the flush.
    BeforeFlush,
    AfterFlush,
    AfterCommit,
    /// After rollback discarded the in-memory state.
    AfterRollback,
}
