//! Undo log for atomic in-memory mutations.
//!
//! Every public mutating operation of a [`Transaction`] runs inside
//! [`Transaction::atomic`]. Nested operations (reverse-side writes, cascade
//! deletes, collection updates) append to the same log, and a failure
//! anywhere unwinds everything recorded since the operation started, in
//! reverse order, through [`Transaction::unwind`].
//!
//! State learned from storage (loads, merges, seeds) is never recorded: it
//! stays valid whether or not the operation that triggered it succeeds.

use txorm_core::{Connection, Result};
use txorm_schema::{AttrId, Bits, KeyId};

use crate::instance::{Cell, IndexKey, ObjId, Status};
use crate::setdata::ItemState;
use crate::transaction::Transaction;

#[derive(Debug, Clone)]
pub(crate) enum UndoRecord {
    /// A new instance was pushed onto the arena
    Allocated(ObjId),
    /// `value` in index `key` mapped to `previous` before the change
    Index {
        key: KeyId,
        value: IndexKey,
        previous: Option<ObjId>,
    },
    Cell {
        obj: ObjId,
        slot: usize,
        previous: Cell,
    },
    Status {
        obj: ObjId,
        status: Status,
        rbits: Bits,
        wbits: Bits,
    },
    /// Queue position before the change, `None` when not queued
    Queue {
        obj: ObjId,
        position: Option<usize>,
    },
    SetItem {
        obj: ObjId,
        attr: AttrId,
        item: ObjId,
        state: ItemState,
        count: Option<usize>,
        /// The collection entry did not exist before
        fresh: bool,
    },
    /// `obj` was added to the modified collections of `attr`
    Modified { attr: AttrId, obj: ObjId },
}

#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    records: Vec<UndoRecord>,
    depth: usize,
}

impl UndoLog {
    pub(crate) fn push(&mut self, record: UndoRecord) {
        if self.depth > 0 {
            self.records.push(record);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    fn begin(&mut self) -> usize {
        self.depth += 1;
        self.records.len()
    }

    fn end(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.records.clear();
        }
    }

    fn take_since(&mut self, mark: usize) -> Vec<UndoRecord> {
        self.records.split_off(mark.min(self.records.len()))
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.depth = 0;
    }
}

impl<C: Connection> Transaction<C> {
    /// Run `f`, undoing every recorded change if it fails.
    pub(crate) fn atomic<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mark = self.undo.begin();
        match f(self) {
            Ok(value) => {
                self.undo.end();
                Ok(value)
            }
            Err(err) => {
                let records = self.undo.take_since(mark);
                tracing::debug!(records = records.len(), error = %err, "unwinding failed operation");
                self.unwind(records);
                self.undo.end();
                Err(err)
            }
        }
    }

    fn unwind(&mut self, records: Vec<UndoRecord>) {
        for record in records.into_iter().rev() {
            match record {
                UndoRecord::Allocated(obj) => {
                    if obj.index() + 1 == self.objects.len() {
                        self.objects.pop();
                    } else if let Some(inst) = self.objects.get_mut(obj.index()) {
                        // storage-side seeds were allocated after it; keep the slot as a tombstone
                        inst.status = Status::Cancelled;
                        inst.queued = false;
                    }
                }
                UndoRecord::Index {
                    key,
                    value,
                    previous,
                } => {
                    let index = self.indexes.entry(key).or_default();
                    match previous {
                        Some(obj) => {
                            index.insert(value, obj);
                        }
                        None => {
                            index.remove(&value);
                        }
                    }
                }
                UndoRecord::Cell {
                    obj,
                    slot,
                    previous,
                } => {
                    self.objects[obj.index()].cells[slot] = previous;
                }
                UndoRecord::Status {
                    obj,
                    status,
                    rbits,
                    wbits,
                } => {
                    let inst = &mut self.objects[obj.index()];
                    inst.status = status;
                    inst.rbits = rbits;
                    inst.wbits = wbits;
                }
                UndoRecord::Queue { obj, position } => {
                    if let Some(current) = self.queue.iter().rposition(|&o| o == obj) {
                        self.queue.remove(current);
                    }
                    if let Some(position) = position {
                        self.queue.insert(position.min(self.queue.len()), obj);
                    }
                    self.objects[obj.index()].queued = position.is_some();
                }
                UndoRecord::SetItem {
                    obj,
                    attr,
                    item,
                    state,
                    count,
                    fresh,
                } => {
                    let sets = &mut self.objects[obj.index()].sets;
                    if let Some(data) = sets.get_mut(&attr) {
                        data.restore(item, state, count);
                        if fresh && data.is_pristine() {
                            sets.remove(&attr);
                        }
                    }
                }
                UndoRecord::Modified { attr, obj } => {
                    if let Some(objects) = self.modified_collections.get_mut(&attr) {
                        objects.remove(&obj);
                        if objects.is_empty() {
                            self.modified_collections.remove(&attr);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_only_inside_operations() {
        let mut log = UndoLog::default();
        log.push(UndoRecord::Queue {
            obj: ObjId::new(1, 0),
            position: None,
        });
        assert_eq!(log.len(), 0);

        let mark = log.begin();
        log.push(UndoRecord::Allocated(ObjId::new(1, 0)));
        assert_eq!(log.len(), 1);
        let inner = log.begin();
        log.push(UndoRecord::Allocated(ObjId::new(1, 1)));
        assert_eq!(log.take_since(inner).len(), 1);
        log.end();
        assert_eq!(log.len(), 1);
        assert_eq!(mark, 0);
        log.end();
        assert_eq!(log.len(), 0);
    }
}
