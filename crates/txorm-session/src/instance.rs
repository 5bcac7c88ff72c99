//! Per-instance storage: object handles, attribute cells and status.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use txorm_core::Value;
use txorm_schema::{AttrId, Bits, EntityId};

use crate::setdata::SetData;

/// Handle of an entity instance inside one [`Transaction`](crate::Transaction).
///
/// Handles are only meaningful for the transaction that issued them; using
/// one with another transaction fails with `TransactionErrorKind::ForeignObject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjId {
    pub(crate) tx: u32,
    pub(crate) index: u32,
}

impl ObjId {
    pub(crate) fn new(tx: u32, index: usize) -> Self {
        Self {
            tx,
            index: index as u32,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Content of one attribute slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    /// Not loaded
    #[default]
    Absent,
    /// Known to be NULL
    Null,
    Value(Value),
    /// Reference to another instance of the same transaction
    Object(ObjId),
}

impl Cell {
    pub fn is_absent(&self) -> bool {
        matches!(self, Cell::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Neither absent nor null.
    pub fn is_set(&self) -> bool {
        matches!(self, Cell::Value(_) | Cell::Object(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Cell::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjId> {
        match self {
            Cell::Object(o) => Some(*o),
            _ => None,
        }
    }

    fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Cell::Absent => 0u8.hash(state),
            Cell::Null => 1u8.hash(state),
            Cell::Value(v) => {
                2u8.hash(state);
                v.hash_into(state);
            }
            Cell::Object(o) => {
                3u8.hash(state);
                o.hash(state);
            }
        }
    }
}

impl From<Value> for Cell {
    fn from(value: Value) -> Self {
        if value.is_null() {
            Cell::Null
        } else {
            Cell::Value(value)
        }
    }
}

impl From<ObjId> for Cell {
    fn from(obj: ObjId) -> Self {
        Cell::Object(obj)
    }
}

impl From<Option<ObjId>> for Cell {
    fn from(obj: Option<ObjId>) -> Self {
        obj.map_or(Cell::Null, Cell::Object)
    }
}

macro_rules! cell_from_scalar {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Cell {
                fn from(value: $ty) -> Self {
                    Cell::from(Value::from(value))
                }
            }
        )*
    };
}

cell_from_scalar!(bool, i32, i64, f64, &str, String);

/// Initial value of an attribute passed to [`Transaction::create`](crate::Transaction::create).
#[derive(Debug, Clone, PartialEq)]
pub enum InitValue {
    Cell(Cell),
    /// Initial members of a collection
    Items(Vec<ObjId>),
}

impl From<Vec<ObjId>> for InitValue {
    fn from(items: Vec<ObjId>) -> Self {
        InitValue::Items(items)
    }
}

macro_rules! init_from_cell {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for InitValue {
                fn from(value: $ty) -> Self {
                    InitValue::Cell(Cell::from(value))
                }
            }
        )*
    };
}

init_from_cell!(Cell, Value, ObjId, Option<ObjId>, bool, i32, i64, f64, &str, String);

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Pending INSERT
    Created,
    /// Read from storage, unchanged
    Loaded,
    /// Pending UPDATE
    Updated,
    /// Written by the last flush
    Saved,
    /// Pending re-verification
    Locked,
    /// Pending DELETE, or deleted by a flush
    Deleted,
    /// Deleted before it was ever inserted
    Cancelled,
}

impl Status {
    pub const fn is_deleted(self) -> bool {
        matches!(self, Status::Deleted | Status::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Loaded => "loaded",
            Status::Updated => "updated",
            Status::Saved => "saved",
            Status::Locked => "locked",
            Status::Deleted => "deleted",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached entity instance.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Instance {
    pub(crate) entity: EntityId,
    pub(crate) status: Status,
    /// Current values, one per family slot
    pub(crate) cells: Vec<Cell>,
    /// Last values known to be in storage
    pub(crate) dbvals: Vec<Cell>,
    pub(crate) rbits: Bits,
    pub(crate) wbits: Bits,
    pub(crate) sets: HashMap<AttrId, SetData>,
    pub(crate) queued: bool,
    /// Fetched with SELECT ... FOR UPDATE
    pub(crate) for_update: bool,
    /// Only the primary key is known
    pub(crate) seed: bool,
}

impl Instance {
    pub(crate) fn new(entity: EntityId, status: Status, slots: usize) -> Self {
        Self {
            entity,
            status,
            cells: vec![Cell::Absent; slots],
            dbvals: vec![Cell::Absent; slots],
            rbits: 0,
            wbits: 0,
            sets: HashMap::new(),
            queued: false,
            for_update: false,
            seed: false,
        }
    }
}

/// Values of one key, in key attribute order.
///
/// Built only when every component is set, so an index never holds a key
/// with a null or absent component.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexKey(pub(crate) Vec<Cell>);

impl Eq for IndexKey {}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for cell in &self.0 {
            cell.hash_into(state);
        }
    }
}

impl IndexKey {
    pub(crate) fn from_cells<'a>(cells: impl IntoIterator<Item = &'a Cell>) -> Option<Self> {
        let mut parts = Vec::new();
        for cell in cells {
            if !cell.is_set() {
                return None;
            }
            parts.push(cell.clone());
        }
        Some(Self(parts))
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|cell| match cell {
                Cell::Value(Value::Text(s)) => format!("{s:?}"),
                Cell::Value(v) => format!("{v:?}"),
                Cell::Object(o) => o.to_string(),
                Cell::Null | Cell::Absent => "NULL".to_string(),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_cell_conversions() {
        assert_eq!(Cell::from(Value::Null), Cell::Null);
        assert_eq!(Cell::from("x"), Cell::Value(Value::Text("x".into())));
        assert_eq!(Cell::from(None::<ObjId>), Cell::Null);
        let obj = ObjId::new(1, 4);
        assert_eq!(Cell::from(Some(obj)).as_object(), Some(obj));
        assert_eq!(obj.to_string(), "#4");
    }

    #[test]
    fn test_index_key_requires_every_component() {
        let a = Cell::from(1i64);
        assert!(IndexKey::from_cells([&a, &Cell::Null]).is_none());
        assert!(IndexKey::from_cells([&a, &Cell::Absent]).is_none());
        assert!(IndexKey::from_cells([&a, &a]).is_some());
    }

    #[test]
    fn test_index_key_hash_and_eq() {
        let mut map = HashMap::new();
        let key = IndexKey(vec![Cell::from("a"), Cell::Object(ObjId::new(1, 2))]);
        map.insert(key.clone(), 7);
        assert_eq!(map.get(&key), Some(&7));
        let other = IndexKey(vec![Cell::from("a"), Cell::Object(ObjId::new(1, 3))]);
        assert!(!map.contains_key(&other));
        assert_eq!(key.to_string(), "\"a\",#2");
    }

    #[test]
    fn test_status_helpers() {
        assert!(Status::Cancelled.is_deleted());
        assert!(!Status::Locked.is_deleted());
        assert_eq!(Status::Updated.to_string(), "updated");
    }
}
