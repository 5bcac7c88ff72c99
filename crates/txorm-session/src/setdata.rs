//! Collection tracking for to-many attributes.
//!
//! Each (instance, `Set` attribute) pair owns a [`SetData`]: the members
//! known so far plus the local additions and removals that have not reached
//! storage yet. Local changes go through the `add`/`remove`/`assign`
//! operations of the transaction and keep the reverse side consistent;
//! storage-side knowledge arrives through `db_reverse_add`/`db_reverse_remove`
//! and through [`Transaction::load_collection`].

use std::collections::BTreeSet;

use txorm_core::{Connection, Error, Result, TypeError};
use txorm_query::SqlAst;
use txorm_schema::AttrId;

use crate::instance::{Cell, ObjId, Status};
use crate::transaction::Transaction;
use crate::undo::UndoRecord;

/// Membership state of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetData {
    pub(crate) items: BTreeSet<ObjId>,
    pub(crate) added: BTreeSet<ObjId>,
    pub(crate) removed: BTreeSet<ObjId>,
    pub(crate) is_fully_loaded: bool,
    pub(crate) count: Option<usize>,
}

/// Membership flags of one item, saved by the undo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ItemState {
    member: bool,
    added: bool,
    removed: bool,
}

impl SetData {
    /// Collection of a newly created instance: empty and complete.
    pub(crate) fn loaded_empty() -> Self {
        Self {
            is_fully_loaded: true,
            count: Some(0),
            ..Self::default()
        }
    }

    /// Known members, loaded or added locally.
    pub fn items(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.items.iter().copied()
    }

    /// Members added in this transaction and not yet written to the link storage.
    pub fn added(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.added.iter().copied()
    }

    pub fn removed(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.removed.iter().copied()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.is_fully_loaded
    }

    /// Total number of members, when known.
    pub fn count(&self) -> Option<usize> {
        self.count
    }

    pub fn contains(&self, item: ObjId) -> bool {
        self.items.contains(&item)
    }

    pub fn has_deltas(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub(crate) fn state(&self, item: ObjId) -> ItemState {
        ItemState {
            member: self.items.contains(&item),
            added: self.added.contains(&item),
            removed: self.removed.contains(&item),
        }
    }

    pub(crate) fn restore(&mut self, item: ObjId, state: ItemState, count: Option<usize>) {
        fn apply(set: &mut BTreeSet<ObjId>, item: ObjId, present: bool) {
            if present {
                set.insert(item);
            } else {
                set.remove(&item);
            }
        }
        apply(&mut self.items, item, state.member);
        apply(&mut self.added, item, state.added);
        apply(&mut self.removed, item, state.removed);
        self.count = count;
    }

    /// Nothing known and nothing changed.
    pub(crate) fn is_pristine(&self) -> bool {
        self.items.is_empty() && !self.has_deltas() && !self.is_fully_loaded && self.count.is_none()
    }

    /// Add a member locally; a pending removal of the same item is cancelled.
    pub(crate) fn insert_local(&mut self, item: ObjId) -> bool {
        if !self.items.insert(item) {
            return false;
        }
        if !self.removed.remove(&item) {
            self.added.insert(item);
        }
        if let Some(count) = self.count.as_mut() {
            *count += 1;
        }
        true
    }

    /// Remove a member locally; a pending addition of the same item is cancelled.
    pub(crate) fn remove_local(&mut self, item: ObjId) -> bool {
        if !self.items.remove(&item) {
            return false;
        }
        if !self.added.remove(&item) {
            self.removed.insert(item);
        }
        if let Some(count) = self.count.as_mut() {
            *count = count.saturating_sub(1);
        }
        true
    }

    pub(crate) fn clear_deltas(&mut self) {
        self.added.clear();
        self.removed.clear();
    }
}

impl<C: Connection> Transaction<C> {
    /// Members of a collection, loading it on first access.
    pub fn set_items(&mut self, obj: ObjId, attr: &str) -> Result<Vec<ObjId>> {
        let attr = self.collection_attr(obj, attr)?;
        self.load_collection(obj, attr)?;
        Ok(self.objects[obj.index()]
            .sets
            .get(&attr)
            .map(|data| data.items().collect())
            .unwrap_or_default())
    }

    /// Number of members, loading the collection when the count is unknown.
    pub fn set_len(&mut self, obj: ObjId, attr: &str) -> Result<usize> {
        let attr = self.collection_attr(obj, attr)?;
        if let Some(count) = self.objects[obj.index()]
            .sets
            .get(&attr)
            .and_then(SetData::count)
        {
            return Ok(count);
        }
        self.load_collection(obj, attr)?;
        Ok(self.objects[obj.index()]
            .sets
            .get(&attr)
            .map_or(0, |data| data.items.len()))
    }

    pub fn set_contains(&mut self, obj: ObjId, attr: &str, item: ObjId) -> Result<bool> {
        let attr = self.collection_attr(obj, attr)?;
        self.check_obj(item)?;
        if let Some(data) = self.objects[obj.index()].sets.get(&attr) {
            if data.contains(item) {
                return Ok(true);
            }
            if data.is_fully_loaded || data.removed.contains(&item) {
                return Ok(false);
            }
        }
        self.load_collection(obj, attr)?;
        Ok(self.objects[obj.index()]
            .sets
            .get(&attr)
            .is_some_and(|data| data.contains(item)))
    }

    /// Current tracking state of a collection, without loading it.
    pub fn set_data(&self, obj: ObjId, attr: &str) -> Result<Option<&SetData>> {
        self.check_obj(obj)?;
        let attr = self.schema.attr_by_name(self.objects[obj.index()].entity, attr)?;
        Ok(self.objects[obj.index()].sets.get(&attr))
    }

    pub fn set_add(&mut self, obj: ObjId, attr: &str, items: &[ObjId]) -> Result<()> {
        let attr = self.collection_attr(obj, attr)?;
        self.atomic(|tx| tx.add_items(obj, attr, items))
    }

    pub fn set_remove(&mut self, obj: ObjId, attr: &str, items: &[ObjId]) -> Result<()> {
        let attr = self.collection_attr(obj, attr)?;
        self.atomic(|tx| tx.remove_items(obj, attr, items))
    }

    /// Replace the members of a collection.
    pub fn set_assign(&mut self, obj: ObjId, attr: &str, items: &[ObjId]) -> Result<()> {
        let attr = self.collection_attr(obj, attr)?;
        self.atomic(|tx| tx.assign_items(obj, attr, items))
    }

    pub fn set_clear(&mut self, obj: ObjId, attr: &str) -> Result<()> {
        self.set_assign(obj, attr, &[])
    }

    fn collection_attr(&self, obj: ObjId, name: &str) -> Result<AttrId> {
        self.check_alive(obj)?;
        let attr = self.schema.attr_by_name(self.objects[obj.index()].entity, name)?;
        if !self.schema.attr(attr).is_collection() {
            return Err(Error::Type(TypeError {
                expected: "collection attribute",
                actual: "single-valued attribute".to_string(),
                attribute: Some(self.schema.attr_path(attr)),
            }));
        }
        Ok(attr)
    }

    fn validate_items(&self, attr: AttrId, items: &[ObjId]) -> Result<BTreeSet<ObjId>> {
        let a = self.schema.attr(attr);
        items
            .iter()
            .map(|&item| match self.validate_cell(a, Cell::Object(item))? {
                Cell::Object(item) => Ok(item),
                _ => Err(self.inconsistent(format!(
                    "collection {} received a non-object value",
                    self.schema.attr_path(attr)
                ))),
            })
            .collect()
    }

    /// Change one item's membership, recording the undo state.
    fn set_item(&mut self, obj: ObjId, attr: AttrId, item: ObjId, insert: bool) -> bool {
        let sets = &mut self.objects[obj.index()].sets;
        let fresh = !sets.contains_key(&attr);
        let data = sets.entry(attr).or_default();
        let state = data.state(item);
        let count = data.count;
        let changed = if insert {
            data.insert_local(item)
        } else {
            data.remove_local(item)
        };
        if !changed {
            if fresh && data.is_pristine() {
                sets.remove(&attr);
            }
            return false;
        }
        self.undo.push(UndoRecord::SetItem {
            obj,
            attr,
            item,
            state,
            count,
            fresh,
        });
        true
    }

    fn mark_modified(&mut self, attr: AttrId, obj: ObjId) {
        if self.modified_collections.entry(attr).or_default().insert(obj) {
            self.undo.push(UndoRecord::Modified { attr, obj });
        }
    }

    fn is_member(&self, obj: ObjId, attr: AttrId, item: ObjId) -> bool {
        self.objects[obj.index()]
            .sets
            .get(&attr)
            .is_some_and(|data| data.contains(item))
    }

    pub(crate) fn add_items(&mut self, obj: ObjId, attr: AttrId, items: &[ObjId]) -> Result<()> {
        self.check_alive(obj)?;
        let mut items = self.validate_items(attr, items)?;
        items.retain(|&item| !self.is_member(obj, attr, item));
        if items.is_empty() {
            return Ok(());
        }
        let schema = self.schema.clone();
        let rev = self.reverse_of(attr)?;
        if schema.attr(rev).is_collection() {
            for &item in &items {
                self.reverse_add(item, rev, obj)?;
            }
        } else {
            for &item in &items {
                self.set_attr(item, rev, Cell::Object(obj), true)?;
            }
        }
        for &item in &items {
            self.set_item(obj, attr, item, true);
        }
        self.mark_modified(attr, obj);
        tracing::trace!(attr = %schema.attr_path(attr), items = items.len(), "collection add");
        Ok(())
    }

    pub(crate) fn remove_items(&mut self, obj: ObjId, attr: AttrId, items: &[ObjId]) -> Result<()> {
        self.check_alive(obj)?;
        let mut items = self.validate_items(attr, items)?;
        if let Some(data) = self.objects[obj.index()].sets.get(&attr) {
            items.retain(|item| !data.removed.contains(item));
        }
        if items.is_empty() {
            return Ok(());
        }
        self.load_collection(obj, attr)?;
        items.retain(|&item| self.is_member(obj, attr, item));
        if items.is_empty() {
            return Ok(());
        }
        self.unlink_members(obj, attr, &items)?;
        for &item in &items {
            self.set_item(obj, attr, item, false);
        }
        self.mark_modified(attr, obj);
        Ok(())
    }

    pub(crate) fn assign_items(&mut self, obj: ObjId, attr: AttrId, items: &[ObjId]) -> Result<()> {
        self.check_alive(obj)?;
        let new_items = self.validate_items(attr, items)?;
        self.load_collection(obj, attr)?;
        let current: BTreeSet<ObjId> = self.objects[obj.index()]
            .sets
            .get(&attr)
            .map(|data| data.items.clone())
            .unwrap_or_default();
        if current == new_items {
            return Ok(());
        }
        let to_remove: BTreeSet<ObjId> = current.difference(&new_items).copied().collect();
        let to_add: BTreeSet<ObjId> = new_items.difference(&current).copied().collect();

        self.unlink_members(obj, attr, &to_remove)?;
        let schema = self.schema.clone();
        let rev = self.reverse_of(attr)?;
        if schema.attr(rev).is_collection() {
            for &item in &to_add {
                self.reverse_add(item, rev, obj)?;
            }
        } else {
            for &item in &to_add {
                self.set_attr(item, rev, Cell::Object(obj), true)?;
            }
        }
        for &item in &to_remove {
            self.set_item(obj, attr, item, false);
        }
        for &item in &to_add {
            self.set_item(obj, attr, item, true);
        }
        self.mark_modified(attr, obj);
        Ok(())
    }

    /// Detach `items` from the reverse side before they leave `obj.attr`.
    fn unlink_members(&mut self, obj: ObjId, attr: AttrId, items: &BTreeSet<ObjId>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let schema = self.schema.clone();
        let a = schema.attr(attr);
        let rev = self.reverse_of(attr)?;
        let r = schema.attr(rev);
        if r.is_collection() {
            for &item in items {
                self.reverse_remove(item, rev, obj)?;
            }
        } else if a.cascade_delete() {
            for &item in items {
                self.delete_obj(item)?;
            }
        } else if r.is_required() {
            let first = items.iter().next().copied().unwrap_or(obj);
            return Err(self.constraint(format!(
                "Cannot remove {} from {}.{}: attribute {} is required",
                self.describe(first),
                self.describe(obj),
                a.name(),
                schema.attr_path(rev)
            )));
        } else {
            for &item in items {
                self.set_attr(item, rev, Cell::Null, true)?;
            }
        }
        Ok(())
    }

    /// Add `item` to `owner.attr` on behalf of the reverse side.
    pub(crate) fn reverse_add(&mut self, owner: ObjId, attr: AttrId, item: ObjId) -> Result<()> {
        if let Some(data) = self.objects[owner.index()].sets.get(&attr) {
            if data.contains(item) || data.added.contains(&item) {
                return Err(self.inconsistent(format!(
                    "{} is already a member of {}.{}",
                    self.describe(item),
                    self.describe(owner),
                    self.schema.attr(attr).name()
                )));
            }
        }
        self.set_item(owner, attr, item, true);
        self.mark_modified(attr, owner);
        Ok(())
    }

    /// Remove `item` from `owner.attr` on behalf of the reverse side.
    pub(crate) fn reverse_remove(&mut self, owner: ObjId, attr: AttrId, item: ObjId) -> Result<()> {
        let known = self.objects[owner.index()]
            .sets
            .get(&attr)
            .is_some_and(|data| data.contains(item) && !data.removed.contains(&item));
        if !known {
            return Err(self.inconsistent(format!(
                "{} is not a member of {}.{}",
                self.describe(item),
                self.describe(owner),
                self.schema.attr(attr).name()
            )));
        }
        self.set_item(owner, attr, item, false);
        self.mark_modified(attr, owner);
        Ok(())
    }

    /// Storage says `item` belongs to `owner.attr`.
    pub(crate) fn db_reverse_add(&mut self, owner: ObjId, attr: AttrId, item: ObjId) -> Result<()> {
        if let Some(data) = self.objects[owner.index()].sets.get(&attr) {
            if data.items.contains(&item) || data.removed.contains(&item) {
                return Ok(());
            }
            if data.is_fully_loaded {
                return Err(self.unrepeatable(format!(
                    "Phantom object {} appeared in collection {}.{}",
                    self.describe(item),
                    self.describe(owner),
                    self.schema.attr(attr).name()
                )));
            }
        }
        self.objects[owner.index()]
            .sets
            .entry(attr)
            .or_default()
            .items
            .insert(item);
        Ok(())
    }

    /// Storage says `item` no longer belongs to `owner.attr`.
    pub(crate) fn db_reverse_remove(&mut self, owner: ObjId, attr: AttrId, item: ObjId) -> Result<()> {
        let Some(data) = self.objects[owner.index()].sets.get(&attr) else {
            return Ok(());
        };
        if data.added.contains(&item) {
            return Ok(());
        }
        if data.is_fully_loaded && data.items.contains(&item) {
            return Err(self.unrepeatable(format!(
                "Phantom object {} disappeared from collection {}.{}",
                self.describe(item),
                self.describe(owner),
                self.schema.attr(attr).name()
            )));
        }
        if let Some(data) = self.objects[owner.index()].sets.get_mut(&attr) {
            data.items.remove(&item);
        }
        Ok(())
    }

    /// Read every member of `obj.attr` from storage, once per transaction.
    pub(crate) fn load_collection(&mut self, obj: ObjId, attr: AttrId) -> Result<()> {
        let inst = &self.objects[obj.index()];
        if inst.status == Status::Created
            || inst.sets.get(&attr).is_some_and(SetData::is_fully_loaded)
        {
            return Ok(());
        }
        let schema = self.schema.clone();
        let a = schema.attr(attr);
        let rev = self.reverse_of(attr)?;
        let target = a.target().ok_or_else(|| {
            self.inconsistent(format!("collection {} has no target", schema.attr_path(attr)))
        })?;
        let params = self.raw_pk(obj)?;

        let loaded: BTreeSet<ObjId> = if let Some(link) = schema.link_table(attr) {
            let ast = SqlAst::select_by(
                link.table.clone(),
                link.target_columns.clone(),
                &link.own_columns,
            );
            let rows = self.query_statement(&ast, &params)?;
            let mut loaded = BTreeSet::new();
            for row in &rows {
                let values = link
                    .target_columns
                    .iter()
                    .map(|column| {
                        row.get_by_name(column).cloned().ok_or_else(|| {
                            self.inconsistent(format!(
                                "link row of {} lacks column {}",
                                link.table, column
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                loaded.insert(self.seed(target, &values)?);
            }
            loaded
        } else {
            let ast = SqlAst::select_by(
                schema.entity(target).table(),
                self.fetch_columns(target),
                schema.columns(rev),
            );
            let rows = self.query_statement(&ast, &params)?;
            let mut loaded = BTreeSet::new();
            for row in &rows {
                loaded.insert(self.materialize_row(target, row)?);
            }
            loaded
        };

        self.objects[obj.index()].sets.entry(attr).or_default();
        let data = &self.objects[obj.index()].sets[&attr];
        let phantom = data
            .items
            .iter()
            .find(|item| !loaded.contains(item) && !data.added.contains(item))
            .copied();
        if let Some(phantom) = phantom {
            return Err(self.unrepeatable(format!(
                "Phantom object {} disappeared from collection {}.{}",
                self.describe(phantom),
                self.describe(obj),
                a.name()
            )));
        }
        let new_items: Vec<ObjId> = loaded
            .iter()
            .filter(|item| !data.items.contains(item) && !data.removed.contains(item))
            .copied()
            .collect();
        if let Some(data) = self.objects[obj.index()].sets.get_mut(&attr) {
            data.items.extend(new_items.iter().copied());
            data.is_fully_loaded = true;
            data.count = Some(data.items.len());
        }

        if schema.link_table(attr).is_some() {
            for item in new_items {
                self.db_reverse_add(item, rev, obj)?;
            }
        }
        tracing::debug!(
            collection = %schema.attr_path(attr),
            owner = %self.describe(obj),
            loaded = loaded.len(),
            "collection loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(i: usize) -> ObjId {
        ObjId::new(1, i)
    }

    #[test]
    fn test_remove_then_add_cancels() {
        let mut data = SetData {
            items: [obj(1), obj(2)].into_iter().collect(),
            is_fully_loaded: true,
            count: Some(2),
            ..SetData::default()
        };
        assert!(data.remove_local(obj(1)));
        assert_eq!(data.removed().collect::<Vec<_>>(), vec![obj(1)]);
        assert_eq!(data.count(), Some(1));
        assert!(data.insert_local(obj(1)));
        assert!(!data.has_deltas());
        assert_eq!(data.count(), Some(2));
    }

    #[test]
    fn test_add_then_remove_cancels() {
        let mut data = SetData::loaded_empty();
        assert!(data.insert_local(obj(3)));
        assert_eq!(data.added().collect::<Vec<_>>(), vec![obj(3)]);
        assert!(data.remove_local(obj(3)));
        assert!(!data.has_deltas());
        assert_eq!(data.count(), Some(0));
    }

    #[test]
    fn test_duplicate_changes_are_ignored() {
        let mut data = SetData::loaded_empty();
        assert!(data.insert_local(obj(1)));
        assert!(!data.insert_local(obj(1)));
        assert!(!data.remove_local(obj(2)));
        assert_eq!(data.count(), Some(1));
    }

    #[test]
    fn test_restore_item_state() {
        let mut data = SetData::default();
        let before = data.state(obj(4));
        data.insert_local(obj(4));
        data.restore(obj(4), before, None);
        assert!(data.is_pristine());
    }

    #[test]
    fn test_unknown_count_stays_unknown() {
        let mut data = SetData::default();
        data.insert_local(obj(1));
        assert_eq!(data.count(), None);
        assert!(!data.is_fully_loaded());
    }
}
