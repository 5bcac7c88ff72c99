//! Flush pipeline: turns pending in-memory changes into SQL.
//!
//! Order of work:
//! 1. link rows removed from many-to-many collections are deleted,
//! 2. queued instances are saved in queue order, each after the created
//!    instances it references,
//! 3. link rows added to many-to-many collections are inserted.
//!
//! Entity `Before*` hooks run over the whole queue before step 1, `After*`
//! hooks after step 3. Changes made by after-save hooks start another round.
//!
//! Updates and deletes carry optimistic criteria built from the storage values
//! of attributes this transaction has read.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use txorm_core::{
    CacheErrorKind, Connection, DependencyError, Error, Result, TypeError, Value,
};
use txorm_query::{Criterion, SqlAst};
use txorm_schema::{AttrId, AttrType};

use crate::instance::{Cell, IndexKey, ObjId, Status};
use crate::transaction::Transaction;
use crate::{EntityEvent, TransactionEvent};

/// Flush rounds allowed while after-save hooks keep changing instances.
const MAX_FLUSH_ROUNDS: usize = 50;

/// Link-table delta of one many-to-many relationship.
#[derive(Debug)]
struct LinkChange {
    attr: AttrId,
    added: BTreeSet<(ObjId, ObjId)>,
    removed: BTreeSet<(ObjId, ObjId)>,
}

impl<C: Connection> Transaction<C> {
    /// Write pending changes to storage without committing.
    ///
    /// Does nothing when no instance or collection is pending. When
    /// `strict` is configured, a failure rolls the transaction back.
    #[tracing::instrument(level = "debug", skip(self), fields(transaction = self.id))]
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        match self.flush_pending() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    pub(crate) fn flush_pending(&mut self) -> Result<()> {
        if self.flush_disabled || !self.is_modified() {
            return Ok(());
        }
        self.events.fire(TransactionEvent::BeforeFlush)?;
        for _ in 0..MAX_FLUSH_ROUNDS {
            self.before_save_hooks()?;
            self.flush_inner()?;
            self.after_save_hooks()?;
            if !self.is_modified() {
                return self.events.fire(TransactionEvent::AfterFlush);
            }
        }
        Err(self.inconsistent(format!(
            "After-save hooks kept modifying instances for {MAX_FLUSH_ROUNDS} flush rounds"
        )))
    }

    /// Run before-save hooks of queued instances; hooks may queue more.
    fn before_save_hooks(&mut self) -> Result<()> {
        let mut position = 0;
        while position < self.queue.len() && !self.entity_hooks.is_empty() {
            let obj = self.queue[position];
            let event = match self.objects[obj.index()].status {
                Status::Created => Some(EntityEvent::BeforeInsert),
                Status::Updated => Some(EntityEvent::BeforeUpdate),
                Status::Deleted => Some(EntityEvent::BeforeDelete),
                _ => None,
            };
            if let Some(event) = event {
                self.fire_entity_event(obj, event)?;
            }
            position += 1;
        }
        Ok(())
    }

    fn after_save_hooks(&mut self) -> Result<()> {
        for (obj, event) in std::mem::take(&mut self.saved) {
            self.fire_entity_event(obj, event)?;
        }
        Ok(())
    }

    fn flush_inner(&mut self) -> Result<()> {
        self.saved.clear();
        let schema = Arc::clone(&self.schema);
        let links = self.link_changes();

        let mut link_rows = 0;
        for change in &links {
            if change.removed.is_empty() {
                continue;
            }
            let Some(link) = schema.link_table(change.attr) else {
                continue;
            };
            let criteria = link
                .own_columns
                .iter()
                .chain(&link.target_columns)
                .cloned()
                .map(Criterion::Eq)
                .collect();
            let ast = SqlAst::delete(link.table.clone(), criteria);
            let params = self.link_params(&change.removed)?;
            link_rows += self.execute_batch(&ast, &params)?;
        }

        let queue = self.queue.clone();
        for &obj in &queue {
            let mut chain = Vec::new();
            self.save(obj, &mut chain)?;
        }

        for change in &links {
            if change.added.is_empty() {
                continue;
            }
            let Some(link) = schema.link_table(change.attr) else {
                continue;
            };
            let columns = link
                .own_columns
                .iter()
                .chain(&link.target_columns)
                .cloned()
                .collect();
            let ast = SqlAst::insert(link.table.clone(), columns, None);
            let params = self.link_params(&change.added)?;
            link_rows += self.execute_batch(&ast, &params)?;
        }

        for (attr, owners) in std::mem::take(&mut self.modified_collections) {
            for owner in owners {
                if let Some(data) = self.objects[owner.index()].sets.get_mut(&attr) {
                    data.clear_deltas();
                }
            }
        }
        for obj in std::mem::take(&mut self.queue) {
            self.objects[obj.index()].queued = false;
        }
        tracing::info!(objects = queue.len(), link_rows, "flush complete");
        Ok(())
    }

    /// Pending link pairs, one entry per relationship, in a stable order.
    fn link_changes(&self) -> Vec<LinkChange> {
        let schema = &self.schema;
        let mut attrs: Vec<AttrId> = self
            .modified_collections
            .keys()
            .copied()
            .filter(|&attr| schema.link_table(attr).is_some())
            .collect();
        attrs.sort_by(|&x, &y| {
            let (a, b) = (schema.attr(x), schema.attr(y));
            (schema.entity(a.entity()).name(), a.name())
                .cmp(&(schema.entity(b.entity()).name(), b.name()))
        });

        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        for attr in attrs {
            if schema.attr(attr).reverse().is_some_and(|rev| seen.contains(&rev)) {
                continue;
            }
            seen.insert(attr);
            let mut change = LinkChange {
                attr,
                added: BTreeSet::new(),
                removed: BTreeSet::new(),
            };
            for &owner in &self.modified_collections[&attr] {
                if let Some(data) = self.objects[owner.index()].sets.get(&attr) {
                    change.added.extend(data.added().map(|item| (owner, item)));
                    change.removed.extend(data.removed().map(|item| (owner, item)));
                }
            }
            changes.push(change);
        }
        changes
    }

    fn link_params(&self, pairs: &BTreeSet<(ObjId, ObjId)>) -> Result<Vec<Vec<Value>>> {
        pairs
            .iter()
            .map(|&(owner, item)| {
                let mut params = self.raw_pk(owner)?;
                params.extend(self.raw_pk(item)?);
                Ok(params)
            })
            .collect()
    }

    fn save(&mut self, obj: ObjId, chain: &mut Vec<ObjId>) -> Result<()> {
        let inst = &self.objects[obj.index()];
        match inst.status {
            Status::Created | Status::Updated => {
                self.save_principals(obj, chain)?;
                if self.objects[obj.index()].status == Status::Created {
                    self.save_created(obj)
                } else {
                    self.save_updated(obj)
                }
            }
            Status::Deleted if inst.queued => self.save_deleted(obj),
            Status::Locked => self.save_locked(obj),
            _ => Ok(()),
        }
    }

    /// Save created instances referenced by `obj` before `obj` itself.
    fn save_principals(&mut self, obj: ObjId, chain: &mut Vec<ObjId>) -> Result<()> {
        if chain.contains(&obj) {
            let names = chain
                .iter()
                .chain(std::iter::once(&obj))
                .map(|o| {
                    self.schema
                        .entity(self.objects[o.index()].entity)
                        .name()
                        .to_string()
                })
                .collect();
            return Err(Error::Dependency(DependencyError { chain: names }));
        }
        chain.push(obj);

        let schema = Arc::clone(&self.schema);
        let inst = &self.objects[obj.index()];
        let created = inst.status == Status::Created;
        let wbits = inst.wbits;
        let mut principals = Vec::new();
        for &attr in schema.entity(inst.entity).attrs() {
            let a = schema.attr(attr);
            if !a.is_reference() || schema.columns(attr).is_empty() {
                continue;
            }
            if !created && wbits & a.bit() == 0 {
                continue;
            }
            if let Cell::Object(target) = inst.cells[a.slot()] {
                if self.objects[target.index()].status == Status::Created {
                    principals.push(target);
                }
            }
        }
        for target in principals {
            if self.objects[target.index()].status == Status::Created {
                self.save_principals(target, chain)?;
                self.save_created(target)?;
            }
        }
        chain.pop();
        Ok(())
    }

    fn save_created(&mut self, obj: ObjId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let entity = self.objects[obj.index()].entity;
        let ety = schema.entity(entity);

        let mut columns = Vec::new();
        let mut params = Vec::new();
        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            let attr_columns = schema.columns(attr);
            if a.is_collection() || attr_columns.is_empty() {
                continue;
            }
            let cell = &self.objects[obj.index()].cells[a.slot()];
            if cell.is_absent() {
                continue;
            }
            columns.extend(attr_columns.iter().cloned());
            params.extend(self.raw_values(attr, cell)?);
        }

        let Some(&pk_attr) = ety.pk_attrs().first() else {
            return Err(self.inconsistent(format!("{} has no primary key", ety.name())));
        };
        let pk_slot = schema.attr(pk_attr).slot();
        let generated = ety.has_auto_pk() && self.objects[obj.index()].cells[pk_slot].is_absent();
        if generated {
            let returning = schema.pk_columns(entity).first().cloned();
            let ast = SqlAst::insert(ety.table(), columns, returning);
            let key = self
                .insert_statement(&ast, &params)?
                .filter(|value| !value.is_null())
                .ok_or_else(|| {
                    self.inconsistent(format!(
                        "Storage did not return a generated key for {}",
                        self.describe(obj)
                    ))
                })?;
            let key = match schema.attr(pk_attr).ty() {
                AttrType::Scalar(kind) => kind.coerce(key)?,
                AttrType::Entity(_) => {
                    return Err(Error::Type(TypeError {
                        expected: "scalar key",
                        actual: key.type_name().to_string(),
                        attribute: Some(schema.attr_path(pk_attr)),
                    }));
                }
            };
            let cell = Cell::from(key);
            let index_key = IndexKey(vec![cell.clone()]);
            let existing = self
                .indexes
                .get(&ety.pk_key())
                .and_then(|index| index.get(&index_key))
                .copied();
            if let Some(other) = existing.filter(|&other| other != obj) {
                return Err(self.obj_error(
                    CacheErrorKind::UniqueViolation,
                    other,
                    format!(
                        "Newly auto-generated id value {} was already used in transaction cache for another object",
                        index_key
                    ),
                ));
            }
            self.indexes
                .entry(ety.pk_key())
                .or_default()
                .insert(index_key, obj);
            self.objects[obj.index()].cells[pk_slot] = cell;
        } else {
            let ast = SqlAst::insert(ety.table(), columns, None);
            self.execute_statement(&ast, &params)?;
        }

        let inst = &mut self.objects[obj.index()];
        inst.status = Status::Saved;
        inst.rbits = ety.all_bits_except_volatile();
        inst.wbits = 0;
        inst.queued = false;
        self.update_dbvals(obj, true);
        self.saved.push((obj, EntityEvent::AfterInsert));
        tracing::debug!(object = %self.describe(obj), "inserted");
        Ok(())
    }

    fn save_updated(&mut self, obj: ObjId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let inst = &self.objects[obj.index()];
        let ety = schema.entity(inst.entity);
        let wbits = inst.wbits;

        let mut set = Vec::new();
        let mut params = Vec::new();
        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            let columns = schema.columns(attr);
            if a.is_collection() || columns.is_empty() || wbits & a.bit() == 0 {
                continue;
            }
            set.extend(columns.iter().cloned());
            params.extend(self.raw_values(attr, &inst.cells[a.slot()])?);
        }

        if !set.is_empty() {
            let (criteria, criteria_params) = self.save_criteria(obj)?;
            params.extend(criteria_params);
            let ast = SqlAst::update(ety.table(), set, criteria);
            let rows = self.execute_statement(&ast, &params)?;
            if rows != 1 {
                return Err(self.stale(obj));
            }
        }

        let inst = &mut self.objects[obj.index()];
        inst.status = Status::Saved;
        inst.rbits |= wbits & ety.all_bits_except_volatile();
        inst.wbits = 0;
        inst.queued = false;
        self.update_dbvals(obj, false);
        self.saved.push((obj, EntityEvent::AfterUpdate));
        tracing::debug!(object = %self.describe(obj), "updated");
        Ok(())
    }

    fn save_deleted(&mut self, obj: ObjId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity(self.objects[obj.index()].entity);
        let (criteria, params) = self.save_criteria(obj)?;
        let ast = SqlAst::delete(ety.table(), criteria);
        let rows = self.execute_statement(&ast, &params)?;
        if rows != 1 {
            return Err(self.stale(obj));
        }
        if let Some(key) = self.key_value(obj, schema.key(ety.pk_key()), None) {
            if let Some(index) = self.indexes.get_mut(&ety.pk_key()) {
                if index.get(&key) == Some(&obj) {
                    index.remove(&key);
                }
            }
        }
        self.objects[obj.index()].queued = false;
        self.saved.push((obj, EntityEvent::AfterDelete));
        tracing::debug!(object = %self.describe(obj), "deleted");
        Ok(())
    }

    /// Verify a locked instance: re-select it with the optimistic criteria.
    fn save_locked(&mut self, obj: ObjId) -> Result<()> {
        let (criteria, params) = self.save_criteria(obj)?;
        let pk_len = self.schema.pk_columns(self.objects[obj.index()].entity).len();
        if criteria.len() > pk_len {
            let entity = self.objects[obj.index()].entity;
            let ast = SqlAst::Select(txorm_query::Select {
                table: self.schema.entity(entity).table().to_string(),
                columns: self.schema.pk_columns(entity).to_vec(),
                criteria,
                for_update: false,
                limit: None,
            });
            let rows = self.query_statement(&ast, &params)?;
            if rows.is_empty() {
                return Err(self.stale(obj));
            }
        }
        let inst = &mut self.objects[obj.index()];
        inst.status = Status::Loaded;
        inst.queued = false;
        Ok(())
    }

    /// Primary key criteria followed by optimistic checks on read attributes.
    fn save_criteria(&self, obj: ObjId) -> Result<(Vec<Criterion>, Vec<Value>)> {
        let schema = &self.schema;
        let inst = &self.objects[obj.index()];
        let ety = schema.entity(inst.entity);
        let mut criteria: Vec<Criterion> = schema
            .pk_columns(inst.entity)
            .iter()
            .cloned()
            .map(Criterion::Eq)
            .collect();
        let mut params = self.raw_pk(obj)?;
        if !self.config.optimistic || inst.for_update {
            return Ok((criteria, params));
        }
        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            if a.is_pk() || a.is_collection() || !a.is_optimistic() || a.is_volatile() {
                continue;
            }
            let columns = schema.columns(attr);
            if columns.is_empty() || inst.rbits & a.bit() == 0 {
                continue;
            }
            match &inst.dbvals[a.slot()] {
                Cell::Absent => {}
                Cell::Null => criteria.extend(columns.iter().cloned().map(Criterion::IsNull)),
                dbval => {
                    criteria.extend(columns.iter().cloned().map(Criterion::Eq));
                    params.extend(self.raw_values(attr, dbval)?);
                }
            }
        }
        Ok((criteria, params))
    }

    fn stale(&self, obj: ObjId) -> Error {
        tracing::warn!(object = %self.describe(obj), "optimistic check failed");
        self.obj_error(
            CacheErrorKind::StaleRead,
            obj,
            format!(
                "Object {} was updated outside of current transaction",
                self.describe(obj)
            ),
        )
    }

    /// Make storage values match the saved cells.
    fn update_dbvals(&mut self, obj: ObjId, after_create: bool) {
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity(self.objects[obj.index()].entity);
        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            if a.is_collection() {
                continue;
            }
            let slot = a.slot();
            if a.is_volatile() {
                for &(key, _) in a.keys() {
                    let kd = schema.key(key);
                    if kd.is_pk() {
                        continue;
                    }
                    if let Some(value) = self.key_value(obj, kd, None) {
                        self.index_remove(key, value, obj);
                    }
                }
                let inst = &mut self.objects[obj.index()];
                inst.cells[slot] = Cell::Absent;
                inst.dbvals[slot] = Cell::Absent;
                inst.rbits &= !a.bit();
                continue;
            }
            let inst = &mut self.objects[obj.index()];
            if after_create && !inst.cells[slot].is_set() && !schema.columns(attr).is_empty() {
                // storage may have filled in a default
                inst.cells[slot] = Cell::Absent;
                inst.dbvals[slot] = Cell::Absent;
                inst.rbits &= !a.bit();
            } else {
                inst.dbvals[slot] = inst.cells[slot].clone();
            }
        }
    }
}
