//! The transaction: identity map, dirty tracking and object lifecycle.
//!
//! A [`Transaction`] owns every instance it has created or read, addressed by
//! [`ObjId`]. Each instance carries one [`Cell`] per attribute slot of its
//! inheritance family, the values last seen in storage, and two bitmasks:
//! `rbits` (attributes whose value this transaction relied on) and `wbits`
//! (attributes written locally). Keys are indexed so that a primary or unique
//! key maps to at most one instance.
//!
//! Local mutations are atomic: they run under the undo log (see
//! [`crate::undo`]) and a failing nested step leaves no trace. Storage-side
//! knowledge (rows fetched, lazily loaded values) is merged through `db_set`,
//! which detects values that changed under an earlier read.
//!
//! # Example
//!
//! ```ignore
//! let mut tx = db.begin(conn);
//! let ann = tx.create("Person", [("name", InitValue::from("Ann"))])?;
//! tx.write(ann, "age", 31)?;
//! tx.commit()?;
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use txorm_core::{
    CacheError, CacheErrorKind, Connection, Error, Result, Row, SchemaErrorKind, TransactionError,
    TransactionErrorKind, TypeError, ValidationError, Value,
};
use txorm_query::{Criterion, Select, SqlAst};
use txorm_schema::{AttrId, AttrType, Attribute, Bits, EntityId, EntityType, KeyDef, KeyId, Schema};

use crate::config::TransactionConfig;
use crate::database::Database;
use crate::instance::{Cell, IndexKey, InitValue, Instance, ObjId, Status};
use crate::setdata::SetData;
use crate::undo::{UndoLog, UndoRecord};
use crate::EntityEvent;
use crate::{TransactionEvent, TransactionEventCallbacks};

static NEXT_TRANSACTION_ID: AtomicU32 = AtomicU32::new(1);

/// A unit of work over one storage connection.
pub struct Transaction<C: Connection> {
    pub(crate) id: u32,
    pub(crate) db: Arc<Database>,
    pub(crate) schema: Arc<Schema>,
    pub(crate) conn: C,
    pub(crate) config: TransactionConfig,
    pub(crate) objects: Vec<Instance>,
    pub(crate) indexes: HashMap<KeyId, HashMap<IndexKey, ObjId>>,
    /// Instances with pending storage work, in save order
    pub(crate) queue: Vec<ObjId>,
    pub(crate) modified_collections: HashMap<AttrId, BTreeSet<ObjId>>,
    pub(crate) undo: UndoLog,
    /// Instances whose delete is in progress, guards cascade cycles
    pub(crate) deleting: HashSet<ObjId>,
    pub(crate) events: TransactionEventCallbacks,
    pub(crate) entity_hooks: Vec<EntityHook<C>>,
    /// Instances written by the running flush, with their after-save event
    pub(crate) saved: Vec<(ObjId, EntityEvent)>,
    /// Set while entity hooks run; flushing is suspended
    pub(crate) flush_disabled: bool,
    pub(crate) closed: bool,
}

type EntityHookFn<C> = Box<dyn FnMut(&mut Transaction<C>, ObjId) -> Result<()> + Send>;

pub(crate) struct EntityHook<C: Connection> {
    entity: EntityId,
    event: EntityEvent,
    f: EntityHookFn<C>,
}

impl<C: Connection> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("objects", &self.objects.len())
            .field("queued", &self.queue.len())
            .field("config", &self.config)
            .field("events", &self.events)
            .field("entity_hooks", &self.entity_hooks.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<C: Connection> Transaction<C> {
    /// Start a transaction with the database's default settings.
    pub fn new(db: Arc<Database>, conn: C) -> Self {
        let config = TransactionConfig::from(db.config());
        Self::with_config(db, conn, config)
    }

    pub fn with_config(db: Arc<Database>, conn: C, config: TransactionConfig) -> Self {
        let schema = Arc::clone(db.schema());
        let mut indexes = HashMap::new();
        for entity in schema.entities() {
            for &key in entity.keys() {
                indexes.entry(key).or_insert_with(HashMap::new);
            }
        }
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(transaction = id, optimistic = config.optimistic, "transaction started");
        Self {
            id,
            db,
            schema,
            conn,
            config,
            objects: Vec::new(),
            indexes,
            queue: Vec::new(),
            modified_collections: HashMap::new(),
            undo: UndoLog::default(),
            deleting: HashSet::new(),
            events: TransactionEventCallbacks::default(),
            entity_hooks: Vec::new(),
            saved: Vec::new(),
            flush_disabled: false,
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_connection(self) -> C {
        self.conn
    }

    /// Committed transactions stay open; rolled back ones are closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Register a callback to run before every flush that has work to do.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.before_flush.push(Box::new(f));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_flush.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_rollback.push(Box::new(f));
    }

    /// Register a save hook for `entity` and its subtypes.
    ///
    /// The hook receives the transaction and the instance being saved. An
    /// error returned by a hook aborts the flush. Flushing is suspended while
    /// hooks run, so queries made from a hook do not auto-flush.
    ///
    /// ```ignore
    /// tx.on_entity("Student", EntityEvent::BeforeInsert, |tx, obj| {
    ///     if tx.peek(obj, "gpa")?.is_absent() {
    ///         tx.write(obj, "gpa", 0.0)?;
    ///     }
    ///     Ok(())
    /// })?;
    /// ```
    pub fn on_entity(
        &mut self,
        entity: &str,
        event: EntityEvent,
        f: impl FnMut(&mut Transaction<C>, ObjId) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let entity = self.schema.entity_by_name(entity)?.id();
        self.entity_hooks.push(EntityHook {
            entity,
            event,
            f: Box::new(f),
        });
        Ok(())
    }

    /// Run the hooks registered for `event` on the entity of `obj`.
    pub(crate) fn fire_entity_event(&mut self, obj: ObjId, event: EntityEvent) -> Result<()> {
        if self.entity_hooks.is_empty() {
            return Ok(());
        }
        let entity = self.objects[obj.index()].entity;
        let mut hooks = std::mem::take(&mut self.entity_hooks);
        let suspended = std::mem::replace(&mut self.flush_disabled, true);
        let mut result = Ok(());
        for hook in &mut hooks {
            if hook.event == event && self.schema.is_subtype(entity, hook.entity) {
                result = (hook.f)(self, obj);
                if result.is_err() {
                    break;
                }
            }
        }
        self.flush_disabled = suspended;
        // hooks registered from inside a hook run from the next event on
        hooks.append(&mut self.entity_hooks);
        self.entity_hooks = hooks;
        result
    }

    // ==================== Checks and errors ====================

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::Closed,
                message: format!("Transaction {} is already closed", self.id),
            }));
        }
        Ok(())
    }

    pub(crate) fn check_obj(&self, obj: ObjId) -> Result<()> {
        self.check_open()?;
        if obj.tx != self.id || obj.index() >= self.objects.len() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::ForeignObject,
                message: format!(
                    "Object {} does not belong to transaction {}",
                    obj, self.id
                ),
            }));
        }
        Ok(())
    }

    pub(crate) fn check_alive(&self, obj: ObjId) -> Result<()> {
        self.check_obj(obj)?;
        if self.objects[obj.index()].status.is_deleted() {
            return Err(self.obj_error(
                CacheErrorKind::ObjectDeleted,
                obj,
                format!("Object {} was deleted", self.describe(obj)),
            ));
        }
        Ok(())
    }

    pub(crate) fn obj_error(&self, kind: CacheErrorKind, obj: ObjId, message: String) -> Error {
        let mut err = CacheError::new(kind, message);
        if let Some(inst) = self.objects.get(obj.index()) {
            err = err.entity(self.schema.entity(inst.entity).name());
        }
        Error::Cache(err)
    }

    pub(crate) fn inconsistent(&self, message: impl Into<String>) -> Error {
        Error::cache(CacheErrorKind::Inconsistent, message)
    }

    pub(crate) fn constraint(&self, message: impl Into<String>) -> Error {
        Error::cache(CacheErrorKind::Constraint, message)
    }

    pub(crate) fn unrepeatable(&self, message: impl Into<String>) -> Error {
        let message = message.into();
        tracing::warn!(%message, "unrepeatable read");
        Error::cache(CacheErrorKind::UnrepeatableRead, message)
    }

    /// `Entity[pk]`, or `Entity[new:#n]` before the key is known.
    pub fn describe(&self, obj: ObjId) -> String {
        let Some(inst) = self.objects.get(obj.index()) else {
            return obj.to_string();
        };
        let ety = self.schema.entity(inst.entity);
        let mut parts = Vec::new();
        for &attr in ety.pk_attrs() {
            match &inst.cells[self.schema.attr(attr).slot()] {
                Cell::Value(v) => parts.push(display_value(v)),
                Cell::Object(o) => parts.push(self.describe(*o)),
                Cell::Null | Cell::Absent => return format!("{}[new:{}]", ety.name(), obj),
            }
        }
        format!("{}[{}]", ety.name(), parts.join(","))
    }

    pub(crate) fn display_cell(&self, cell: &Cell) -> String {
        match cell {
            Cell::Absent => "<not loaded>".to_string(),
            Cell::Null => "None".to_string(),
            Cell::Value(v) => display_value(v),
            Cell::Object(o) => self.describe(*o),
        }
    }

    pub(crate) fn reverse_of(&self, attr: AttrId) -> Result<AttrId> {
        self.schema.attr(attr).reverse().ok_or_else(|| {
            self.inconsistent(format!(
                "relationship {} has no reverse attribute",
                self.schema.attr_path(attr)
            ))
        })
    }

    fn is_instance(&self, obj: ObjId, entity: EntityId) -> bool {
        self.schema
            .is_subtype(self.objects[obj.index()].entity, entity)
    }

    // ==================== Inspection ====================

    pub fn status(&self, obj: ObjId) -> Result<Status> {
        self.check_obj(obj)?;
        Ok(self.objects[obj.index()].status)
    }

    pub fn entity_of(&self, obj: ObjId) -> Result<&EntityType> {
        self.check_obj(obj)?;
        Ok(self.schema.entity(self.objects[obj.index()].entity))
    }

    /// Raw primary key values, `None` while storage has not assigned them.
    pub fn primary_key(&self, obj: ObjId) -> Result<Option<Vec<Value>>> {
        self.check_obj(obj)?;
        match self.raw_pk(obj) {
            Ok(values) => Ok(Some(values)),
            Err(Error::Cache(e)) if e.kind == CacheErrorKind::Inconsistent => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Pending work exists: queued instances or changed collections.
    pub fn is_modified(&self) -> bool {
        !self.queue.is_empty() || !self.modified_collections.is_empty()
    }

    /// Number of instances in the identity map.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn with_status(&self, status: Status) -> impl Iterator<Item = ObjId> + '_ {
        self.objects
            .iter()
            .enumerate()
            .filter(move |(_, inst)| inst.status == status)
            .map(|(i, _)| ObjId::new(self.id, i))
    }

    pub fn created(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.with_status(Status::Created)
    }

    pub fn updated(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.with_status(Status::Updated)
    }

    pub fn deleted(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.with_status(Status::Deleted)
    }

    /// Read and write bitmasks of an instance.
    pub fn dirty_bits(&self, obj: ObjId) -> Result<(Bits, Bits)> {
        self.check_obj(obj)?;
        let inst = &self.objects[obj.index()];
        Ok((inst.rbits, inst.wbits))
    }

    // ==================== Index maintenance ====================

    pub(crate) fn key_value(
        &self,
        obj: ObjId,
        key: &KeyDef,
        replace: Option<(usize, &Cell)>,
    ) -> Option<IndexKey> {
        let cells = &self.objects[obj.index()].cells;
        IndexKey::from_cells(key.attrs().iter().enumerate().map(|(i, &attr)| {
            match replace {
                Some((position, cell)) if position == i => cell,
                _ => &cells[self.schema.attr(attr).slot()],
            }
        }))
    }

    fn unique_violation(&self, key: KeyId, value: &IndexKey, other: ObjId) -> Error {
        let kd = self.schema.key(key);
        let names: Vec<&str> = kd
            .attrs()
            .iter()
            .map(|&a| self.schema.attr(a).name())
            .collect();
        self.obj_error(
            CacheErrorKind::UniqueViolation,
            other,
            format!(
                "{} with key {}({}) = ({}) already exists",
                self.describe(other),
                self.schema.entity(kd.entity()).name(),
                names.join(", "),
                value
            ),
        )
    }

    pub(crate) fn index_insert(&mut self, key: KeyId, value: IndexKey, obj: ObjId) -> Result<()> {
        match self.indexes.get(&key).and_then(|index| index.get(&value)).copied() {
            Some(other) if other == obj => return Ok(()),
            Some(other) => return Err(self.unique_violation(key, &value, other)),
            None => {}
        }
        self.indexes
            .entry(key)
            .or_default()
            .insert(value.clone(), obj);
        self.undo.push(UndoRecord::Index {
            key,
            value,
            previous: None,
        });
        Ok(())
    }

    pub(crate) fn index_remove(&mut self, key: KeyId, value: IndexKey, obj: ObjId) {
        let index = self.indexes.entry(key).or_default();
        if index.get(&value) != Some(&obj) {
            return;
        }
        index.remove(&value);
        self.undo.push(UndoRecord::Index {
            key,
            value,
            previous: Some(obj),
        });
    }

    /// Move unique keys of `obj` to the storage value of `attr`, without undo.
    fn db_update_indexes(&mut self, obj: ObjId, attr: AttrId, new: &Cell) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        for &(key, position) in schema.attr(attr).keys() {
            let kd = schema.key(key);
            if kd.is_pk() {
                continue;
            }
            let old_value = self.key_value(obj, kd, None);
            let new_value = self.key_value(obj, kd, Some((position, new)));
            if old_value == new_value {
                continue;
            }
            if let Some(new_value) = &new_value {
                if let Some(&other) = self.indexes.get(&key).and_then(|i| i.get(new_value)) {
                    if other != obj {
                        return Err(self.unique_violation(key, new_value, other));
                    }
                }
            }
            let index = self.indexes.entry(key).or_default();
            if let Some(old_value) = old_value {
                if index.get(&old_value) == Some(&obj) {
                    index.remove(&old_value);
                }
            }
            if let Some(new_value) = new_value {
                index.insert(new_value, obj);
            }
        }
        Ok(())
    }

    fn lookup(&self, entity: EntityId, pk: &[Cell]) -> Option<ObjId> {
        let key = IndexKey::from_cells(pk)?;
        self.indexes
            .get(&self.schema.entity(entity).pk_key())
            .and_then(|index| index.get(&key))
            .copied()
    }

    // ==================== Undo-tracked primitives ====================

    fn set_cell(&mut self, obj: ObjId, slot: usize, cell: Cell) {
        let previous = std::mem::replace(&mut self.objects[obj.index()].cells[slot], cell);
        self.undo.push(UndoRecord::Cell {
            obj,
            slot,
            previous,
        });
    }

    fn save_status(&mut self, obj: ObjId) {
        let inst = &self.objects[obj.index()];
        self.undo.push(UndoRecord::Status {
            obj,
            status: inst.status,
            rbits: inst.rbits,
            wbits: inst.wbits,
        });
    }

    pub(crate) fn enqueue(&mut self, obj: ObjId) {
        if self.objects[obj.index()].queued {
            return;
        }
        self.queue.push(obj);
        self.objects[obj.index()].queued = true;
        self.undo.push(UndoRecord::Queue {
            obj,
            position: None,
        });
    }

    fn requeue_last(&mut self, obj: ObjId) {
        let position = self.queue.iter().position(|&o| o == obj);
        if let Some(position) = position {
            self.queue.remove(position);
        }
        self.queue.push(obj);
        self.objects[obj.index()].queued = true;
        self.undo.push(UndoRecord::Queue { obj, position });
    }

    fn dequeue(&mut self, obj: ObjId) {
        let Some(position) = self.queue.iter().position(|&o| o == obj) else {
            return;
        };
        self.queue.remove(position);
        self.objects[obj.index()].queued = false;
        self.undo.push(UndoRecord::Queue {
            obj,
            position: Some(position),
        });
    }

    /// Record a local write of a tracked attribute.
    fn mark_dirty(&mut self, obj: ObjId, bit: Bits) {
        let status = self.objects[obj.index()].status;
        if bit == 0 || status == Status::Created {
            return;
        }
        self.save_status(obj);
        let inst = &mut self.objects[obj.index()];
        inst.wbits |= bit;
        if matches!(status, Status::Loaded | Status::Saved | Status::Locked) {
            inst.status = Status::Updated;
        }
        self.enqueue(obj);
    }

    // ==================== Validation ====================

    pub(crate) fn validate_cell(&self, a: &Attribute, cell: Cell) -> Result<Cell> {
        let path = || self.schema.attr_path(a.id());
        match cell {
            Cell::Absent => Err(Error::Type(TypeError {
                expected: "value",
                actual: "absent cell".to_string(),
                attribute: Some(path()),
            })),
            Cell::Null => {
                if a.is_required() {
                    return Err(Error::Validation(ValidationError {
                        attribute: path(),
                        message: "Attribute is required".to_string(),
                    }));
                }
                if !a.is_nullable() && !a.is_collection() {
                    return Err(Error::Validation(ValidationError {
                        attribute: path(),
                        message: "Attribute cannot be set to None".to_string(),
                    }));
                }
                Ok(Cell::Null)
            }
            Cell::Value(value) => match a.ty() {
                AttrType::Scalar(kind) => kind
                    .coerce(value)
                    .map(Cell::from)
                    .map_err(|err| with_attribute(err, path())),
                AttrType::Entity(_) => Err(Error::Type(TypeError {
                    expected: "object reference",
                    actual: value.type_name().to_string(),
                    attribute: Some(path()),
                })),
            },
            Cell::Object(obj) => match a.ty() {
                AttrType::Entity(target) => {
                    self.check_obj(obj)?;
                    if self.objects[obj.index()].status.is_deleted() {
                        return Err(self.obj_error(
                            CacheErrorKind::ObjectDeleted,
                            obj,
                            format!(
                                "Cannot assign deleted object {} to {}",
                                self.describe(obj),
                                path()
                            ),
                        ));
                    }
                    if !self.is_instance(obj, target) {
                        return Err(Error::Type(TypeError {
                            expected: "object reference",
                            actual: format!(
                                "{} instead of {}",
                                self.describe(obj),
                                self.schema.entity(target).name()
                            ),
                            attribute: Some(path()),
                        }));
                    }
                    Ok(Cell::Object(obj))
                }
                AttrType::Scalar(kind) => Err(Error::Type(TypeError {
                    expected: kind.name(),
                    actual: format!("object {}", self.describe(obj)),
                    attribute: Some(path()),
                })),
            },
        }
    }

    fn single_valued(&self, obj: ObjId, name: &str) -> Result<AttrId> {
        self.check_alive(obj)?;
        let attr = self
            .schema
            .attr_by_name(self.objects[obj.index()].entity, name)?;
        if self.schema.attr(attr).is_collection() {
            return Err(Error::Type(TypeError {
                expected: "single-valued attribute",
                actual: "collection".to_string(),
                attribute: Some(self.schema.attr_path(attr)),
            }));
        }
        Ok(attr)
    }

    // ==================== Create ====================

    /// Create a new instance; it is inserted by the next flush.
    pub fn create<I, K>(&mut self, entity: &str, values: I) -> Result<ObjId>
    where
        I: IntoIterator<Item = (K, InitValue)>,
        K: AsRef<str>,
    {
        self.check_open()?;
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity_by_name(entity)?;
        let mut given = HashMap::new();
        for (name, value) in values {
            given.insert(schema.attr_by_name(ety.id(), name.as_ref())?, value);
        }
        self.atomic(|tx| tx.create_obj(ety.id(), given))
    }

    fn create_obj(&mut self, entity: EntityId, mut given: HashMap<AttrId, InitValue>) -> Result<ObjId> {
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity(entity);
        let mut cells = vec![Cell::Absent; ety.slot_count()];
        let mut collections = Vec::new();

        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            let value = given.remove(&attr);
            if a.is_collection() {
                match value {
                    Some(InitValue::Items(items)) => collections.push((attr, items)),
                    Some(InitValue::Cell(_)) => {
                        return Err(Error::Type(TypeError {
                            expected: "list of objects",
                            actual: "single value".to_string(),
                            attribute: Some(schema.attr_path(attr)),
                        }));
                    }
                    None => {}
                }
                continue;
            }
            let cell = match value {
                Some(InitValue::Items(_)) => {
                    return Err(Error::Type(TypeError {
                        expected: "single value",
                        actual: "list of objects".to_string(),
                        attribute: Some(schema.attr_path(attr)),
                    }));
                }
                Some(InitValue::Cell(cell)) => {
                    let cell = self.validate_cell(a, cell)?;
                    if a.is_discriminator() && cell != Cell::from(ety.discriminator_value().clone()) {
                        return Err(Error::Validation(ValidationError {
                            attribute: schema.attr_path(attr),
                            message: format!(
                                "Discriminator of {} must be {}",
                                ety.name(),
                                display_value(ety.discriminator_value())
                            ),
                        }));
                    }
                    cell
                }
                None if a.is_discriminator() => Cell::from(ety.discriminator_value().clone()),
                None => {
                    if let Some(default) = a.default() {
                        Cell::from(default.clone())
                    } else if a.is_auto() {
                        Cell::Absent
                    } else if a.is_required() {
                        return Err(Error::Validation(ValidationError {
                            attribute: schema.attr_path(attr),
                            message: "Attribute is required".to_string(),
                        }));
                    } else if a.is_nullable() || schema.columns(attr).is_empty() {
                        Cell::Null
                    } else {
                        Cell::Absent
                    }
                }
            };
            cells[a.slot()] = cell;
        }

        let pk_key = ety.pk_key();
        let pk_value = IndexKey::from_cells(
            schema
                .key(pk_key)
                .attrs()
                .iter()
                .map(|&a| &cells[schema.attr(a).slot()]),
        );
        if let Some(value) = &pk_value {
            if let Some(&other) = self.indexes.get(&pk_key).and_then(|i| i.get(value)) {
                return Err(self.obj_error(
                    CacheErrorKind::UniqueViolation,
                    other,
                    format!(
                        "Cannot create {}: instance with primary key {} already exists",
                        ety.name(),
                        value
                    ),
                ));
            }
        }

        let obj = ObjId::new(self.id, self.objects.len());
        let mut inst = Instance::new(entity, Status::Created, ety.slot_count());
        inst.cells = cells;
        for &attr in ety.attrs() {
            if schema.attr(attr).is_collection() {
                inst.sets.insert(attr, SetData::loaded_empty());
            }
        }
        self.objects.push(inst);
        self.undo.push(UndoRecord::Allocated(obj));

        if let Some(value) = pk_value {
            self.index_insert(pk_key, value, obj)?;
        }
        for &key in ety.keys() {
            let kd = schema.key(key);
            if kd.is_pk() {
                continue;
            }
            if let Some(value) = self.key_value(obj, kd, None) {
                self.index_insert(key, value, obj)?;
            }
        }
        self.enqueue(obj);

        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            if a.is_collection() || a.reverse().is_none() {
                continue;
            }
            let cell = self.objects[obj.index()].cells[a.slot()].clone();
            if cell.is_set() {
                self.update_reverse(obj, attr, &Cell::Absent, &cell)?;
            }
        }
        for (attr, items) in collections {
            self.assign_items(obj, attr, &items)?;
        }
        tracing::debug!(entity = %ety.name(), object = %obj, "instance created");
        Ok(obj)
    }

    // ==================== Read ====================

    /// Value of a single-valued attribute, loading it when absent.
    pub fn read(&mut self, obj: ObjId, attr: &str) -> Result<Cell> {
        let attr = self.single_valued(obj, attr)?;
        self.read_attr(obj, attr)
    }

    /// Cached cell of an attribute, without loading and without marking it read.
    pub fn peek(&self, obj: ObjId, attr: &str) -> Result<Cell> {
        self.check_obj(obj)?;
        let inst = &self.objects[obj.index()];
        let attr = self.schema.attr_by_name(inst.entity, attr)?;
        Ok(inst.cells[self.schema.attr(attr).slot()].clone())
    }

    /// Scalar value of an attribute; null and absent read as `Value::Null`.
    pub fn read_value(&mut self, obj: ObjId, attr: &str) -> Result<Value> {
        match self.read(obj, attr)? {
            Cell::Value(v) => Ok(v),
            Cell::Null | Cell::Absent => Ok(Value::Null),
            Cell::Object(o) => Err(Error::Type(TypeError {
                expected: "scalar value",
                actual: format!("object {}", self.describe(o)),
                attribute: Some(attr.to_string()),
            })),
        }
    }

    /// Target of a reference attribute.
    pub fn read_object(&mut self, obj: ObjId, attr: &str) -> Result<Option<ObjId>> {
        match self.read(obj, attr)? {
            Cell::Object(o) => Ok(Some(o)),
            Cell::Null | Cell::Absent => Ok(None),
            Cell::Value(v) => Err(Error::Type(TypeError {
                expected: "object reference",
                actual: v.type_name().to_string(),
                attribute: Some(attr.to_string()),
            })),
        }
    }

    pub(crate) fn read_attr(&mut self, obj: ObjId, attr: AttrId) -> Result<Cell> {
        let cell = self.current_cell(obj, attr)?;
        let a = self.schema.attr(attr);
        if !a.is_volatile() {
            let inst = &mut self.objects[obj.index()];
            if inst.wbits & a.bit() == 0 {
                inst.rbits |= a.bit();
            }
        }
        Ok(cell)
    }

    /// Current cell, loaded from storage when absent. Does not touch `rbits`.
    pub(crate) fn current_cell(&mut self, obj: ObjId, attr: AttrId) -> Result<Cell> {
        let slot = self.schema.attr(attr).slot();
        let inst = &self.objects[obj.index()];
        if inst.cells[slot].is_absent() && inst.status != Status::Created {
            self.load_attr(obj, attr)?;
        }
        Ok(self.objects[obj.index()].cells[slot].clone())
    }

    fn load_attr(&mut self, obj: ObjId, attr: AttrId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let a = schema.attr(attr);
        let columns = schema.columns(attr);
        let entity = self.objects[obj.index()].entity;

        if columns.is_empty() {
            // one-to-one side without the foreign key: look for the owner
            let rev = self.reverse_of(attr)?;
            let target = a.target().ok_or_else(|| {
                self.inconsistent(format!("{} has no columns", schema.attr_path(attr)))
            })?;
            let ast = SqlAst::select_by(
                schema.entity(target).table(),
                self.fetch_columns(target),
                schema.columns(rev),
            );
            let params = self.raw_pk(obj)?;
            let rows = self.query_statement(&ast, &params)?;
            for row in &rows {
                self.materialize_row(target, row)?;
            }
            if self.objects[obj.index()].cells[a.slot()].is_absent() {
                self.db_set_attr(obj, attr, Cell::Null, false)?;
            }
            return Ok(());
        }

        if a.is_lazy() {
            let ast = SqlAst::select_by(
                schema.entity(entity).table(),
                columns.to_vec(),
                schema.pk_columns(entity),
            );
            let params = self.raw_pk(obj)?;
            let rows = self.query_statement(&ast, &params)?;
            let Some(row) = rows.first() else {
                return Err(self.obj_error(
                    CacheErrorKind::ObjectNotFound,
                    obj,
                    format!("Object {} disappeared", self.describe(obj)),
                ));
            };
            let values = columns
                .iter()
                .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                .collect::<Vec<_>>();
            let cell = self.parse_attr_cell(attr, &values)?;
            return self.db_set_attr(obj, attr, cell, false);
        }

        self.load_row(obj)
    }

    /// Fetch the full row of `obj` and merge it.
    fn load_row(&mut self, obj: ObjId) -> Result<()> {
        let entity = self.objects[obj.index()].entity;
        let ast = SqlAst::select_by(
            self.schema.entity(entity).table(),
            self.fetch_columns(entity),
            self.schema.pk_columns(entity),
        );
        let params = self.raw_pk(obj)?;
        let rows = self.query_statement(&ast, &params)?;
        let Some(row) = rows.first() else {
            return Err(self.obj_error(
                CacheErrorKind::ObjectNotFound,
                obj,
                format!("Object {} disappeared", self.describe(obj)),
            ));
        };
        let loaded = self.materialize_row(entity, row)?;
        if loaded != obj {
            return Err(self.inconsistent(format!(
                "Loading {} produced {}",
                self.describe(obj),
                self.describe(loaded)
            )));
        }
        Ok(())
    }

    // ==================== Write ====================

    /// Assign a single-valued attribute.
    pub fn write(&mut self, obj: ObjId, attr: &str, value: impl Into<Cell>) -> Result<()> {
        let attr = self.single_valued(obj, attr)?;
        let value = value.into();
        self.atomic(|tx| tx.set_attr(obj, attr, value, false))
    }

    /// Assign several single-valued attributes as one step.
    ///
    /// Unique and composite keys are checked once, against the final values,
    /// so an intermediate combination taken by another instance does not
    /// fail the write. On error nothing is changed.
    pub fn write_many(&mut self, obj: ObjId, values: &[(&str, Cell)]) -> Result<()> {
        let mut changes: Vec<(AttrId, Cell)> = Vec::with_capacity(values.len());
        for (name, value) in values {
            let attr = self.single_valued(obj, name)?;
            if changes.iter().any(|&(a, _)| a == attr) {
                return Err(Error::Validation(ValidationError {
                    attribute: self.schema.attr_path(attr),
                    message: "Attribute is assigned more than once".to_string(),
                }));
            }
            changes.push((attr, value.clone()));
        }
        self.atomic(|tx| tx.set_attrs(obj, changes))
    }

    fn set_attrs(&mut self, obj: ObjId, changes: Vec<(AttrId, Cell)>) -> Result<()> {
        self.check_alive(obj)?;
        let schema = Arc::clone(&self.schema);
        let mut updates: Vec<(AttrId, Cell, Cell)> = Vec::new();
        for (attr, value) in changes {
            let a = schema.attr(attr);
            let new = self.validate_cell(a, value)?;
            if self.check_immutable(obj, attr, &new)? {
                continue;
            }
            let mut old = self.objects[obj.index()].cells[a.slot()].clone();
            if old.is_absent() && a.reverse().is_some() {
                old = self.current_cell(obj, attr)?;
            }
            if old != new {
                updates.push((attr, old, new));
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        let mut key_changes: Vec<(KeyId, Option<IndexKey>, Option<IndexKey>)> = Vec::new();
        for &(attr, _, _) in &updates {
            for &(key, _) in schema.attr(attr).keys() {
                let kd = schema.key(key);
                if kd.is_pk() || key_changes.iter().any(|&(k, _, _)| k == key) {
                    continue;
                }
                let cells = &self.objects[obj.index()].cells;
                let old_value = self.key_value(obj, kd, None);
                let new_value = IndexKey::from_cells(kd.attrs().iter().map(|&part| {
                    updates
                        .iter()
                        .find(|&&(changed, _, _)| changed == part)
                        .map_or(&cells[schema.attr(part).slot()], |(_, _, new)| new)
                }));
                if old_value != new_value {
                    key_changes.push((key, old_value, new_value));
                }
            }
        }

        for &(attr, _, _) in &updates {
            self.mark_dirty(obj, schema.attr(attr).bit());
        }
        for (key, old_value, _) in &key_changes {
            if let Some(value) = old_value {
                self.index_remove(*key, value.clone(), obj);
            }
        }
        for (key, _, new_value) in key_changes {
            if let Some(value) = new_value {
                self.index_insert(key, value, obj)?;
            }
        }
        for (attr, _, new) in &updates {
            self.set_cell(obj, schema.attr(*attr).slot(), new.clone());
        }
        for (attr, old, new) in &updates {
            if schema.attr(*attr).reverse().is_some() {
                self.update_reverse(obj, *attr, old, new)?;
            }
        }
        Ok(())
    }

    /// Reject a change of the primary key or discriminator; `true` when `attr` is one of them.
    fn check_immutable(&self, obj: ObjId, attr: AttrId, new: &Cell) -> Result<bool> {
        let a = self.schema.attr(attr);
        if !a.is_pk() && !a.is_discriminator() {
            return Ok(false);
        }
        if self.objects[obj.index()].cells[a.slot()] == *new {
            return Ok(true);
        }
        if a.is_pk() {
            return Err(self.obj_error(
                CacheErrorKind::PrimaryKeyChange,
                obj,
                format!(
                    "Cannot change value of primary key {} of {}",
                    self.schema.attr_path(attr),
                    self.describe(obj)
                ),
            ));
        }
        Err(Error::Validation(ValidationError {
            attribute: self.schema.attr_path(attr),
            message: "Discriminator cannot be changed".to_string(),
        }))
    }

    /// Assign `obj.attr`; `reverse_call` marks a write made on behalf of the reverse side.
    pub(crate) fn set_attr(
        &mut self,
        obj: ObjId,
        attr: AttrId,
        value: Cell,
        reverse_call: bool,
    ) -> Result<()> {
        self.check_alive(obj)?;
        let schema = Arc::clone(&self.schema);
        let a = schema.attr(attr);
        let new = self.validate_cell(a, value)?;
        let slot = a.slot();

        if self.check_immutable(obj, attr, &new)? {
            return Ok(());
        }

        let mut old = self.objects[obj.index()].cells[slot].clone();
        if old.is_absent() && a.reverse().is_some() {
            old = self.current_cell(obj, attr)?;
        }
        if old == new {
            return Ok(());
        }

        self.mark_dirty(obj, a.bit());
        for &(key, position) in a.keys() {
            let kd = schema.key(key);
            if kd.is_pk() {
                continue;
            }
            let old_value = self.key_value(obj, kd, None);
            let new_value = self.key_value(obj, kd, Some((position, &new)));
            if old_value == new_value {
                continue;
            }
            if let Some(value) = old_value {
                self.index_remove(key, value, obj);
            }
            if let Some(value) = new_value {
                self.index_insert(key, value, obj)?;
            }
        }
        self.set_cell(obj, slot, new.clone());

        let Some(rev) = a.reverse() else {
            return Ok(());
        };
        if !reverse_call {
            return self.update_reverse(obj, attr, &old, &new);
        }
        let Cell::Object(previous) = old else {
            return Ok(());
        };
        let r = schema.attr(rev);
        if r.is_collection() {
            self.reverse_remove(previous, rev, obj)
        } else if !new.is_set() || self.objects[previous.index()].status.is_deleted() {
            Ok(())
        } else if r.is_required() {
            Err(self.constraint(format!(
                "Cannot unlink {} from previous {} object, because {} attribute is required",
                self.describe(previous),
                self.describe(obj),
                schema.attr_path(rev)
            )))
        } else {
            self.set_attr(previous, rev, Cell::Null, true)
        }
    }

    /// Propagate a local change of `obj.attr` from `old` to `new` to the reverse side.
    pub(crate) fn update_reverse(&mut self, obj: ObjId, attr: AttrId, old: &Cell, new: &Cell) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let a = schema.attr(attr);
        let rev = self.reverse_of(attr)?;
        let r = schema.attr(rev);
        if r.is_collection() {
            if let Cell::Object(previous) = *old {
                self.reverse_remove(previous, rev, obj)?;
            }
            if let Cell::Object(next) = *new {
                self.reverse_add(next, rev, obj)?;
            }
            return Ok(());
        }
        if let Cell::Object(previous) = *old {
            if !self.objects[previous.index()].status.is_deleted() {
                if a.cascade_delete() {
                    self.delete_obj(previous)?;
                } else if r.is_required() {
                    return Err(self.constraint(format!(
                        "Cannot unlink {} from previous {} object, because {} attribute is required",
                        self.describe(previous),
                        self.describe(obj),
                        schema.attr_path(rev)
                    )));
                } else {
                    self.set_attr(previous, rev, Cell::Null, true)?;
                }
            }
        }
        if let Cell::Object(next) = *new {
            self.set_attr(next, rev, Cell::Object(obj), true)?;
        }
        Ok(())
    }

    // ==================== Delete and lock ====================

    /// Delete an instance, applying cascade and nullify rules to its relationships.
    pub fn delete(&mut self, obj: ObjId) -> Result<()> {
        self.check_alive(obj)?;
        self.atomic(|tx| tx.delete_obj(obj))
    }

    pub(crate) fn delete_obj(&mut self, obj: ObjId) -> Result<()> {
        self.check_obj(obj)?;
        if self.objects[obj.index()].status.is_deleted() || !self.deleting.insert(obj) {
            return Ok(());
        }
        let result = self.delete_inner(obj);
        self.deleting.remove(&obj);
        result
    }

    fn delete_inner(&mut self, obj: ObjId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity(self.objects[obj.index()].entity);

        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            if !a.is_collection() {
                continue;
            }
            self.load_collection(obj, attr)?;
            let items: Vec<ObjId> = self.objects[obj.index()]
                .sets
                .get(&attr)
                .map(|data| data.items().collect())
                .unwrap_or_default();
            if items.is_empty() {
                continue;
            }
            let rev = self.reverse_of(attr)?;
            if a.cascade_delete() {
                for item in items {
                    self.delete_obj(item)?;
                }
            } else if !schema.attr(rev).is_required() {
                self.assign_items(obj, attr, &[])?;
            } else {
                return Err(self.constraint(format!(
                    "Cannot delete object {}, because it has non-empty set of {}, and {} is required",
                    self.describe(obj),
                    a.name(),
                    schema.attr_path(rev)
                )));
            }
        }

        for &attr in ety.attrs() {
            let a = schema.attr(attr);
            if a.is_collection() {
                continue;
            }
            let Some(rev) = a.reverse() else {
                continue;
            };
            let Cell::Object(target) = self.current_cell(obj, attr)? else {
                continue;
            };
            if self.objects[target.index()].status.is_deleted() || self.deleting.contains(&target) {
                continue;
            }
            let r = schema.attr(rev);
            if r.is_collection() {
                self.reverse_remove(target, rev, obj)?;
            } else if a.cascade_delete() {
                self.delete_obj(target)?;
            } else if !r.is_required() {
                self.set_attr(target, rev, Cell::Null, true)?;
            } else {
                return Err(self.constraint(format!(
                    "Cannot delete object {}, because it has associated {}, and {} is required",
                    self.describe(obj),
                    a.name(),
                    schema.attr_path(rev)
                )));
            }
        }

        for &key in ety.keys() {
            let kd = schema.key(key);
            if kd.is_pk() {
                continue;
            }
            if let Some(value) = self.key_value(obj, kd, None) {
                self.index_remove(key, value, obj);
            }
        }

        let status = self.objects[obj.index()].status;
        self.save_status(obj);
        if status == Status::Created {
            self.objects[obj.index()].status = Status::Cancelled;
            self.dequeue(obj);
            if let Some(value) = self.key_value(obj, schema.key(ety.pk_key()), None) {
                self.index_remove(ety.pk_key(), value, obj);
            }
        } else {
            self.objects[obj.index()].status = Status::Deleted;
            self.requeue_last(obj);
        }
        tracing::debug!(object = %self.describe(obj), previous = %status, "instance deleted");
        Ok(())
    }

    /// Ask the next flush to verify that the row has not changed.
    pub fn lock(&mut self, obj: ObjId) -> Result<()> {
        self.check_alive(obj)?;
        if !matches!(self.objects[obj.index()].status, Status::Loaded | Status::Saved) {
            return Ok(());
        }
        self.atomic(|tx| {
            tx.save_status(obj);
            tx.objects[obj.index()].status = Status::Locked;
            tx.enqueue(obj);
            Ok(())
        })
    }

    // ==================== Fetch ====================

    /// Instance with the given primary key, from the identity map or storage.
    pub fn get<I, V>(&mut self, entity: &str, pk: I) -> Result<Option<ObjId>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.check_open()?;
        let id = self.schema.entity_by_name(entity)?.id();
        let values = self.pk_arguments(id, pk)?;
        self.fetch_by_pk(id, values, false)
    }

    /// Like [`get`](Self::get), but always reads the row with `SELECT ... FOR UPDATE`.
    ///
    /// The instance is exempt from optimistic checks for the rest of the transaction.
    pub fn get_for_update<I, V>(&mut self, entity: &str, pk: I) -> Result<Option<ObjId>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.check_open()?;
        let id = self.schema.entity_by_name(entity)?.id();
        let values = self.pk_arguments(id, pk)?;
        self.fetch_by_pk(id, values, true)
    }

    /// Instance with the given attribute values, which must match at most one row.
    pub fn get_by(&mut self, entity: &str, criteria: &[(&str, Cell)]) -> Result<Option<ObjId>> {
        self.check_open()?;
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity_by_name(entity)?;
        let resolved = self.resolve_criteria(ety.id(), criteria)?;

        for &key in ety.keys() {
            let kd = schema.key(key);
            if kd.attrs().len() != resolved.len()
                || !kd.attrs().iter().all(|a| resolved.iter().any(|(r, _)| r == a))
            {
                continue;
            }
            let cells = kd
                .attrs()
                .iter()
                .filter_map(|a| resolved.iter().find(|(r, _)| r == a).map(|(_, c)| c));
            let found = IndexKey::from_cells(cells)
                .and_then(|value| self.indexes.get(&key).and_then(|i| i.get(&value)))
                .copied();
            if let Some(obj) = found {
                let inst = &self.objects[obj.index()];
                if inst.status.is_deleted() {
                    return Ok(None);
                }
                if !inst.seed {
                    return Ok(self.is_instance(obj, ety.id()).then_some(obj));
                }
            }
            break;
        }

        let found = self.query_objects(ety.id(), &resolved, Some(2))?;
        match found.as_slice() {
            [] => Ok(None),
            [obj] => Ok(Some(*obj)),
            _ => Err(Error::Cache(
                CacheError::new(
                    CacheErrorKind::MultipleObjectsFound,
                    "Multiple objects were found. Use find() to retrieve them",
                )
                .entity(ety.name()),
            )),
        }
    }

    /// All instances whose attributes equal the given values.
    pub fn find(&mut self, entity: &str, criteria: &[(&str, Cell)]) -> Result<Vec<ObjId>> {
        self.check_open()?;
        let id = self.schema.entity_by_name(entity)?.id();
        let resolved = self.resolve_criteria(id, criteria)?;
        self.query_objects(id, &resolved, None)
    }

    /// Run a query built elsewhere and materialize its rows as `entity` instances.
    pub fn select(&mut self, entity: &str, ast: &SqlAst, params: &[Value]) -> Result<Vec<ObjId>> {
        self.check_open()?;
        let id = self.schema.entity_by_name(entity)?.id();
        if self.config.auto_flush {
            self.flush()?;
        }
        let rows = self.query_statement(ast, params)?;
        self.materialize_rows(id, &rows)
    }

    /// Merge one storage row into the identity map.
    pub fn materialize(&mut self, entity: &str, row: &Row) -> Result<ObjId> {
        self.check_open()?;
        let id = self.schema.entity_by_name(entity)?.id();
        self.materialize_row(id, row)
    }

    /// Instance with the given primary key if it is already in the identity map.
    pub fn cached<I, V>(&mut self, entity: &str, pk: I) -> Result<Option<ObjId>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.check_open()?;
        let id = self.schema.entity_by_name(entity)?.id();
        let values = self.pk_arguments(id, pk)?;
        let cells = self.parse_pk_cells(id, &values)?;
        Ok(self.lookup(id, &cells))
    }

    fn pk_arguments<I, V>(&self, entity: EntityId, pk: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = pk.into_iter().map(Into::into).collect();
        let expected = self.schema.pk_columns(entity).len();
        if values.len() != expected {
            return Err(Error::Validation(ValidationError {
                attribute: self.schema.entity(entity).name().to_string(),
                message: format!(
                    "Expected {} primary key value(s), got {}",
                    expected,
                    values.len()
                ),
            }));
        }
        Ok(values)
    }

    fn fetch_by_pk(&mut self, entity: EntityId, values: Vec<Value>, for_update: bool) -> Result<Option<ObjId>> {
        let cells = self.parse_pk_cells(entity, &values)?;
        if let Some(obj) = self.lookup(entity, &cells) {
            let inst = &self.objects[obj.index()];
            if inst.status.is_deleted() {
                return Ok(None);
            }
            if !inst.seed && !for_update {
                return Ok(self.is_instance(obj, entity).then_some(obj));
            }
        }

        let mut ast = SqlAst::select_by(
            self.schema.entity(entity).table(),
            self.fetch_columns(entity),
            self.schema.pk_columns(entity),
        );
        if let SqlAst::Select(select) = &mut ast {
            select.for_update = for_update;
        }
        let params = cells
            .iter()
            .zip(self.schema.entity(entity).pk_attrs())
            .map(|(cell, &attr)| self.raw_values(attr, cell))
            .collect::<Result<Vec<_>>>()?
            .concat();
        let rows = self.query_statement(&ast, &params)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let obj = self.materialize_row(entity, row)?;
        if for_update {
            self.objects[obj.index()].for_update = true;
        }
        if self.objects[obj.index()].status.is_deleted() {
            return Ok(None);
        }
        Ok(self.is_instance(obj, entity).then_some(obj))
    }

    fn resolve_criteria(&self, entity: EntityId, criteria: &[(&str, Cell)]) -> Result<Vec<(AttrId, Cell)>> {
        criteria
            .iter()
            .map(|(name, cell)| {
                let attr = self.schema.attr_by_name(entity, name)?;
                let a = self.schema.attr(attr);
                if a.is_collection() || self.schema.columns(attr).is_empty() {
                    return Err(Error::schema(
                        SchemaErrorKind::Mapping,
                        format!(
                            "{} has no columns and cannot be used as a criterion",
                            self.schema.attr_path(attr)
                        ),
                    ));
                }
                let cell = if cell.is_null() {
                    Cell::Null
                } else {
                    self.validate_cell(a, cell.clone())?
                };
                Ok((attr, cell))
            })
            .collect()
    }

    fn query_objects(
        &mut self,
        entity: EntityId,
        criteria: &[(AttrId, Cell)],
        limit: Option<u64>,
    ) -> Result<Vec<ObjId>> {
        if self.config.auto_flush {
            self.flush()?;
        }
        let schema = Arc::clone(&self.schema);
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        for (attr, cell) in criteria {
            let columns = schema.columns(*attr);
            if cell.is_null() {
                conditions.extend(columns.iter().cloned().map(Criterion::IsNull));
            } else {
                conditions.extend(columns.iter().cloned().map(Criterion::Eq));
                params.extend(self.raw_values(*attr, cell)?);
            }
        }
        let ast = SqlAst::Select(Select {
            table: schema.entity(entity).table().to_string(),
            columns: self.fetch_columns(entity),
            criteria: conditions,
            for_update: false,
            limit,
        });
        let rows = self.query_statement(&ast, &params)?;
        self.materialize_rows(entity, &rows)
    }

    fn materialize_rows(&mut self, entity: EntityId, rows: &[Row]) -> Result<Vec<ObjId>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for row in rows {
            let obj = self.materialize_row(entity, row)?;
            if !self.objects[obj.index()].status.is_deleted()
                && self.is_instance(obj, entity)
                && seen.insert(obj)
            {
                found.push(obj);
            }
        }
        Ok(found)
    }

    /// Columns selected when fetching `entity`: primary key first, then every
    /// eagerly loaded column of the entity and its subtypes.
    pub(crate) fn fetch_columns(&self, entity: EntityId) -> Vec<String> {
        let schema = &self.schema;
        let mut columns: Vec<String> = schema.pk_columns(entity).to_vec();
        let ety = schema.entity(entity);
        for e in std::iter::once(entity).chain(ety.subtypes().iter().copied()) {
            for &attr in schema.entity(e).attrs() {
                let a = schema.attr(attr);
                if a.is_pk() || a.is_lazy() {
                    continue;
                }
                for column in schema.columns(attr) {
                    if !columns.contains(column) {
                        columns.push(column.clone());
                    }
                }
            }
        }
        columns
    }

    // ==================== Materialization ====================

    pub(crate) fn materialize_row(&mut self, entity: EntityId, row: &Row) -> Result<ObjId> {
        let schema = Arc::clone(&self.schema);
        let root = schema.entity(entity).root();
        let mut actual = entity;
        if let Some(discriminator) = schema.entity(root).discriminator() {
            let value = schema
                .columns(discriminator)
                .first()
                .and_then(|column| row.get_by_name(column));
            if let Some(value) = value.filter(|v| !v.is_null()) {
                actual = schema.entity_for_discriminator(root, value).ok_or_else(|| {
                    self.inconsistent(format!(
                        "Unknown discriminator value {} for entity {}",
                        display_value(value),
                        schema.entity(root).name()
                    ))
                })?;
            }
        }

        let pk_values = schema
            .pk_columns(actual)
            .iter()
            .map(|column| {
                row.get_by_name(column).cloned().ok_or_else(|| {
                    self.inconsistent(format!(
                        "Row of {} lacks primary key column {}",
                        schema.entity(actual).name(),
                        column
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let pk_cells = self.parse_pk_cells(actual, &pk_values)?;
        let obj = self.identity(actual, pk_cells)?;

        let inst = &self.objects[obj.index()];
        if inst.status == Status::Created || inst.status.is_deleted() {
            return Ok(obj);
        }
        let mut updates = Vec::new();
        for &attr in schema.entity(inst.entity).attrs() {
            let a = schema.attr(attr);
            if a.is_pk() || a.is_collection() {
                continue;
            }
            let columns = schema.columns(attr);
            if columns.is_empty() {
                continue;
            }
            let Some(values) = columns
                .iter()
                .map(|c| row.get_by_name(c).cloned())
                .collect::<Option<Vec<_>>>()
            else {
                continue;
            };
            updates.push((attr, values));
        }
        let mut parsed = Vec::with_capacity(updates.len());
        for (attr, values) in updates {
            parsed.push((attr, self.parse_attr_cell(attr, &values)?));
        }
        self.db_set(obj, parsed)?;
        tracing::trace!(object = %self.describe(obj), "row materialized");
        Ok(obj)
    }

    /// Instance for a primary key, allocating a seed when it is not cached.
    fn identity(&mut self, entity: EntityId, pk: Vec<Cell>) -> Result<ObjId> {
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity(entity);
        let key = IndexKey::from_cells(&pk).ok_or_else(|| {
            self.inconsistent(format!("Primary key of {} contains NULL", ety.name()))
        })?;
        if let Some(&obj) = self.indexes.get(&ety.pk_key()).and_then(|i| i.get(&key)) {
            let current = self.objects[obj.index()].entity;
            if current == entity || schema.is_subtype(current, entity) {
                return Ok(obj);
            }
            let inst = &mut self.objects[obj.index()];
            if schema.is_subtype(entity, current) && inst.rbits == 0 && inst.wbits == 0 {
                inst.entity = entity;
                return Ok(obj);
            }
            return Err(self.inconsistent(format!(
                "Unexpected class change from {} to {} for object with primary key {}",
                schema.entity(current).name(),
                ety.name(),
                key
            )));
        }

        let obj = ObjId::new(self.id, self.objects.len());
        let mut inst = Instance::new(entity, Status::Loaded, ety.slot_count());
        for (&attr, cell) in ety.pk_attrs().iter().zip(pk) {
            let slot = schema.attr(attr).slot();
            inst.dbvals[slot] = cell.clone();
            inst.cells[slot] = cell;
        }
        inst.seed = true;
        self.objects.push(inst);
        self.indexes.entry(ety.pk_key()).or_default().insert(key, obj);
        Ok(obj)
    }

    /// Instance of `entity` identified by raw key values.
    pub(crate) fn seed(&mut self, entity: EntityId, values: &[Value]) -> Result<ObjId> {
        let pk = self.parse_pk_cells(entity, values)?;
        self.identity(entity, pk)
    }

    fn parse_pk_cells(&mut self, entity: EntityId, values: &[Value]) -> Result<Vec<Cell>> {
        let schema = Arc::clone(&self.schema);
        let ety = schema.entity(entity);
        let mut offset = 0;
        let mut cells = Vec::with_capacity(ety.pk_attrs().len());
        for &attr in ety.pk_attrs() {
            let width = schema.columns(attr).len();
            let slice = values.get(offset..offset + width).ok_or_else(|| {
                self.inconsistent(format!(
                    "Expected {} primary key value(s) for {}, got {}",
                    schema.pk_columns(entity).len(),
                    ety.name(),
                    values.len()
                ))
            })?;
            offset += width;
            let cell = self.parse_attr_cell(attr, slice)?;
            if !cell.is_set() {
                return Err(self.inconsistent(format!(
                    "Primary key of {} contains NULL",
                    ety.name()
                )));
            }
            cells.push(cell);
        }
        Ok(cells)
    }

    fn parse_attr_cell(&mut self, attr: AttrId, values: &[Value]) -> Result<Cell> {
        let schema = Arc::clone(&self.schema);
        let a = schema.attr(attr);
        match a.ty() {
            AttrType::Scalar(kind) => match values.first() {
                None | Some(Value::Null) => Ok(Cell::Null),
                Some(value) => kind
                    .coerce(value.clone())
                    .map(Cell::from)
                    .map_err(|err| with_attribute(err, schema.attr_path(attr))),
            },
            AttrType::Entity(target) => {
                if values.is_empty() || values.iter().any(Value::is_null) {
                    Ok(Cell::Null)
                } else {
                    self.seed(target, values).map(Cell::Object)
                }
            }
        }
    }

    /// Merge storage values into `obj`.
    pub(crate) fn db_set(&mut self, obj: ObjId, updates: Vec<(AttrId, Cell)>) -> Result<()> {
        let inst = &mut self.objects[obj.index()];
        if inst.status == Status::Created || inst.status.is_deleted() {
            return Ok(());
        }
        inst.seed = false;
        for (attr, cell) in updates {
            self.db_set_attr(obj, attr, cell, false)?;
        }
        Ok(())
    }

    /// Merge one storage value; `Cell::Absent` forgets the value.
    pub(crate) fn db_set_attr(&mut self, obj: ObjId, attr: AttrId, new: Cell, reverse_call: bool) -> Result<()> {
        let inst = &self.objects[obj.index()];
        if inst.status == Status::Created || inst.status.is_deleted() {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        let a = schema.attr(attr);
        let slot = a.slot();
        let old = inst.dbvals[slot].clone();
        if old == new {
            return Ok(());
        }
        if !a.is_volatile() && inst.rbits & a.bit() != 0 {
            let diff = if new.is_absent() {
                String::new()
            } else {
                format!(
                    " (was: {}, now: {})",
                    self.display_cell(&old),
                    self.display_cell(&new)
                )
            };
            let message = format!(
                "Value of {}.{} for {} was updated outside of current transaction{}",
                schema.entity(inst.entity).name(),
                a.name(),
                self.describe(obj),
                diff
            );
            tracing::warn!(object = %self.describe(obj), attribute = %a.name(), "unrepeatable read");
            return Err(self.obj_error(CacheErrorKind::UnrepeatableRead, obj, message));
        }

        let keep_local = inst.wbits & a.bit() != 0;
        self.objects[obj.index()].dbvals[slot] = new.clone();
        if !keep_local {
            if self.objects[obj.index()].cells[slot] != new {
                self.db_update_indexes(obj, attr, &new)?;
            }
            self.objects[obj.index()].cells[slot] = new.clone();
        }

        let Some(rev) = a.reverse() else {
            return Ok(());
        };
        if !reverse_call {
            return self.db_update_reverse(obj, attr, &old, &new);
        }
        let Cell::Object(previous) = old else {
            return Ok(());
        };
        if schema.attr(rev).is_collection() {
            self.db_reverse_remove(previous, rev, obj)
        } else {
            self.db_set_attr(previous, rev, Cell::Absent, true)
        }
    }

    fn db_update_reverse(&mut self, obj: ObjId, attr: AttrId, old: &Cell, new: &Cell) -> Result<()> {
        let rev = self.reverse_of(attr)?;
        if self.schema.attr(rev).is_collection() {
            if let Cell::Object(previous) = *old {
                self.db_reverse_remove(previous, rev, obj)?;
            }
            if let Cell::Object(next) = *new {
                self.db_reverse_add(next, rev, obj)?;
            }
        } else {
            if let Cell::Object(previous) = *old {
                self.db_set_attr(previous, rev, Cell::Absent, true)?;
            }
            if let Cell::Object(next) = *new {
                self.db_set_attr(next, rev, Cell::Object(obj), true)?;
            }
        }
        Ok(())
    }

    // ==================== Raw values ====================

    /// Storage values of a cell of `attr`, references expanded to the target key.
    pub(crate) fn raw_values(&self, attr: AttrId, cell: &Cell) -> Result<Vec<Value>> {
        match cell {
            Cell::Value(v) => Ok(vec![v.clone()]),
            Cell::Object(o) => self.raw_pk(*o),
            Cell::Null | Cell::Absent => {
                Ok(vec![Value::Null; self.schema.columns(attr).len().max(1)])
            }
        }
    }

    pub(crate) fn raw_pk(&self, obj: ObjId) -> Result<Vec<Value>> {
        let inst = &self.objects[obj.index()];
        let ety = self.schema.entity(inst.entity);
        let mut values = Vec::new();
        for &attr in ety.pk_attrs() {
            match &inst.cells[self.schema.attr(attr).slot()] {
                Cell::Value(v) => values.push(v.clone()),
                Cell::Object(o) => values.extend(self.raw_pk(*o)?),
                Cell::Null | Cell::Absent => {
                    return Err(self.inconsistent(format!(
                        "Primary key of {} is not known yet",
                        self.describe(obj)
                    )));
                }
            }
        }
        Ok(values)
    }

    // ==================== Statements ====================

    pub(crate) fn query_statement(&mut self, ast: &SqlAst, params: &[Value]) -> Result<Vec<Row>> {
        let compiled = self.db.compile(ast)?;
        let args = compiled.adapter.adapt(params)?;
        tracing::debug!(kind = ast.kind(), sql = %compiled.sql, params = args.len(), "executing query");
        self.conn
            .query(&compiled.sql, &args)
            .map_err(|err| with_sql(err, &compiled.sql))
    }

    pub(crate) fn execute_statement(&mut self, ast: &SqlAst, params: &[Value]) -> Result<u64> {
        let compiled = self.db.compile(ast)?;
        let args = compiled.adapter.adapt(params)?;
        tracing::debug!(kind = ast.kind(), sql = %compiled.sql, params = args.len(), "executing statement");
        self.conn
            .execute(&compiled.sql, &args)
            .map_err(|err| with_sql(err, &compiled.sql))
    }

    pub(crate) fn insert_statement(&mut self, ast: &SqlAst, params: &[Value]) -> Result<Option<Value>> {
        let compiled = self.db.compile(ast)?;
        let args = compiled.adapter.adapt(params)?;
        tracing::debug!(kind = ast.kind(), sql = %compiled.sql, params = args.len(), "executing insert");
        self.conn
            .insert(&compiled.sql, &args)
            .map_err(|err| with_sql(err, &compiled.sql))
    }

    pub(crate) fn execute_batch(&mut self, ast: &SqlAst, params: &[Vec<Value>]) -> Result<u64> {
        let compiled = self.db.compile(ast)?;
        let args = params
            .iter()
            .map(|p| compiled.adapter.adapt(p))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(kind = ast.kind(), sql = %compiled.sql, batch = args.len(), "executing batch");
        self.conn
            .execute_many(&compiled.sql, &args)
            .map_err(|err| with_sql(err, &compiled.sql))
    }

    // ==================== Commit and rollback ====================

    /// Flush pending changes and commit the storage transaction.
    ///
    /// The transaction stays usable afterwards; instances keep their state.
    #[tracing::instrument(level = "debug", skip(self), fields(transaction = self.id))]
    pub fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        let result = self.flush_pending().and_then(|()| self.conn.commit());
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        for inst in &mut self.objects {
            inst.for_update = false;
        }
        tracing::info!(objects = self.objects.len(), "transaction committed");
        self.events.fire(TransactionEvent::AfterCommit)
    }

    /// Roll back storage work and discard all in-memory state.
    ///
    /// No compensating statements are issued. The transaction is closed
    /// afterwards, even when the driver reports an error.
    #[tracing::instrument(level = "debug", skip(self), fields(transaction = self.id))]
    pub fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        tracing::warn!(
            objects = self.objects.len(),
            pending = self.queue.len(),
            "rolling back transaction"
        );
        let result = self.conn.rollback();
        self.objects.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
        self.queue.clear();
        self.modified_collections.clear();
        self.undo.clear();
        self.deleting.clear();
        self.saved.clear();
        self.closed = true;
        result?;
        self.events.fire(TransactionEvent::AfterRollback)
    }

    /// Apply the `strict` policy to a failed flush or commit.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        tracing::warn!(error = %err, strict = self.config.strict, "flush failed");
        if self.config.strict && !self.closed {
            if let Err(rollback_err) = self.rollback() {
                tracing::warn!(error = %rollback_err, "rollback after failed flush also failed");
            }
        }
        err
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Text(s) | Value::Decimal(s) => format!("'{}'", s),
        other => format!("{:?}", other),
    }
}

fn with_attribute(err: Error, attribute: String) -> Error {
    match err {
        Error::Type(mut e) => {
            e.attribute = Some(attribute);
            Error::Type(e)
        }
        other => other,
    }
}

fn with_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::Query(mut e) => {
            if e.sql.is_none() {
                e.sql = Some(sql.to_string());
            }
            Error::Query(e)
        }
        other => other,
    }
}
