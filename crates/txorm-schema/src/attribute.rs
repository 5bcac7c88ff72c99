//! Attribute descriptors.

use std::sync::OnceLock;

use txorm_core::{Value, ValueKind};

use crate::{AttrId, Bits, EntityId, KeyId};

/// Semantic kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    /// Must hold a value once the object is created
    Required,
    /// May be null
    Optional,
    /// To-many collection
    Set,
}

/// Declared value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Scalar(ValueKind),
    Entity(EntityId),
}

/// Storage layout of a many-to-many link table, seen from one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTable {
    pub table: String,
    /// Columns holding the primary key of the attribute's own entity
    pub own_columns: Vec<String>,
    /// Columns holding the primary key of the target entity
    pub target_columns: Vec<String>,
}

/// A resolved attribute of an entity type.
///
/// Attributes are created by [`SchemaBuilder::build`](crate::SchemaBuilder::build)
/// and never change afterwards, except for the column layout which is
/// computed on first use.
#[derive(Debug)]
pub struct Attribute {
    pub(crate) id: AttrId,
    pub(crate) name: String,
    pub(crate) entity: EntityId,
    pub(crate) kind: AttrKind,
    pub(crate) ty: AttrType,
    pub(crate) is_unique: bool,
    pub(crate) pk_offset: Option<usize>,
    pub(crate) nullable: bool,
    pub(crate) default: Option<Value>,
    pub(crate) auto: bool,
    pub(crate) volatile: bool,
    pub(crate) optimistic: bool,
    pub(crate) lazy: bool,
    pub(crate) cascade_delete: bool,
    pub(crate) is_discriminator: bool,
    pub(crate) reverse: Option<AttrId>,
    pub(crate) slot: usize,
    pub(crate) bit: Bits,
    pub(crate) keys: Vec<(KeyId, usize)>,
    pub(crate) explicit_columns: Vec<String>,
    pub(crate) explicit_reverse_columns: Vec<String>,
    pub(crate) explicit_table: Option<String>,
    pub(crate) columns: OnceLock<Vec<String>>,
    pub(crate) link: OnceLock<LinkTable>,
}

impl Attribute {
    pub fn id(&self) -> AttrId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity that declares the attribute.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn kind(&self) -> AttrKind {
        self.kind
    }

    pub fn ty(&self) -> AttrType {
        self.ty
    }

    /// Target entity of a reference or collection.
    pub fn target(&self) -> Option<EntityId> {
        match self.ty {
            AttrType::Entity(e) => Some(e),
            AttrType::Scalar(_) => None,
        }
    }

    pub fn value_kind(&self) -> Option<ValueKind> {
        match self.ty {
            AttrType::Scalar(k) => Some(k),
            AttrType::Entity(_) => None,
        }
    }

    pub fn is_required(&self) -> bool {
        self.kind == AttrKind::Required
    }

    pub fn is_collection(&self) -> bool {
        self.kind == AttrKind::Set
    }

    pub fn is_reference(&self) -> bool {
        self.kind != AttrKind::Set && matches!(self.ty, AttrType::Entity(_))
    }

    pub fn is_unique(&self) -> bool {
        self.is_unique
    }

    pub fn is_pk(&self) -> bool {
        self.pk_offset.is_some()
    }

    /// Position inside a composite primary key.
    pub fn pk_offset(&self) -> Option<usize> {
        self.pk_offset
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Value is generated by storage.
    pub fn is_auto(&self) -> bool {
        self.auto
    }

    /// Value may change in storage without the transaction noticing.
    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    /// Participates in optimistic WHERE criteria when read.
    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }

    /// Not fetched with the row; loaded on first access.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn cascade_delete(&self) -> bool {
        self.cascade_delete
    }

    pub fn is_discriminator(&self) -> bool {
        self.is_discriminator
    }

    pub fn reverse(&self) -> Option<AttrId> {
        self.reverse
    }

    /// A collection whose reverse is itself.
    pub fn is_symmetric(&self) -> bool {
        self.reverse == Some(self.id)
    }

    /// Index of the attribute's cell in an instance of its family.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Dirty-tracking bit; zero for primary key parts, collections and the discriminator.
    pub fn bit(&self) -> Bits {
        self.bit
    }

    /// Keys (including the primary key) the attribute belongs to, with its position.
    pub fn keys(&self) -> &[(KeyId, usize)] {
        &self.keys
    }

    pub fn is_part_of_key(&self) -> bool {
        !self.keys.is_empty()
    }
}
