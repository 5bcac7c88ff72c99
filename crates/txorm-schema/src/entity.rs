//! Entity type descriptors.

use std::collections::HashMap;
use std::sync::OnceLock;

use txorm_core::Value;

use crate::{AttrId, Bits, EntityId, KeyId};

/// A primary, unique or composite unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    pub(crate) id: KeyId,
    pub(crate) entity: EntityId,
    pub(crate) attrs: Vec<AttrId>,
    pub(crate) is_pk: bool,
}

impl KeyDef {
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Entity that declares the key.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn attrs(&self) -> &[AttrId] {
        &self.attrs
    }

    pub fn is_pk(&self) -> bool {
        self.is_pk
    }
}

/// A resolved entity type.
#[derive(Debug)]
pub struct EntityType {
    pub(crate) id: EntityId,
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) bases: Vec<EntityId>,
    pub(crate) root: EntityId,
    pub(crate) subtypes: Vec<EntityId>,
    pub(crate) attrs: Vec<AttrId>,
    pub(crate) new_attrs: Vec<AttrId>,
    pub(crate) by_name: HashMap<String, AttrId>,
    pub(crate) pk_attrs: Vec<AttrId>,
    pub(crate) pk_key: KeyId,
    pub(crate) keys: Vec<KeyId>,
    pub(crate) auto_pk: bool,
    pub(crate) discriminator: Option<AttrId>,
    pub(crate) discriminator_value: Value,
    pub(crate) slot_count: usize,
    pub(crate) all_bits: Bits,
    pub(crate) all_bits_except_volatile: Bits,
    pub(crate) pk_columns: OnceLock<Vec<String>>,
}

impl EntityType {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table shared by the whole inheritance family.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn bases(&self) -> &[EntityId] {
        &self.bases
    }

    pub fn root(&self) -> EntityId {
        self.root
    }

    /// All direct and indirect subtypes.
    pub fn subtypes(&self) -> &[EntityId] {
        &self.subtypes
    }

    /// All attributes, inherited ones first.
    pub fn attrs(&self) -> &[AttrId] {
        &self.attrs
    }

    /// Attributes declared by this entity itself.
    pub fn new_attrs(&self) -> &[AttrId] {
        &self.new_attrs
    }

    pub fn attr_named(&self, name: &str) -> Option<AttrId> {
        self.by_name.get(name).copied()
    }

    pub fn pk_attrs(&self) -> &[AttrId] {
        &self.pk_attrs
    }

    pub fn pk_key(&self) -> KeyId {
        self.pk_key
    }

    /// All keys, the primary key first.
    pub fn keys(&self) -> &[KeyId] {
        &self.keys
    }

    /// Single integer primary key generated by storage.
    pub fn has_auto_pk(&self) -> bool {
        self.auto_pk
    }

    pub fn discriminator(&self) -> Option<AttrId> {
        self.discriminator
    }

    pub fn discriminator_value(&self) -> &Value {
        &self.discriminator_value
    }

    /// Number of attribute cells in an instance of this family.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn all_bits(&self) -> Bits {
        self.all_bits
    }

    pub fn all_bits_except_volatile(&self) -> Bits {
        self.all_bits_except_volatile
    }
}
