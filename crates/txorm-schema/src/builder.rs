//! Declarative schema construction.
//!
//! Entities are declared by name with a fluent API and resolved all at once
//! by [`SchemaBuilder::build`], so declarations may reference entities that
//! are declared later.
//!
//! # Example
//!
//! ```
//! use txorm_core::ValueKind;
//! use txorm_schema::SchemaBuilder;
//!
//! let mut builder = SchemaBuilder::new();
//! let person = builder.entity("Person");
//! person.required("name", ValueKind::Text);
//! person.set("courses", "Course");
//! let course = builder.entity("Course");
//! course.required("title", ValueKind::Text);
//! course.set("students", "Person");
//!
//! let schema = builder.build().unwrap();
//! let person = schema.entity_by_name("Person").unwrap();
//! let courses = schema.attr_by_name(person.id(), "courses").unwrap();
//! let link = schema.link_table(courses).unwrap();
//! assert_eq!(link.table, "course_students");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use txorm_core::{Error, Result, SchemaError, SchemaErrorKind, Value, ValueKind};

use crate::attribute::{AttrKind, AttrType, Attribute};
use crate::entity::{EntityType, KeyDef};
use crate::schema::Schema;
use crate::{AttrId, Bits, EntityId, KeyId, MAX_TRACKED_ATTRIBUTES};

/// Name of the discriminator attribute added to roots of inheritance families.
pub const DISCRIMINATOR_ATTRIBUTE: &str = "classtype";

/// Name of the implicit primary key.
pub const IMPLICIT_PK: &str = "id";

/// Declared type of an attribute: a scalar kind or the name of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Scalar(ValueKind),
    Entity(String),
}

impl From<ValueKind> for TypeRef {
    fn from(kind: ValueKind) -> Self {
        TypeRef::Scalar(kind)
    }
}

impl From<&str> for TypeRef {
    fn from(entity: &str) -> Self {
        TypeRef::Entity(entity.to_string())
    }
}

impl From<String> for TypeRef {
    fn from(entity: String) -> Self {
        TypeRef::Entity(entity)
    }
}

/// Declaration of a single attribute.
#[derive(Debug, Clone)]
pub struct AttrDef {
    name: String,
    kind: AttrKind,
    ty: TypeRef,
    unique: bool,
    primary_key: bool,
    discriminator: bool,
    reverse: Option<String>,
    columns: Vec<String>,
    reverse_columns: Vec<String>,
    table: Option<String>,
    default: Option<Value>,
    auto: bool,
    nullable: Option<bool>,
    volatile: bool,
    optimistic: Option<bool>,
    lazy: bool,
    cascade_delete: Option<bool>,
}

impl AttrDef {
    fn new(name: &str, kind: AttrKind, ty: TypeRef) -> Self {
        Self {
            name: name.to_string(),
            kind,
            ty,
            unique: false,
            primary_key: false,
            discriminator: false,
            reverse: None,
            columns: Vec::new(),
            reverse_columns: Vec::new(),
            table: None,
            default: None,
            auto: false,
            nullable: None,
            volatile: false,
            optimistic: None,
            lazy: false,
            cascade_delete: None,
        }
    }

    /// Name of the attribute on the other side of the relationship.
    pub fn reverse(&mut self, name: &str) -> &mut Self {
        self.reverse = Some(name.to_string());
        self
    }

    pub fn column(&mut self, name: &str) -> &mut Self {
        self.columns = vec![name.to_string()];
        self
    }

    /// Columns of a reference to an entity with a composite key, or of one
    /// side of a many-to-many link table.
    pub fn columns(&mut self, names: &[&str]) -> &mut Self {
        self.columns = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Link table columns of the reverse side of a symmetric collection.
    pub fn reverse_columns(&mut self, names: &[&str]) -> &mut Self {
        self.reverse_columns = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Link table of a many-to-many collection.
    pub fn table(&mut self, name: &str) -> &mut Self {
        self.table = Some(name.to_string());
        self
    }

    pub fn default(&mut self, value: impl Into<Value>) -> &mut Self {
        self.default = Some(value.into());
        self
    }

    pub fn auto(&mut self) -> &mut Self {
        self.auto = true;
        self
    }

    pub fn unique(&mut self) -> &mut Self {
        self.unique = true;
        self
    }

    pub fn nullable(&mut self, nullable: bool) -> &mut Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn volatile(&mut self) -> &mut Self {
        self.volatile = true;
        self
    }

    pub fn optimistic(&mut self, optimistic: bool) -> &mut Self {
        self.optimistic = Some(optimistic);
        self
    }

    pub fn lazy(&mut self) -> &mut Self {
        self.lazy = true;
        self
    }

    pub fn cascade_delete(&mut self, cascade: bool) -> &mut Self {
        self.cascade_delete = Some(cascade);
        self
    }
}

/// Declaration of an entity type.
#[derive(Debug, Clone)]
pub struct EntityDef {
    name: String,
    table: Option<String>,
    bases: Vec<String>,
    attrs: Vec<AttrDef>,
    composite_keys: Vec<Vec<String>>,
    composite_pk: Option<Vec<String>>,
    discriminator: Option<Value>,
}

impl EntityDef {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            bases: Vec::new(),
            attrs: Vec::new(),
            composite_keys: Vec::new(),
            composite_pk: None,
            discriminator: None,
        }
    }

    fn push(&mut self, def: AttrDef) -> &mut AttrDef {
        let index = self.attrs.len();
        self.attrs.push(def);
        &mut self.attrs[index]
    }

    pub fn required(&mut self, name: &str, ty: impl Into<TypeRef>) -> &mut AttrDef {
        self.push(AttrDef::new(name, AttrKind::Required, ty.into()))
    }

    pub fn optional(&mut self, name: &str, ty: impl Into<TypeRef>) -> &mut AttrDef {
        self.push(AttrDef::new(name, AttrKind::Optional, ty.into()))
    }

    /// Required attribute with a single-attribute unique key.
    pub fn unique(&mut self, name: &str, ty: impl Into<TypeRef>) -> &mut AttrDef {
        self.required(name, ty).unique()
    }

    pub fn primary_key(&mut self, name: &str, ty: impl Into<TypeRef>) -> &mut AttrDef {
        let attr = self.required(name, ty);
        attr.primary_key = true;
        attr.unique = true;
        attr
    }

    /// To-many collection of `target` entities.
    pub fn set(&mut self, name: &str, target: &str) -> &mut AttrDef {
        self.push(AttrDef::new(
            name,
            AttrKind::Set,
            TypeRef::Entity(target.to_string()),
        ))
    }

    /// Unique key over several attributes, inherited ones included.
    pub fn composite_key(&mut self, attrs: &[&str]) -> &mut Self {
        self.composite_keys
            .push(attrs.iter().map(|a| a.to_string()).collect());
        self
    }

    /// Primary key made of several attributes declared by this entity.
    pub fn composite_primary_key(&mut self, attrs: &[&str]) -> &mut Self {
        self.composite_pk = Some(attrs.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn table(&mut self, name: &str) -> &mut Self {
        self.table = Some(name.to_string());
        self
    }

    /// Inherit from `base`; all bases must share one root.
    pub fn extends(&mut self, base: &str) -> &mut Self {
        self.bases.push(base.to_string());
        self
    }

    /// Discriminator value stored for instances of this entity.
    ///
    /// Defaults to the entity name.
    pub fn discriminator(&mut self, value: impl Into<Value>) -> &mut Self {
        self.discriminator = Some(value.into());
        self
    }
}

/// Collects entity declarations and resolves them into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    defs: Vec<EntityDef>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an entity, or reopen an earlier declaration with the same name.
    pub fn entity(&mut self, name: &str) -> &mut EntityDef {
        let index = match self.defs.iter().position(|d| d.name == name) {
            Some(index) => index,
            None => {
                self.defs.push(EntityDef::new(name));
                self.defs.len() - 1
            }
        };
        &mut self.defs[index]
    }

    /// Resolve every declaration.
    ///
    /// Fails on the first invalid name, unknown reference, unresolvable or
    /// ambiguous reverse, key error or mapping conflict.
    pub fn build(self) -> Result<Schema> {
        let mut build = Build::new(self.defs)?;
        build.resolve_hierarchy()?;
        for entity in build.order.clone() {
            build.declare(entity)?;
        }
        build.check_pk_cycles()?;
        build.link_reverses()?;
        let order = build.order.clone();
        let mut schema = build.into_schema()?;
        assign_bits(&mut schema, &order)?;
        validate_mapping(&schema)?;
        tracing::debug!(
            entities = schema.entities.len(),
            attributes = schema.attrs.len(),
            keys = schema.keys.len(),
            "Schema built"
        );
        Ok(schema)
    }
}

fn compiled(
    cell: &'static OnceLock<std::result::Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| Error::Custom(format!("invalid identifier pattern {pattern}: {e}")))
}

fn validate_entity_name(name: &str) -> Result<()> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    if compiled(&PATTERN, r"^[A-Z][A-Za-z0-9_]*$")?.is_match(name) {
        return Ok(());
    }
    Err(SchemaError::new(
        SchemaErrorKind::InvalidName,
        format!("Entity name {name:?} must start with a capital letter and contain only letters, digits and underscores"),
    )
    .entity(name)
    .into())
}

fn validate_attr_name(entity: &str, name: &str) -> Result<()> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    if compiled(&PATTERN, r"^[A-Za-z][A-Za-z0-9_]*$")?.is_match(name) {
        return Ok(());
    }
    Err(SchemaError::new(
        SchemaErrorKind::InvalidName,
        format!("Attribute name {entity}.{name:?} is not a valid identifier"),
    )
    .entity(entity)
    .attribute(name)
    .into())
}

fn schema_error(kind: SchemaErrorKind, entity: &str, attr: &str, message: String) -> Error {
    SchemaError::new(kind, message)
        .entity(entity)
        .attribute(attr)
        .into()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    InProgress,
    Done,
}

/// Working state of a single `build` call.
struct Build {
    defs: Vec<EntityDef>,
    by_name: HashMap<String, EntityId>,
    bases: Vec<Vec<EntityId>>,
    roots: Vec<EntityId>,
    subtypes: Vec<Vec<EntityId>>,
    /// Bases before subtypes
    order: Vec<EntityId>,
    entities: Vec<Option<EntityType>>,
    attrs: Vec<Attribute>,
    keys: Vec<KeyDef>,
    reverse_names: Vec<Option<String>>,
    cascade: Vec<Option<bool>>,
    next_slot: Vec<usize>,
}

impl Build {
    fn new(defs: Vec<EntityDef>) -> Result<Self> {
        let mut by_name = HashMap::new();
        for (index, def) in defs.iter().enumerate() {
            validate_entity_name(&def.name)?;
            by_name.insert(def.name.clone(), EntityId::from_index(index));
        }

        let mut bases = Vec::with_capacity(defs.len());
        for def in &defs {
            let mut resolved = Vec::new();
            for base in &def.bases {
                let id = by_name.get(base).copied().ok_or_else(|| {
                    Error::from(
                        SchemaError::new(
                            SchemaErrorKind::UnknownEntity,
                            format!("Base entity {base} of {} is not defined", def.name),
                        )
                        .entity(&def.name),
                    )
                })?;
                if !resolved.contains(&id) {
                    resolved.push(id);
                }
            }
            bases.push(resolved);
        }

        let n = defs.len();
        Ok(Self {
            defs,
            by_name,
            bases,
            roots: (0..n).map(EntityId::from_index).collect(),
            subtypes: vec![Vec::new(); n],
            order: Vec::with_capacity(n),
            entities: (0..n).map(|_| None).collect(),
            attrs: Vec::new(),
            keys: Vec::new(),
            reverse_names: Vec::new(),
            cascade: Vec::new(),
            next_slot: vec![0; n],
        })
    }

    fn name(&self, entity: EntityId) -> &str {
        &self.defs[entity.index()].name
    }

    fn declared(&self, entity: EntityId) -> Result<&EntityType> {
        self.entities[entity.index()].as_ref().ok_or_else(|| {
            Error::Custom(format!(
                "entity {} used before it was declared",
                self.name(entity)
            ))
        })
    }

    fn resolve_hierarchy(&mut self) -> Result<()> {
        let mut state = vec![Visit::New; self.defs.len()];
        for index in 0..self.defs.len() {
            self.visit(EntityId::from_index(index), &mut state)?;
        }

        let mut ancestors: Vec<Vec<EntityId>> = vec![Vec::new(); self.defs.len()];
        for &entity in &self.order.clone() {
            let bases = self.bases[entity.index()].clone();
            let Some(&first) = bases.first() else {
                continue;
            };
            let root = self.roots[first.index()];
            if bases.iter().any(|b| self.roots[b.index()] != root) {
                return Err(SchemaError::new(
                    SchemaErrorKind::Inheritance,
                    format!(
                        "Bases of entity {} belong to different inheritance families",
                        self.name(entity)
                    ),
                )
                .entity(self.name(entity))
                .into());
            }
            self.roots[entity.index()] = root;

            let mut all = Vec::new();
            for base in bases {
                for ancestor in std::iter::once(base).chain(ancestors[base.index()].clone()) {
                    if !all.contains(&ancestor) {
                        all.push(ancestor);
                    }
                }
            }
            for &ancestor in &all {
                self.subtypes[ancestor.index()].push(entity);
            }
            ancestors[entity.index()] = all;
        }
        Ok(())
    }

    fn visit(&mut self, entity: EntityId, state: &mut [Visit]) -> Result<()> {
        match state[entity.index()] {
            Visit::Done => return Ok(()),
            Visit::InProgress => {
                return Err(SchemaError::new(
                    SchemaErrorKind::Inheritance,
                    format!("Entity {} inherits from itself", self.name(entity)),
                )
                .entity(self.name(entity))
                .into());
            }
            Visit::New => {}
        }
        state[entity.index()] = Visit::InProgress;
        for base in self.bases[entity.index()].clone() {
            self.visit(base, state)?;
        }
        state[entity.index()] = Visit::Done;
        self.order.push(entity);
        Ok(())
    }

    fn declare(&mut self, entity: EntityId) -> Result<()> {
        let def = self.defs[entity.index()].clone();
        let root = self.roots[entity.index()];
        let is_root = root == entity;

        let mut attrs = Vec::new();
        let mut by_name = HashMap::new();
        let mut keys = Vec::new();
        for &base in &self.bases[entity.index()] {
            let base_ty = self.declared(base)?;
            for &a in &base_ty.attrs {
                if !attrs.contains(&a) {
                    attrs.push(a);
                    by_name.insert(self.attrs[a.index()].name.clone(), a);
                }
            }
            for &k in &base_ty.keys {
                if !keys.contains(&k) {
                    keys.push(k);
                }
            }
        }

        let table = if is_root {
            def.table
                .clone()
                .unwrap_or_else(|| def.name.to_lowercase())
        } else {
            let root_table = self.declared(root)?.table.clone();
            if def.table.as_ref().is_some_and(|t| *t != root_table) {
                return Err(SchemaError::new(
                    SchemaErrorKind::Inheritance,
                    format!(
                        "Entity {} shares table {root_table} with its family and cannot redefine it",
                        def.name
                    ),
                )
                .entity(&def.name)
                .into());
            }
            root_table
        };

        let mut new_defs = def.attrs.clone();
        let flagged_pk = new_defs.iter().filter(|a| a.primary_key).count();
        if is_root {
            if flagged_pk > 1 || (flagged_pk == 1 && def.composite_pk.is_some()) {
                return Err(SchemaError::new(
                    SchemaErrorKind::DuplicatePrimaryKey,
                    format!(
                        "Entity {} declares more than one primary key; use composite_primary_key",
                        def.name
                    ),
                )
                .entity(&def.name)
                .into());
            }
            if flagged_pk == 0 && def.composite_pk.is_none() {
                if new_defs.iter().any(|a| a.name == IMPLICIT_PK) {
                    return Err(schema_error(
                        SchemaErrorKind::InvalidKey,
                        &def.name,
                        IMPLICIT_PK,
                        format!(
                            "Cannot create primary key for {} automatically because name '{IMPLICIT_PK}' is already in use",
                            def.name
                        ),
                    ));
                }
                let mut id = AttrDef::new(
                    IMPLICIT_PK,
                    AttrKind::Required,
                    TypeRef::Scalar(ValueKind::BigInt),
                );
                id.primary_key = true;
                id.unique = true;
                id.auto = true;
                new_defs.insert(0, id);
            }
            if !self.subtypes[entity.index()].is_empty() {
                match new_defs
                    .iter_mut()
                    .find(|a| a.name == DISCRIMINATOR_ATTRIBUTE)
                {
                    Some(existing) => existing.discriminator = true,
                    None => {
                        let mut d = AttrDef::new(
                            DISCRIMINATOR_ATTRIBUTE,
                            AttrKind::Required,
                            TypeRef::Scalar(ValueKind::Text),
                        );
                        d.discriminator = true;
                        new_defs.push(d);
                    }
                }
            }
        } else if flagged_pk > 0 || def.composite_pk.is_some() {
            return Err(SchemaError::new(
                SchemaErrorKind::DuplicatePrimaryKey,
                format!(
                    "Primary key cannot be redefined in derived entity {}",
                    def.name
                ),
            )
            .entity(&def.name)
            .into());
        }

        let mut new_attrs = Vec::with_capacity(new_defs.len());
        for adef in &new_defs {
            validate_attr_name(&def.name, &adef.name)?;
            if by_name.contains_key(&adef.name) {
                return Err(schema_error(
                    SchemaErrorKind::InvalidName,
                    &def.name,
                    &adef.name,
                    format!("Attribute {}.{} is already defined", def.name, adef.name),
                ));
            }
            let ty = match &adef.ty {
                TypeRef::Scalar(kind) => AttrType::Scalar(*kind),
                TypeRef::Entity(target) => {
                    AttrType::Entity(self.by_name.get(target).copied().ok_or_else(|| {
                        schema_error(
                            SchemaErrorKind::UnknownEntity,
                            &def.name,
                            &adef.name,
                            format!(
                                "Entity {target} referenced by {}.{} is not defined",
                                def.name, adef.name
                            ),
                        )
                    })?)
                }
            };
            let default = check_attr_def(&def.name, adef, ty)?;

            let id = AttrId::from_index(self.attrs.len());
            let slot = self.next_slot[root.index()];
            self.next_slot[root.index()] += 1;
            self.attrs.push(Attribute {
                id,
                name: adef.name.clone(),
                entity,
                kind: adef.kind,
                ty,
                is_unique: adef.unique || adef.primary_key,
                pk_offset: adef.primary_key.then_some(0),
                nullable: adef.kind == AttrKind::Optional && adef.nullable.unwrap_or(true),
                default,
                auto: adef.auto,
                volatile: adef.volatile,
                optimistic: adef
                    .optimistic
                    .unwrap_or(ty != AttrType::Scalar(ValueKind::Double)),
                lazy: adef.lazy,
                cascade_delete: false,
                is_discriminator: adef.discriminator,
                reverse: None,
                slot,
                bit: 0,
                keys: Vec::new(),
                explicit_columns: adef.columns.clone(),
                explicit_reverse_columns: adef.reverse_columns.clone(),
                explicit_table: adef.table.clone(),
                columns: OnceLock::new(),
                link: OnceLock::new(),
            });
            self.reverse_names.push(adef.reverse.clone());
            self.cascade.push(adef.cascade_delete);
            attrs.push(id);
            new_attrs.push(id);
            by_name.insert(adef.name.clone(), id);
        }

        let pk_attrs = if is_root {
            match &def.composite_pk {
                Some(names) => self.composite_pk(&def.name, names, &new_attrs)?,
                None => new_attrs
                    .iter()
                    .copied()
                    .filter(|a| self.attrs[a.index()].pk_offset.is_some())
                    .collect(),
            }
        } else {
            self.declared(root)?.pk_attrs.clone()
        };

        let pk_key = if is_root {
            let key = self.push_key(entity, pk_attrs.clone(), true);
            keys.insert(0, key);
            key
        } else {
            self.declared(root)?.pk_key
        };
        for &a in &new_attrs {
            let attr = &self.attrs[a.index()];
            if attr.is_unique && attr.pk_offset.is_none() {
                let key = self.push_key(entity, vec![a], false);
                keys.push(key);
            }
        }
        for names in &def.composite_keys {
            let key_attrs = self.composite_key(&def.name, names, &by_name)?;
            let key = self.push_key(entity, key_attrs, false);
            keys.push(key);
        }

        let discriminator = if is_root {
            new_attrs
                .iter()
                .copied()
                .find(|a| self.attrs[a.index()].is_discriminator)
        } else {
            self.declared(root)?.discriminator
        };
        let discriminator_value = match (&def.discriminator, discriminator) {
            (Some(value), Some(attr)) => {
                let kind = self.attrs[attr.index()]
                    .value_kind()
                    .unwrap_or(ValueKind::Text);
                kind.coerce(value.clone()).map_err(|e| {
                    schema_error(
                        SchemaErrorKind::Inheritance,
                        &def.name,
                        DISCRIMINATOR_ATTRIBUTE,
                        format!("Invalid discriminator value for {}: {e}", def.name),
                    )
                })?
            }
            (Some(value), None) => value.clone(),
            (None, _) => Value::Text(def.name.clone()),
        };

        let auto_pk = pk_attrs.len() == 1 && self.attrs[pk_attrs[0].index()].auto;
        self.entities[entity.index()] = Some(EntityType {
            id: entity,
            name: def.name.clone(),
            table,
            bases: self.bases[entity.index()].clone(),
            root,
            subtypes: self.subtypes[entity.index()].clone(),
            attrs,
            new_attrs,
            by_name,
            pk_attrs,
            pk_key,
            keys,
            auto_pk,
            discriminator,
            discriminator_value,
            slot_count: 0,
            all_bits: 0,
            all_bits_except_volatile: 0,
            pk_columns: OnceLock::new(),
        });
        Ok(())
    }

    fn composite_pk(
        &mut self,
        entity: &str,
        names: &[String],
        new_attrs: &[AttrId],
    ) -> Result<Vec<AttrId>> {
        if names.is_empty() {
            return Err(SchemaError::new(
                SchemaErrorKind::InvalidKey,
                format!("Primary key of {entity} is empty"),
            )
            .entity(entity)
            .into());
        }
        let mut ids = Vec::with_capacity(names.len());
        for (offset, name) in names.iter().enumerate() {
            let id = new_attrs
                .iter()
                .copied()
                .find(|a| self.attrs[a.index()].name == *name)
                .ok_or_else(|| {
                    schema_error(
                        SchemaErrorKind::UnknownAttribute,
                        entity,
                        name,
                        format!("Primary key attribute {entity}.{name} is not declared"),
                    )
                })?;
            let attr = &mut self.attrs[id.index()];
            if attr.kind != AttrKind::Required {
                return Err(schema_error(
                    SchemaErrorKind::InvalidKey,
                    entity,
                    name,
                    format!("Primary key attribute {entity}.{name} must be Required"),
                ));
            }
            if attr.ty == AttrType::Scalar(ValueKind::Double) {
                return Err(schema_error(
                    SchemaErrorKind::InvalidKey,
                    entity,
                    name,
                    format!("Floating point attribute {entity}.{name} cannot be part of a key"),
                ));
            }
            if ids.contains(&id) {
                return Err(schema_error(
                    SchemaErrorKind::InvalidKey,
                    entity,
                    name,
                    format!("Attribute {entity}.{name} is listed twice in the primary key"),
                ));
            }
            attr.pk_offset = Some(offset);
            attr.is_unique = names.len() == 1;
            ids.push(id);
        }
        Ok(ids)
    }

    fn composite_key(
        &self,
        entity: &str,
        names: &[String],
        by_name: &HashMap<String, AttrId>,
    ) -> Result<Vec<AttrId>> {
        if names.len() < 2 {
            return Err(SchemaError::new(
                SchemaErrorKind::InvalidKey,
                format!("Composite key of {entity} should contain at least two attributes"),
            )
            .entity(entity)
            .into());
        }
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = by_name.get(name).copied().ok_or_else(|| {
                schema_error(
                    SchemaErrorKind::UnknownAttribute,
                    entity,
                    name,
                    format!("Composite key attribute {entity}.{name} is not declared"),
                )
            })?;
            let attr = &self.attrs[id.index()];
            if attr.kind == AttrKind::Set || attr.ty == AttrType::Scalar(ValueKind::Double) {
                return Err(schema_error(
                    SchemaErrorKind::InvalidKey,
                    entity,
                    name,
                    format!("Attribute {entity}.{name} cannot be part of a composite key"),
                ));
            }
            if ids.contains(&id) {
                return Err(schema_error(
                    SchemaErrorKind::InvalidKey,
                    entity,
                    name,
                    format!("Attribute {entity}.{name} is listed twice in a composite key"),
                ));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn push_key(&mut self, entity: EntityId, attrs: Vec<AttrId>, is_pk: bool) -> KeyId {
        let id = KeyId::from_index(self.keys.len());
        for (position, &a) in attrs.iter().enumerate() {
            self.attrs[a.index()].keys.push((id, position));
        }
        self.keys.push(KeyDef {
            id,
            entity,
            attrs,
            is_pk,
        });
        id
    }

    /// Primary keys may reference other entities, but never circularly.
    fn check_pk_cycles(&self) -> Result<()> {
        let mut state = vec![Visit::New; self.defs.len()];
        for &entity in &self.order {
            if self.roots[entity.index()] == entity {
                self.visit_pk(entity, &mut state)?;
            }
        }
        Ok(())
    }

    fn visit_pk(&self, root: EntityId, state: &mut [Visit]) -> Result<()> {
        match state[root.index()] {
            Visit::Done => return Ok(()),
            Visit::InProgress => {
                return Err(SchemaError::new(
                    SchemaErrorKind::InvalidKey,
                    format!(
                        "Primary key of {} references itself through other primary keys",
                        self.name(root)
                    ),
                )
                .entity(self.name(root))
                .into());
            }
            Visit::New => {}
        }
        state[root.index()] = Visit::InProgress;
        for &a in &self.declared(root)?.pk_attrs {
            if let AttrType::Entity(target) = self.attrs[a.index()].ty {
                self.visit_pk(self.roots[target.index()], state)?;
            }
        }
        state[root.index()] = Visit::Done;
        Ok(())
    }

    fn attr_path(&self, attr: AttrId) -> String {
        let a = &self.attrs[attr.index()];
        format!("{}.{}", self.name(a.entity), a.name)
    }

    fn link_reverses(&mut self) -> Result<()> {
        for index in 0..self.attrs.len() {
            let attr = AttrId::from_index(index);
            let AttrType::Entity(target) = self.attrs[index].ty else {
                continue;
            };
            if let Some(paired) = self.attrs[index].reverse {
                if let Some(name) = &self.reverse_names[index] {
                    if self.attrs[paired.index()].name != *name {
                        return Err(self.reverse_error(
                            SchemaErrorKind::ReverseMismatch,
                            attr,
                            format!(
                                "Inconsistent reverse attributes {} and {}",
                                self.attr_path(attr),
                                self.attr_path(paired)
                            ),
                        ));
                    }
                }
                continue;
            }
            let reverse = self.find_reverse(attr, target)?;
            self.pair(attr, reverse)?;
        }

        for index in 0..self.attrs.len() {
            let attr = &self.attrs[index];
            let Some(reverse) = attr.reverse else {
                continue;
            };
            let reverse_required = self.attrs[reverse.index()].kind == AttrKind::Required;
            let cascade = self.cascade[index]
                .unwrap_or(attr.kind == AttrKind::Set && reverse_required);
            self.attrs[index].cascade_delete = cascade;
        }
        Ok(())
    }

    fn reverse_error(&self, kind: SchemaErrorKind, attr: AttrId, message: String) -> Error {
        let a = &self.attrs[attr.index()];
        schema_error(kind, self.name(a.entity), &a.name, message)
    }

    fn find_reverse(&self, attr: AttrId, target: EntityId) -> Result<AttrId> {
        let a = &self.attrs[attr.index()];
        let owner = a.entity;
        let target_ty = self.declared(target)?;

        if let Some(name) = &self.reverse_names[attr.index()] {
            let reverse = target_ty.by_name.get(name).copied().ok_or_else(|| {
                self.reverse_error(
                    SchemaErrorKind::ReverseNotFound,
                    attr,
                    format!(
                        "Reverse attribute for {} not found: {}.{name}",
                        self.attr_path(attr),
                        target_ty.name
                    ),
                )
            })?;
            let r = &self.attrs[reverse.index()];
            let names_back = self.reverse_names[reverse.index()]
                .as_ref()
                .is_none_or(|n| *n == a.name);
            let free = r.reverse.is_none_or(|paired| paired == attr);
            if r.ty != AttrType::Entity(owner) || !names_back || !free {
                return Err(self.reverse_error(
                    SchemaErrorKind::ReverseMismatch,
                    attr,
                    format!(
                        "Inconsistent reverse attributes {} and {}",
                        self.attr_path(attr),
                        self.attr_path(reverse)
                    ),
                ));
            }
            return Ok(reverse);
        }

        let mut named_back = Vec::new();
        let mut unannotated = Vec::new();
        for &candidate in &target_ty.new_attrs {
            let c = &self.attrs[candidate.index()];
            if c.ty != AttrType::Entity(owner) {
                continue;
            }
            match &self.reverse_names[candidate.index()] {
                Some(name) if *name == a.name => named_back.push(candidate),
                None if candidate != attr && c.reverse.is_none() => unannotated.push(candidate),
                _ => {}
            }
        }

        let candidates = if named_back.is_empty() {
            unannotated
        } else {
            named_back
        };
        match candidates.as_slice() {
            [single] => Ok(*single),
            [] => Err(self.reverse_error(
                SchemaErrorKind::ReverseNotFound,
                attr,
                format!(
                    "Reverse attribute for {} not found",
                    self.attr_path(attr)
                ),
            )),
            many => Err(self.reverse_error(
                SchemaErrorKind::AmbiguousReverse,
                attr,
                format!(
                    "Ambiguous reverse attribute for {}: {}",
                    self.attr_path(attr),
                    many.iter()
                        .map(|&c| self.attr_path(c))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
        }
    }

    fn pair(&mut self, attr: AttrId, reverse: AttrId) -> Result<()> {
        let a = &self.attrs[attr.index()];
        let r = &self.attrs[reverse.index()];
        if attr == reverse && a.kind != AttrKind::Set {
            return Err(self.reverse_error(
                SchemaErrorKind::InvalidRelationship,
                attr,
                format!(
                    "Symmetric relationship {} must be a Set",
                    self.attr_path(attr)
                ),
            ));
        }
        if a.kind == AttrKind::Required && r.kind == AttrKind::Required {
            return Err(self.reverse_error(
                SchemaErrorKind::InvalidRelationship,
                attr,
                format!(
                    "At least one attribute of one-to-one relationship {} - {} must be optional",
                    self.attr_path(attr),
                    self.attr_path(reverse)
                ),
            ));
        }
        self.attrs[attr.index()].reverse = Some(reverse);
        self.attrs[reverse.index()].reverse = Some(attr);
        Ok(())
    }

    fn into_schema(self) -> Result<Schema> {
        let mut entities = Vec::with_capacity(self.entities.len());
        for (index, entity) in self.entities.into_iter().enumerate() {
            let mut entity = entity.ok_or_else(|| {
                Error::Custom(format!("entity {} was never declared", self.defs[index].name))
            })?;
            entity.slot_count = self.next_slot[entity.root.index()];
            entities.push(entity);
        }
        Ok(Schema {
            entities,
            attrs: self.attrs,
            keys: self.keys,
            by_name: self.by_name,
        })
    }
}

/// Per-attribute declaration checks; returns the coerced default value.
fn check_attr_def(entity: &str, def: &AttrDef, ty: AttrType) -> Result<Option<Value>> {
    let fail = |kind, message: String| Err(schema_error(kind, entity, &def.name, message));
    let path = format!("{entity}.{}", def.name);

    if def.kind == AttrKind::Set {
        if !matches!(ty, AttrType::Entity(_)) {
            return fail(
                SchemaErrorKind::InvalidRelationship,
                format!("Set attribute {path} must reference an entity"),
            );
        }
        if def.unique || def.primary_key || def.auto || def.default.is_some() {
            return fail(
                SchemaErrorKind::InvalidKey,
                format!("Set attribute {path} cannot be a key, auto or have a default"),
            );
        }
    }
    if let AttrType::Scalar(kind) = ty {
        if def.reverse.is_some() || def.cascade_delete.is_some() {
            return fail(
                SchemaErrorKind::InvalidRelationship,
                format!("Scalar attribute {path} cannot have a reverse or cascade"),
            );
        }
        if def.auto && !(def.primary_key && kind.is_integer()) {
            return fail(
                SchemaErrorKind::InvalidKey,
                format!("auto is only valid for an integer primary key, not {path}"),
            );
        }
        if kind.is_float() && (def.unique || def.primary_key) {
            return fail(
                SchemaErrorKind::InvalidKey,
                format!("Floating point attribute {path} cannot be part of a key"),
            );
        }
    } else if def.auto {
        return fail(
            SchemaErrorKind::InvalidKey,
            format!("auto is only valid for an integer primary key, not {path}"),
        );
    }
    if def.kind == AttrKind::Required && def.nullable == Some(true) {
        return fail(
            SchemaErrorKind::Mapping,
            format!("Required attribute {path} cannot be nullable"),
        );
    }

    match (&def.default, ty) {
        (None, _) => Ok(None),
        (Some(value), AttrType::Scalar(kind)) => kind
            .coerce(value.clone())
            .map(Some)
            .or_else(|e| fail(SchemaErrorKind::Mapping, format!("Invalid default for {path}: {e}"))),
        (Some(_), AttrType::Entity(_)) => fail(
            SchemaErrorKind::Mapping,
            format!("Relationship attribute {path} cannot have a default"),
        ),
    }
}

fn assign_bits(schema: &mut Schema, order: &[EntityId]) -> Result<()> {
    let mut next_bit: HashMap<EntityId, usize> = HashMap::new();
    for &entity in order {
        let root = schema.entity(entity).root;
        let new_attrs = schema.entity(entity).new_attrs.clone();
        for a in new_attrs {
            let tracked = {
                let attr = schema.attr(a);
                attr.kind != AttrKind::Set
                    && !attr.is_discriminator
                    && attr.pk_offset.is_none()
            };
            if !tracked {
                continue;
            }
            let next = next_bit.entry(root).or_insert(0);
            if *next >= MAX_TRACKED_ATTRIBUTES {
                let name = schema.entity(root).name.clone();
                return Err(SchemaError::new(
                    SchemaErrorKind::TooManyAttributes,
                    format!(
                        "Entity family {name} has more than {MAX_TRACKED_ATTRIBUTES} tracked attributes"
                    ),
                )
                .entity(name)
                .into());
            }
            let bit: Bits = 1 << *next;
            schema.attrs[a.index()].bit = bit;
            *next += 1;
        }
    }

    for index in 0..schema.entities.len() {
        let (all, except_volatile) = schema.entities[index].attrs.iter().fold(
            (0, 0),
            |(all, except_volatile): (Bits, Bits), &a| {
                let attr = &schema.attrs[a.index()];
                let volatile_free = if attr.volatile { 0 } else { attr.bit };
                (all | attr.bit, except_volatile | volatile_free)
            },
        );
        schema.entities[index].all_bits = all;
        schema.entities[index].all_bits_except_volatile = except_volatile;
    }
    Ok(())
}

fn validate_mapping(schema: &Schema) -> Result<()> {
    let mapping = |attr: &Attribute, message: String| -> Error {
        schema_error(
            SchemaErrorKind::Mapping,
            &schema.entity(attr.entity).name,
            &attr.name,
            message,
        )
    };

    for attr in &schema.attrs {
        let path = schema.attr_path(attr.id);
        let reverse = attr.reverse.map(|r| schema.attr(r));
        match attr.ty {
            AttrType::Scalar(_) => {
                if attr.explicit_columns.len() > 1 {
                    return Err(mapping(attr, format!("Scalar attribute {path} maps to one column")));
                }
            }
            AttrType::Entity(target) => {
                let expected = schema.pk_columns(target).len();
                if !attr.explicit_columns.is_empty() && attr.explicit_columns.len() != expected {
                    return Err(mapping(
                        attr,
                        format!(
                            "Invalid number of columns for {path}: expected {expected}, got {}",
                            attr.explicit_columns.len()
                        ),
                    ));
                }
                let Some(reverse) = reverse else {
                    continue;
                };
                match (attr.kind, reverse.kind) {
                    (AttrKind::Set, AttrKind::Set) => {
                        if let (Some(a), Some(b)) = (&attr.explicit_table, &reverse.explicit_table) {
                            if a != b {
                                return Err(mapping(
                                    attr,
                                    format!("Link table name conflict for {path}: {a} vs {b}"),
                                ));
                            }
                        }
                        if !attr.explicit_reverse_columns.is_empty() && reverse.id != attr.id {
                            return Err(mapping(
                                attr,
                                format!("reverse_columns is only valid for symmetric {path}"),
                            ));
                        }
                    }
                    (AttrKind::Set, _) => {
                        if !attr.explicit_columns.is_empty() || attr.explicit_table.is_some() {
                            return Err(mapping(
                                attr,
                                format!("Columns of one-to-many {path} are defined by its reverse"),
                            ));
                        }
                    }
                    (_, AttrKind::Set) => {}
                    _ => {
                        if !attr.explicit_columns.is_empty() && !reverse.explicit_columns.is_empty() {
                            return Err(mapping(
                                attr,
                                format!(
                                    "Both sides of one-to-one relationship {path} - {} specify columns",
                                    schema.attr_path(reverse.id)
                                ),
                            ));
                        }
                    }
                }
            }
        }
    }

    for root in schema.entities.iter().filter(|e| e.root == e.id) {
        let family: Vec<&EntityType> = std::iter::once(root)
            .chain(root.subtypes.iter().map(|&s| schema.entity(s)))
            .collect();

        let mut owners: HashMap<&str, AttrId> = HashMap::new();
        let mut seen = HashSet::new();
        for entity in &family {
            for &a in &entity.new_attrs {
                if !seen.insert(a) {
                    continue;
                }
                for column in schema.columns(a) {
                    if let Some(&other) = owners.get(column.as_str()) {
                        return Err(mapping(
                            schema.attr(a),
                            format!(
                                "Column {column} of table {} is mapped to both {} and {}",
                                root.table,
                                schema.attr_path(other),
                                schema.attr_path(a)
                            ),
                        ));
                    }
                    owners.insert(column.as_str(), a);
                }
            }
        }

        if root.discriminator.is_some() {
            let mut values: Vec<&Value> = Vec::new();
            for entity in &family {
                if values.contains(&&entity.discriminator_value) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::Inheritance,
                        format!(
                            "Discriminator value {:?} of {} is already used in its family",
                            entity.discriminator_value, entity.name
                        ),
                    )
                    .entity(&entity.name)
                    .into());
                }
                values.push(&entity.discriminator_value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(result: Result<Schema>) -> SchemaErrorKind {
        result.unwrap_err().schema_kind().expect("schema error")
    }

    fn university() -> SchemaBuilder {
        let mut b = SchemaBuilder::new();
        let group = b.entity("Group");
        group.primary_key("number", ValueKind::Int);
        group.set("students", "Student");
        let student = b.entity("Student");
        student.required("name", ValueKind::Text);
        student.optional("gpa", ValueKind::Double);
        student.required("group", "Group");
        student.set("courses", "Course");
        let course = b.entity("Course");
        course.required("title", ValueKind::Text);
        course.required("semester", ValueKind::Int);
        course.composite_primary_key(&["title", "semester"]);
        course.set("students", "Student");
        b
    }

    #[test]
    fn test_implicit_primary_key() {
        let schema = university().build().unwrap();
        let student = schema.entity_by_name("Student").unwrap();
        let id = schema.attr_by_name(student.id(), "id").unwrap();
        let id_attr = schema.attr(id);
        assert!(id_attr.is_pk());
        assert!(id_attr.is_auto());
        assert_eq!(id_attr.value_kind(), Some(ValueKind::BigInt));
        assert!(student.has_auto_pk());
        assert_eq!(student.pk_attrs(), &[id]);
        assert_eq!(student.table(), "student");
    }

    #[test]
    fn test_reverse_resolution_and_columns() {
        let schema = university().build().unwrap();
        let student = schema.entity_by_name("Student").unwrap().id();
        let group = schema.entity_by_name("Group").unwrap().id();
        let s_group = schema.attr_by_name(student, "group").unwrap();
        let g_students = schema.attr_by_name(group, "students").unwrap();

        assert_eq!(schema.attr(s_group).reverse(), Some(g_students));
        assert_eq!(schema.attr(g_students).reverse(), Some(s_group));
        assert_eq!(schema.columns(s_group), &["group".to_string()]);
        assert!(schema.columns(g_students).is_empty());
        assert!(schema.link_table(g_students).is_none());
        // one-to-many with a Required reverse cascades by default
        assert!(schema.attr(g_students).cascade_delete());
        assert!(!schema.attr(s_group).cascade_delete());
    }

    #[test]
    fn test_many_to_many_with_composite_key() {
        let schema = university().build().unwrap();
        let student = schema.entity_by_name("Student").unwrap().id();
        let course = schema.entity_by_name("Course").unwrap().id();
        let s_courses = schema.attr_by_name(student, "courses").unwrap();
        let c_students = schema.attr_by_name(course, "students").unwrap();

        let from_student = schema.link_table(s_courses).unwrap().clone();
        let from_course = schema.link_table(c_students).unwrap().clone();
        assert_eq!(from_student.table, "course_students");
        assert_eq!(from_course.table, "course_students");
        assert_eq!(from_student.own_columns, vec!["student".to_string()]);
        assert_eq!(
            from_student.target_columns,
            vec!["course_title".to_string(), "course_semester".to_string()]
        );
        assert_eq!(from_course.own_columns, from_student.target_columns);
        assert_eq!(from_course.target_columns, from_student.own_columns);
    }

    #[test]
    fn test_bits_skip_pk_and_collections() {
        let schema = university().build().unwrap();
        let student = schema.entity_by_name("Student").unwrap();
        let bits: Vec<Bits> = student.attrs().iter().map(|&a| schema.attr(a).bit()).collect();
        // id, name, gpa, group, courses
        assert_eq!(bits, vec![0, 1, 2, 4, 0]);
        assert_eq!(student.all_bits(), 0b111);
        assert_eq!(student.slot_count(), 5);
        // floats do not take part in optimistic checks by default
        let gpa = schema.attr_by_name(student.id(), "gpa").unwrap();
        assert!(!schema.attr(gpa).is_optimistic());
    }

    #[test]
    fn test_keys() {
        let mut b = SchemaBuilder::new();
        let person = b.entity("Person");
        person.unique("email", ValueKind::Text);
        person.required("first", ValueKind::Text);
        person.required("last", ValueKind::Text);
        person.composite_key(&["first", "last"]);
        let schema = b.build().unwrap();

        let ty = schema.entity_by_name("Person").unwrap();
        assert_eq!(ty.keys().len(), 3);
        assert!(schema.key(ty.keys()[0]).is_pk());
        let first = schema.attr_by_name(ty.id(), "first").unwrap();
        let last = schema.attr_by_name(ty.id(), "last").unwrap();
        assert_eq!(schema.attr(last).keys(), &[(ty.keys()[2], 1)]);
        assert_eq!(schema.key(ty.keys()[2]).attrs(), &[first, last]);
        assert!(schema.attr(schema.attr_by_name(ty.id(), "email").unwrap()).is_unique());
    }

    #[test]
    fn test_ambiguous_and_missing_reverse() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").set("cars", "Car");
        b.entity("Car").required("owner", "Person");
        b.entity("Car").optional("driver", "Person");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::AmbiguousReverse);

        let mut b = SchemaBuilder::new();
        b.entity("Person").set("owned", "Car").reverse("owner");
        b.entity("Person").set("driven", "Car").reverse("driver");
        b.entity("Car").required("owner", "Person");
        b.entity("Car").optional("driver", "Person");
        assert!(b.build().is_ok());

        let mut b = SchemaBuilder::new();
        b.entity("Person").required("name", ValueKind::Text);
        b.entity("Car").required("owner", "Person");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::ReverseNotFound);

        let mut b = SchemaBuilder::new();
        b.entity("Person").set("cars", "Car").reverse("nope");
        b.entity("Car").required("owner", "Person");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::ReverseNotFound);
    }

    #[test]
    fn test_reverse_mismatch() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").set("cars", "Car").reverse("model");
        b.entity("Car").required("owner", "Person");
        b.entity("Car").required("model", ValueKind::Text);
        assert_eq!(kind_of(b.build()), SchemaErrorKind::ReverseMismatch);
    }

    #[test]
    fn test_both_sides_required() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").required("passport", "Passport");
        b.entity("Passport").required("person", "Person");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidRelationship);
    }

    #[test]
    fn test_symmetric_set() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").set("friends", "Person").reverse("friends");
        let schema = b.build().unwrap();
        let person = schema.entity_by_name("Person").unwrap().id();
        let friends = schema.attr_by_name(person, "friends").unwrap();
        assert!(schema.attr(friends).is_symmetric());
        let link = schema.link_table(friends).unwrap();
        assert_eq!(link.table, "person_friends");
        assert_eq!(link.own_columns, vec!["person".to_string()]);
        assert_eq!(link.target_columns, vec!["person_2".to_string()]);

        let mut b = SchemaBuilder::new();
        b.entity("Person").optional("partner", "Person").reverse("partner");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidRelationship);
    }

    #[test]
    fn test_same_entity_many_to_many() {
        let mut b = SchemaBuilder::new();
        let user = b.entity("User");
        user.set("followers", "User").reverse("following");
        user.set("following", "User").reverse("followers");
        let schema = b.build().unwrap();
        let user = schema.entity_by_name("User").unwrap().id();
        let followers = schema.attr_by_name(user, "followers").unwrap();
        let following = schema.attr_by_name(user, "following").unwrap();
        let a = schema.link_table(followers).unwrap();
        let b = schema.link_table(following).unwrap();
        assert_eq!(a.table, "user_followers");
        assert_eq!(a.target_columns, vec!["user".to_string()]);
        assert_eq!(a.own_columns, vec!["user_2".to_string()]);
        assert_eq!(b.own_columns, a.target_columns);
    }

    #[test]
    fn test_one_to_one_column_owner() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").optional("passport", "Passport");
        b.entity("Passport").required("person", "Person");
        let schema = b.build().unwrap();
        let person = schema.entity_by_name("Person").unwrap().id();
        let passport = schema.entity_by_name("Passport").unwrap().id();
        let p_passport = schema.attr_by_name(person, "passport").unwrap();
        let pp_person = schema.attr_by_name(passport, "person").unwrap();
        assert!(schema.columns(p_passport).is_empty());
        // the columnless side is still tracked
        assert_ne!(schema.attr(p_passport).bit(), 0);
        assert_eq!(schema.columns(pp_person), &["person".to_string()]);

        // both optional: the first by (entity, attr) name owns the column
        let mut b = SchemaBuilder::new();
        b.entity("Husband").optional("wife", "Wife");
        b.entity("Wife").optional("husband", "Husband");
        let schema = b.build().unwrap();
        let husband = schema.entity_by_name("Husband").unwrap().id();
        let wife = schema.attr_by_name(husband, "wife").unwrap();
        assert_eq!(schema.columns(wife), &["wife".to_string()]);

        // explicit columns win
        let mut b = SchemaBuilder::new();
        b.entity("Husband").optional("wife", "Wife");
        b.entity("Wife").optional("husband", "Husband").column("husband_id");
        let schema = b.build().unwrap();
        let husband = schema.entity_by_name("Husband").unwrap().id();
        let wife_ty = schema.entity_by_name("Wife").unwrap().id();
        assert!(schema.columns(schema.attr_by_name(husband, "wife").unwrap()).is_empty());
        assert_eq!(
            schema.columns(schema.attr_by_name(wife_ty, "husband").unwrap()),
            &["husband_id".to_string()]
        );

        let mut b = SchemaBuilder::new();
        b.entity("Husband").optional("wife", "Wife").column("wife_id");
        b.entity("Wife").optional("husband", "Husband").column("husband_id");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::Mapping);
    }

    #[test]
    fn test_inheritance() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").required("name", ValueKind::Text);
        let student = b.entity("Student");
        student.extends("Person");
        student.optional("gpa", ValueKind::Double);
        let professor = b.entity("Professor");
        professor.extends("Person");
        professor.discriminator("prof");
        professor.optional("degree", ValueKind::Text);
        let schema = b.build().unwrap();

        let person = schema.entity_by_name("Person").unwrap();
        let student = schema.entity_by_name("Student").unwrap();
        let professor = schema.entity_by_name("Professor").unwrap();
        assert_eq!(student.root(), person.id());
        assert_eq!(student.table(), "person");
        assert!(schema.is_subtype(student.id(), person.id()));
        assert!(!schema.is_subtype(person.id(), student.id()));
        assert_eq!(person.subtypes().len(), 2);

        let classtype = person.discriminator().unwrap();
        assert_eq!(schema.attr(classtype).name(), DISCRIMINATOR_ATTRIBUTE);
        assert_eq!(student.discriminator(), Some(classtype));
        assert_eq!(student.discriminator_value(), &Value::Text("Student".into()));
        assert_eq!(
            schema.entity_for_discriminator(person.id(), &Value::Text("prof".into())),
            Some(professor.id())
        );

        // one slot space per family
        let gpa = schema.attr_by_name(student.id(), "gpa").unwrap();
        let degree = schema.attr_by_name(professor.id(), "degree").unwrap();
        assert_ne!(schema.attr(gpa).slot(), schema.attr(degree).slot());
        assert_ne!(schema.attr(gpa).bit(), schema.attr(degree).bit());
        assert_eq!(student.slot_count(), professor.slot_count());
        assert_eq!(schema.attr(classtype).bit(), 0);
    }

    #[test]
    fn test_pk_in_subtype_rejected() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").required("name", ValueKind::Text);
        let student = b.entity("Student");
        student.extends("Person");
        student.primary_key("code", ValueKind::Int);
        assert_eq!(kind_of(b.build()), SchemaErrorKind::DuplicatePrimaryKey);
    }

    #[test]
    fn test_inheritance_cycle() {
        let mut b = SchemaBuilder::new();
        b.entity("A").extends("B");
        b.entity("B").extends("A");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::Inheritance);
    }

    #[test]
    fn test_key_errors() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").optional("id", ValueKind::Text);
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidKey);

        let mut b = SchemaBuilder::new();
        b.entity("Person").primary_key("code", ValueKind::Text).auto();
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidKey);

        let mut b = SchemaBuilder::new();
        b.entity("Point").unique("x", ValueKind::Double);
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidKey);

        let mut b = SchemaBuilder::new();
        b.entity("Person").primary_key("a", ValueKind::Int);
        b.entity("Person").primary_key("b", ValueKind::Int);
        assert_eq!(kind_of(b.build()), SchemaErrorKind::DuplicatePrimaryKey);
    }

    #[test]
    fn test_pk_reference_cycle() {
        let mut b = SchemaBuilder::new();
        b.entity("A").primary_key("b", "B");
        b.entity("B").primary_key("a", "A");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidKey);
    }

    #[test]
    fn test_names() {
        let mut b = SchemaBuilder::new();
        b.entity("person");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidName);

        let mut b = SchemaBuilder::new();
        b.entity("Person").required("1st", ValueKind::Text);
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidName);

        let mut b = SchemaBuilder::new();
        b.entity("Person").required("name", ValueKind::Text);
        b.entity("Person").optional("name", ValueKind::Text);
        assert_eq!(kind_of(b.build()), SchemaErrorKind::InvalidName);
    }

    #[test]
    fn test_unknown_entity() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").set("cars", "Car");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::UnknownEntity);
    }

    #[test]
    fn test_explicit_column_count() {
        let mut b = SchemaBuilder::new();
        let course = b.entity("Course");
        course.required("title", ValueKind::Text);
        course.required("semester", ValueKind::Int);
        course.composite_primary_key(&["title", "semester"]);
        course.set("lessons", "Lesson");
        b.entity("Lesson").required("course", "Course").column("course_id");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::Mapping);
    }

    #[test]
    fn test_duplicate_column_in_family() {
        let mut b = SchemaBuilder::new();
        b.entity("Person").required("name", ValueKind::Text);
        let student = b.entity("Student");
        student.extends("Person");
        student.optional("nickname", ValueKind::Text).column("name");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::Mapping);
    }

    #[test]
    fn test_default_is_coerced() {
        let mut b = SchemaBuilder::new();
        b.entity("Item").optional("qty", ValueKind::BigInt).default(1);
        let schema = b.build().unwrap();
        let item = schema.entity_by_name("Item").unwrap().id();
        let qty = schema.attr_by_name(item, "qty").unwrap();
        assert_eq!(schema.attr(qty).default(), Some(&Value::BigInt(1)));

        let mut b = SchemaBuilder::new();
        b.entity("Item").optional("qty", ValueKind::Int).default("many");
        assert_eq!(kind_of(b.build()), SchemaErrorKind::Mapping);
    }

    #[test]
    fn test_too_many_attributes() {
        let mut b = SchemaBuilder::new();
        let wide = b.entity("Wide");
        for i in 0..=MAX_TRACKED_ATTRIBUTES {
            wide.optional(&format!("c{i}"), ValueKind::Int);
        }
        assert_eq!(kind_of(b.build()), SchemaErrorKind::TooManyAttributes);
    }

    #[test]
    fn test_volatile_excluded_from_read_bits() {
        let mut b = SchemaBuilder::new();
        let counter = b.entity("Counter");
        counter.required("name", ValueKind::Text);
        counter.optional("hits", ValueKind::BigInt).volatile();
        let schema = b.build().unwrap();
        let ty = schema.entity_by_name("Counter").unwrap();
        assert_eq!(ty.all_bits(), 0b11);
        assert_eq!(ty.all_bits_except_volatile(), 0b01);
    }
}
