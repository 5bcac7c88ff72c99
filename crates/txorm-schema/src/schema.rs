//! The resolved, immutable metamodel.

use std::collections::HashMap;

use txorm_core::{Error, Result, SchemaErrorKind, Value};

use crate::attribute::{AttrKind, AttrType, Attribute, LinkTable};
use crate::entity::{EntityType, KeyDef};
use crate::{AttrId, EntityId, KeyId};

/// Every entity type, attribute and key of a mapping.
///
/// A `Schema` is produced once by [`SchemaBuilder::build`](crate::SchemaBuilder::build)
/// and shared read-only (usually behind an `Arc`) by every transaction.
/// Column lists are computed lazily and cached.
#[derive(Debug)]
pub struct Schema {
    pub(crate) entities: Vec<EntityType>,
    pub(crate) attrs: Vec<Attribute>,
    pub(crate) keys: Vec<KeyDef>,
    pub(crate) by_name: HashMap<String, EntityId>,
}

impl Schema {
    pub fn entity(&self, id: EntityId) -> &EntityType {
        &self.entities[id.index()]
    }

    pub fn attr(&self, id: AttrId) -> &Attribute {
        &self.attrs[id.index()]
    }

    pub fn key(&self, id: KeyId) -> &KeyDef {
        &self.keys[id.index()]
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.iter()
    }

    pub fn entity_id(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(name).copied()
    }

    /// Look up an entity by name, failing with `UnknownEntity`.
    pub fn entity_by_name(&self, name: &str) -> Result<&EntityType> {
        self.entity_id(name)
            .map(|id| self.entity(id))
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownEntity,
                    format!("Entity {} is not defined", name),
                )
            })
    }

    /// Look up an attribute of `entity` (inherited attributes included).
    pub fn attr_by_name(&self, entity: EntityId, name: &str) -> Result<AttrId> {
        let ty = self.entity(entity);
        ty.attr_named(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownAttribute,
                format!("Unknown attribute {}.{}", ty.name, name),
            )
        })
    }

    /// Qualified `Entity.attr` name for messages.
    pub fn attr_path(&self, attr: AttrId) -> String {
        let a = self.attr(attr);
        format!("{}.{}", self.entity(a.entity).name, a.name)
    }

    /// `sub` is `sup` or one of its subtypes.
    pub fn is_subtype(&self, sub: EntityId, sup: EntityId) -> bool {
        sub == sup || self.entity(sup).subtypes.contains(&sub)
    }

    /// Subtype of `root`'s family whose discriminator equals `value`.
    pub fn entity_for_discriminator(&self, root: EntityId, value: &Value) -> Option<EntityId> {
        let root_ty = self.entity(root);
        std::iter::once(root)
            .chain(root_ty.subtypes.iter().copied())
            .find(|&id| &self.entity(id).discriminator_value == value)
    }

    pub fn pk_key(&self, entity: EntityId) -> &KeyDef {
        self.key(self.entity(entity).pk_key)
    }

    /// Primary key columns of `entity`, references expanded.
    pub fn pk_columns(&self, entity: EntityId) -> &[String] {
        let ty = self.entity(entity);
        ty.pk_columns.get_or_init(|| {
            ty.pk_attrs
                .iter()
                .flat_map(|&a| self.columns(a).iter().cloned())
                .collect()
        })
    }

    /// Physical columns of an attribute.
    ///
    /// Empty for collections and for the side of a one-to-one relationship
    /// that does not hold the foreign key.
    pub fn columns(&self, attr: AttrId) -> &[String] {
        let a = self.attr(attr);
        a.columns.get_or_init(|| self.compute_columns(a))
    }

    fn compute_columns(&self, a: &Attribute) -> Vec<String> {
        match (a.kind, a.ty) {
            (AttrKind::Set, _) => Vec::new(),
            (_, AttrType::Scalar(_)) => {
                if a.explicit_columns.is_empty() {
                    vec![a.name.to_lowercase()]
                } else {
                    a.explicit_columns.clone()
                }
            }
            (_, AttrType::Entity(target)) => {
                let owns = match a.reverse.map(|r| self.attr(r)) {
                    Some(r) if r.kind == AttrKind::Set => true,
                    Some(r) => self.one_to_one_owner(a, r),
                    None => true,
                };
                if !owns {
                    return Vec::new();
                }
                if !a.explicit_columns.is_empty() {
                    return a.explicit_columns.clone();
                }
                let target_pk = self.pk_columns(target);
                if target_pk.len() == 1 {
                    vec![a.name.to_lowercase()]
                } else {
                    target_pk
                        .iter()
                        .map(|col| format!("{}_{}", a.name, col).to_lowercase())
                        .collect()
                }
            }
        }
    }

    /// Whether `a` holds the columns of the one-to-one relationship with `r`.
    pub(crate) fn one_to_one_owner(&self, a: &Attribute, r: &Attribute) -> bool {
        if a.kind == AttrKind::Required {
            return true;
        }
        if r.kind == AttrKind::Required {
            return false;
        }
        if !a.explicit_columns.is_empty() {
            return true;
        }
        if !r.explicit_columns.is_empty() {
            return false;
        }
        let a_key = (&self.entity(a.entity).name, &a.name);
        let r_key = (&self.entity(r.entity).name, &r.name);
        a_key <= r_key
    }

    /// Attributes of `entity` that map to at least one column.
    pub fn column_attrs(&self, entity: EntityId) -> impl Iterator<Item = AttrId> + '_ {
        self.entity(entity)
            .attrs
            .iter()
            .copied()
            .filter(move |&a| !self.columns(a).is_empty())
    }

    /// Link table of a many-to-many collection.
    ///
    /// Returns `None` for scalar attributes and one-to-many collections.
    pub fn link_table(&self, attr: AttrId) -> Option<&LinkTable> {
        let a = self.attr(attr);
        let reverse = self.attr(a.reverse?);
        if a.kind != AttrKind::Set || reverse.kind != AttrKind::Set {
            return None;
        }
        Some(a.link.get_or_init(|| self.compute_link(a, reverse)))
    }

    fn default_m2m_columns(&self, entity: EntityId) -> Vec<String> {
        let ty = self.entity(entity);
        let pk = self.pk_columns(entity);
        if pk.len() == 1 {
            vec![ty.name.to_lowercase()]
        } else {
            pk.iter()
                .map(|col| format!("{}_{}", ty.name, col).to_lowercase())
                .collect()
        }
    }

    fn compute_link(&self, a: &Attribute, r: &Attribute) -> LinkTable {
        let entity_name = |attr: &Attribute| self.entity(attr.entity).name.clone();
        let table = a
            .explicit_table
            .clone()
            .or_else(|| r.explicit_table.clone())
            .unwrap_or_else(|| {
                let first = if (entity_name(a), &a.name) <= (entity_name(r), &r.name) {
                    a
                } else {
                    r
                };
                format!("{}_{}", entity_name(first), first.name).to_lowercase()
            });

        if a.id == r.id {
            let columns = if a.explicit_columns.is_empty() {
                self.default_m2m_columns(a.entity)
            } else {
                a.explicit_columns.clone()
            };
            let reverse_columns = if a.explicit_reverse_columns.is_empty() {
                columns.iter().map(|c| format!("{c}_2")).collect()
            } else {
                a.explicit_reverse_columns.clone()
            };
            return LinkTable {
                table,
                own_columns: columns,
                target_columns: reverse_columns,
            };
        }

        // columns of a side hold the pk of that side's target
        let side_columns = |side: &Attribute, other: &Attribute| -> Vec<String> {
            if !side.explicit_columns.is_empty() {
                return side.explicit_columns.clone();
            }
            let mut cols = self.default_m2m_columns(other.entity);
            let side_is_second =
                (entity_name(side), &side.name) > (entity_name(other), &other.name);
            if side.entity == other.entity && side_is_second {
                cols = cols.into_iter().map(|c| format!("{c}_2")).collect();
            }
            cols
        };
        LinkTable {
            table,
            own_columns: side_columns(r, a),
            target_columns: side_columns(a, r),
        }
    }
}
