//! Entity metamodel for txorm.
//!
//! This crate provides:
//! - A declarative [`SchemaBuilder`] for entity types and their attributes
//! - Reverse-relationship resolution and relationship validation
//! - Single-table inheritance with an automatic discriminator
//! - Primary, unique and composite keys
//! - Column and link-table layout for references and collections
//! - Per-family cell slots and dirty-tracking bits
//!
//! A built [`Schema`] is immutable and is usually shared behind an `Arc`.

mod attribute;
mod builder;
mod entity;
mod schema;

pub use attribute::{AttrKind, AttrType, Attribute, LinkTable};
pub use builder::{AttrDef, EntityDef, SchemaBuilder, TypeRef};
pub use entity::{EntityType, KeyDef};
pub use schema::Schema;

/// Dirty-tracking bitmask; one bit per tracked attribute of a family.
pub type Bits = u128;

/// Maximum number of tracked attributes in one inheritance family.
pub const MAX_TRACKED_ATTRIBUTES: usize = Bits::BITS as usize;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            /// Position in the schema's arena.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_id!(
    /// Handle of an [`EntityType`] inside a [`Schema`].
    EntityId
);
define_id!(
    /// Handle of an [`Attribute`] inside a [`Schema`].
    AttrId
);
define_id!(
    /// Handle of a [`KeyDef`] inside a [`Schema`].
    KeyId
);
