//! Schema-driven transform between the REST object model and storage.
//!
//! - [`keys`]: field name to storage key mapping and name validation
//! - [`coders`]: special-type coders and atom encoding
//! - [`acl`]: ACL split into permission lists
//! - [`constraints`]: where-clause to storage predicate
//! - [`update`]: write bodies to storage documents and update instructions
//! - [`object`]: storage documents back to REST objects

pub mod acl;
pub mod coders;
pub mod constraints;
pub mod keys;
pub mod object;
pub mod update;

pub use acl::{transform_acl, untransform_acl, StoredAcl};
pub use coders::{
    coder_for, BytesCoder, DateCoder, FileCoder, GeoPointCoder, PointerCoder, SpecialTypeCoder,
};
pub use constraints::transform_where;
pub use keys::{storage_key, transform_sort};
pub use object::untransform_object;
pub use update::{schema_additions, transform_create, transform_update};
