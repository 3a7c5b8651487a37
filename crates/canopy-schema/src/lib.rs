//! Schema layer of the Canopy directory service.
//!
//! # Purpose
//! Everything the repository needs to interpret directory data: the DN
//! model (parsing, normalization, structural operations), the schema
//! registry (attribute types, object classes, entry validation), typed
//! value normalization per matching rule, and the password-policy view
//! consulted during bind.
mod builtin;
mod dn;
mod ppolicy;
mod registry;
mod value;

pub use dn::{AttrTypeAndValue, Dn, DnCache, NormString, RelativeDn};
pub use ppolicy::PPolicy;
pub use registry::{AttributeType, ObjectClass, SchemaConfig, SchemaRegistry};
pub use value::{NormValue, SchemaValue};

/// Generalized time with seconds resolution, e.g. `20240102150405Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%SZ";
/// Sub-second generalized time used by `pwdFailureTime`.
pub const TIMESTAMP_NANO_FORMAT: &str = "%Y%m%d%H%M%S%.6fZ";
