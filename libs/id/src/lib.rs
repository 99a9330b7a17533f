//! # runway-id
//!
//! Typed identifiers for runway entities and the codec between their two
//! representations.
//!
//! ## Friendly and internal forms
//!
//! Every entity has one identity with two spellings:
//!
//! - the **internal** form is the bare ULID (`01HV4Z2WQXKJNM8GPQY6VBKC3D`),
//!   used as the storage key;
//! - the **friendly** form carries a per-kind namespace prefix
//!   (`waitpoint_01HV4Z2WQXKJNM8GPQY6VBKC3D`) and is what callers see.
//!
//! The mapping is pure and reversible: `to_internal(parse(f)) == f` minus the
//! prefix, and a friendly id with another kind's prefix never decodes. Two
//! environments can therefore never share an identifier, and lookups still
//! scope by environment on top of that.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
