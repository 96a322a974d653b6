//! # fleetsim-id
//!
//! Stable ID types, parsing, and validation for the fleet simulator.
//!
//! ## Design Principles
//!
//! - IDs are system-generated and never reused, even after an instance is
//!   terminated and pruned
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing different resource types
//!
//! ## ID Format
//!
//! Resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `rep_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//!
//! Event IDs and snapshot versions are plain monotonic integers.

mod error;
#[doc(hidden)]
pub mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
