//! # admitq-id
//!
//! Stable ID types, parsing, and validation for the admitq control plane.
//!
//! ## Design Principles
//!
//! - Workload IDs are system-generated; queue and check names are operator labels
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed so a workload ID cannot be passed where a request ID is expected
//!
//! ## ID Format
//!
//! Resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `wl_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `req_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! ULIDs are time-ordered, so sorting workload IDs approximates submission order.
//!
//! Store bookkeeping numbers (`ResourceVersion`, `Revision`) live here as well
//! so every crate agrees on their representation.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
