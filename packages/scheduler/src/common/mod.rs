// Common types and utilities shared across the scheduler core

pub mod entity_ids;
pub mod id;
pub mod pagination;
pub mod patch;
pub mod sql;

pub use entity_ids::*;
pub use id::{Id, V4, V7};
pub use pagination::{trim_results, Cursor};
pub use patch::Patch;
