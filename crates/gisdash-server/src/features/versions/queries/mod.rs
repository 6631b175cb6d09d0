//! Dataset version queries

pub mod get_active;
pub mod list_versions;

pub use get_active::{ActiveVersion, GetActiveVersionError, GetActiveVersionQuery};
pub use list_versions::{ListVersionsError, ListVersionsQuery};
