//! Versions feature module
//!
//! Read access to dataset versions and the layers of the active one.

pub mod queries;
pub mod routes;

pub use routes::versions_routes;
