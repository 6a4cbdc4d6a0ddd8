//! Location storage for the location service.
//!
//! Reads go through the follower-read executor, writes through the primary.

pub mod models;
pub mod repository;
pub mod schema;

pub use models::{Location, NewLocation};
pub use repository::LocationRepository;
