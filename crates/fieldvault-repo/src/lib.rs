//! Record repositories on top of the connection manager: a generic
//! soft-deleting repository, the user repository and the database health probe.

pub mod health;
pub mod repository;
pub mod user;

pub use repository::{Repository, Stored};
pub use user::{User, UserRepository, UserUpdate};
