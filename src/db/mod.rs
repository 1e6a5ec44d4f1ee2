//! Database module

pub mod schema;
pub mod connection;
pub mod repositories;
pub mod store;
pub mod persistence;

pub use connection::Database;
pub use persistence::PersistenceQueue;
pub use repositories::{SessionRepository, WorkspaceRepository};
pub use store::{MemorySessionStore, SessionStore};
