//! Persistent store for events, topic summaries, skill states and the audit
//! trail.
//!
//! The engine only talks to [`TutorStore`]. [`SqliteStore`] is the durable
//! implementation; [`MemoryStore`] backs tests and embedding callers.

mod memory;
pub mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::TutorStore;
