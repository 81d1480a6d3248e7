pub mod in_memory_cluster_store;
pub mod sqlite;

pub use in_memory_cluster_store::InMemoryClusterStore;
pub use sqlite::{SqliteClusterStore, SqliteDatabase};
