//! Queue storage backends

mod file;
mod sqlite;
mod traits;


pub use file::FileStorage;
pub use sqlite::SqliteStorage;
pub use traits::{NewMessage, QueueStats, QueueStorage, ReceiveRequest, StorageError};
