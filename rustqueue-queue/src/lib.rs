//! Queue engine for RustQueue
//!
//! At-least-once message queues with visibility-timeout leasing:
//! - Add, paginated get, receive (lease, destructive, consumer-scoped)
//! - Delete by receipt handle or by id, update, clear
//! - Queue statistics, listing and health
//!
//! The same semantics run on two storage backends: one JSON container per
//! queue ([`FileStorage`]) or SQLite tables ([`SqliteStorage`]). Expired
//! leases are reclaimed lazily, on the next receive.

pub mod engine;
pub mod handlers;
pub mod lease;
mod lock;
pub mod message;
pub mod record;
pub mod registry;
pub mod storage;
pub mod time;
pub mod validation;

pub use engine::{Caller, MessagePage, QueueEngine, QueueError, QueueInfo, ReceiveOptions};
pub use handlers::{routes, QueueState, API_KEY_HEADER};
pub use message::{Message, MessageStatus};
pub use registry::QueueRegistry;
pub use storage::{
    FileStorage, NewMessage, QueueStats, QueueStorage, ReceiveRequest, SqliteStorage,
    StorageError,
};
pub use validation::QueueLimits;
