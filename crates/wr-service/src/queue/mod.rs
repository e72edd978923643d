//! Admission-control queues.
//!
//! - [`store`] - `QueueStore` contract and key schema
//! - [`memory`] - In-memory `QueueStore`
//! - [`manager`] - `QueueManager` (register, promote, rank, admission checks)

pub mod manager;
pub mod memory;
pub mod store;

pub use manager::{QueueManager, QueueManagerConfig, Registration, NOT_WAITING};
pub use memory::InMemoryQueueStore;
pub use store::{proceed_key, queue_name_from_wait_key, wait_key, QueueStore, WAIT_KEY_SCAN_PATTERN};
