//! Waiting Room Service Library
//!
//! Arrival-ordered admission control for high-demand resources. Users register
//! into a per-queue wait set, are promoted in batches to a proceed set, and
//! prove admission with a deterministic token.
//!
//! # Architecture
//!
//! ```text
//! HTTP shim (routes, handlers)
//! ├── QueueManager ──► QueueStore (Redis | in-memory)
//! │   └── TokenIssuer ──► TokenCache (bounded)
//! └── AdmissionScheduler (periodic discover + promote sweep)
//! ```
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with HTTP mappings
//! - [`queue`] - Store contract, in-memory store, `QueueManager`
//! - [`redis`] - Redis-backed `QueueStore`
//! - [`scheduler`] - `AdmissionScheduler` and queue discovery
//! - [`token`] - Admission tokens and the token cache
//! - [`handlers`], [`routes`] - HTTP surface
//! - [`observability`] - Metrics and health endpoints

pub mod config;
pub mod errors;
pub mod handlers;
pub mod observability;
pub mod queue;
pub mod redis;
pub mod routes;
pub mod scheduler;
pub mod token;
