//! Redis-backed queue storage.
//!
//! This module provides:
//! - `RedisQueueStore` - `QueueStore` over a multiplexed Redis connection
//! - Lua scripts for atomic multi-key queue operations
//!
//! # State Storage
//!
//! - `users:queue:{name}:wait` - Waiting users (ZSET by registration time)
//! - `users:queue:{name}:proceed` - Admitted users (ZSET by admission time)

pub mod client;
pub mod lua_scripts;

pub use client::RedisQueueStore;
