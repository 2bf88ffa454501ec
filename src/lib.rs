//! tinyredis: a single-threaded, event-driven in-memory key-value server.
//!
//! The keyspace is indexed by an incrementally rehashing hash table
//! ([`dict`]), sorted sets are backed by an indexable skip list
//! ([`skiplist`], [`zset`]), and all I/O is multiplexed by a
//! readiness-based reactor ([`ae`]) that drives the client protocol state
//! machine in [`networking`].

pub mod ae;
pub mod anet;
pub mod commands;
pub mod config;
pub mod db;
pub mod dict;
pub mod error;
pub mod networking;
pub mod object;
pub mod server;
pub mod skiplist;
pub mod util;
pub mod zset;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{Server, VERSION};
