//! Per-thread request-scheduling engine for a clustered key-value reverse proxy.
//!
//! This crate is the core described in the proxy's design: protocol parsing, slot/key
//! routing, the multiplexed send/receive scheduler, the private-connection escape hatch, and
//! the event-driven per-worker I/O loop. Everything that sits outside that core (CLI parsing,
//! process-level logging init, daemonization) lives in the `clusterproxy` binary crate and
//! calls into this one through [`cluster`], [`listener`] and [`scheduler`].

pub mod buffer;
pub mod client;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod pool;
pub mod private;
pub mod protocol;
pub mod reply;
pub mod request;
pub mod routing;
pub mod scheduler;
pub mod slotmap;
pub mod upstream;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use slotmap::SlotMap;
