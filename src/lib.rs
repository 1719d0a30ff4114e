//! Coordination kernel over bounded channels.
//!
//! Layers, bottom up:
//! - [`transport`]: numbered bounded FIFO channels
//! - [`registry`]: hands out response channels and reclaims leaked ones
//! - [`rpc`]: request/response envelopes, client calls and actor loops
//! - [`database`]: the shared document behind a FIFO lock
//! - [`scheduler`]: job placement, crash detection and service supervision
//! - [`node`]: boots all of the above on one host

pub mod cluster;
pub mod config;
pub mod database;
pub mod error;
pub mod node;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod transport;

pub use error::{KernelError, Result};
