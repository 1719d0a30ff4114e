//! Bounded, single-consumer FIFO channels identified by small integers.
//!
//! This is the only communication primitive the kernel relies on:
//! - **Non-blocking writes**: a full channel hands the message back to the caller
//! - **Blocking writes**: retried with exponential backoff until delivered
//! - **Reads**: wait up to a deadline, forever, or not at all
//! - **Drain**: take everything currently buffered without waiting
//!
//! # Components
//!
//! - [`ChannelHub`]: the set of channels shared by every actor and client
//! - [`Backoff`]: retry policy for [`ChannelHub::write_blocking`]
//! - [`Wait`]: how long a read may block

pub mod backoff;
pub mod channel;

pub use backoff::Backoff;
pub use channel::{ChannelHub, Wait};

/// Channel number. Well-known actors own fixed numbers, response channels
/// are minted by the port registry.
pub type ChannelId = u32;
