//! Request/response messaging over bounded channels.
//!
//! Channels have no built-in correlation, so every request travels in an
//! envelope carrying a random [`RequestId`] and, when a reply is wanted, the
//! caller's response channel. Responses echo the id back.
//!
//! # Components
//!
//! - [`RpcClient`]: reserves a response channel, sends, waits with a timeout
//! - [`Server`]: drives an [`Actor`] from its well-known request channel,
//!   interleaving periodic timers and yielding on a bounded time slice
//! - [`Responder`]: writes replies, including deferred ones sent long after
//!   the original request was answered

pub mod client;
pub mod message;
pub mod server;

pub use client::RpcClient;
pub use message::{decode, encode, RequestEnvelope, RequestId, ResponseEnvelope};
pub use server::{Actor, Responder, Server};
