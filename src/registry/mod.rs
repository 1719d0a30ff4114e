//! Allocation of response channel numbers.
//!
//! The registry keeps a feed channel topped up with unused channel ids.
//! Clients pull an id from the feed and tell the registry who they are; when
//! done they release it. Ids are recycled, and ids held by processes that
//! no longer exist are reclaimed by a periodic sweep.

pub mod actor;
pub mod client;
pub mod state;

use serde::{Deserialize, Serialize};

use crate::cluster::Pid;
use crate::transport::ChannelId;

pub use actor::{RegistryActor, RegistryTimer};
pub use client::PortClient;
pub use state::{PortRegistry, ReleaseOutcome, ReserveOutcome};

/// The process a channel is reserved for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelOwner {
    pub hostname: String,
    pub pid: Pid,
}

impl ChannelOwner {
    pub fn new(hostname: impl Into<String>, pid: Pid) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub channel: ChannelId,
    pub owner: ChannelOwner,
}

/// Full allocator state, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub reserved: Vec<Reservation>,
    /// Released ids waiting to be handed out again
    pub free: Vec<ChannelId>,
    /// Ids sitting in the feed channel, not yet claimed
    pub in_feed: Vec<ChannelId>,
    /// First id that has never been minted
    pub high_water: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryRequest {
    Reserve {
        channel: ChannelId,
        owner: ChannelOwner,
    },
    Release {
        channel: ChannelId,
        owner: ChannelOwner,
    },
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryResponse {
    Status { status: RegistryStatus },
}
