use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::registry::{ChannelOwner, RegistryStatus, Reservation};
use crate::transport::ChannelId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// Reserved again by its current owner
    AlreadyOwned,
    /// Held by someone else. The existing reservation stands.
    Conflict { recorded: ChannelOwner },
    /// Not a dynamic channel id
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotReserved,
    OwnerMismatch { recorded: ChannelOwner },
}

/// Bookkeeping for dynamic channel ids.
///
/// An id is in exactly one of: never minted (at or above `high_water`),
/// in the feed, reserved, or free for reuse.
#[derive(Debug)]
pub struct PortRegistry {
    first_dynamic: ChannelId,
    high_water: ChannelId,
    reserved: BTreeMap<ChannelId, ChannelOwner>,
    free: VecDeque<ChannelId>,
    in_feed: BTreeSet<ChannelId>,
}

impl PortRegistry {
    pub fn new(first_dynamic: ChannelId) -> Self {
        Self {
            first_dynamic,
            high_water: first_dynamic,
            reserved: BTreeMap::new(),
            free: VecDeque::new(),
            in_feed: BTreeSet::new(),
        }
    }

    /// Next id for the feed, preferring recycled ones.
    pub fn mint(&mut self) -> ChannelId {
        let id = self.free.pop_front().unwrap_or_else(|| {
            let id = self.high_water;
            self.high_water += 1;
            id
        });
        self.in_feed.insert(id);
        id
    }

    /// Undo a [`mint`](Self::mint) whose id could not be written to the feed.
    pub fn unmint(&mut self, id: ChannelId) {
        if self.in_feed.remove(&id) {
            self.free.push_front(id);
        }
    }

    pub fn reserve(&mut self, channel: ChannelId, owner: ChannelOwner) -> ReserveOutcome {
        if channel < self.first_dynamic || channel >= self.high_water {
            return ReserveOutcome::OutOfRange;
        }
        if let Some(recorded) = self.reserved.get(&channel) {
            return if *recorded == owner {
                ReserveOutcome::AlreadyOwned
            } else {
                ReserveOutcome::Conflict {
                    recorded: recorded.clone(),
                }
            };
        }
        self.in_feed.remove(&channel);
        self.free.retain(|id| *id != channel);
        self.reserved.insert(channel, owner);
        ReserveOutcome::Reserved
    }

    /// Release `channel` if and only if `owner` holds it.
    pub fn release(&mut self, channel: ChannelId, owner: &ChannelOwner) -> ReleaseOutcome {
        match self.reserved.get(&channel) {
            None => ReleaseOutcome::NotReserved,
            Some(recorded) if recorded != owner => ReleaseOutcome::OwnerMismatch {
                recorded: recorded.clone(),
            },
            Some(_) => {
                self.reserved.remove(&channel);
                self.free.push_back(channel);
                ReleaseOutcome::Released
            }
        }
    }

    /// Release every reservation whose owner is no longer alive.
    pub fn sweep(&mut self, is_alive: impl Fn(&ChannelOwner) -> bool) -> Vec<ChannelId> {
        let dead: Vec<ChannelId> = self
            .reserved
            .iter()
            .filter(|(_, owner)| !is_alive(owner))
            .map(|(channel, _)| *channel)
            .collect();
        for channel in &dead {
            self.reserved.remove(channel);
            self.free.push_back(*channel);
        }
        dead
    }

    pub fn owner(&self, channel: ChannelId) -> Option<&ChannelOwner> {
        self.reserved.get(&channel)
    }

    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            reserved: self
                .reserved
                .iter()
                .map(|(channel, owner)| Reservation {
                    channel: *channel,
                    owner: owner.clone(),
                })
                .collect(),
            free: self.free.iter().copied().collect(),
            in_feed: self.in_feed.iter().copied().collect(),
            high_water: self.high_water,
        }
    }
}
