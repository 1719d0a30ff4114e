use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::ProcessTable;
use crate::registry::{
    PortRegistry, RegistryRequest, RegistryResponse, ReleaseOutcome, ReserveOutcome,
};
use crate::rpc::{Actor, RequestEnvelope};
use crate::transport::{ChannelHub, ChannelId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryTimer {
    /// Reclaim channels whose owners died
    Sweep,
}

/// Serves reserve/release/status and keeps the feed channel topped up.
pub struct RegistryActor {
    registry: PortRegistry,
    hub: Arc<ChannelHub>,
    feed: ChannelId,
    feed_size: usize,
    processes: Arc<dyn ProcessTable>,
    sweep_every: Duration,
}

impl RegistryActor {
    pub fn new(
        hub: Arc<ChannelHub>,
        first_dynamic: ChannelId,
        feed: ChannelId,
        feed_size: usize,
        processes: Arc<dyn ProcessTable>,
        sweep_every: Duration,
    ) -> Self {
        Self {
            registry: PortRegistry::new(first_dynamic),
            hub,
            feed,
            feed_size: feed_size.max(1),
            processes,
            sweep_every,
        }
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    fn top_up_feed(&mut self) {
        while self.hub.len(self.feed) < self.feed_size {
            let id = self.registry.mint();
            if self.hub.try_write(self.feed, id.to_string()).is_some() {
                self.registry.unmint(id);
                break;
            }
        }
    }

    fn sweep(&mut self) {
        let processes = self.processes.clone();
        let reclaimed = self
            .registry
            .sweep(|owner| processes.pid_alive(&owner.hostname, owner.pid));
        for channel in &reclaimed {
            self.hub.drain(*channel);
        }
        if !reclaimed.is_empty() {
            tracing::warn!(channels = ?reclaimed, "Reclaimed channels from dead processes");
        }
    }
}

#[async_trait]
impl Actor for RegistryActor {
    type Request = RegistryRequest;
    type Response = RegistryResponse;
    type Timer = RegistryTimer;

    fn name(&self) -> &'static str {
        "registry"
    }

    fn timers(&self) -> Vec<(RegistryTimer, Duration)> {
        vec![(RegistryTimer::Sweep, self.sweep_every)]
    }

    async fn before_batch(&mut self) {
        self.top_up_feed();
    }

    async fn handle(&mut self, request: RequestEnvelope<RegistryRequest>) -> Option<RegistryResponse> {
        match request.body {
            RegistryRequest::Reserve { channel, owner } => {
                match self.registry.reserve(channel, owner.clone()) {
                    ReserveOutcome::Reserved => {
                        tracing::trace!(channel, host = %owner.hostname, pid = owner.pid, "Channel reserved");
                    }
                    ReserveOutcome::AlreadyOwned => {}
                    ReserveOutcome::Conflict { recorded } => {
                        tracing::warn!(
                            channel,
                            host = %owner.hostname,
                            pid = owner.pid,
                            owner_host = %recorded.hostname,
                            owner_pid = recorded.pid,
                            "Reserve of a channel held by another process"
                        );
                    }
                    ReserveOutcome::OutOfRange => {
                        tracing::warn!(channel, "Reserve of a channel the registry never issued");
                    }
                }
                None
            }
            RegistryRequest::Release { channel, owner } => {
                match self.registry.release(channel, &owner) {
                    ReleaseOutcome::Released => {
                        self.hub.drain(channel);
                        tracing::trace!(channel, "Channel released");
                    }
                    ReleaseOutcome::NotReserved => {
                        tracing::warn!(channel, host = %owner.hostname, pid = owner.pid, "Release of an unreserved channel");
                    }
                    ReleaseOutcome::OwnerMismatch { recorded } => {
                        tracing::warn!(
                            channel,
                            host = %owner.hostname,
                            pid = owner.pid,
                            owner_host = %recorded.hostname,
                            owner_pid = recorded.pid,
                            "Release refused, caller does not own the channel"
                        );
                    }
                }
                None
            }
            RegistryRequest::Status => Some(RegistryResponse::Status {
                status: self.registry.status(),
            }),
        }
    }

    async fn on_timer(&mut self, timer: RegistryTimer) {
        match timer {
            RegistryTimer::Sweep => self.sweep(),
        }
    }
}
