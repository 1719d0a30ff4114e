use std::sync::Arc;
use std::time::Duration;

use crate::config::ChannelConfig;
use crate::error::{KernelError, Result};
use crate::registry::{ChannelOwner, RegistryRequest, RegistryResponse, RegistryStatus};
use crate::rpc::{encode, RequestEnvelope, RpcClient};
use crate::transport::{Backoff, ChannelHub, ChannelId, Wait};

/// Per-process handle on the port registry.
#[derive(Debug, Clone)]
pub struct PortClient {
    hub: Arc<ChannelHub>,
    registry: ChannelId,
    feed: ChannelId,
    owner: ChannelOwner,
    backoff: Backoff,
    reserve_wait: Duration,
}

impl PortClient {
    pub fn new(
        hub: Arc<ChannelHub>,
        channels: &ChannelConfig,
        owner: ChannelOwner,
        backoff: Backoff,
        reserve_wait: Duration,
    ) -> Self {
        Self {
            hub,
            registry: channels.registry,
            feed: channels.port_feed,
            owner,
            backoff,
            reserve_wait,
        }
    }

    pub fn owner(&self) -> &ChannelOwner {
        &self.owner
    }

    /// Take a fresh channel id from the feed and record ownership of it.
    ///
    /// Anything left in the channel from a previous owner is discarded.
    pub async fn reserve(&self) -> Result<ChannelId> {
        let raw = self
            .hub
            .read(self.feed, Wait::For(self.reserve_wait))
            .await
            .ok_or(KernelError::NoFreeChannel)?;
        let channel: ChannelId = raw
            .trim()
            .parse()
            .map_err(|_| KernelError::InvalidResponse(format!("feed carried {raw:?}")))?;

        self.hub.drain(channel);
        self.notify(&RegistryRequest::Reserve {
            channel,
            owner: self.owner.clone(),
        })
        .await?;
        Ok(channel)
    }

    pub async fn release(&self, channel: ChannelId) {
        let request = RegistryRequest::Release {
            channel,
            owner: self.owner.clone(),
        };
        if let Err(e) = self.notify(&request).await {
            tracing::warn!(channel, error = %e, "Failed to release channel");
        }
    }

    pub async fn status(&self, wait: Wait) -> Result<RegistryStatus> {
        let rpc = RpcClient::new(self.hub.clone(), self.clone(), self.backoff.clone());
        match rpc.call(self.registry, &RegistryRequest::Status, wait).await? {
            RegistryResponse::Status { status } => Ok(status),
        }
    }

    async fn notify(&self, request: &RegistryRequest) -> Result<()> {
        let raw = encode(&RequestEnvelope::new(request, None))?;
        self.hub.write_blocking(self.registry, raw, &self.backoff).await;
        Ok(())
    }
}
