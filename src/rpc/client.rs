use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{KernelError, Result};
use crate::registry::PortClient;
use crate::rpc::message::{decode, encode, RequestEnvelope, RequestId, ResponseEnvelope};
use crate::transport::{Backoff, ChannelHub, ChannelId, Wait};

/// Client side of the request/response protocol.
#[derive(Debug, Clone)]
pub struct RpcClient {
    hub: Arc<ChannelHub>,
    ports: PortClient,
    backoff: Backoff,
}

impl RpcClient {
    pub fn new(hub: Arc<ChannelHub>, ports: PortClient, backoff: Backoff) -> Self {
        Self {
            hub,
            ports,
            backoff,
        }
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    pub fn ports(&self) -> &PortClient {
        &self.ports
    }

    /// Fire-and-forget notification. No response channel is reserved.
    pub async fn send<Req: Serialize>(&self, target: ChannelId, body: &Req) -> Result<RequestId> {
        self.write_request(target, body, None).await
    }

    /// Reserve a response channel, send, wait for the matching reply, and
    /// release the channel again whether or not a reply arrived.
    pub async fn call<Req, Resp>(&self, target: ChannelId, body: &Req, wait: Wait) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let reply_to = self.ports.reserve().await?;
        let result = self.call_on(target, reply_to, body, wait).await;
        self.ports.release(reply_to).await;
        result
    }

    /// Like [`call`](Self::call) but on a response channel the caller
    /// already holds.
    pub async fn call_on<Req, Resp>(
        &self,
        target: ChannelId,
        reply_to: ChannelId,
        body: &Req,
        wait: Wait,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let id = self.write_request(target, body, Some(reply_to)).await?;
        self.receive(reply_to, wait, |envelope: &ResponseEnvelope<Resp>| {
            envelope.request_id == Some(id)
        })
        .await
    }

    /// Wait on `channel` for a response accepted by `accept`.
    ///
    /// Responses that decode but are not accepted are stale leftovers from
    /// an earlier call and are skipped. Anything that does not decode as
    /// `Resp` is an [`KernelError::InvalidResponse`].
    pub async fn receive<Resp, F>(&self, channel: ChannelId, wait: Wait, accept: F) -> Result<Resp>
    where
        Resp: DeserializeOwned,
        F: Fn(&ResponseEnvelope<Resp>) -> bool,
    {
        let deadline = match wait {
            Wait::For(duration) => Some(Instant::now() + duration),
            Wait::Immediate => Some(Instant::now()),
            Wait::Forever => None,
        };

        loop {
            let wait = match deadline {
                Some(deadline) => Wait::until(deadline),
                None => Wait::Forever,
            };
            let Some(raw) = self.hub.read(channel, wait).await else {
                return Err(KernelError::Timeout(channel));
            };

            let envelope: ResponseEnvelope<Resp> = decode(&raw).map_err(|e| {
                tracing::warn!(channel, error = %e, "Response matched no expected type");
                KernelError::InvalidResponse(e.to_string())
            })?;

            if accept(&envelope) {
                return Ok(envelope.body);
            }
            tracing::debug!(
                channel,
                request_id = ?envelope.request_id,
                "Discarding stale response"
            );
        }
    }

    async fn write_request<Req: Serialize>(
        &self,
        target: ChannelId,
        body: &Req,
        reply_to: Option<ChannelId>,
    ) -> Result<RequestId> {
        let envelope = RequestEnvelope::new(body, reply_to);
        let id = envelope.id;
        let raw = encode(&envelope)?;
        self.hub.write_blocking(target, raw, &self.backoff).await;
        Ok(id)
    }
}
