use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::rpc::message::{decode, encode, RequestEnvelope, RequestId, ResponseEnvelope};
use crate::transport::{Backoff, ChannelHub, ChannelId, Wait};

/// A long-running, logically sequential message handler.
///
/// Handlers and timers never run concurrently within one actor, so actors
/// need no internal locking.
#[async_trait]
pub trait Actor: Send + 'static {
    type Request: DeserializeOwned + fmt::Debug + Send;
    type Response: Serialize + Send + Sync;
    type Timer: Copy + fmt::Debug + Send + Sync;

    fn name(&self) -> &'static str;

    /// Periodic timers and their intervals, read once at startup.
    fn timers(&self) -> Vec<(Self::Timer, Duration)>;

    /// Runs at the top of every loop iteration, before any message.
    async fn before_batch(&mut self) {}

    /// Handle one request. A returned response is sent to the request's
    /// `reply_to` channel, if it has one.
    async fn handle(&mut self, request: RequestEnvelope<Self::Request>) -> Option<Self::Response>;

    async fn on_timer(&mut self, timer: Self::Timer);
}

/// Writes responses to callers' channels.
#[derive(Debug, Clone)]
pub struct Responder {
    hub: Arc<ChannelHub>,
    backoff: Backoff,
}

impl Responder {
    pub fn new(hub: Arc<ChannelHub>, backoff: Backoff) -> Self {
        Self { hub, backoff }
    }

    pub async fn respond<T: Serialize>(
        &self,
        channel: ChannelId,
        request_id: Option<RequestId>,
        body: &T,
    ) {
        match encode(&ResponseEnvelope { request_id, body }) {
            Ok(raw) => self.hub.write_blocking(channel, raw, &self.backoff).await,
            Err(e) => tracing::error!(channel, error = %e, "Failed to encode response"),
        }
    }
}

struct TimerSlot<T> {
    timer: T,
    every: Duration,
    next: Instant,
}

/// Server loop driving one [`Actor`] from its request channel.
pub struct Server<A: Actor> {
    hub: Arc<ChannelHub>,
    channel: ChannelId,
    actor: A,
    responder: Responder,
    time_slice: Duration,
    shutdown: CancellationToken,
}

impl<A: Actor> Server<A> {
    pub fn new(
        hub: Arc<ChannelHub>,
        channel: ChannelId,
        actor: A,
        responder: Responder,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            channel,
            actor,
            responder,
            time_slice: Duration::from_millis(50),
            shutdown,
        }
    }

    pub fn with_time_slice(mut self, time_slice: Duration) -> Self {
        self.time_slice = time_slice;
        self
    }

    /// Run until the shutdown token is cancelled, then hand the actor back.
    ///
    /// Each iteration drains every buffered request and handles them in
    /// arrival order. With nothing buffered it blocks on one read, bounded by
    /// the next timer deadline. Due timers fire between messages, and the
    /// loop yields to the runtime whenever a time slice is used up.
    pub async fn run(mut self) -> A {
        let name = self.actor.name();
        let started = Instant::now();
        let mut timers: Vec<TimerSlot<A::Timer>> = self
            .actor
            .timers()
            .into_iter()
            .map(|(timer, every)| TimerSlot {
                timer,
                every,
                next: started + every,
            })
            .collect();

        tracing::info!(actor = name, channel = self.channel, "Actor started");

        let mut slice_start = Instant::now();
        while !self.shutdown.is_cancelled() {
            self.actor.before_batch().await;
            self.fire_due(&mut timers).await;

            let mut batch = self.hub.drain(self.channel);
            if batch.is_empty() {
                let wait = timers
                    .iter()
                    .map(|slot| slot.next)
                    .min()
                    .map(Wait::until)
                    .unwrap_or(Wait::Forever);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    message = self.hub.read(self.channel, wait) => batch.extend(message),
                }
            }

            for raw in batch {
                self.dispatch(&raw).await;
                self.fire_due(&mut timers).await;
                if slice_start.elapsed() >= self.time_slice {
                    tokio::task::yield_now().await;
                    slice_start = Instant::now();
                }
            }

            tokio::task::yield_now().await;
            slice_start = Instant::now();
        }

        tracing::info!(actor = name, "Actor stopped");
        self.actor
    }

    async fn fire_due(&mut self, timers: &mut [TimerSlot<A::Timer>]) {
        for slot in timers.iter_mut() {
            if Instant::now() >= slot.next {
                tracing::trace!(actor = self.actor.name(), timer = ?slot.timer, "Timer fired");
                self.actor.on_timer(slot.timer).await;
                slot.next = Instant::now() + slot.every;
            }
        }
    }

    async fn dispatch(&mut self, raw: &str) {
        let request: RequestEnvelope<A::Request> = match decode(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    actor = self.actor.name(),
                    error = %e,
                    "Dropping malformed request"
                );
                return;
            }
        };

        let id = request.id;
        let reply_to = request.reply_to;
        tracing::trace!(actor = self.actor.name(), request_id = %id, body = ?request.body, "Handling request");

        if let Some(response) = self.actor.handle(request).await {
            match reply_to {
                Some(channel) => self.responder.respond(channel, Some(id), &response).await,
                None => {
                    tracing::debug!(actor = self.actor.name(), request_id = %id, "No reply channel, response dropped")
                }
            }
        }
    }
}
