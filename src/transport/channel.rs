use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::transport::{Backoff, ChannelId};

/// How long a read may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately when the channel is empty
    Immediate,
    /// Block for at most this long
    For(Duration),
    /// Block until a message arrives
    Forever,
}

impl Wait {
    /// `None` means no deadline.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(duration) => Wait::For(duration),
            None => Wait::Forever,
        }
    }

    pub fn until(deadline: Instant) -> Self {
        Wait::For(deadline.saturating_duration_since(Instant::now()))
    }

    fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Immediate => Some(Instant::now()),
            Wait::For(duration) => Some(Instant::now() + duration),
            Wait::Forever => None,
        }
    }
}

#[derive(Debug, Default)]
struct Port {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl Port {
    fn pop(&self) -> Option<String> {
        self.queue.lock().pop_front()
    }
}

/// Every channel in the system, created lazily on first use.
///
/// Channels carry serialized messages and are bounded: a write into a full
/// channel is rejected rather than evicting older messages. Each channel is
/// expected to have exactly one reader.
#[derive(Debug)]
pub struct ChannelHub {
    ports: Mutex<HashMap<ChannelId, Arc<Port>>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn port(&self, channel: ChannelId) -> Arc<Port> {
        self.ports.lock().entry(channel).or_default().clone()
    }

    /// Non-blocking write. Returns the message back if the channel is full.
    pub fn try_write(&self, channel: ChannelId, message: String) -> Option<String> {
        let port = self.port(channel);
        {
            let mut queue = port.queue.lock();
            if queue.len() >= self.capacity {
                return Some(message);
            }
            queue.push_back(message);
        }
        port.notify.notify_one();
        None
    }

    /// Write, retrying with backoff until the channel accepts the message.
    pub async fn write_blocking(&self, channel: ChannelId, message: String, backoff: &Backoff) {
        let mut message = message;
        let mut attempt = 0u32;
        while let Some(rejected) = self.try_write(channel, message) {
            message = rejected;
            attempt = attempt.saturating_add(1);
            if backoff.should_report(attempt) {
                tracing::error!(channel, attempt, "Channel still full, retrying write");
            }
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
        if attempt > 0 {
            tracing::trace!(channel, attempt, "Delivered after retries");
        }
    }

    /// Read one message, blocking according to `wait`.
    ///
    /// Always yields to the runtime once before returning.
    pub async fn read(&self, channel: ChannelId, wait: Wait) -> Option<String> {
        let port = self.port(channel);
        let deadline = wait.deadline();

        let message = loop {
            let notified = port.notify.notified();
            if let Some(message) = port.pop() {
                break Some(message);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        break port.pop();
                    }
                }
                None => notified.await,
            }
        };

        tokio::task::yield_now().await;
        message
    }

    /// Remove and return everything currently buffered.
    pub fn drain(&self, channel: ChannelId) -> Vec<String> {
        self.port(channel).queue.lock().drain(..).collect()
    }

    pub fn len(&self, channel: ChannelId) -> usize {
        self.port(channel).queue.lock().len()
    }

    pub fn is_empty(&self, channel: ChannelId) -> bool {
        self.len(channel) == 0
    }

    pub fn is_full(&self, channel: ChannelId) -> bool {
        self.len(channel) >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;

    #[test]
    fn try_write_rejects_when_full() {
        let hub = ChannelHub::new(2);
        assert!(hub.try_write(7, "a".into()).is_none());
        assert!(hub.try_write(7, "b".into()).is_none());
        assert_eq!(hub.try_write(7, "c".into()), Some("c".to_string()));
        assert!(hub.is_full(7));
        assert_eq!(hub.drain(7), vec!["a".to_string(), "b".to_string()]);
        assert!(hub.is_empty(7));
    }

    #[test]
    fn channels_are_independent() {
        let hub = ChannelHub::new(1);
        assert!(hub.try_write(1, "x".into()).is_none());
        assert!(hub.try_write(2, "y".into()).is_none());
        assert_eq!(hub.len(1), 1);
        assert_eq!(hub.len(2), 1);
    }

    #[tokio::test]
    async fn read_is_fifo() {
        let hub = ChannelHub::new(10);
        for i in 0..5 {
            hub.try_write(3, i.to_string());
        }
        for i in 0..5 {
            assert_eq!(hub.read(3, Wait::Immediate).await, Some(i.to_string()));
        }
        assert_eq!(hub.read(3, Wait::Immediate).await, None);
    }

    #[tokio::test]
    async fn read_times_out_on_empty_channel() {
        let hub = ChannelHub::new(10);
        let start = Instant::now();
        let got = hub.read(9, Wait::For(Duration::from_millis(30))).await;
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn read_wakes_on_write() {
        let hub = Arc::new(ChannelHub::new(10));
        let reader = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.read(4, Wait::Forever).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.try_write(4, "hello".into());
        assert_eq!(reader.await.unwrap(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn write_blocking_waits_for_room() {
        let hub = Arc::new(ChannelHub::new(1));
        hub.try_write(5, "first".into());

        let writer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let backoff = Backoff::from_config(&BackoffConfig {
                    base_ms: 1,
                    jitter_ms: 0,
                    ..BackoffConfig::default()
                });
                hub.write_blocking(5, "second".into(), &backoff).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.read(5, Wait::Immediate).await, Some("first".to_string()));
        writer.await.unwrap();
        assert_eq!(
            hub.read(5, Wait::For(Duration::from_millis(100))).await,
            Some("second".to_string())
        );
    }
}
