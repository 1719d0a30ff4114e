use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::transport::ChannelId;

/// Opaque random id tying a response to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A request as written to an actor's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope<T> {
    pub id: RequestId,
    /// Where the caller waits for the reply. Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ChannelId>,
    pub body: T,
}

impl<T> RequestEnvelope<T> {
    pub fn new(body: T, reply_to: Option<ChannelId>) -> Self {
        Self {
            id: RequestId::new(),
            reply_to,
            body,
        }
    }
}

/// A response as written to a caller's response channel.
///
/// Unsolicited messages (deferred lock grants, job notifications) carry no
/// request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub body: T,
}

pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Ping {
        Ping { n: u32 },
        Quit,
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn notification_omits_reply_channel() {
        let raw = encode(&RequestEnvelope::new(Ping::Quit, None)).unwrap();
        assert!(!raw.contains("reply_to"));
        let back: RequestEnvelope<Ping> = decode(&raw).unwrap();
        assert_eq!(back.body, Ping::Quit);
        assert!(back.reply_to.is_none());
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let raw = r#"{"id":"6f1c3c1e-8d5e-4f59-9a63-2b8b1b1f4a10","body":{"type":"explode"}}"#;
        assert!(decode::<RequestEnvelope<Ping>>(raw).is_err());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode::<RequestEnvelope<Ping>>("not json").is_err());
    }
}
