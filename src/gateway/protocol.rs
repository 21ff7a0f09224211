// =============================================================================
// Gateway wire protocol -- JSON messages over the WebSocket
// =============================================================================
//
// Client -> gateway:
//   { "action": "subscribe", "channels": ["market:tick:*"], "requestId": "1" }
//   { "action": "unsubscribe", "channels": [...], "requestId": "2" }
//   { "action": "ping", "requestId": "3" }
//
// Gateway -> client: connected | subscribed | unsubscribed | data | pong |
// error, tagged by "type". Timestamps are RFC 3339 UTC; `seq` is per
// connection, starting at 1.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Forbidden,
    Backpressure,
    RateLimit,
    InvalidSubscription,
    Idle,
}

/// Per-channel rejection inside a `subscribed` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelError {
    pub channel: String,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        session_id: String,
        server_time: String,
    },
    #[serde(rename_all = "camelCase")]
    Subscribed {
        channels: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<ChannelError>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribed {
        channels: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Data {
        seq: u64,
        channel: String,
        data: Value,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}
