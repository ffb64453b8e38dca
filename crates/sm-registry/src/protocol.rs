//! WebSocket wire protocol.
//!
//! Both directions exchange the same JSON envelope; `data` stays raw and is
//! decoded by the handler that owns the `message_type`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use sm_queue::operations::deserialize_message_data;
use sm_store::QueueMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_type: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn new(message_type: &str, data: Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            message_id: Uuid::new_v4().to_string(),
            data,
            correlation_id: None,
            reply_to: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Acknowledgment echoing the inbound message id.
    pub fn ack(echo_message_id: &str) -> Self {
        Self {
            message_type: "ack".to_string(),
            message_id: echo_message_id.to_string(),
            data: json!({"status": "received"}),
            correlation_id: None,
            reply_to: None,
            timestamp: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self::new("error", json!({"error": message}))
    }

    /// Wire form of an outbound queue row. The queue `message_id` rides on
    /// the envelope so acknowledgments can be matched back to the row.
    pub fn from_queue_message(msg: &QueueMessage) -> Self {
        Self {
            message_type: msg.message_type.clone(),
            message_id: msg.message_id.clone(),
            data: deserialize_message_data(msg),
            correlation_id: msg.correlation_id.clone(),
            reply_to: msg.reply_to.clone(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new("heartbeat", json!({"uptime": 42}));
        let text = env.to_json();
        let parsed: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.message_type, "heartbeat");
        assert_eq!(parsed.message_id, env.message_id);
        assert_eq!(parsed.data["uptime"], 42);
    }

    #[test]
    fn test_ack_shape() {
        let ack = Envelope::ack("msg-7");
        let text = ack.to_json();
        assert!(text.contains(r#""message_type":"ack""#));
        assert!(text.contains(r#""message_id":"msg-7""#));
        assert!(text.contains(r#""status":"received""#));
    }

    #[test]
    fn test_missing_optional_fields_tolerated() {
        let parsed: Envelope =
            serde_json::from_str(r#"{"message_type":"system_info"}"#).unwrap();
        assert_eq!(parsed.message_type, "system_info");
        assert!(parsed.message_id.is_empty());
        assert!(parsed.data.is_null());
        assert!(parsed.correlation_id.is_none());
    }
}
