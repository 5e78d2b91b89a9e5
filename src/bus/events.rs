use serde::{Deserialize, Serialize};

/// An attachment carried by an inbound or outbound message. Base64
/// `data` is present only on the most recent inbound user record and
/// is never written to persisted session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub media_attachments: Vec<MediaAttachment>,
    pub received_at_ms: i64,
}

impl InboundMessage {
    /// The isolation unit for sessions, cron jobs, and turn locks.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    pub fn is_background(&self) -> bool {
        self.channel == "system" && self.sender_id.starts_with("cron:")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media_attachments: Vec<MediaAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_joins_channel_and_chat() {
        let msg = InboundMessage {
            channel: "cli".into(),
            chat_id: "u1".into(),
            sender_id: "u1".into(),
            content: "hi".into(),
            media_attachments: vec![],
            received_at_ms: 0,
        };
        assert_eq!(msg.session_key(), "cli:u1");
    }

    #[test]
    fn background_detection_requires_both_markers() {
        let mut msg = InboundMessage {
            channel: "system".into(),
            chat_id: "c1".into(),
            sender_id: "cron:job-1".into(),
            content: String::new(),
            media_attachments: vec![],
            received_at_ms: 0,
        };
        assert!(msg.is_background());
        msg.sender_id = "user-1".into();
        assert!(!msg.is_background());
    }
}
