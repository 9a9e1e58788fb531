//! Wire protocol for `/ws/v1` (spec §4.6, §6): every frame is JSON with a
//! top-level `event` field naming its type, matching the envelope
//! convention already used for the HTTP surface.

use chat_core::ids::{ChannelId, ClientMsgId, MsgId, SeqId};
use chat_core::message::{Attachment, Envelope, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Hello {
        token: String,
        device_info: Option<Value>,
        #[serde(default)]
        last_seen_seq_by_channel: std::collections::HashMap<ChannelId, SeqId>,
    },
    Publish {
        channel_id: ChannelId,
        client_msg_id: Option<ClientMsgId>,
        content: String,
        #[serde(rename = "type")]
        kind: MessageType,
        parent_id: Option<MsgId>,
        #[serde(default)]
        attachments: Vec<Attachment>,
        metadata: Option<Value>,
    },
    Ack {
        msg_id: MsgId,
        kind: AckKind,
    },
    Ping {
        ts: i64,
    },
    Subscribe {
        channel_id: ChannelId,
    },
    Unsubscribe {
        channel_id: ChannelId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome {
        user_id: chat_core::ids::UserId,
        server_time: i64,
        session_id: Uuid,
    },
    Message {
        #[serde(flatten)]
        envelope: Envelope,
    },
    MessageUpdate {
        #[serde(flatten)]
        envelope: Envelope,
    },
    MessageDelete {
        msg_id: MsgId,
        channel_id: ChannelId,
    },
    AckResult {
        client_msg_id: Option<ClientMsgId>,
        msg_id: MsgId,
        seq_id: SeqId,
        status: &'static str,
    },
    Pong {
        ts: i64,
        server_time: i64,
    },
    SessionKicked,
    SessionExpired,
    SessionTimeout,
    ResyncBatch {
        channel_id: ChannelId,
        messages: Vec<Envelope>,
        has_more: bool,
    },
    /// SPEC_FULL §11 "Read-receipt fan-out": additive UX, not in spec.md's
    /// frame list.
    ReadReceipt {
        user_id: chat_core::ids::UserId,
        channel_id: ChannelId,
        seq_id: SeqId,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            "{\"event\":\"error\",\"code\":\"internal\",\"message\":\"serialization failed\"}".to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_parses_with_optional_fields_omitted() {
        let json = r#"{"event":"hello","token":"abc"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Hello { token, last_seen_seq_by_channel, .. } => {
                assert_eq!(token, "abc");
                assert!(last_seen_seq_by_channel.is_empty());
            }
            _ => panic!("expected hello"),
        }
    }

    #[test]
    fn publish_frame_round_trips_required_fields() {
        let json = r#"{"event":"publish","channelId":"3fa85f64-5717-4562-b3fc-2c963f66afa6","content":"hi","type":"text"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, ClientFrame::Publish { .. }));
    }

    #[test]
    fn server_frame_tags_event_name() {
        let frame = ServerFrame::Pong { ts: 1, server_time: 2 };
        let json = frame.to_json();
        assert!(json.contains("\"event\":\"pong\""));
    }
}
