//! The `Message` entity and its wire envelope (spec §3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ChannelId, ClientMsgId, MsgId, SeqId, TenantId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
    Image,
    System,
}

impl MessageType {
    /// System messages broadcast but do not move unread counters (spec §9
    /// open question, resolved in SPEC_FULL §12).
    pub fn counts_toward_unread(self) -> bool {
        !matches!(self, MessageType::System)
    }

    /// Empty content is only allowed alongside attachments for these types
    /// (spec §8 boundary case).
    pub fn allows_empty_content(self) -> bool {
        matches!(self, MessageType::File | MessageType::Image)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_key: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// The durable message row (spec §3). Owned exclusively by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub msg_id: MsgId,
    pub channel_id: ChannelId,
    pub tenant_id: TenantId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub parent_id: Option<MsgId>,
    pub seq_id: SeqId,
    pub client_msg_id: Option<ClientMsgId>,
    pub attachments: Vec<Attachment>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl Message {
    /// Projects the durable row into the wire envelope broadcast over the
    /// Bus/WebSocket (spec §6). A soft-deleted message projects with its
    /// content blanked.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            msg_id: self.msg_id,
            seq_id: self.seq_id,
            client_msg_id: self.client_msg_id,
            channel_id: self.channel_id,
            tenant_id: self.tenant_id,
            sender_id: self.sender_id,
            kind: self.kind,
            content: if self.is_deleted { String::new() } else { self.content.clone() },
            parent_id: self.parent_id,
            attachments: if self.attachments.is_empty() { None } else { Some(self.attachments.clone()) },
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

/// The canonical JSON shape delivered over Bus or socket (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub msg_id: MsgId,
    pub seq_id: SeqId,
    pub client_msg_id: Option<ClientMsgId>,
    pub channel_id: ChannelId,
    pub tenant_id: TenantId,
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub parent_id: Option<MsgId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_do_not_count_toward_unread() {
        assert!(!MessageType::System.counts_toward_unread());
        assert!(MessageType::Text.counts_toward_unread());
    }

    #[test]
    fn only_file_and_image_allow_empty_content() {
        assert!(MessageType::File.allows_empty_content());
        assert!(MessageType::Image.allows_empty_content());
        assert!(!MessageType::Text.allows_empty_content());
        assert!(!MessageType::System.allows_empty_content());
    }

    #[test]
    fn deleted_message_projects_with_blank_content() {
        let msg = Message {
            msg_id: MsgId::generate(),
            channel_id: ChannelId::new_v4(),
            tenant_id: TenantId::new_v4(),
            sender_id: UserId::new_v4(),
            content: "secret".into(),
            kind: MessageType::Text,
            parent_id: None,
            seq_id: SeqId(1),
            client_msg_id: None,
            attachments: vec![],
            metadata: None,
            created_at: Utc::now(),
            edited_at: None,
            is_deleted: true,
        };
        assert_eq!(msg.to_envelope().content, "");
    }
}
