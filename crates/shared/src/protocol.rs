use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{AttachmentRef, Conversation, MessageId, UserId};

/// One emoji on one message and the users who applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub actor_ids: Vec<UserId>,
    #[serde(default)]
    pub count: u32,
}

impl Reaction {
    pub fn new(emoji: impl Into<String>, actor: UserId) -> Self {
        Self {
            emoji: emoji.into(),
            actor_ids: vec![actor],
            count: 1,
        }
    }

    pub fn has_actor(&self, actor: &UserId) -> bool {
        self.actor_ids.iter().any(|existing| existing == actor)
    }

    /// Drops repeated actors (first occurrence wins) and re-derives the count.
    fn normalized(mut self) -> Self {
        let mut seen = Vec::with_capacity(self.actor_ids.len());
        for actor in self.actor_ids.drain(..) {
            if !seen.contains(&actor) {
                seen.push(actor);
            }
        }
        self.count = seen.len() as u32;
        self.actor_ids = seen;
        self
    }
}

/// Stored shape of a message. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub author_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachment_refs: Vec<AttachmentRef>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
}

/// Immutable snapshot of a channel message, thread reply, or private chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation: Conversation,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachment_refs: Vec<AttachmentRef>,
    pub reactions: Vec<Reaction>,
    pub parent_message_id: Option<MessageId>,
}

impl Message {
    pub fn new(
        conversation: Conversation,
        author_id: UserId,
        content: impl Into<String>,
        attachment_refs: Vec<AttachmentRef>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation,
            author_id,
            content: content.into(),
            created_at: Utc::now(),
            attachment_refs,
            reactions: Vec::new(),
            parent_message_id: None,
        }
    }

    pub fn reply_to(mut self, parent: MessageId) -> Self {
        self.parent_message_id = Some(parent);
        self
    }

    pub fn from_record(id: MessageId, conversation: Conversation, record: MessageRecord) -> Self {
        let reactions = record
            .reactions
            .into_iter()
            .filter(|reaction| !reaction.emoji.is_empty())
            .map(Reaction::normalized)
            .collect();
        Self {
            id,
            conversation,
            author_id: record.author_id,
            content: record.content,
            created_at: record.created_at,
            attachment_refs: record.attachment_refs,
            reactions,
            parent_message_id: record.parent_message_id,
        }
    }

    /// Decodes raw document fields. Absent and `null` fields fall back to empty defaults;
    /// a present field of the wrong type is an error.
    pub fn decode(
        id: MessageId,
        conversation: Conversation,
        fields: &Map<String, Value>,
    ) -> Result<Self, serde_json::Error> {
        let present: Map<String, Value> = fields
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let record: MessageRecord = serde_json::from_value(Value::Object(present))?;
        Ok(Self::from_record(id, conversation, record))
    }

    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            author_id: self.author_id.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
            attachment_refs: self.attachment_refs.clone(),
            reactions: self.reactions.clone(),
            parent_message_id: self.parent_message_id.clone(),
        }
    }

    pub fn encode(&self) -> Value {
        serde_json::to_value(self.to_record()).unwrap_or(Value::Null)
    }

    pub fn reaction(&self, emoji: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|reaction| reaction.emoji == emoji)
    }
}

/// What an edit request does to a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditTransition {
    /// Replace the content.
    Update(String),
    /// Content cleared on a message without attachments: remove the message.
    DeleteEmpty,
    Unchanged,
}

impl EditTransition {
    pub fn classify(original: &Message, new_content: &str) -> Self {
        if new_content.trim().is_empty() && original.attachment_refs.is_empty() {
            return EditTransition::DeleteEmpty;
        }
        if new_content == original.content {
            return EditTransition::Unchanged;
        }
        EditTransition::Update(new_content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::ChannelId;

    fn channel() -> Conversation {
        Conversation::Channel(ChannelId::new("general"))
    }

    #[test]
    fn decode_defaults_missing_and_null_fields() {
        let fields = json!({
            "author_id": "u1",
            "content": "hi",
            "reactions": null,
        });
        let message = Message::decode(
            MessageId::new("m1"),
            channel(),
            fields.as_object().expect("object"),
        )
        .expect("decode");
        assert_eq!(message.content, "hi");
        assert!(message.reactions.is_empty());
        assert!(message.attachment_refs.is_empty());
        assert_eq!(message.created_at, DateTime::<Utc>::default());
    }

    #[test]
    fn decode_rejects_wrongly_typed_fields() {
        let fields = json!({ "content": 42 });
        assert!(Message::decode(
            MessageId::new("m1"),
            channel(),
            fields.as_object().expect("object")
        )
        .is_err());
    }

    #[test]
    fn decode_repairs_reaction_counts_and_duplicate_actors() {
        let fields = json!({
            "reactions": [
                { "emoji": "👍", "actor_ids": ["u1", "u2", "u1"], "count": 7 },
                { "actor_ids": ["u3"], "count": 1 },
            ],
        });
        let message = Message::decode(
            MessageId::new("m1"),
            channel(),
            fields.as_object().expect("object"),
        )
        .expect("decode");
        assert_eq!(
            message.reactions,
            vec![Reaction {
                emoji: "👍".into(),
                actor_ids: vec![UserId::new("u1"), UserId::new("u2")],
                count: 2,
            }]
        );
    }

    #[test]
    fn encode_then_decode_preserves_the_message() {
        let message = Message::new(channel(), UserId::new("u1"), "hello", Vec::new())
            .reply_to(MessageId::new("parent"));
        let encoded = message.encode();
        let decoded = Message::decode(
            message.id.clone(),
            channel(),
            encoded.as_object().expect("object"),
        )
        .expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn empty_edit_without_attachments_is_a_delete() {
        let message = Message::new(channel(), UserId::new("u1"), "hi", Vec::new());
        assert_eq!(EditTransition::classify(&message, "   "), EditTransition::DeleteEmpty);
        assert_eq!(EditTransition::classify(&message, "hi"), EditTransition::Unchanged);
        assert_eq!(
            EditTransition::classify(&message, "hello"),
            EditTransition::Update("hello".into())
        );
    }

    #[test]
    fn empty_edit_keeps_messages_with_attachments() {
        let message = Message::new(
            channel(),
            UserId::new("u1"),
            "see file",
            vec![AttachmentRef::new("files/a.png")],
        );
        assert_eq!(
            EditTransition::classify(&message, ""),
            EditTransition::Update(String::new())
        );
    }
}
