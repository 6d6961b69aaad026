//! Document store paths for channels, threads, and private chat copies.

use crate::domain::{ChannelId, MessageId, PrivateChatId, UserId};

pub const PRIVATE_MESSAGES_FIELD: &str = "messages";
pub const FIELD_SEPARATOR: char = '.';

pub fn channel_messages(channel_id: &ChannelId) -> String {
    format!("channels/{channel_id}/messages")
}

pub fn channel_message(channel_id: &ChannelId, message_id: &MessageId) -> String {
    format!("channels/{channel_id}/messages/{message_id}")
}

pub fn thread_replies(channel_id: &ChannelId, parent_id: &MessageId) -> String {
    format!("channels/{channel_id}/messages/{parent_id}/threads")
}

pub fn thread_reply(channel_id: &ChannelId, parent_id: &MessageId, reply_id: &MessageId) -> String {
    format!("channels/{channel_id}/messages/{parent_id}/threads/{reply_id}")
}

pub fn private_chat(owner: &UserId, chat_id: &PrivateChatId) -> String {
    format!("users/{owner}/privateChats/{chat_id}")
}

/// Dotted field path of one message inside a private chat document.
pub fn private_message_field(message_id: &MessageId) -> String {
    format!("{PRIVATE_MESSAGES_FIELD}{FIELD_SEPARATOR}{message_id}")
}

/// Whether `key` addresses exactly one level of a dotted field path.
pub fn is_field_segment(key: &str) -> bool {
    !key.is_empty() && !key.contains(FIELD_SEPARATOR)
}

/// Splits `a/b/c` into (`a/b`, `c`).
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}
