use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(AttachmentRef);
id_newtype!(PrivateChatId);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

pub const PRIVATE_CHAT_SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantsError {
    #[error("user id {0:?} contains the private chat separator")]
    SeparatorInUserId(String),
    #[error("user id must not be empty")]
    EmptyUserId,
    #[error("private chat id {0:?} does not name exactly two participants")]
    Malformed(String),
}

impl PrivateChatId {
    /// Both participants compute the same id regardless of argument order.
    pub fn for_participants(a: &UserId, b: &UserId) -> Result<Self, ParticipantsError> {
        for user in [a, b] {
            if user.0.is_empty() {
                return Err(ParticipantsError::EmptyUserId);
            }
            if user.0.contains(PRIVATE_CHAT_SEPARATOR) {
                return Err(ParticipantsError::SeparatorInUserId(user.0.clone()));
            }
        }
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{first}{PRIVATE_CHAT_SEPARATOR}{second}")))
    }

    pub fn participants(&self) -> Result<(UserId, UserId), ParticipantsError> {
        let mut parts = self.0.split(PRIVATE_CHAT_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(first), Some(second), None) if !first.is_empty() && !second.is_empty() => {
                Ok((UserId::new(first), UserId::new(second)))
            }
            _ => Err(ParticipantsError::Malformed(self.0.clone())),
        }
    }

    /// Owner documents that hold a copy of this chat. A self-chat has a single owner.
    pub fn owners(&self) -> Result<Vec<UserId>, ParticipantsError> {
        let (first, second) = self.participants()?;
        if first == second {
            Ok(vec![first])
        } else {
            Ok(vec![first, second])
        }
    }

    pub fn peer_of(&self, user: &UserId) -> Result<Option<UserId>, ParticipantsError> {
        let (first, second) = self.participants()?;
        Ok(if &first == user {
            Some(second)
        } else if &second == user {
            Some(first)
        } else {
            None
        })
    }
}

/// Addressable scope for a set of messages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Conversation {
    Channel(ChannelId),
    Private(PrivateChatId),
}

impl Conversation {
    pub fn id(&self) -> &str {
        match self {
            Conversation::Channel(id) => id.as_str(),
            Conversation::Private(id) => id.as_str(),
        }
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conversation::Channel(id) => write!(f, "channel:{id}"),
            Conversation::Private(id) => write!(f, "private:{id}"),
        }
    }
}
