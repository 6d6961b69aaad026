//! Reaction aggregation. Pure functions over immutable reaction lists; callers decide
//! where the result is written.
//!
//! Channel and thread messages use [`ReactionPolicy::AddOnce`]: a second click by the same
//! actor changes nothing. Private chats use [`ReactionPolicy::PrivatePair`]: a second click
//! removes the actor again, and an emoji both participants applied always counts exactly 2.

use shared::{
    domain::{ParticipantsError, PrivateChatId, UserId},
    protocol::Reaction,
};

/// What happens to a private-chat reaction whose last actor toggled it off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmptyReaction {
    #[default]
    Remove,
    /// Legacy behavior: the entry stays with an empty actor set and count 0.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionPolicy {
    AddOnce,
    PrivatePair {
        participants: (UserId, UserId),
        empty: EmptyReaction,
    },
}

impl ReactionPolicy {
    pub fn private(chat_id: &PrivateChatId, empty: EmptyReaction) -> Result<Self, ParticipantsError> {
        Ok(Self::PrivatePair {
            participants: chat_id.participants()?,
            empty,
        })
    }
}

pub fn apply(reactions: &[Reaction], emoji: &str, actor: &UserId, policy: &ReactionPolicy) -> Vec<Reaction> {
    match policy {
        ReactionPolicy::AddOnce => add_once(reactions, emoji, actor),
        ReactionPolicy::PrivatePair {
            participants,
            empty,
        } => toggle_private_pair(reactions, emoji, actor, participants, *empty),
    }
}

pub fn add_once(reactions: &[Reaction], emoji: &str, actor: &UserId) -> Vec<Reaction> {
    let mut next = reactions.to_vec();
    match next.iter_mut().find(|reaction| reaction.emoji == emoji) {
        Some(reaction) if reaction.has_actor(actor) => {}
        Some(reaction) => {
            reaction.actor_ids.push(actor.clone());
            reaction.count += 1;
        }
        None => next.push(Reaction::new(emoji, actor.clone())),
    }
    next
}

pub fn toggle_private_pair(
    reactions: &[Reaction],
    emoji: &str,
    actor: &UserId,
    participants: &(UserId, UserId),
    empty: EmptyReaction,
) -> Vec<Reaction> {
    let mut next = reactions.to_vec();
    let Some(index) = next.iter().position(|reaction| reaction.emoji == emoji) else {
        next.push(Reaction::new(emoji, actor.clone()));
        return next;
    };

    let reaction = &mut next[index];
    if reaction.has_actor(actor) {
        reaction.actor_ids.retain(|existing| existing != actor);
    } else {
        reaction.actor_ids.push(actor.clone());
    }
    reaction.count = pair_count(reaction, participants);

    if reaction.actor_ids.is_empty() && empty == EmptyReaction::Remove {
        next.remove(index);
    }
    next
}

/// Both participants present means exactly 2, whatever else the actor list holds.
fn pair_count(reaction: &Reaction, participants: &(UserId, UserId)) -> u32 {
    if participants.0 != participants.1
        && reaction.has_actor(&participants.0)
        && reaction.has_actor(&participants.1)
    {
        2
    } else {
        reaction.actor_ids.len() as u32
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
