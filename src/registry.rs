//! Client registry
//!
//! Maps each username to its presence: either the outbound channel of the
//! session that currently owns the name, or the time the user was last seen.
//! Entries are never removed, so a returning user can be replayed what they
//! missed.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::Message;
use crate::types::{SessionId, Timestamp};

/// Outbound channel of a connected session
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Connection that owns the username
    pub session_id: SessionId,
    /// Server → Client message channel
    pub sender: mpsc::Sender<Message>,
}

impl ActiveSession {
    /// Queue a message for this session without waiting
    ///
    /// Fails if the client disconnected or stopped reading and its buffer
    /// is full; the message is dropped in both cases.
    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::ChannelFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

/// Presence of a known username
#[derive(Debug, Clone)]
pub enum Presence {
    Active(ActiveSession),
    LastSeen(Timestamp),
}

/// Result of registering a username
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Username never seen before
    FirstJoin,
    /// Returning user, offline since the given time
    Reconnect(Timestamp),
    /// Username was already active; the new session replaced the old one
    Displaced(SessionId),
}

/// Username → presence table
#[derive(Debug, Default)]
pub struct ClientRegistry {
    entries: HashMap<String, Presence>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `username` active on `session`
    ///
    /// A second login for an active name wins silently; the displaced
    /// session is not notified.
    pub fn on_join(
        &mut self,
        username: &str,
        session_id: SessionId,
        sender: mpsc::Sender<Message>,
    ) -> JoinOutcome {
        let active = Presence::Active(ActiveSession { session_id, sender });
        match self.entries.insert(username.to_string(), active) {
            None => JoinOutcome::FirstJoin,
            Some(Presence::LastSeen(at)) => JoinOutcome::Reconnect(at),
            Some(Presence::Active(old)) => JoinOutcome::Displaced(old.session_id),
        }
    }

    /// Mark `username` offline as of `now`
    ///
    /// Only the session that owns the active entry can do this. Returns
    /// whether the entry changed.
    pub fn on_leave(&mut self, username: &str, session_id: SessionId, now: Timestamp) -> bool {
        let Some(Presence::Active(session)) = self.entries.get(username) else {
            return false;
        };
        if session.session_id != session_id {
            return false;
        }
        self.entries
            .insert(username.to_string(), Presence::LastSeen(now));
        true
    }

    /// Every active session except `exclude`'s
    pub fn broadcast_targets<'a>(
        &'a self,
        exclude: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ActiveSession)> + 'a {
        self.entries
            .iter()
            .filter(move |(name, _)| name.as_str() != exclude)
            .filter_map(|(name, presence)| match presence {
                Presence::Active(session) => Some((name.as_str(), session)),
                Presence::LastSeen(_) => None,
            })
    }

    /// Active session of `username`, if connected
    pub fn lookup_active(&self, username: &str) -> Option<&ActiveSession> {
        match self.entries.get(username) {
            Some(Presence::Active(session)) => Some(session),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn presence(&self, username: &str) -> Option<&Presence> {
        self.entries.get(username)
    }

    /// Number of connected users
    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|p| matches!(p, Presence::Active(_)))
            .count()
    }

    /// Number of known usernames, connected or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
