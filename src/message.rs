//! Message model and chat command parsing
//!
//! A `Message` is the single unit that travels over the wire, sits in the
//! history store and waits in the delayed queue. Text starting with a
//! command token is parsed into a `Command` by the session handler.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{duration_secs, Timestamp};

/// Author name used for server-generated notices
pub const SERVER_AUTHOR: &str = "server";

/// Reply to a `/delay` the server cannot honor
pub const DELAY_USAGE: &str = "Usage: /delay <seconds> <text>";

/// Separator used when a line does not carry one
pub const DEFAULT_SEPARATOR: &str = ": ";

/// A chat message
///
/// An empty `to_username` means broadcast. `send_after` is only
/// meaningful while the message waits in the delayed queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "datetime")]
    pub created_at: Timestamp,
    pub author: String,
    pub text: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub to_username: String,
    #[serde(default, with = "duration_secs")]
    pub send_after: Duration,
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

impl Message {
    /// Create a broadcast message stamped with the current time
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            created_at: Timestamp::now(),
            author: author.into(),
            text: text.into(),
            separator: default_separator(),
            to_username: String::new(),
            send_after: Duration::ZERO,
        }
    }

    /// Address this message to a single user
    pub fn to(mut self, username: impl Into<String>) -> Self {
        self.to_username = username.into();
        self
    }

    /// Schedule this message for delivery after `delay`
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.send_after = delay;
        self
    }

    /// Server notice addressed to one user
    pub fn notice(username: &str, text: impl Into<String>) -> Self {
        Self::new(SERVER_AUTHOR, text).to(username)
    }

    /// Server notice for every active user
    pub fn announcement(text: impl Into<String>) -> Self {
        Self::new(SERVER_AUTHOR, text)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_username.is_empty()
    }

    pub fn is_delayed(&self) -> bool {
        !self.send_after.is_zero()
    }

    /// Moment the message becomes eligible for delivery, `None` if it
    /// cannot be represented
    pub fn due_at(&self) -> Option<Timestamp> {
        self.created_at.after(self.send_after)
    }

    /// Whether `username` should see this message in a replay:
    /// broadcasts and private messages to them, never their own.
    pub fn is_visible_to(&self, username: &str) -> bool {
        self.author != username && (self.is_broadcast() || self.to_username == username)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.author, self.separator, self.text)
    }
}

/// Render a business error as a notice for the affected user
impl From<(&str, AppError)> for Message {
    fn from((username, err): (&str, AppError)) -> Self {
        let text = match &err {
            AppError::RecipientOffline(recipient) => {
                format!("User '{}' is not online", recipient)
            }
            AppError::MalformedMessage(reason) => format!("Invalid message: {}", reason),
            // Fatal errors are not typically converted (connection closes)
            _ => "Internal error".to_string(),
        };
        Message::notice(username, text)
    }
}

/// A chat line classified by its leading command token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Shut the whole server down
    Stop,
    /// Broadcast `text` after `delay`
    Delay { delay: Duration, text: String },
    /// Drop every message still waiting in the delayed queue
    ClearUnsent,
    /// Deliver `text` to `to` only
    Private { to: String, text: String },
    /// Close this session
    Quit,
    /// Ordinary broadcast
    Say(String),
    /// A known command with unusable arguments
    Usage(&'static str),
}

impl Command {
    /// Classify a line of chat text
    ///
    /// Tokens are checked in fixed order: `/stop`, `/delay`,
    /// `/clear_unsent`, `/private`, `/quit`; anything else is a broadcast.
    pub fn parse(text: &str) -> Self {
        let (token, rest) = match text.split_once(' ') {
            Some((token, rest)) => (token, rest),
            None => (text, ""),
        };

        match token {
            "/stop" => Command::Stop,
            "/delay" => {
                let usage = Command::Usage(DELAY_USAGE);
                let Some((secs, text)) = rest.split_once(' ') else {
                    return usage;
                };
                let delay = match secs.parse::<u64>() {
                    Ok(secs) if secs > 0 && !text.is_empty() => Duration::from_secs(secs),
                    _ => return usage,
                };
                // The due time has to exist on the calendar
                if Timestamp::now().after(delay).is_none() {
                    return usage;
                }
                Command::Delay {
                    delay,
                    text: text.to_string(),
                }
            }
            "/clear_unsent" => Command::ClearUnsent,
            "/private" => match rest.split_once(' ') {
                Some((to, text)) if !to.is_empty() && !text.is_empty() => Command::Private {
                    to: to.to_string(),
                    text: text.to_string(),
                },
                _ => Command::Usage("Usage: /private <username> <text>"),
            },
            "/quit" => Command::Quit,
            _ => Command::Say(text.to_string()),
        }
    }
}
