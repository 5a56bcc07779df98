//! Startup message generator
//!
//! Fills an empty chat with a few canned lines so a first visitor has
//! some history to look at.

use rand::seq::SliceRandom;

use crate::message::{Message, SERVER_AUTHOR};

const PHRASES: &[&str] = &[
    "Welcome! Say hi to everyone.",
    "Use /private <user> <text> to whisper.",
    "Use /delay <seconds> <text> to send a message later.",
    "Changed your mind? /clear_unsent drops pending delayed messages.",
    "History is kept for an hour after a restart.",
    "Be nice to each other.",
];

/// Generate `count` broadcast messages authored by the server
pub fn generate(count: usize) -> Vec<Message> {
    let mut rng = rand::thread_rng();
    (0..count)
        .filter_map(|_| PHRASES.choose(&mut rng))
        .map(|phrase| Message::announcement(*phrase))
        .collect()
}
