//! Line codec for the wire protocol
//!
//! One message per line: `timestamp;author;text;separator;to_username`.
//! Every field is escaped on encode (`\\`, `\;`, `\n`, `\r`) so user text can
//! carry the delimiter. Decoding splits on unescaped delimiters into at most
//! five fields; anything past the fourth delimiter stays in the last field.

use std::time::Duration;

use crate::error::AppError;
use crate::message::{Message, DEFAULT_SEPARATOR};
use crate::types::Timestamp;

const DELIMITER: char = ';';
const ESCAPE: char = '\\';

/// Number of fields in a full line
const FIELD_COUNT: usize = 5;

/// Timestamp, author and text are required
const MIN_FIELD_COUNT: usize = 3;

/// Serialize a message into one newline-terminated line
pub fn encode(msg: &Message) -> String {
    let mut line = String::with_capacity(
        32 + msg.author.len() + msg.text.len() + msg.separator.len() + msg.to_username.len(),
    );
    line.push_str(&msg.created_at.to_string());
    for field in [&msg.author, &msg.text, &msg.separator, &msg.to_username] {
        line.push(DELIMITER);
        escape_into(field, &mut line);
    }
    line.push('\n');
    line
}

/// Parse one line (with or without its trailing newline) into a message
pub fn decode(line: &str) -> Result<Message, AppError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut fields = split_fields(line).into_iter();
    if fields.len() < MIN_FIELD_COUNT {
        return Err(AppError::MalformedMessage(format!(
            "expected at least {} fields, got {}",
            MIN_FIELD_COUNT,
            fields.len()
        )));
    }

    let created_at = Timestamp::parse(&fields.next().unwrap_or_default())?;
    let author = fields.next().unwrap_or_default();
    let text = fields.next().unwrap_or_default();
    let separator = fields
        .next()
        .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string());
    let to_username = fields.next().unwrap_or_default();

    Ok(Message {
        created_at,
        author,
        text,
        separator,
        to_username,
        send_after: Duration::ZERO,
    })
}

fn escape_into(field: &str, out: &mut String) {
    for c in field.chars() {
        match c {
            ESCAPE => out.push_str("\\\\"),
            DELIMITER => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

/// Split on unescaped delimiters into at most `FIELD_COUNT` unescaped fields
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(other) => current.push(other),
                // Trailing lone backslash is kept literally
                None => current.push(ESCAPE),
            },
            DELIMITER if fields.len() < FIELD_COUNT - 1 => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}
