//! Error types for the chat server
//!
//! Defines application-level errors and message send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (reported back to the client as a notice).
#[derive(Debug, Error)]
pub enum AppError {
    /// Line framing error on the wire (fatal for that connection)
    #[error("Line read error: {0}")]
    Lines(#[from] tokio_util::codec::LinesCodecError),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// A line could not be decoded into a message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// History backup or restore failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Private message target is unknown or not connected
    #[error("Recipient offline: {0}")]
    RecipientOffline(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed or saturated
/// channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The receiver is not keeping up and its buffer is full
    #[error("Channel full")]
    ChannelFull,
}
