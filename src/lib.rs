//! Line-oriented TCP Chat Server Library
//!
//! A single public chat over plain TCP, one `;`-delimited message per line.
//!
//! # Features
//! - Username intro line, presence tracking across reconnects
//! - Replay of recent history on first join, of missed messages on reconnect
//! - Per-user hourly broadcast limit
//! - Private messages (`/private`)
//! - Delayed messages (`/delay`, `/clear_unsent`)
//! - History persisted to JSON on shutdown and restored with a TTL
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning registry, history and delayed queue
//! - Each connection has a `handler` task communicating with the server
//! - A delivery loop task ticks the server once per interval
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use linechat::{ChatService, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), linechat::AppError> {
//!     let service = ChatService::bind(Settings::from_env()?).await?;
//!     service.run().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod delayed;
pub mod error;
pub mod handler;
pub mod message;
pub mod rate_limit;
pub mod registry;
pub mod seed;
pub mod server;
pub mod service;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::Settings;
pub use delayed::DelayedQueue;
pub use error::{AppError, SendError};
pub use handler::handle_connection;
pub use message::{Command, Message};
pub use rate_limit::RateLimiter;
pub use registry::{ClientRegistry, JoinOutcome, Presence};
pub use server::{ChatServer, ServerCommand};
pub use service::{ChatService, ServiceHandle};
pub use store::MessageStore;
pub use types::{SessionId, Timestamp};
