//! Connection handler
//!
//! Runs the per-connection protocol: read the intro line, register with the
//! ChatServer, dispatch chat lines and commands, and always report the
//! disconnect, however the session ends.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::Settings;
use crate::error::AppError;
use crate::message::{Command, Message};
use crate::rate_limit::RateLimiter;
use crate::server::ServerCommand;
use crate::types::SessionId;

/// Longest accepted input line, in bytes
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Outbound queue depth per connection
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// How long a closing session waits for its queued output to reach the socket
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    AwaitingIntro,
    Active { username: String },
    Closed,
}

/// Why the active loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Eof,
    Quit,
    IdleTimeout,
    Shutdown,
}

/// Handle a new TCP connection
///
/// Reads the intro, then runs the session until the client leaves, the
/// connection fails or the server shuts down.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    shutdown: watch::Receiver<bool>,
    settings: Arc<Settings>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let session_id = SessionId::new();
    let mut session = Session {
        id: session_id,
        state: SessionState::AwaitingIntro,
        cmd_tx,
        shutdown,
        limiter: RateLimiter::new(settings.rate_limit, settings.rate_window),
        settings,
        outbound: None,
    };

    // AwaitingIntro: a bad first line aborts before anything is registered
    let Some(username) = session.read_intro(&mut lines).await? else {
        debug!("Connection from {} closed before intro", peer_addr);
        return Ok(());
    };
    info!("{} connected from {} (session {})", username, peer_addr, session_id);

    // Create channel for server -> client messages
    let (msg_tx, msg_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER_SIZE);
    let writer = tokio::spawn(write_loop(write_half, msg_rx, session_id));

    if session
        .cmd_tx
        .send(ServerCommand::Join {
            session_id,
            username: username.clone(),
            sender: msg_tx.clone(),
        })
        .await
        .is_err()
    {
        error!("Failed to register {} - server closed", username);
        return Err(AppError::ChannelSend);
    }

    session.outbound = Some(msg_tx);
    session.transition(SessionState::Active {
        username: username.clone(),
    });

    let result = session.run_active(&username, &mut lines).await;
    match &result {
        Ok(reason) => debug!("Session {} ended: {:?}", session_id, reason),
        Err(e) => warn!("Session {} for {} failed: {}", session_id, username, e),
    }

    // Closed: runs on every exit path of the active loop
    session.close().await;

    // The writer ends once the server drops its copy of the sender
    if tokio::time::timeout(WRITE_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("Session {} closed with output still queued", session_id);
    }
    info!("{} disconnected", username);

    result.map(|_| ())
}

/// Per-connection state owned by the handler task
struct Session {
    id: SessionId,
    state: SessionState,
    cmd_tx: mpsc::Sender<ServerCommand>,
    shutdown: watch::Receiver<bool>,
    settings: Arc<Settings>,
    outbound: Option<mpsc::Sender<Message>>,
    limiter: RateLimiter,
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Read and decode the intro line; `None` if the peer left first or
    /// the server is shutting down
    async fn read_intro(&mut self, lines: &mut LineReader) -> Result<Option<String>, AppError> {
        let next = tokio::select! {
            next = lines.next() => next,
            _ = self.shutdown.wait_for(|stopped| *stopped) => return Ok(None),
        };
        let line = match next {
            Some(line) => line?,
            None => return Ok(None),
        };
        let intro = codec::decode(&line)?;
        if intro.author.trim().is_empty() {
            return Err(AppError::MalformedMessage(
                "intro line has no username".to_string(),
            ));
        }
        Ok(Some(intro.author))
    }

    /// Read and dispatch lines until the session ends
    async fn run_active(
        &mut self,
        username: &str,
        lines: &mut LineReader,
    ) -> Result<CloseReason, AppError> {
        let idle_timeout = self.settings.idle_timeout;

        loop {
            let next = tokio::select! {
                next = next_line(lines, idle_timeout) => next,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(CloseReason::Shutdown);
                    }
                    continue;
                }
            };

            let line = match next {
                Some(Some(line)) => line?,
                Some(None) => return Ok(CloseReason::Eof),
                None => return Ok(CloseReason::IdleTimeout),
            };

            let mut message = codec::decode(&line)?;
            message.author = username.to_string();

            if let Some(reason) = self.dispatch(username, message).await? {
                return Ok(reason);
            }
        }
    }

    /// Act on one decoded line
    async fn dispatch(
        &mut self,
        username: &str,
        message: Message,
    ) -> Result<Option<CloseReason>, AppError> {
        match Command::parse(&message.text) {
            Command::Stop => {
                if self.settings.allow_remote_stop {
                    self.send_to_server(ServerCommand::Stop {
                        requested_by: Some(username.to_string()),
                    })
                    .await?;
                } else {
                    self.notify(username, "The /stop command is disabled").await;
                }
            }
            Command::Delay { delay, text } => {
                let message = Message { text, ..message }.to("").delayed(delay);
                self.send_to_server(ServerCommand::Schedule { message }).await?;
            }
            Command::ClearUnsent => {
                self.send_to_server(ServerCommand::ClearUnsent {
                    username: username.to_string(),
                })
                .await?;
            }
            Command::Private { to, text } => {
                let message = Message { text, ..message }.to(to);
                self.send_to_server(ServerCommand::Private { message }).await?;
            }
            Command::Quit => return Ok(Some(CloseReason::Quit)),
            Command::Usage(usage) => self.notify(username, usage).await,
            Command::Say(_) if !message.is_broadcast() => {
                self.send_to_server(ServerCommand::Private { message }).await?;
            }
            Command::Say(_) => {
                if self.limiter.try_consume() {
                    self.send_to_server(ServerCommand::Broadcast { message }).await?;
                } else {
                    debug!("{} hit the rate limit", username);
                    let text = format!(
                        "Message limit reached: {} messages per {} seconds. Message not sent.",
                        self.limiter.limit(),
                        self.limiter.window().as_secs()
                    );
                    self.notify(username, text).await;
                }
            }
        }
        Ok(None)
    }

    async fn send_to_server(&self, cmd: ServerCommand) -> Result<(), AppError> {
        self.cmd_tx.send(cmd).await.map_err(|_| AppError::ChannelSend)
    }

    /// Local notice to this session only; never stored or broadcast
    async fn notify(&self, username: &str, text: impl Into<String>) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(Message::notice(username, text)).await;
        }
    }

    /// Report the disconnect of an active session and release the outbound channel
    async fn close(&mut self) {
        if let SessionState::Active { username } = &self.state {
            let _ = self
                .cmd_tx
                .send(ServerCommand::Leave {
                    session_id: self.id,
                    username: username.clone(),
                })
                .await;
        }
        self.outbound = None;
        self.transition(SessionState::Closed);
    }
}

/// Next line, `None` on idle timeout, `Some(None)` on EOF
async fn next_line(
    lines: &mut LineReader,
    idle_timeout: Option<Duration>,
) -> Option<Option<Result<String, tokio_util::codec::LinesCodecError>>> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, lines.next()).await.ok(),
        None => Some(lines.next().await),
    }
}

/// Drain the outbound channel onto the socket
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut msg_rx: mpsc::Receiver<Message>,
    session_id: SessionId,
) {
    while let Some(msg) = msg_rx.recv().await {
        if let Err(e) = writer.write_all(codec::encode(&msg).as_bytes()).await {
            debug!("Write failed for session {}: {}", session_id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("Write task ended for session {}", session_id);
}
