//! Server core
//!
//! Binds the listener, restores history, starts the ChatServer actor and the
//! delayed delivery loop, and accepts connections until the server stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::delayed;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::seed;
use crate::server::{ChatServer, ChatServerConfig, ServerCommand};
use crate::store::MessageStore;
use crate::types::Timestamp;

/// Channel buffer size for server commands
const CHANNEL_BUFFER_SIZE: usize = 256;

/// How long `run` waits for sessions to flush and close after the actor stops
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound, not yet running chat service
pub struct ChatService {
    listener: TcpListener,
    settings: Arc<Settings>,
    cmd_tx: mpsc::Sender<ServerCommand>,
    shutdown_rx: watch::Receiver<bool>,
    server: ChatServer,
}

/// Cloneable handle for stopping a running service
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    cmd_tx: mpsc::Sender<ServerCommand>,
}

impl ServiceHandle {
    /// Ask the server to back up its history and shut down
    pub async fn stop(&self) -> Result<(), AppError> {
        self.cmd_tx
            .send(ServerCommand::Stop { requested_by: None })
            .await
            .map_err(|_| AppError::ChannelSend)
    }
}

impl ChatService {
    /// Restore history and bind the listener
    pub async fn bind(settings: Settings) -> Result<Self, AppError> {
        let mut history = MessageStore::restore(
            &settings.backup_file,
            settings.message_ttl,
            Timestamp::now(),
        )
        .await;
        if settings.seed_messages > 0 {
            info!("Adding {} generated messages", settings.seed_messages);
            history.extend(seed::generate(settings.seed_messages));
        }

        let listener = TcpListener::bind(&settings.addr).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ChatServer::new(
            cmd_rx,
            shutdown_tx,
            MessageStore::from_messages(history),
            ChatServerConfig {
                chat_name: settings.chat_name.clone(),
                history_len: settings.history_len,
                backup_file: settings.backup_file.clone(),
            },
        );

        Ok(Self {
            listener,
            settings: Arc::new(settings),
            cmd_tx,
            shutdown_rx,
            server,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Accept connections until the server is stopped
    ///
    /// Returns once the history has been backed up, the delivery loop has
    /// finished and every session has flushed its output (or the drain
    /// timeout passed). Returns the final history.
    pub async fn run(self) -> Result<MessageStore, AppError> {
        let ChatService {
            listener,
            settings,
            cmd_tx,
            mut shutdown_rx,
            server,
        } = self;

        info!("Chat server listening on {}", listener.local_addr()?);

        let server_task = tokio::spawn(server.run());
        let delivery_task = tokio::spawn(delayed::run_delivery_loop(
            cmd_tx.clone(),
            settings.delivery_interval,
            shutdown_rx.clone(),
        ));

        let mut sessions = JoinSet::new();

        // Connection accept loop
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        let cmd_tx = cmd_tx.clone();
                        let shutdown = shutdown_rx.clone();
                        let settings = settings.clone();

                        // Spawn handler task for each connection
                        sessions.spawn(async move {
                            if let Err(e) = handle_connection(stream, cmd_tx, shutdown, settings).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                // Reap finished sessions
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Stop accepting before waiting on the actor
        drop(listener);
        drop(cmd_tx);

        let store = server_task.await?;
        let _ = delivery_task.await;

        debug!("Waiting for {} sessions to close", sessions.len());
        let drained = tokio::time::timeout(SESSION_DRAIN_TIMEOUT, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} sessions that did not close in time", sessions.len());
            sessions.shutdown().await;
        }

        info!("Server stopped");
        Ok(store)
    }
}
