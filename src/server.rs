//! ChatServer Actor implementation
//!
//! The central actor that owns all shared state: the client registry, the
//! message history and the delayed delivery queue. Session handlers and the
//! delivery loop talk to it only through `ServerCommand`s, so no locks are
//! needed.

use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::delayed::DelayedQueue;
use crate::error::{AppError, SendError};
use crate::message::{Message, DELAY_USAGE};
use crate::registry::{ActiveSession, ClientRegistry, JoinOutcome};
use crate::store::MessageStore;
use crate::types::{SessionId, Timestamp};

/// Commands sent from handlers and the delivery loop to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Session finished its intro
    Join {
        session_id: SessionId,
        username: String,
        sender: mpsc::Sender<Message>,
    },
    /// Session closed
    Leave {
        session_id: SessionId,
        username: String,
    },
    /// Store and fan out to everyone but the author
    Broadcast { message: Message },
    /// Store and deliver to `message.to_username` only
    Private { message: Message },
    /// Hold until `created_at + send_after`
    Schedule { message: Message },
    /// Empty the delayed queue on behalf of `username`
    ClearUnsent { username: String },
    /// Deliver every delayed message due at `now`
    DeliverDue { now: Timestamp },
    /// Back up history and shut the server down
    Stop { requested_by: Option<String> },
}

/// Behaviour knobs of the actor
#[derive(Debug, Clone)]
pub struct ChatServerConfig {
    pub chat_name: String,
    pub history_len: usize,
    pub backup_file: PathBuf,
}

/// The main ChatServer actor
pub struct ChatServer {
    registry: ClientRegistry,
    store: MessageStore,
    delayed: DelayedQueue,
    config: ChatServerConfig,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    /// Raised once when the server stops
    shutdown: watch::Sender<bool>,
}

impl ChatServer {
    /// Create a new ChatServer over restored history
    pub fn new(
        receiver: mpsc::Receiver<ServerCommand>,
        shutdown: watch::Sender<bool>,
        store: MessageStore,
        config: ChatServerConfig,
    ) -> Self {
        Self {
            registry: ClientRegistry::new(),
            store,
            delayed: DelayedQueue::new(),
            config,
            receiver,
            shutdown,
        }
    }

    /// Run the ChatServer event loop
    ///
    /// Processes commands in arrival order until a `Stop` arrives or all
    /// senders are dropped, then backs up the history and raises the
    /// shutdown signal.
    pub async fn run(mut self) -> MessageStore {
        info!("ChatServer started with {} messages of history", self.store.len());

        while let Some(cmd) = self.receiver.recv().await {
            if let ServerCommand::Stop { requested_by } = cmd {
                match requested_by {
                    Some(username) => warn!("Stop requested by {}", username),
                    None => info!("Stop requested"),
                }
                break;
            }
            self.handle_command(cmd);
        }

        let _ = self.shutdown.send(true);
        self.receiver.close();

        if let Err(e) = self.store.backup(&self.config.backup_file).await {
            error!("History backup failed: {}", e);
        }

        info!("ChatServer shutting down");
        self.store
    }

    /// Process a single command
    ///
    /// Never waits on a session: a client that stops reading loses
    /// messages instead of stalling the actor.
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Join {
                session_id,
                username,
                sender,
            } => {
                self.handle_join(session_id, username, sender);
            }
            ServerCommand::Leave {
                session_id,
                username,
            } => {
                self.handle_leave(session_id, username);
            }
            ServerCommand::Broadcast { message } => {
                self.handle_broadcast(message);
            }
            ServerCommand::Private { message } => {
                self.handle_private(message);
            }
            ServerCommand::Schedule { message } => {
                self.handle_schedule(message);
            }
            ServerCommand::ClearUnsent { username } => {
                self.handle_clear_unsent(username);
            }
            ServerCommand::DeliverDue { now } => {
                self.handle_deliver_due(now);
            }
            ServerCommand::Stop { .. } => {}
        }
    }

    /// Handle a completed intro
    fn handle_join(
        &mut self,
        session_id: SessionId,
        username: String,
        sender: mpsc::Sender<Message>,
    ) {
        let now = Timestamp::now();
        let outcome = self.registry.on_join(&username, session_id, sender);
        let Some(client) = self.registry.lookup_active(&username) else {
            return;
        };

        let (welcome, replay) = match outcome {
            JoinOutcome::Reconnect(last_seen) => {
                info!("{} reconnected (session {})", username, session_id);
                (
                    format!("Welcome back to {}, {}!", self.config.chat_name, username),
                    self.store
                        .since(last_seen, now, |m| m.is_visible_to(&username)),
                )
            }
            JoinOutcome::FirstJoin | JoinOutcome::Displaced(_) => {
                if let JoinOutcome::Displaced(old) = outcome {
                    warn!("{} logged in again, session {} displaced", username, old);
                } else {
                    info!("{} joined (session {})", username, session_id);
                }
                (
                    format!("Welcome to {}, {}!", self.config.chat_name, username),
                    self.store
                        .last_n(self.config.history_len, Message::is_broadcast),
                )
            }
        };

        if deliver(&username, client, Message::notice(&username, welcome)) {
            for message in replay {
                if !deliver(&username, client, message) {
                    break;
                }
            }
        }

        self.fan_out(
            Message::announcement(format!("{} joined the chat", username)),
            &username,
        );

        debug!(
            "Active users: {}, known users: {}",
            self.registry.active_count(),
            self.registry.len()
        );
    }

    /// Handle a closed session
    fn handle_leave(&mut self, session_id: SessionId, username: String) {
        if !self.registry.on_leave(&username, session_id, Timestamp::now()) {
            debug!("Ignoring leave of stale session {} for {}", session_id, username);
            return;
        }

        info!("{} left the chat", username);
        self.fan_out(
            Message::announcement(format!("{} left the chat", username)),
            &username,
        );
    }

    /// Handle a broadcast chat message
    fn handle_broadcast(&mut self, message: Message) {
        debug!("{}", message);
        self.store.append(message.clone());
        let author = message.author.clone();
        self.fan_out(message, &author);
    }

    /// Handle a private message
    fn handle_private(&mut self, message: Message) {
        let Some(recipient) = self.registry.lookup_active(&message.to_username) else {
            let err = AppError::RecipientOffline(message.to_username.clone());
            debug!("Private message from {} not delivered: {}", message.author, err);
            self.notify(&message.author, (message.author.as_str(), err).into());
            return;
        };

        deliver(&message.to_username, recipient, message.clone());
        self.store.append(message);
    }

    /// Handle a delayed message
    fn handle_schedule(&mut self, message: Message) {
        let author = message.author.clone();
        let delay = message.send_after;

        let text = match self.delayed.schedule(message) {
            Some(due) => {
                debug!("Scheduled message from {} for {}", author, due);
                format!("Message will be sent in {} seconds", delay.as_secs())
            }
            None => {
                debug!("Rejected delay of {}s from {}", delay.as_secs(), author);
                DELAY_USAGE.to_string()
            }
        };
        self.notify(&author, Message::notice(&author, text));
    }

    /// Handle `/clear_unsent`
    fn handle_clear_unsent(&mut self, username: String) {
        let cleared = self.delayed.clear_all();
        info!("{} cleared {} unsent messages", username, cleared);

        self.notify(
            &username,
            Message::notice(&username, format!("Cleared {} unsent messages", cleared)),
        );
    }

    /// Handle a delivery loop tick
    fn handle_deliver_due(&mut self, now: Timestamp) {
        for message in self.delayed.take_due(now) {
            debug!("Delivering delayed message from {}", message.author);
            self.handle_broadcast(message);
        }
    }

    /// Helper: send to `username` if connected
    fn notify(&self, username: &str, message: Message) {
        if let Some(client) = self.registry.lookup_active(username) {
            deliver(username, client, message);
        }
    }

    /// Helper: send to every active session except `exclude`
    fn fan_out(&self, message: Message, exclude: &str) {
        for (username, client) in self.registry.broadcast_targets(exclude) {
            deliver(username, client, message.clone());
        }
    }
}

/// Queue `message` for one session, dropping it if the session cannot take it
fn deliver(username: &str, client: &ActiveSession, message: Message) -> bool {
    match client.send(message) {
        Ok(()) => true,
        Err(SendError::ChannelFull) => {
            warn!("Dropping message for {}: outbound buffer full", username);
            false
        }
        Err(SendError::ChannelClosed) => {
            debug!("Dropping message for {}: channel closed", username);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Harness {
        cmd_tx: mpsc::Sender<ServerCommand>,
        shutdown_rx: watch::Receiver<bool>,
        task: tokio::task::JoinHandle<MessageStore>,
        _dir: tempfile::TempDir,
    }

    fn start(history: Vec<Message>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = ChatServerConfig {
            chat_name: "Public".to_string(),
            history_len: 2,
            backup_file: dir.path().join("messages.json"),
        };
        let server = ChatServer::new(
            cmd_rx,
            shutdown_tx,
            MessageStore::from_messages(history),
            config,
        );
        Harness {
            cmd_tx,
            shutdown_rx,
            task: tokio::spawn(server.run()),
            _dir: dir,
        }
    }

    async fn join(h: &Harness, username: &str) -> (SessionId, mpsc::Receiver<Message>) {
        let session_id = SessionId::new();
        let (tx, mut rx) = mpsc::channel(64);
        h.cmd_tx
            .send(ServerCommand::Join {
                session_id,
                username: username.to_string(),
                sender: tx,
            })
            .await
            .unwrap();
        // Welcome banner confirms the join was processed
        let welcome = rx.recv().await.unwrap();
        assert!(welcome.text.contains("Welcome"));
        (session_id, rx)
    }

    async fn stop(h: Harness) -> MessageStore {
        h.cmd_tx
            .send(ServerCommand::Stop { requested_by: None })
            .await
            .unwrap();
        h.task.await.unwrap()
    }

    async fn next_chat(rx: &mut mpsc::Receiver<Message>) -> Message {
        loop {
            let msg = rx.recv().await.unwrap();
            if msg.author != crate::message::SERVER_AUTHOR {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_first_join_gets_last_broadcasts() {
        let history = vec![
            Message::new("carol", "one"),
            Message::new("carol", "two"),
            Message::new("carol", "secret").to("dave"),
            Message::new("carol", "three"),
        ];
        let h = start(history);
        let (_, mut rx) = join(&h, "alice").await;

        assert_eq!(rx.recv().await.unwrap().text, "two");
        assert_eq!(rx.recv().await.unwrap().text, "three");
        stop(h).await;
    }

    #[tokio::test]
    async fn test_broadcast_excludes_author_and_is_stored() {
        let h = start(Vec::new());
        let (_, mut alice) = join(&h, "alice").await;
        let (_, mut bob) = join(&h, "bob").await;

        h.cmd_tx
            .send(ServerCommand::Broadcast {
                message: Message::new("alice", "hello"),
            })
            .await
            .unwrap();

        assert_eq!(next_chat(&mut bob).await.text, "hello");

        let store = stop(h).await;
        assert_eq!(store.len(), 1);
        // Alice only saw bob's join notice, never her own message
        while let Ok(msg) = alice.try_recv() {
            assert_ne!(msg.text, "hello");
        }
    }

    #[tokio::test]
    async fn test_private_to_offline_user_notifies_sender_only() {
        let h = start(Vec::new());
        let (_, mut alice) = join(&h, "alice").await;
        let (_, mut bob) = join(&h, "bob").await;
        // Alice sees bob join
        assert!(alice.recv().await.unwrap().text.contains("bob joined"));

        h.cmd_tx
            .send(ServerCommand::Private {
                message: Message::new("alice", "psst").to("ghost"),
            })
            .await
            .unwrap();

        let notice = alice.recv().await.unwrap();
        assert_eq!(notice.to_username, "alice");
        assert!(notice.text.contains("ghost"));

        let store = stop(h).await;
        assert!(store.is_empty());
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_private_delivery() {
        let h = start(Vec::new());
        let (_, _alice) = join(&h, "alice").await;
        let (_, mut bob) = join(&h, "bob").await;

        h.cmd_tx
            .send(ServerCommand::Private {
                message: Message::new("alice", "psst").to("bob"),
            })
            .await
            .unwrap();

        let msg = next_chat(&mut bob).await;
        assert_eq!(msg.text, "psst");
        assert_eq!(msg.to_username, "bob");
        stop(h).await;
    }

    #[tokio::test]
    async fn test_delayed_message_waits_for_due_time() {
        let h = start(Vec::new());
        let (_, _alice) = join(&h, "alice").await;
        let (_, mut bob) = join(&h, "bob").await;

        let message = Message::new("alice", "later").delayed(Duration::from_secs(30));
        let created_at = message.created_at;
        h.cmd_tx
            .send(ServerCommand::Schedule { message })
            .await
            .unwrap();

        h.cmd_tx
            .send(ServerCommand::DeliverDue {
                now: created_at.after(Duration::from_secs(29)).unwrap(),
            })
            .await
            .unwrap();
        h.cmd_tx
            .send(ServerCommand::Broadcast {
                message: Message::new("alice", "marker"),
            })
            .await
            .unwrap();

        // Nothing was delivered one second early
        assert_eq!(next_chat(&mut bob).await.text, "marker");

        h.cmd_tx
            .send(ServerCommand::DeliverDue {
                now: created_at.after(Duration::from_secs(30)).unwrap(),
            })
            .await
            .unwrap();

        let msg = next_chat(&mut bob).await;
        assert_eq!(msg.text, "later");
        assert_eq!(msg.author, "alice");

        let store = stop(h).await;
        let texts: Vec<&str> = store.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["marker", "later"]);
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_is_refused() {
        let h = start(Vec::new());
        let (_, mut alice) = join(&h, "alice").await;

        let message =
            Message::new("alice", "far future").delayed(Duration::from_secs(10_000_000_000_000));
        h.cmd_tx
            .send(ServerCommand::Schedule { message })
            .await
            .unwrap();
        h.cmd_tx
            .send(ServerCommand::DeliverDue {
                now: Timestamp::now(),
            })
            .await
            .unwrap();

        assert_eq!(alice.recv().await.unwrap().text, DELAY_USAGE);

        let store = stop(h).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_session_does_not_block_actor() {
        let h = start(Vec::new());
        let (_, mut alice) = join(&h, "alice").await;

        // Bob's buffer is full with the welcome banner and he never reads
        let (tx, _bob) = mpsc::channel(1);
        h.cmd_tx
            .send(ServerCommand::Join {
                session_id: SessionId::new(),
                username: "bob".to_string(),
                sender: tx,
            })
            .await
            .unwrap();
        assert!(alice.recv().await.unwrap().text.contains("bob joined"));

        for i in 0..3 {
            h.cmd_tx
                .send(ServerCommand::Broadcast {
                    message: Message::new("alice", format!("m{}", i)),
                })
                .await
                .unwrap();
        }
        h.cmd_tx
            .send(ServerCommand::Stop { requested_by: None })
            .await
            .unwrap();

        let store = tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("actor blocked on a stalled session")
            .unwrap();
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_clear_unsent_drops_queue() {
        let h = start(Vec::new());
        let (_, mut alice) = join(&h, "alice").await;

        let message = Message::new("alice", "never").delayed(Duration::from_secs(5));
        let created_at = message.created_at;
        h.cmd_tx
            .send(ServerCommand::Schedule { message })
            .await
            .unwrap();
        h.cmd_tx
            .send(ServerCommand::ClearUnsent {
                username: "alice".to_string(),
            })
            .await
            .unwrap();
        h.cmd_tx
            .send(ServerCommand::DeliverDue {
                now: created_at.after(Duration::from_secs(60)).unwrap(),
            })
            .await
            .unwrap();

        assert!(alice.recv().await.unwrap().text.contains("5 seconds"));
        assert!(alice.recv().await.unwrap().text.contains("Cleared 1"));

        let store = stop(h).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replays_missed_messages() {
        let h = start(vec![Message::new("carol", "ancient")]);
        let (alice_session, _alice) = join(&h, "alice").await;
        let (_, mut bob) = join(&h, "bob").await;

        h.cmd_tx
            .send(ServerCommand::Leave {
                session_id: alice_session,
                username: "alice".to_string(),
            })
            .await
            .unwrap();
        loop {
            if bob.recv().await.unwrap().text == "alice left the chat" {
                break;
            }
        }

        // Stamp the missed messages strictly after the leave
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut ahead = Message::new("bob", "stamped ahead");
        ahead.created_at = Timestamp::now().after(Duration::from_secs(3600)).unwrap();
        for message in [
            Message::new("bob", "missed"),
            Message::new("carol", "to dave").to("dave"),
            ahead,
            Message::new("bob", "also missed"),
        ] {
            h.cmd_tx
                .send(ServerCommand::Broadcast { message })
                .await
                .unwrap();
        }

        let (_, mut alice) = join(&h, "alice").await;
        assert_eq!(alice.recv().await.unwrap().text, "missed");
        assert_eq!(alice.recv().await.unwrap().text, "also missed");

        let store = stop(h).await;
        assert_eq!(store.len(), 5);
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_leave_keeps_new_session() {
        let h = start(Vec::new());
        let (old, _old_rx) = join(&h, "alice").await;
        let (_, mut new_rx) = join(&h, "alice").await;
        let (_, _bob) = join(&h, "bob").await;

        h.cmd_tx
            .send(ServerCommand::Leave {
                session_id: old,
                username: "alice".to_string(),
            })
            .await
            .unwrap();
        h.cmd_tx
            .send(ServerCommand::Broadcast {
                message: Message::new("bob", "still here?"),
            })
            .await
            .unwrap();

        assert_eq!(next_chat(&mut new_rx).await.text, "still here?");
        stop(h).await;
    }

    #[tokio::test]
    async fn test_stop_backs_up_and_signals_shutdown() {
        let h = start(vec![Message::new("carol", "keep me")]);
        let backup = h._dir.path().join("messages.json");
        let mut shutdown_rx = h.shutdown_rx.clone();

        h.cmd_tx
            .send(ServerCommand::Stop {
                requested_by: Some("alice".to_string()),
            })
            .await
            .unwrap();
        let store = h.task.await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(*shutdown_rx.borrow_and_update());
        let saved = std::fs::read_to_string(&backup).unwrap();
        assert!(saved.contains("keep me"));
    }
}
