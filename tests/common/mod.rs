//! Reusable test harness for chat server integration tests.
//!
//! Starts a real `ChatService` on an ephemeral port with its history file in
//! a temp directory, and provides a line-protocol client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use linechat::codec;
use linechat::message::SERVER_AUTHOR;
use linechat::{AppError, ChatService, Message, MessageStore, ServiceHandle, Settings};

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(5);

// ── TestServer ──────────────────────────────────────────────────────

/// A running service plus everything needed to stop and inspect it
pub struct TestServer {
    pub addr: String,
    pub handle: ServiceHandle,
    pub task: JoinHandle<Result<MessageStore, AppError>>,
    pub backup_file: PathBuf,
}

/// Settings for a test server writing history into `dir`
pub fn test_settings(dir: &Path) -> Settings {
    Settings {
        addr: "127.0.0.1:0".to_string(),
        backup_file: dir.join("messages.json"),
        delivery_interval: Duration::from_millis(50),
        ..Settings::default()
    }
}

pub async fn start_server(settings: Settings) -> TestServer {
    let backup_file = settings.backup_file.clone();
    let service = ChatService::bind(settings).await.expect("bind failed");
    let addr = service.local_addr().expect("no local addr").to_string();
    let handle = service.handle();
    let task = tokio::spawn(service.run());
    TestServer {
        addr,
        handle,
        task,
        backup_file,
    }
}

impl TestServer {
    /// Stop the server and return its final history
    pub async fn stop(self) -> MessageStore {
        self.handle.stop().await.expect("stop failed");
        self.wait().await
    }

    /// Wait for a shutdown triggered elsewhere
    pub async fn wait(self) -> MessageStore {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server returned an error")
    }
}

// ── TestClient ──────────────────────────────────────────────────────

/// Line-protocol client for one username
pub struct TestClient {
    pub username: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect without sending anything
    pub async fn connect_raw(addr: &str, username: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (read_half, writer) = stream.into_split();
        Self {
            username: username.to_string(),
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    /// Connect, send the intro line and wait for the welcome banner
    pub async fn join(addr: &str, username: &str) -> Self {
        let mut client = Self::connect_raw(addr, username).await;
        client.send_message(&Message::new(username, "")).await;
        let welcome = client.recv().await.expect("no welcome banner");
        assert_eq!(welcome.author, SERVER_AUTHOR);
        assert!(welcome.text.contains("Welcome"), "got {:?}", welcome);
        client
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("write failed");
    }

    pub async fn send_message(&mut self, msg: &Message) {
        self.send_raw(&codec::encode(msg)).await;
    }

    /// Send chat text (or a command) as this user
    pub async fn say(&mut self, text: &str) {
        let msg = Message::new(self.username.as_str(), text);
        self.send_message(&msg).await;
    }

    /// Next message, `None` on EOF or connection error
    pub async fn recv(&mut self) -> Option<Message> {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .ok()??;
        Some(codec::decode(&line).expect("server sent a malformed line"))
    }

    /// Next message not authored by the server
    pub async fn recv_chat(&mut self) -> Message {
        loop {
            let msg = self.recv().await.expect("connection closed");
            if msg.author != SERVER_AUTHOR {
                return msg;
            }
        }
    }

    /// Skip ahead to the first server notice containing `needle`
    pub async fn recv_notice(&mut self, needle: &str) -> Message {
        loop {
            let msg = self.recv().await.expect("connection closed");
            if msg.author == SERVER_AUTHOR && msg.text.contains(needle) {
                return msg;
            }
        }
    }

    /// Every remaining message until the server closes the connection
    pub async fn drain(&mut self) -> Vec<Message> {
        let mut rest = Vec::new();
        while let Some(msg) = self.recv().await {
            rest.push(msg);
        }
        rest
    }
}
