//! Delayed delivery queue
//!
//! Holds messages sent with `/delay` until their due time. The queue itself
//! is plain data owned by the `ChatServer` actor; `run_delivery_loop` is the
//! background task that prods the actor once per interval.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::message::Message;
use crate::server::ServerCommand;
use crate::types::Timestamp;

#[derive(Debug)]
struct Pending {
    due: Timestamp,
    message: Message,
}

/// Messages waiting for their due time, in insertion order
#[derive(Debug, Default)]
pub struct DelayedQueue {
    pending: Vec<Pending>,
}

impl DelayedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` until `created_at + send_after`
    ///
    /// A message whose due time cannot be represented is not queued and
    /// `None` is returned.
    pub fn schedule(&mut self, message: Message) -> Option<Timestamp> {
        let due = message.due_at()?;
        self.pending.push(Pending { due, message });
        Some(due)
    }

    /// Drop everything still queued, returning how many were dropped
    pub fn clear_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Remove and return every message due at `now`, in insertion order
    pub fn take_due(&mut self, now: Timestamp) -> Vec<Message> {
        let (due, pending): (Vec<Pending>, Vec<Pending>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.due <= now);
        self.pending = pending;
        due.into_iter().map(|p| p.message).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Send a `DeliverDue` tick to the server every `interval` until shutdown
pub async fn run_delivery_loop(
    cmd_tx: mpsc::Sender<ServerCommand>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let tick = ServerCommand::DeliverDue { now: Timestamp::now() };
                if cmd_tx.send(tick).await.is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Delayed delivery loop stopped");
}
