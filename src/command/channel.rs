//! Command channel - one outbound write against one inbound frame
//!
//! Correlation is purely by order: a caller takes the channel's single turn,
//! writes its command, then waits for the next frame. Frames arriving with
//! nobody waiting are buffered up to a small capacity, dropping the oldest.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Serializes commands and pairs each with the next response frame
pub struct CommandChannel {
    frames: Mutex<VecDeque<String>>,
    capacity: usize,
    arrived: Notify,
    /// Held for the whole write + wait of one command
    turn: Mutex<()>,
    response_timeout: Duration,
    closed: AtomicBool,
}

impl CommandChannel {
    /// Create a new command channel
    pub fn new(capacity: usize, response_timeout: Duration) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            arrived: Notify::new(),
            turn: Mutex::new(()),
            response_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver an inbound frame
    pub async fn push_frame(&self, frame: String) {
        let mut frames = self.frames.lock().await;
        if frames.len() >= self.capacity {
            if let Some(dropped) = frames.pop_front() {
                debug!("[CMD] Response buffer full, dropping {:?}", dropped);
            }
        }
        frames.push_back(frame);
        drop(frames);
        self.arrived.notify_one();
    }

    /// Run one command exchange
    ///
    /// `write` performs the outbound write and resolves to whether the
    /// platform confirmed it. Returns the next frame, or `None` on write
    /// failure, timeout or a closed channel.
    pub async fn exchange<F>(&self, command: &str, write: F) -> Option<String>
    where
        F: Future<Output = bool>,
    {
        let _turn = self.turn.lock().await;

        if self.is_closed() {
            return None;
        }

        let stale = self.drain().await;
        if !stale.is_empty() {
            debug!("[CMD] Discarded {} stale frame(s) before {}: {:?}", stale.len(), command, stale);
        }

        if !write.await {
            warn!("[CMD] Write of {} was not confirmed", command);
            return None;
        }

        match timeout(self.response_timeout, self.next_frame()).await {
            Ok(frame) => frame,
            Err(_) => {
                warn!(
                    "[CMD] No response to {} within {:?}",
                    command, self.response_timeout
                );
                None
            }
        }
    }

    /// Drop every buffered frame
    pub async fn drain(&self) -> Vec<String> {
        self.frames.lock().await.drain(..).collect()
    }

    /// Stop the channel; waiting and future exchanges return `None`
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.arrived.notify_waiters();
        self.arrived.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of buffered frames (for debugging)
    pub async fn buffered(&self) -> usize {
        self.frames.lock().await.len()
    }

    async fn next_frame(&self) -> Option<String> {
        loop {
            if let Some(frame) = self.frames.lock().await.pop_front() {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            self.arrived.notified().await;
        }
    }
}
