//! Signals emitted to downstream consumers after ingestion

use log::debug;
use tokio::sync::mpsc;

/// A thread was created or changed by a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadProcessed {
    pub thread_id: i64,
    pub account_id: i64,
    pub org_id: i64,
    /// True when the thread row was created by this run
    pub is_new: bool,
}

/// Receiver of [`ThreadProcessed`] signals. Emission never fails the sync.
pub trait EventSink: Send + Sync {
    fn thread_processed(&self, event: ThreadProcessed);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn thread_processed(&self, _event: ThreadProcessed) {}
}

/// Forwards events into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ThreadProcessed>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ThreadProcessed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn thread_processed(&self, event: ThreadProcessed) {
        if self.tx.send(event).is_err() {
            debug!("[SYNC] Event receiver dropped, discarding {:?}", event);
        }
    }
}
