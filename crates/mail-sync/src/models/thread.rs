//! Thread model representing one conversation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use super::{MessageFlags, ProviderMessage};

/// Subject used when the first message of a thread has none
pub const NO_SUBJECT: &str = "(no subject)";

/// Thread-level boolean flags aggregated from its messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadFlags {
    /// Every message has been read
    pub is_read: bool,
    /// At least one message is starred
    pub is_starred: bool,
    /// No message is in the inbox
    pub is_archived: bool,
    /// Every message is a draft
    pub is_draft: bool,
    /// Every message is in the trash
    pub is_trashed: bool,
}

impl ThreadFlags {
    /// Aggregate per-message flags; an empty iterator yields the default
    pub fn aggregate<'a>(flags: impl IntoIterator<Item = &'a MessageFlags>) -> Self {
        let mut any = false;
        let mut result = ThreadFlags {
            is_read: true,
            is_starred: false,
            is_archived: true,
            is_draft: true,
            is_trashed: true,
        };

        for f in flags {
            any = true;
            result.is_read &= f.is_read;
            result.is_starred |= f.is_starred;
            result.is_archived &= !f.in_inbox;
            result.is_draft &= f.is_draft;
            result.is_trashed &= f.is_trashed;
        }

        if any { result } else { ThreadFlags::default() }
    }
}

/// A full thread as returned by a provider client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderThread {
    /// Provider-native thread ID (Gmail thread id, Outlook conversation id)
    pub provider_thread_id: String,
    /// Provider-supplied thread snippet, may be empty
    pub snippet: String,
    /// Messages ordered oldest first
    pub messages: Vec<ProviderMessage>,
}

impl ProviderThread {
    pub fn new(provider_thread_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            provider_thread_id: provider_thread_id.into(),
            snippet: String::new(),
            messages,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }
}

/// The denormalized, mutable part of a thread row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub subject: String,
    pub snippet: String,
    /// Unique participant addresses in order of first appearance
    pub participants: Vec<String>,
    pub message_count: usize,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Union of message labels, sorted
    pub labels: Vec<String>,
    pub flags: ThreadFlags,
}

impl ThreadSummary {
    /// Compute the thread summary from its messages
    pub fn from_thread(thread: &ProviderThread) -> Self {
        let messages = &thread.messages;
        if messages.is_empty() {
            return Self::default();
        }

        let first = messages.iter().min_by_key(|m| m.sent_at);
        let latest = messages.iter().max_by_key(|m| m.sent_at);

        let subject = match first {
            Some(m) if !m.subject.trim().is_empty() => m.subject.trim().to_string(),
            _ => NO_SUBJECT.to_string(),
        };

        let snippet = if !thread.snippet.is_empty() {
            thread.snippet.clone()
        } else {
            latest.map(|m| m.snippet.clone()).unwrap_or_default()
        };

        let mut seen = HashSet::new();
        let participants = messages
            .iter()
            .flat_map(|m| m.from.iter().chain(m.to.iter()).chain(m.cc.iter()))
            .filter(|a| !a.email.is_empty() && seen.insert(a.email.clone()))
            .map(|a| a.email.clone())
            .collect();

        Self {
            subject,
            snippet,
            participants,
            message_count: messages.len(),
            first_message_at: first.map(|m| m.sent_at),
            last_message_at: latest.map(|m| m.sent_at),
            labels: union_labels(messages.iter().map(|m| m.labels.as_slice())),
            flags: ThreadFlags::aggregate(messages.iter().map(|m| &m.flags)),
        }
    }
}

/// Sorted, de-duplicated union of label sets
pub fn union_labels<'a>(sets: impl IntoIterator<Item = &'a [String]>) -> Vec<String> {
    sets.into_iter()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A persisted thread row, keyed by `(account_id, provider_thread_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: i64,
    pub account_id: i64,
    pub provider_thread_id: String,
    pub summary: ThreadSummary,
    /// Watermark for downstream analysis; never touched by sync
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
