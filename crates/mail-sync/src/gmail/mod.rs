//! Gmail API integration
//!
//! This module provides:
//! - A [`ProviderClient`](crate::provider::ProviderClient) over the Gmail REST API
//! - Response normalization to domain models

mod client;
mod normalize;

pub use client::GmailClient;
pub use normalize::{flags_from_labels, normalize_message, normalize_thread};

/// Gmail API response types
///
/// Every field the API may omit is optional; absent lists deserialize empty.
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Response from `users.threads.list`
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListThreadsResponse {
        #[serde(default)]
        pub threads: Vec<ThreadRef>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u64>,
    }

    /// Listing entry for a thread
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ThreadRef {
        pub id: String,
        pub snippet: Option<String>,
        pub history_id: Option<String>,
    }

    /// Full thread from `users.threads.get`
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailThread {
        pub id: String,
        pub snippet: Option<String>,
        pub history_id: Option<String>,
        #[serde(default)]
        pub messages: Vec<GmailMessage>,
    }

    /// Full message from Gmail API
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: Option<String>,
        #[serde(default)]
        pub label_ids: Vec<String>,
        pub snippet: Option<String>,
        /// Milliseconds since epoch, as a string
        pub internal_date: Option<String>,
        pub size_estimate: Option<u64>,
        pub payload: Option<MessagePart>,
    }

    /// A MIME part; the message payload is the root part
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        #[serde(default)]
        pub headers: Vec<Header>,
        pub body: Option<MessageBody>,
        #[serde(default)]
        pub parts: Vec<MessagePart>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Part body; `data` is URL-safe base64, attachments only carry an id
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageBody {
        pub size: Option<u64>,
        pub data: Option<String>,
        pub attachment_id: Option<String>,
    }

    /// Response from `users.history.list`
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        #[serde(default)]
        pub history: Vec<HistoryRecord>,
        pub next_page_token: Option<String>,
        pub history_id: Option<String>,
    }

    /// One change record
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: Option<String>,
        #[serde(default)]
        pub messages_added: Vec<HistoryMessage>,
        #[serde(default)]
        pub messages_deleted: Vec<HistoryMessage>,
        #[serde(default)]
        pub labels_added: Vec<HistoryLabelChange>,
        #[serde(default)]
        pub labels_removed: Vec<HistoryLabelChange>,
    }

    #[derive(Debug, Deserialize)]
    pub struct HistoryMessage {
        pub message: MinimalMessage,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryLabelChange {
        pub message: MinimalMessage,
        /// Labels added or removed by this change
        #[serde(default)]
        pub label_ids: Vec<String>,
    }

    /// Message as embedded in history records; `label_ids` is its full current set
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MinimalMessage {
        pub id: String,
        pub thread_id: String,
        #[serde(default)]
        pub label_ids: Vec<String>,
    }

    /// Response from `users.getProfile`
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Profile {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub threads_total: Option<u64>,
        pub history_id: Option<String>,
    }
}
