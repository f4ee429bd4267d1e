//! Microsoft Graph (Outlook) integration
//!
//! Graph has no native thread resource: messages are grouped client-side by
//! `conversationId`, and incremental sync follows the Inbox delta feed.

mod client;
mod normalize;

pub use client::OutlookClient;
pub use normalize::{WellKnownFolders, normalize_message, normalize_conversation};

/// Graph API response types
pub mod api {
    use serde::Deserialize;

    /// A page of messages from `/messages` or a delta feed
    #[derive(Debug, Default, Deserialize)]
    pub struct MessagesPage {
        #[serde(default)]
        pub value: Vec<GraphMessage>,
        #[serde(rename = "@odata.nextLink")]
        pub next_link: Option<String>,
        #[serde(rename = "@odata.deltaLink")]
        pub delta_link: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GraphMessage {
        pub id: Option<String>,
        pub conversation_id: Option<String>,
        pub subject: Option<String>,
        pub from: Option<GraphRecipient>,
        #[serde(default)]
        pub to_recipients: Vec<GraphRecipient>,
        #[serde(default)]
        pub cc_recipients: Vec<GraphRecipient>,
        #[serde(default)]
        pub bcc_recipients: Vec<GraphRecipient>,
        pub body: Option<GraphBody>,
        pub body_preview: Option<String>,
        pub is_read: Option<bool>,
        pub is_draft: Option<bool>,
        pub flag: Option<GraphFlag>,
        #[serde(default)]
        pub categories: Vec<String>,
        pub parent_folder_id: Option<String>,
        pub internet_message_id: Option<String>,
        #[serde(default)]
        pub internet_message_headers: Vec<GraphHeader>,
        pub received_date_time: Option<String>,
        pub sent_date_time: Option<String>,
        #[serde(default)]
        pub attachments: Vec<GraphAttachment>,
        /// Present on delta entries for messages that left the folder
        #[serde(rename = "@removed")]
        pub removed: Option<GraphRemoved>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GraphRecipient {
        pub email_address: Option<GraphEmailAddress>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct GraphEmailAddress {
        pub name: Option<String>,
        pub address: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GraphBody {
        /// `text` or `html`
        pub content_type: Option<String>,
        pub content: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GraphFlag {
        pub flag_status: Option<String>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct GraphHeader {
        pub name: String,
        pub value: String,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GraphAttachment {
        pub id: Option<String>,
        pub name: Option<String>,
        pub content_type: Option<String>,
        pub size: Option<u64>,
        pub is_inline: Option<bool>,
        pub content_id: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct GraphRemoved {
        pub reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct MailFolder {
        pub id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GraphUser {
        pub mail: Option<String>,
        pub user_principal_name: Option<String>,
        pub display_name: Option<String>,
    }
}
