//! Message model: the provider-normalized email plus its persisted record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address, lower-cased (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into().trim().to_lowercase(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into().trim().to_lowercase(),
        }
    }

    /// Parse a single address like `"Doe, John" <john@example.com>`,
    /// `John Doe <john@example.com>`, `<john@example.com>` or a bare address.
    ///
    /// Returns `None` for empty input.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let email = s[angle_start + 1..angle_end].trim();
            if email.is_empty() {
                return None;
            }
            let name = unquote(s[..angle_start].trim());
            return Some(Self {
                name: if name.is_empty() { None } else { Some(name) },
                email: email.to_lowercase(),
            });
        }

        Some(Self::new(unquote(s)))
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Strip surrounding double quotes and unescape `\"` / `\\`
fn unquote(s: &str) -> String {
    let inner = s
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out.trim().to_string()
}

/// Per-message state flags derived from provider labels/fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
    pub is_trashed: bool,
    /// Whether the message currently sits in the inbox
    pub in_inbox: bool,
}

/// Attachment metadata (binary content is never fetched at ingestion time)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub provider_attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

/// Envelope role of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    From,
    To,
    Cc,
    Bcc,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::From => "from",
            ParticipantRole::To => "to",
            ParticipantRole::Cc => "cc",
            ParticipantRole::Bcc => "bcc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "from" => Some(ParticipantRole::From),
            "to" => Some(ParticipantRole::To),
            "cc" => Some(ParticipantRole::Cc),
            "bcc" => Some(ParticipantRole::Bcc),
            _ => None,
        }
    }
}

/// One (role, address) pair of a message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub role: ParticipantRole,
    pub email: String,
    pub name: Option<String>,
}

/// A fully normalized message as returned by a provider client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMessage {
    /// Provider-native message ID
    pub provider_message_id: String,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    /// Short plain-text preview
    pub snippet: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// RFC 5322 Message-ID header
    pub message_id_header: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Provider labels (Gmail label ids, Outlook categories)
    pub labels: Vec<String>,
    pub flags: MessageFlags,
    /// Size in bytes as reported by the provider
    pub size: u64,
    pub sent_at: DateTime<Utc>,
    /// Whether the connected mailbox sent this message
    pub is_from_user: bool,
    pub attachments: Vec<AttachmentMeta>,
}

impl ProviderMessage {
    /// Create a new message builder
    pub fn builder(provider_message_id: impl Into<String>) -> ProviderMessageBuilder {
        ProviderMessageBuilder::new(provider_message_id.into())
    }

    /// Envelope participants, one per (role, email)
    pub fn participants(&self) -> Vec<Participant> {
        let mut seen = HashSet::new();
        let mut participants = Vec::new();

        let roles = self
            .from
            .iter()
            .map(|a| (ParticipantRole::From, a))
            .chain(self.to.iter().map(|a| (ParticipantRole::To, a)))
            .chain(self.cc.iter().map(|a| (ParticipantRole::Cc, a)))
            .chain(self.bcc.iter().map(|a| (ParticipantRole::Bcc, a)));

        for (role, addr) in roles {
            if addr.email.is_empty() || !seen.insert((role, addr.email.clone())) {
                continue;
            }
            participants.push(Participant {
                role,
                email: addr.email.clone(),
                name: addr.name.clone(),
            });
        }

        participants
    }
}

/// Builder for creating ProviderMessage instances
pub struct ProviderMessageBuilder {
    message: ProviderMessage,
}

impl ProviderMessageBuilder {
    fn new(provider_message_id: String) -> Self {
        Self {
            message: ProviderMessage {
                provider_message_id,
                from: None,
                to: Vec::new(),
                cc: Vec::new(),
                bcc: Vec::new(),
                subject: String::new(),
                snippet: String::new(),
                body_text: None,
                body_html: None,
                message_id_header: None,
                in_reply_to: None,
                references: Vec::new(),
                labels: Vec::new(),
                flags: MessageFlags::default(),
                size: 0,
                sent_at: Utc::now(),
                is_from_user: false,
                attachments: Vec::new(),
            },
        }
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.message.from = Some(from);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.message.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.message.cc = cc;
        self
    }

    pub fn bcc(mut self, bcc: Vec<EmailAddress>) -> Self {
        self.message.bcc = bcc;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.message.subject = subject.into();
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.message.snippet = snippet.into();
        self
    }

    pub fn body_text(mut self, body_text: Option<String>) -> Self {
        self.message.body_text = body_text;
        self
    }

    pub fn body_html(mut self, body_html: Option<String>) -> Self {
        self.message.body_html = body_html;
        self
    }

    pub fn threading(
        mut self,
        message_id_header: Option<String>,
        in_reply_to: Option<String>,
        references: Vec<String>,
    ) -> Self {
        self.message.message_id_header = message_id_header;
        self.message.in_reply_to = in_reply_to;
        self.message.references = references;
        self
    }

    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.message.labels = labels;
        self
    }

    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.message.flags = flags;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.message.size = size;
        self
    }

    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.message.sent_at = sent_at;
        self
    }

    pub fn is_from_user(mut self, is_from_user: bool) -> Self {
        self.message.is_from_user = is_from_user;
        self
    }

    pub fn attachments(mut self, attachments: Vec<AttachmentMeta>) -> Self {
        self.message.attachments = attachments;
        self
    }

    pub fn build(self) -> ProviderMessage {
        self.message
    }
}

/// A persisted message row
///
/// Envelope and body are immutable after insert; only `labels` and `flags`
/// change on later syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub thread_id: i64,
    pub provider_message_id: String,
    pub subject: String,
    pub from: Option<EmailAddress>,
    pub sent_at: DateTime<Utc>,
    pub labels: Vec<String>,
    pub flags: MessageFlags,
    pub size: u64,
    pub is_from_user: bool,
}
