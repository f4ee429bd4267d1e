//! Graph message normalization and conversation grouping

use chrono::{DateTime, Utc};

use super::api::{GraphMessage, GraphRecipient};
use crate::models::{AttachmentMeta, EmailAddress, MessageFlags, ProviderMessage, ProviderThread};
use crate::provider::ProviderError;

/// Ids of the folders that decide inbox/trash/sent state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WellKnownFolders {
    pub inbox: String,
    pub deleted_items: String,
    pub sent_items: String,
}

/// Build one thread from every message of a conversation, oldest first
pub fn normalize_conversation(
    conversation_id: &str,
    messages: &[GraphMessage],
    folders: &WellKnownFolders,
    account_email: &str,
) -> Result<ProviderThread, ProviderError> {
    let mut normalized: Vec<ProviderMessage> = messages
        .iter()
        .filter(|m| m.removed.is_none())
        .filter_map(|m| normalize_message(m, folders, account_email))
        .collect();

    if normalized.is_empty() {
        return Err(ProviderError::NotFound(format!(
            "Conversation {} has no messages",
            conversation_id
        )));
    }

    normalized.sort_by_key(|m| m.sent_at);
    let snippet = normalized
        .last()
        .map(|m| m.snippet.clone())
        .unwrap_or_default();

    Ok(ProviderThread::new(conversation_id, normalized).with_snippet(snippet))
}

/// Normalize one Graph message; entries without an id are skipped
pub fn normalize_message(
    msg: &GraphMessage,
    folders: &WellKnownFolders,
    account_email: &str,
) -> Option<ProviderMessage> {
    let id = msg.id.as_deref().filter(|id| !id.is_empty())?;

    let from = msg.from.as_ref().and_then(to_address);
    let to = msg.to_recipients.iter().filter_map(to_address).collect();
    let cc = msg.cc_recipients.iter().filter_map(to_address).collect();
    let bcc = msg.bcc_recipients.iter().filter_map(to_address).collect();

    let (body_text, body_html) = match &msg.body {
        Some(body) => {
            let content = body.content.clone().filter(|c| !c.is_empty());
            if body
                .content_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("html"))
            {
                (None, content)
            } else {
                (content, None)
            }
        }
        None => (None, None),
    };

    let folder = msg.parent_folder_id.as_deref().unwrap_or_default();
    let in_folder = |id: &str| !id.is_empty() && folder == id;

    let flags = MessageFlags {
        is_read: msg.is_read.unwrap_or(false),
        is_starred: msg
            .flag
            .as_ref()
            .and_then(|f| f.flag_status.as_deref())
            .is_some_and(|s| s.eq_ignore_ascii_case("flagged")),
        is_draft: msg.is_draft.unwrap_or(false),
        is_trashed: in_folder(&folders.deleted_items),
        in_inbox: in_folder(&folders.inbox),
    };

    let account_email = account_email.to_lowercase();
    let is_from_user = in_folder(&folders.sent_items)
        || from.as_ref().is_some_and(|f: &EmailAddress| f.email == account_email);

    let header = |name: &str| {
        msg.internet_message_headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.trim().to_string())
    };
    let references = header("References")
        .map(|r| r.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let attachments: Vec<AttachmentMeta> = msg
        .attachments
        .iter()
        .filter_map(|a| {
            Some(AttachmentMeta {
                provider_attachment_id: a.id.clone()?,
                filename: a.name.clone().unwrap_or_default(),
                mime_type: a
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: a.size.unwrap_or(0),
                content_id: a.content_id.clone().filter(|c| !c.is_empty()),
                is_inline: a.is_inline.unwrap_or(false),
            })
        })
        .collect();

    // Graph v1.0 exposes no message size; approximate from body and attachments
    let size = msg
        .body
        .as_ref()
        .and_then(|b| b.content.as_ref())
        .map(|c| c.len() as u64)
        .unwrap_or(0)
        + attachments.iter().map(|a| a.size).sum::<u64>();

    let mut builder = ProviderMessage::builder(id)
        .to(to)
        .cc(cc)
        .bcc(bcc)
        .subject(msg.subject.clone().unwrap_or_default())
        .snippet(msg.body_preview.clone().unwrap_or_default())
        .body_text(body_text)
        .body_html(body_html)
        .threading(msg.internet_message_id.clone(), header("In-Reply-To"), references)
        .labels(msg.categories.clone())
        .flags(flags)
        .size(size)
        .sent_at(message_date(msg))
        .is_from_user(is_from_user)
        .attachments(attachments);

    if let Some(from) = from {
        builder = builder.from(from);
    }

    Some(builder.build())
}

fn to_address(recipient: &GraphRecipient) -> Option<EmailAddress> {
    let email = recipient.email_address.as_ref()?;
    let address = email.address.as_deref().map(str::trim).filter(|a| !a.is_empty())?;
    match email.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => Some(EmailAddress::with_name(name, address)),
        None => Some(EmailAddress::new(address)),
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value?).ok().map(|d| d.with_timezone(&Utc))
}

fn message_date(msg: &GraphMessage) -> DateTime<Utc> {
    parse_timestamp(msg.received_date_time.as_deref())
        .or_else(|| parse_timestamp(msg.sent_date_time.as_deref()))
        .unwrap_or_else(Utc::now)
}
