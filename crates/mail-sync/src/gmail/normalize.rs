//! Gmail API response normalization
//!
//! Converts Gmail API responses to provider-neutral threads and messages.

use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};

use super::api::{GmailMessage, GmailThread, MessagePart};
use crate::models::{AttachmentMeta, MessageFlags, ProviderMessage, ProviderThread};
use crate::provider::ProviderError;
use crate::provider::address::{parse_address_list, parse_single_address};

/// Normalize a full Gmail thread; messages come back oldest first
pub fn normalize_thread(thread: GmailThread, account_email: &str) -> Result<ProviderThread, ProviderError> {
    if thread.messages.is_empty() {
        return Err(ProviderError::NotFound(format!(
            "Thread {} has no messages",
            thread.id
        )));
    }

    let mut messages: Vec<ProviderMessage> = thread
        .messages
        .iter()
        .map(|m| normalize_message(m, account_email))
        .collect();
    messages.sort_by_key(|m| m.sent_at);

    let snippet = thread
        .snippet
        .as_deref()
        .map(decode_html_entities)
        .unwrap_or_default();

    Ok(ProviderThread::new(thread.id, messages).with_snippet(snippet))
}

/// Normalize a Gmail API message
pub fn normalize_message(gmail_msg: &GmailMessage, account_email: &str) -> ProviderMessage {
    let empty = MessagePart::default();
    let payload = gmail_msg.payload.as_ref().unwrap_or(&empty);

    let from = extract_header(payload, "From").and_then(|s| parse_single_address(&s));
    let to = extract_header(payload, "To")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();
    let cc = extract_header(payload, "Cc")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();
    let bcc = extract_header(payload, "Bcc")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();
    let subject = extract_header(payload, "Subject").unwrap_or_default();

    let message_id_header = extract_header(payload, "Message-ID");
    let in_reply_to = extract_header(payload, "In-Reply-To");
    let references = extract_header(payload, "References")
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let sent_at = message_date(gmail_msg, payload);

    let body_text = find_body(payload, "text/plain");
    let body_html = find_body(payload, "text/html");

    // Prefer the snippet, fall back to the start of the plain body
    let snippet = match gmail_msg.snippet.as_deref() {
        Some(s) if !s.is_empty() => decode_html_entities(s),
        _ => body_text
            .as_deref()
            .map(|t| t.chars().take(200).collect())
            .unwrap_or_default(),
    };

    let labels = gmail_msg.label_ids.clone();
    let account_email = account_email.to_lowercase();
    let is_from_user = labels.iter().any(|l| l == "SENT")
        || from.as_ref().is_some_and(|f| f.email == account_email);

    let mut attachments = Vec::new();
    collect_attachments(payload, &mut attachments);

    let mut builder = ProviderMessage::builder(&gmail_msg.id)
        .to(to)
        .cc(cc)
        .bcc(bcc)
        .subject(subject)
        .snippet(snippet)
        .body_text(body_text)
        .body_html(body_html)
        .threading(message_id_header, in_reply_to, references)
        .flags(flags_from_labels(&labels))
        .labels(labels)
        .size(gmail_msg.size_estimate.unwrap_or(0))
        .sent_at(sent_at)
        .is_from_user(is_from_user)
        .attachments(attachments);

    if let Some(from) = from {
        builder = builder.from(from);
    }

    builder.build()
}

/// Derive message flags from Gmail system labels
pub fn flags_from_labels(labels: &[String]) -> MessageFlags {
    let has = |name: &str| labels.iter().any(|l| l == name);
    MessageFlags {
        is_read: !has("UNREAD"),
        is_starred: has("STARRED"),
        is_draft: has("DRAFT"),
        is_trashed: has("TRASH"),
        in_inbox: has("INBOX"),
    }
}

/// `internalDate` when present, else the `Date` header, else now
fn message_date(gmail_msg: &GmailMessage, payload: &MessagePart) -> DateTime<Utc> {
    gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .or_else(|| {
            extract_header(payload, "Date")
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|d| d.with_timezone(&Utc))
        })
        .unwrap_or_else(Utc::now)
}

/// Extract a header value by name
fn extract_header(part: &MessagePart, name: &str) -> Option<String> {
    part.headers.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

fn is_mime(part: &MessagePart, mime: &str) -> bool {
    part.mime_type.as_deref().is_some_and(|m| m.starts_with(mime))
}

fn is_attachment(part: &MessagePart) -> bool {
    part.filename.as_deref().is_some_and(|f| !f.is_empty())
}

/// First non-attachment body of the given MIME type, depth first
fn find_body(part: &MessagePart, mime: &str) -> Option<String> {
    if is_mime(part, mime)
        && !is_attachment(part)
        && let Some(body) = &part.body
        && let Some(data) = &body.data
        && let Some(text) = decode_base64_body(data)
    {
        return Some(text);
    }

    part.parts.iter().find_map(|p| find_body(p, mime))
}

/// Collect attachment metadata from every part that names a file
fn collect_attachments(part: &MessagePart, out: &mut Vec<AttachmentMeta>) {
    if is_attachment(part)
        && let Some(body) = &part.body
        && let Some(attachment_id) = &body.attachment_id
    {
        let disposition = extract_header(part, "Content-Disposition").unwrap_or_default();
        let content_id = extract_header(part, "Content-ID")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|id| !id.is_empty());

        out.push(AttachmentMeta {
            provider_attachment_id: attachment_id.clone(),
            filename: part.filename.clone().unwrap_or_default(),
            mime_type: part
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: body.size.unwrap_or(0),
            content_id,
            is_inline: disposition.trim_start().to_ascii_lowercase().starts_with("inline"),
        });
    }

    for child in &part.parts {
        collect_attachments(child, out);
    }
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    for decoder in decoders {
        if let Ok(decoded) = decoder.decode(data.trim()) {
            return Some(String::from_utf8_lossy(&decoded).into_owned());
        }
    }

    None
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
