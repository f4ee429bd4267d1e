//! Gmail API HTTP client
//!
//! Threads are native in Gmail; incremental sync reads the History API with the
//! last stored `historyId` as the cursor.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, HashSet};

use super::api::{GmailThread, HistoryResponse, ListThreadsResponse, Profile};
use super::normalize::{flags_from_labels, normalize_thread};
use crate::models::{Provider, ProviderThread};
use crate::provider::{
    AccountInfo, ApiSession, ChangeSet, LabelUpdate, ListThreadsOptions, ProviderClient,
    ProviderError, ThreadPage, ThreadRef, TokenSet,
};

/// Gmail API client for one mailbox
pub struct GmailClient {
    session: ApiSession,
    account_email: String,
    base_url: String,
}

impl GmailClient {
    /// Gmail API base URL
    pub const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1/users/me";
    pub const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    pub const MAX_PAGE_SIZE: usize = 500;

    pub fn new(session: ApiSession, account_email: impl Into<String>) -> Self {
        Self {
            session,
            account_email: account_email.into(),
            base_url: Self::BASE_URL.to_string(),
        }
    }

    /// Point the client at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn threads_url(&self, options: &ListThreadsOptions) -> String {
        let page_size = options.page_size.clamp(1, Self::MAX_PAGE_SIZE);
        let mut url = format!("{}/threads?maxResults={}", self.base_url, page_size);

        let mut query = Vec::new();
        if let Some(after) = options.after {
            query.push(format!("after:{}", after.timestamp()));
        }
        if let Some(before) = options.before {
            query.push(format!("before:{}", before.timestamp()));
        }
        if !query.is_empty() {
            url.push_str(&format!("&q={}", urlencoding::encode(&query.join(" "))));
        }
        if let Some(token) = &options.page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        url
    }

    /// List one page of history since a given historyId
    async fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse, ProviderError> {
        let mut url = format!(
            "{}/history?startHistoryId={}&historyTypes=messageAdded&historyTypes=messageDeleted&historyTypes=labelAdded&historyTypes=labelRemoved",
            self.base_url,
            urlencoding::encode(start_history_id)
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        self.session.get_json(&url).await
    }

    async fn get_profile(&self) -> Result<Profile, ProviderError> {
        self.session
            .get_json(&format!("{}/profile", self.base_url))
            .await
    }
}

#[async_trait]
impl ProviderClient for GmailClient {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    fn max_page_size(&self) -> usize {
        Self::MAX_PAGE_SIZE
    }

    fn needs_refresh(&self) -> bool {
        self.session.tokens().needs_refresh()
    }

    fn current_tokens(&self) -> TokenSet {
        self.session.current_tokens()
    }

    async fn refresh_token(&self) -> Result<TokenSet, ProviderError> {
        self.session.tokens().refresh().await
    }

    async fn get_account_info(&self) -> Result<AccountInfo, ProviderError> {
        let profile = self.get_profile().await?;
        Ok(AccountInfo {
            email: profile.email_address,
            display_name: None,
            messages_total: profile.messages_total,
            threads_total: profile.threads_total,
        })
    }

    async fn list_threads(&self, options: &ListThreadsOptions) -> Result<ThreadPage, ProviderError> {
        let response: ListThreadsResponse = self.session.get_json(&self.threads_url(options)).await?;

        Ok(ThreadPage {
            threads: response
                .threads
                .into_iter()
                .map(|t| ThreadRef {
                    provider_thread_id: t.id,
                    snippet: t.snippet,
                })
                .collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
            result_size_estimate: response.result_size_estimate,
        })
    }

    async fn get_thread(&self, provider_thread_id: &str) -> Result<ProviderThread, ProviderError> {
        let url = format!(
            "{}/threads/{}?format=full",
            self.base_url,
            urlencoding::encode(provider_thread_id)
        );
        let thread: GmailThread = self.session.get_json(&url).await?;
        normalize_thread(thread, &self.account_email)
    }

    async fn get_changes(&self, cursor: &str) -> Result<ChangeSet, ProviderError> {
        let mut changed: Vec<String> = Vec::new();
        let mut changed_set: HashSet<String> = HashSet::new();
        // message id -> (thread id, current labels); later records win
        let mut label_changes: HashMap<String, (String, Vec<String>)> = HashMap::new();
        let mut label_order: Vec<String> = Vec::new();

        let mut latest_history_id = None;
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = match self.list_history(cursor, page_token.as_deref()).await {
                Ok(page) => page,
                Err(e) if e.is_not_found() => {
                    info!("[GMAIL] History {} expired, full sync required", cursor);
                    return Ok(ChangeSet::full_sync_required());
                }
                Err(e) => return Err(e),
            };
            pages += 1;

            for record in page.history {
                for added in record.messages_added {
                    if changed_set.insert(added.message.thread_id.clone()) {
                        changed.push(added.message.thread_id);
                    }
                }
                // The rest of the thread may still exist; refetching settles it,
                // and a thread that is entirely gone comes back NotFound
                for removed in record.messages_deleted {
                    if changed_set.insert(removed.message.thread_id.clone()) {
                        changed.push(removed.message.thread_id);
                    }
                }
                for change in record.labels_added.into_iter().chain(record.labels_removed) {
                    let message = change.message;
                    if !label_changes.contains_key(&message.id) {
                        label_order.push(message.id.clone());
                    }
                    label_changes.insert(message.id, (message.thread_id, message.label_ids));
                }
            }

            if page.history_id.is_some() {
                latest_history_id = page.history_id;
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        let label_updates = label_order
            .into_iter()
            .filter_map(|message_id| {
                let (thread_id, labels) = label_changes.remove(&message_id)?;
                if changed_set.contains(&thread_id) {
                    return None;
                }
                Some(LabelUpdate {
                    provider_thread_id: thread_id,
                    provider_message_id: message_id,
                    flags: flags_from_labels(&labels),
                    labels,
                })
            })
            .collect::<Vec<_>>();

        debug!(
            "[GMAIL] History since {}: {} pages, {} changed, {} label updates",
            cursor,
            pages,
            changed.len(),
            label_updates.len()
        );

        Ok(ChangeSet {
            new_cursor: Some(latest_history_id.unwrap_or_else(|| cursor.to_string())),
            changed_thread_ids: changed,
            deleted_thread_ids: Vec::new(),
            label_updates,
            full_sync_required: false,
        })
    }

    async fn get_initial_cursor(&self) -> Result<String, ProviderError> {
        self.get_profile()
            .await?
            .history_id
            .ok_or_else(|| ProviderError::provider("Gmail profile has no historyId"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::provider::fake::FakeTransport;
    use crate::provider::http::{HttpResponse, RetryPolicy};
    use crate::provider::token::{OAuthEndpoint, TokenManager};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn client(transport: Arc<FakeTransport>) -> GmailClient {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tokens = TokenManager::new(
            TokenSet::new("access", "refresh", clock.now() + chrono::Duration::hours(1)),
            OAuthEndpoint {
                token_url: GmailClient::TOKEN_URL.to_string(),
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                scope: None,
            },
            transport.clone(),
            clock,
        );
        let session = ApiSession::new(transport, tokens, RetryPolicy::none());
        GmailClient::new(session, "me@example.com")
    }

    #[tokio::test]
    async fn test_list_threads_builds_date_query() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_json(
            "/threads?",
            json!({
                "threads": [{"id": "t1", "snippet": "hi"}, {"id": "t2"}],
                "nextPageToken": "page-2",
                "resultSizeEstimate": 42
            }),
        );

        let options = ListThreadsOptions {
            page_size: 1000,
            page_token: None,
            after: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            before: Some(Utc.timestamp_opt(1_710_000_000, 0).unwrap()),
        };
        let page = client(transport.clone()).list_threads(&options).await.unwrap();

        assert_eq!(page.threads.len(), 2);
        assert_eq!(page.threads[0].snippet.as_deref(), Some("hi"));
        assert_eq!(page.next_page_token.as_deref(), Some("page-2"));
        assert_eq!(page.result_size_estimate, Some(42));

        let url = &transport.urls()[0];
        assert!(url.contains("maxResults=500"));
        assert!(url.contains("q=after%3A1700000000%20before%3A1710000000"));
    }

    #[tokio::test]
    async fn test_get_thread_normalizes_messages() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_json(
            "/threads/t1",
            json!({
                "id": "t1",
                "snippet": "Latest",
                "messages": [{
                    "id": "m1",
                    "threadId": "t1",
                    "labelIds": ["SENT"],
                    "internalDate": "1700000000000",
                    "payload": {
                        "mimeType": "text/plain",
                        "headers": [
                            {"name": "From", "value": "Me <me@example.com>"},
                            {"name": "Subject", "value": "Hi"}
                        ],
                        "body": {"size": 5, "data": "aGVsbG8"}
                    }
                }]
            }),
        );

        let thread = client(transport.clone()).get_thread("t1").await.unwrap();
        assert_eq!(thread.provider_thread_id, "t1");
        assert_eq!(thread.messages.len(), 1);
        assert_eq!(thread.messages[0].body_text.as_deref(), Some("hello"));
        assert!(thread.messages[0].is_from_user);
        assert!(transport.urls()[0].ends_with("/threads/t1?format=full"));
    }

    #[tokio::test]
    async fn test_get_thread_not_found() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("/threads/gone", HttpResponse::new(404, "Requested entity was not found."));

        let err = client(transport).get_thread("gone").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_changes_collects_all_pages() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_json(
            "startHistoryId=100",
            json!({
                "history": [
                    {"messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]},
                    {"messagesDeleted": [{"message": {"id": "m2", "threadId": "t2"}}]},
                    {"messagesDeleted": [{"message": {"id": "m3", "threadId": "t1"}}]}
                ],
                "nextPageToken": "next",
                "historyId": "150"
            }),
        );
        transport.respond_json(
            "pageToken=next",
            json!({
                "history": [
                    {"labelsRemoved": [{"message": {"id": "m4", "threadId": "t3", "labelIds": ["INBOX"]}, "labelIds": ["UNREAD"]}]},
                    {"labelsAdded": [{"message": {"id": "m4", "threadId": "t3", "labelIds": ["INBOX", "STARRED"]}, "labelIds": ["STARRED"]}]},
                    {"labelsAdded": [{"message": {"id": "m5", "threadId": "t1", "labelIds": ["STARRED"]}, "labelIds": ["STARRED"]}]},
                    {"messagesAdded": [{"message": {"id": "m6", "threadId": "t1"}}]}
                ],
                "historyId": "200"
            }),
        );

        let changes = client(transport).get_changes("100").await.unwrap();
        assert!(!changes.full_sync_required);
        assert_eq!(changes.new_cursor.as_deref(), Some("200"));
        // Deleting a message refetches its thread instead of trashing it
        assert_eq!(changes.changed_thread_ids, vec!["t1", "t2"]);
        assert!(changes.deleted_thread_ids.is_empty());

        assert_eq!(changes.label_updates.len(), 1);
        let update = &changes.label_updates[0];
        assert_eq!(update.provider_thread_id, "t3");
        assert_eq!(update.labels, vec!["INBOX", "STARRED"]);
        assert!(update.flags.is_starred);
        assert!(update.flags.is_read);
    }

    #[tokio::test]
    async fn test_get_changes_without_records_keeps_cursor() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_json("startHistoryId=100", json!({}));

        let changes = client(transport).get_changes("100").await.unwrap();
        assert_eq!(changes.new_cursor.as_deref(), Some("100"));
        assert!(changes.changed_thread_ids.is_empty());
    }

    #[tokio::test]
    async fn test_expired_history_requires_full_sync() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond("startHistoryId=1", HttpResponse::new(404, "not found"));

        let changes = client(transport).get_changes("1").await.unwrap();
        assert!(changes.full_sync_required);
        assert!(changes.new_cursor.is_none());
    }

    #[tokio::test]
    async fn test_initial_cursor_and_account_info() {
        let transport = Arc::new(FakeTransport::new());
        let profile = json!({
            "emailAddress": "me@example.com",
            "messagesTotal": 10,
            "threadsTotal": 4,
            "historyId": "987"
        });
        transport.respond_json("/profile", profile.clone());
        transport.respond_json("/profile", profile);

        let client = client(transport);
        assert_eq!(client.get_initial_cursor().await.unwrap(), "987");
        let info = client.get_account_info().await.unwrap();
        assert_eq!(info.email, "me@example.com");
        assert_eq!(info.threads_total, Some(4));
    }
}
