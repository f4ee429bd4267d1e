//! Microsoft Graph HTTP client

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashSet;
use tokio::sync::OnceCell;
use url::Url;

use super::api::{GraphUser, MailFolder, MessagesPage};
use super::normalize::{WellKnownFolders, normalize_conversation};
use crate::models::{Provider, ProviderThread};
use crate::provider::{
    AccountInfo, ApiSession, ChangeSet, ListThreadsOptions, ProviderClient, ProviderError,
    ThreadPage, ThreadRef, TokenSet,
};

/// Fields fetched for full messages
const MESSAGE_FIELDS: &str = "id,conversationId,subject,from,toRecipients,ccRecipients,bccRecipients,body,bodyPreview,isRead,isDraft,flag,categories,parentFolderId,internetMessageId,internetMessageHeaders,receivedDateTime,sentDateTime";

/// Graph API client for one mailbox
pub struct OutlookClient {
    session: ApiSession,
    account_email: String,
    base_url: String,
    folders: OnceCell<WellKnownFolders>,
}

impl OutlookClient {
    pub const BASE_URL: &'static str = "https://graph.microsoft.com/v1.0/me";
    pub const SCOPE: &'static str = "offline_access https://graph.microsoft.com/Mail.Read";
    pub const MAX_PAGE_SIZE: usize = 1000;

    /// Messages fetched per page when loading one conversation
    const CONVERSATION_PAGE_SIZE: usize = 100;

    pub fn token_url(tenant: &str) -> String {
        format!("https://login.microsoftonline.com/{}/oauth2/v2.0/token", tenant)
    }

    pub fn new(session: ApiSession, account_email: impl Into<String>) -> Self {
        Self {
            session,
            account_email: account_email.into(),
            base_url: Self::BASE_URL.to_string(),
            folders: OnceCell::new(),
        }
    }

    /// Point the client at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> String {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        }
    }

    fn initial_delta_url(&self) -> String {
        self.url(
            "/mailFolders/inbox/messages/delta",
            &[("$select", "id,conversationId".to_string())],
        )
    }

    /// Resolve the well-known folder ids once per client
    async fn folders(&self) -> Result<&WellKnownFolders, ProviderError> {
        self.folders
            .get_or_try_init(|| async {
                let inbox = self.folder_id("inbox").await?;
                let deleted_items = self.folder_id("deleteditems").await?;
                let sent_items = self.folder_id("sentitems").await?;
                Ok(WellKnownFolders {
                    inbox,
                    deleted_items,
                    sent_items,
                })
            })
            .await
    }

    async fn folder_id(&self, well_known: &str) -> Result<String, ProviderError> {
        let url = self.url(
            &format!("/mailFolders/{}", well_known),
            &[("$select", "id".to_string())],
        );
        let folder: MailFolder = self.session.get_json(&url).await?;
        Ok(folder.id)
    }

    /// Accept a server-issued paging or delta link only if it points back at
    /// the API host; the session attaches the bearer token to it
    fn checked_link(&self, link: &str) -> Result<String, ProviderError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::provider(format!("Invalid base URL {}: {}", self.base_url, e)))?;
        let target = Url::parse(link)
            .map_err(|e| ProviderError::provider(format!("Invalid Graph link {}: {}", link, e)))?;
        if target.scheme() != base.scheme() || target.host_str() != base.host_str() {
            return Err(ProviderError::provider(format!(
                "Graph link points outside {}: {}",
                base.host_str().unwrap_or_default(),
                link
            )));
        }
        Ok(link.to_string())
    }

    /// Whether a change-feed failure means the delta link is no longer usable
    fn is_expired_delta(error: &ProviderError) -> bool {
        match error {
            ProviderError::NotFound(_) => true,
            ProviderError::Provider { message, .. } => {
                message.contains("syncStateNotFound")
                    || message.contains("resyncRequired")
                    || message.contains("SyncStateNotFound")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ProviderClient for OutlookClient {
    fn provider(&self) -> Provider {
        Provider::Outlook
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
        let url = self.url("", &[("$select", "mail,userPrincipalName,displayName".to_string())]);
        let user: GraphUser = self.session.get_json(&url).await?;
        Ok(AccountInfo {
            email: user
                .mail
                .or(user.user_principal_name)
                .unwrap_or_else(|| self.account_email.clone()),
            display_name: user.display_name,
            messages_total: None,
            threads_total: None,
        })
    }

    async fn list_threads(&self, options: &ListThreadsOptions) -> Result<ThreadPage, ProviderError> {
        // The next link already carries every query option
        let url = match &options.page_token {
            Some(next_link) => self.checked_link(next_link)?,
            None => {
                let mut params = vec![
                    ("$select", "id,conversationId,receivedDateTime".to_string()),
                    (
                        "$top",
                        options.page_size.clamp(1, Self::MAX_PAGE_SIZE).to_string(),
                    ),
                    ("$orderby", "receivedDateTime desc".to_string()),
                ];
                let mut filters = Vec::new();
                if let Some(after) = options.after {
                    filters.push(format!(
                        "receivedDateTime ge {}",
                        after.format("%Y-%m-%dT%H:%M:%SZ")
                    ));
                }
                if let Some(before) = options.before {
                    filters.push(format!(
                        "receivedDateTime lt {}",
                        before.format("%Y-%m-%dT%H:%M:%SZ")
                    ));
                }
                if !filters.is_empty() {
                    params.push(("$filter", filters.join(" and ")));
                }
                self.url("/messages", &params)
            }
        };

        let page: MessagesPage = self.session.get_json(&url).await?;

        let mut seen = HashSet::new();
        let threads = page
            .value
            .into_iter()
            .filter_map(|m| m.conversation_id)
            .filter(|id| seen.insert(id.clone()))
            .map(ThreadRef::new)
            .collect();

        Ok(ThreadPage {
            threads,
            next_page_token: page.next_link,
            result_size_estimate: None,
        })
    }

    async fn get_thread(&self, provider_thread_id: &str) -> Result<ProviderThread, ProviderError> {
        let folders = self.folders().await?;

        let mut url = self.url(
            "/messages",
            &[
                (
                    "$filter",
                    format!("conversationId eq '{}'", provider_thread_id.replace('\'', "''")),
                ),
                ("$select", MESSAGE_FIELDS.to_string()),
                (
                    "$expand",
                    "attachments($select=id,name,contentType,size,isInline)".to_string(),
                ),
                ("$top", Self::CONVERSATION_PAGE_SIZE.to_string()),
            ],
        );

        let mut messages = Vec::new();
        loop {
            let page: MessagesPage = self.session.get_json(&url).await?;
            messages.extend(page.value);
            match page.next_link {
                Some(next) => url = self.checked_link(&next)?,
                None => break,
            }
        }

        normalize_conversation(provider_thread_id, &messages, folders, &self.account_email)
    }

    async fn get_changes(&self, cursor: &str) -> Result<ChangeSet, ProviderError> {
        let mut changed = Vec::new();
        let mut seen = HashSet::new();
        let mut removed = 0usize;
        let mut delta_link = None;
        let mut url = match self.checked_link(cursor) {
            Ok(url) => url,
            Err(e) => {
                warn!("[OUTLOOK] Stored delta link unusable, full sync required: {}", e);
                return Ok(ChangeSet::full_sync_required());
            }
        };

        loop {
            let page: MessagesPage = match self.session.get_json(&url).await {
                Ok(page) => page,
                Err(e) if Self::is_expired_delta(&e) => {
                    info!("[OUTLOOK] Delta link expired, full sync required: {}", e);
                    return Ok(ChangeSet::full_sync_required());
                }
                Err(e) => return Err(e),
            };

            for message in page.value {
                if message.removed.is_some() {
                    removed += 1;
                    continue;
                }
                if let Some(conversation_id) = message.conversation_id
                    && seen.insert(conversation_id.clone())
                {
                    changed.push(conversation_id);
                }
            }

            if let Some(link) = page.delta_link {
                delta_link = Some(self.checked_link(&link)?);
            }
            match page.next_link {
                Some(next) => url = self.checked_link(&next)?,
                None => break,
            }
        }

        if removed > 0 {
            // Removed entries carry only a message id, so the owning thread is unknown
            debug!(
                "[OUTLOOK] {} messages left the inbox; not mapped to thread deletions",
                removed
            );
        }

        Ok(ChangeSet {
            new_cursor: Some(delta_link.unwrap_or_else(|| cursor.to_string())),
            changed_thread_ids: changed,
            deleted_thread_ids: Vec::new(),
            label_updates: Vec::new(),
            full_sync_required: false,
        })
    }

    async fn get_initial_cursor(&self) -> Result<String, ProviderError> {
        let mut url = self.initial_delta_url();
        let mut pages = 0;

        loop {
            let page: MessagesPage = self.session.get_json(&url).await?;
            pages += 1;
            if let Some(delta_link) = page.delta_link {
                debug!("[OUTLOOK] Delta baseline captured after {} pages", pages);
                return self.checked_link(&delta_link);
            }
            match page.next_link {
                Some(next) => url = self.checked_link(&next)?,
                None => {
                    return Err(ProviderError::provider(
                        "Delta feed ended without a deltaLink",
                    ));
                }
            }
        }
    }
}
