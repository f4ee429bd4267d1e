//! Test doubles for the transport and provider seams

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use super::http::{HttpRequest, HttpResponse, HttpTransport};
use super::{
    AccountInfo, ChangeSet, ListThreadsOptions, ProviderClient, ProviderError, ThreadPage, ThreadRef,
    TokenSet,
};
use crate::models::{
    AttachmentMeta, EmailAddress, MessageFlags, Provider, ProviderMessage, ProviderThread,
};

/// Replays queued responses for URLs containing a pattern, recording every request
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<Vec<(String, VecDeque<HttpResponse>)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next request whose URL contains `pattern`
    pub fn respond(&self, pattern: &str, response: HttpResponse) {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|(p, _)| p == pattern) {
            Some((_, queue)) => queue.push_back(response),
            None => routes.push((pattern.to_string(), VecDeque::from([response]))),
        }
    }

    pub fn respond_json(&self, pattern: &str, body: serde_json::Value) {
        self.respond(pattern, HttpResponse::new(200, body.to_string()));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

impl HttpTransport for FakeTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());

        let mut routes = self.routes.lock().unwrap();
        // Longest pattern wins so specific routes shadow generic ones
        routes.sort_by_key(|(p, _)| std::cmp::Reverse(p.len()));
        for (pattern, queue) in routes.iter_mut() {
            if request.url.contains(pattern.as_str())
                && let Some(response) = queue.pop_front()
            {
                return Ok(response);
            }
        }

        Ok(HttpResponse::new(
            500,
            format!("no scripted response for {}", request.url),
        ))
    }
}

/// In-memory provider with scripted threads, failures and change feeds
pub struct FakeProvider {
    order: Mutex<Vec<String>>,
    threads: Mutex<HashMap<String, ProviderThread>>,
    failing: Mutex<HashSet<String>>,
    changes: Mutex<Option<Result<ChangeSet, ProviderError>>>,
    refresh_error: Mutex<Option<ProviderError>>,
    tokens: Mutex<TokenSet>,
    cursor: String,
    list_calls: Mutex<Vec<ListThreadsOptions>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(Vec::new()),
            threads: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            changes: Mutex::new(None),
            refresh_error: Mutex::new(None),
            tokens: Mutex::new(TokenSet::new(
                "access",
                "refresh",
                Utc::now() + chrono::Duration::hours(1),
            )),
            cursor: "cursor-1".to_string(),
            list_calls: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_threads(self, threads: Vec<ProviderThread>) -> Self {
        for thread in threads {
            self.add_thread(thread);
        }
        self
    }

    pub fn add_thread(&self, thread: ProviderThread) {
        let id = thread.provider_thread_id.clone();
        let mut order = self.order.lock().unwrap();
        if !order.contains(&id) {
            order.push(id.clone());
        }
        self.threads.lock().unwrap().insert(id, thread);
    }

    /// Listed but gone by fetch time: `get_thread` returns NotFound
    pub fn add_listed_only(&self, id: &str) {
        let mut order = self.order.lock().unwrap();
        if !order.iter().any(|listed| listed == id) {
            order.push(id.to_string());
        }
    }

    /// Listed but not fetchable: `get_thread` fails with a provider error
    pub fn fail_thread(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// Undo `fail_thread`
    pub fn recover_thread(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn set_changes(&self, changes: Result<ChangeSet, ProviderError>) {
        *self.changes.lock().unwrap() = Some(changes);
    }

    pub fn fail_refresh(&self, error: ProviderError) {
        *self.refresh_error.lock().unwrap() = Some(error);
    }

    pub fn set_tokens(&self, tokens: TokenSet) {
        *self.tokens.lock().unwrap() = tokens;
    }

    pub fn list_calls(&self) -> Vec<ListThreadsOptions> {
        self.list_calls.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    fn max_page_size(&self) -> usize {
        2
    }

    fn needs_refresh(&self) -> bool {
        self.tokens.lock().unwrap().needs_refresh(Utc::now())
    }

    fn current_tokens(&self) -> TokenSet {
        self.tokens.lock().unwrap().clone()
    }

    async fn refresh_token(&self) -> Result<TokenSet, ProviderError> {
        if let Some(error) = self.refresh_error.lock().unwrap().clone() {
            return Err(error);
        }
        let mut tokens = self.tokens.lock().unwrap();
        tokens.access_token = format!("{}+", tokens.access_token);
        tokens.expires_at = Utc::now() + chrono::Duration::hours(1);
        Ok(tokens.clone())
    }

    async fn get_account_info(&self) -> Result<AccountInfo, ProviderError> {
        Ok(AccountInfo {
            email: "user@example.com".to_string(),
            ..Default::default()
        })
    }

    async fn list_threads(&self, options: &ListThreadsOptions) -> Result<ThreadPage, ProviderError> {
        self.list_calls.lock().unwrap().push(options.clone());

        let order = self.order.lock().unwrap().clone();
        let start: usize = options
            .page_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let size = options.page_size.clamp(1, self.max_page_size());
        let end = (start + size).min(order.len());

        Ok(ThreadPage {
            threads: order[start..end].iter().map(ThreadRef::new).collect(),
            next_page_token: (end < order.len()).then(|| end.to_string()),
            result_size_estimate: Some(order.len() as u64),
        })
    }

    async fn get_thread(&self, provider_thread_id: &str) -> Result<ProviderThread, ProviderError> {
        self.fetched.lock().unwrap().push(provider_thread_id.to_string());
        if self.failing.lock().unwrap().contains(provider_thread_id) {
            return Err(ProviderError::provider(format!("fetch failed for {}", provider_thread_id)));
        }
        self.threads
            .lock()
            .unwrap()
            .get(provider_thread_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(provider_thread_id.to_string()))
    }

    async fn get_changes(&self, _cursor: &str) -> Result<ChangeSet, ProviderError> {
        self.changes
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(ChangeSet::default()))
    }

    async fn get_initial_cursor(&self) -> Result<String, ProviderError> {
        Ok(self.cursor.clone())
    }
}

/// A thread of `count` messages, newest one day old
pub fn sample_thread(id: &str, count: usize) -> ProviderThread {
    let messages = (0..count)
        .map(|i| {
            ProviderMessage::builder(format!("{}-m{}", id, i))
                .from(EmailAddress::with_name("Sender", format!("sender{}@example.com", i)))
                .to(vec![EmailAddress::new("user@example.com")])
                .subject(format!("Subject {}", id))
                .snippet(format!("Message {} of {}", i, id))
                .labels(vec!["INBOX".to_string()])
                .flags(MessageFlags {
                    in_inbox: true,
                    ..Default::default()
                })
                .sent_at(Utc::now() - chrono::Duration::days(1) - chrono::Duration::hours((count - i) as i64))
                .attachments(if i == 0 {
                    vec![AttachmentMeta {
                        provider_attachment_id: format!("{}-a0", id),
                        filename: "doc.pdf".to_string(),
                        mime_type: "application/pdf".to_string(),
                        size: 1024,
                        content_id: None,
                        is_inline: false,
                    }]
                } else {
                    Vec::new()
                })
                .build()
        })
        .collect();
    ProviderThread::new(id, messages)
}
