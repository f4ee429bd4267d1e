//! Shared fixtures: a scripted provider and an orchestrator harness

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mail_sync::provider::AccountInfo;
use mail_sync::{
    Account, AesGcmCipher, ChangeSet, Clock, EmailAddress, ListThreadsOptions, ManualClock,
    MessageFlags, Provider, ProviderClient, ProviderError, ProviderFactory, ProviderMessage,
    ProviderThread, SyncConfig, SyncOrchestrator, SyncStore, ThreadPage, ThreadRef, TokenSet,
};

pub const PAGE_SIZE: usize = 3;

/// Provider that serves a fixed mailbox, filtering listings by date like the
/// real APIs do
pub struct ScriptedProvider {
    threads: Mutex<Vec<ProviderThread>>,
    failing: Mutex<HashSet<String>>,
    changes: Mutex<Option<Result<ChangeSet, ProviderError>>>,
    changes_delay: Mutex<Option<Duration>>,
    tokens: Mutex<TokenSet>,
    cursors: AtomicUsize,
    get_thread_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(threads: Vec<ProviderThread>) -> Self {
        Self {
            threads: Mutex::new(threads),
            failing: Mutex::new(HashSet::new()),
            changes: Mutex::new(None),
            changes_delay: Mutex::new(None),
            tokens: Mutex::new(valid_tokens()),
            cursors: AtomicUsize::new(0),
            get_thread_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_thread(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn recover_thread(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn set_changes(&self, changes: Result<ChangeSet, ProviderError>) {
        *self.changes.lock().unwrap() = Some(changes);
    }

    /// Make `get_changes` take this long
    pub fn delay_changes(&self, delay: Duration) {
        *self.changes_delay.lock().unwrap() = Some(delay);
    }

    pub fn push_thread(&self, thread: ProviderThread) {
        self.threads.lock().unwrap().push(thread);
    }

    pub fn get_thread_calls(&self) -> usize {
        self.get_thread_calls.load(Ordering::SeqCst)
    }

    fn latest(thread: &ProviderThread) -> Option<DateTime<Utc>> {
        thread.messages.iter().map(|m| m.sent_at).max()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    fn max_page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn needs_refresh(&self) -> bool {
        false
    }

    fn current_tokens(&self) -> TokenSet {
        self.tokens.lock().unwrap().clone()
    }

    async fn refresh_token(&self) -> Result<TokenSet, ProviderError> {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.access_token.push('+');
        Ok(tokens.clone())
    }

    async fn get_account_info(&self) -> Result<AccountInfo, ProviderError> {
        Ok(AccountInfo {
            email: "owner@example.com".to_string(),
            ..Default::default()
        })
    }

    async fn list_threads(&self, options: &ListThreadsOptions) -> Result<ThreadPage, ProviderError> {
        let matching: Vec<String> = self
            .threads
            .lock()
            .unwrap()
            .iter()
            .filter(|t| {
                let Some(latest) = Self::latest(t) else {
                    return false;
                };
                options.after.is_none_or(|after| latest >= after)
                    && options.before.is_none_or(|before| latest < before)
            })
            .map(|t| t.provider_thread_id.clone())
            .collect();

        let start: usize = options
            .page_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let end = (start + options.page_size.clamp(1, PAGE_SIZE)).min(matching.len());

        Ok(ThreadPage {
            threads: matching[start..end].iter().map(ThreadRef::new).collect(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
            result_size_estimate: Some(matching.len() as u64),
        })
    }

    async fn get_thread(&self, provider_thread_id: &str) -> Result<ProviderThread, ProviderError> {
        self.get_thread_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(provider_thread_id) {
            return Err(ProviderError::provider("backend unavailable"));
        }
        self.threads
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.provider_thread_id == provider_thread_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(provider_thread_id.to_string()))
    }

    async fn get_changes(&self, _cursor: &str) -> Result<ChangeSet, ProviderError> {
        let delay = *self.changes_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.changes.lock().unwrap().clone();
        scripted.unwrap_or_else(|| Ok(ChangeSet::default()))
    }

    async fn get_initial_cursor(&self) -> Result<String, ProviderError> {
        let n = self.cursors.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("delta-{}", n))
    }
}

/// Hands out the same scripted client for every account
pub struct ScriptedFactory(pub Arc<ScriptedProvider>);

impl ProviderFactory for ScriptedFactory {
    fn create(&self, _account: &Account, _tokens: TokenSet) -> anyhow::Result<Arc<dyn ProviderClient>> {
        Ok(self.0.clone())
    }
}

pub fn valid_tokens() -> TokenSet {
    TokenSet::new("access", "refresh", Utc::now() + chrono::Duration::hours(1))
}

/// A thread of `count` messages whose newest message is `age_days` old
pub fn thread(id: &str, age_days: i64, count: usize) -> ProviderThread {
    let newest = Utc::now() - chrono::Duration::days(age_days);
    let messages = (0..count)
        .map(|i| {
            ProviderMessage::builder(format!("{}-{}", id, i))
                .from(EmailAddress::with_name("Alice", "alice@example.com"))
                .to(vec![EmailAddress::new("owner@example.com")])
                .subject(format!("Thread {}", id))
                .snippet(format!("message {}", i))
                .labels(vec!["Inbox".to_string()])
                .flags(MessageFlags {
                    in_inbox: true,
                    ..Default::default()
                })
                .sent_at(newest - chrono::Duration::minutes((count - 1 - i) as i64))
                .build()
        })
        .collect();
    ProviderThread::new(id, messages)
}

pub struct Harness {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub store: Arc<dyn SyncStore>,
    pub provider: Arc<ScriptedProvider>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(store: Arc<dyn SyncStore>, provider: ScriptedProvider) -> Self {
        let config = SyncConfig {
            min_sync_interval_secs: 0,
            ..SyncConfig::default()
        };
        Self::with_config(store, provider, config)
    }

    pub fn with_config(store: Arc<dyn SyncStore>, provider: ScriptedProvider, config: SyncConfig) -> Self {
        let provider = Arc::new(provider);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            Arc::new(ScriptedFactory(provider.clone())),
            Arc::new(AesGcmCipher::new(&[9u8; 32])),
            clock.clone(),
            config,
        );
        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            provider,
            clock,
        }
    }

    pub fn connect(&self, email: &str) -> Account {
        self.orchestrator
            .connect_account(1, Provider::Outlook, email, &valid_tokens())
            .unwrap()
    }

    pub fn account(&self, id: i64) -> Account {
        self.store.get_account(id).unwrap().unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
