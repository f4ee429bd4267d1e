//! Mail sync crate - multi-provider mailbox sync and phased backfill
//!
//! This crate provides:
//! - Domain models (Account, Thread, Message, BackfillProgress)
//! - Gmail and Outlook clients behind one `ProviderClient` interface
//! - Storage trait abstractions with in-memory and SQLite backends
//! - Idempotent ingestion, deduplication and bounded-concurrency fetching
//! - Phased backfill, incremental sync and the per-account orchestrator
//!
//! Nothing above the `provider` module branches on which provider an
//! account uses.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod gmail;
pub mod models;
pub mod outlook;
pub mod provider;
pub mod storage;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ProviderCredentials, SyncConfig};
pub use crypto::{AesGcmCipher, CipherError, CredentialCipher};
pub use error::{SyncError, SyncErrorCode, SyncFailure};
pub use events::{ChannelEventSink, EventSink, NoopEventSink, ThreadProcessed};
pub use gmail::GmailClient;
pub use models::{
    Account, AccountStatus, BackfillPhase, BackfillProgress, EmailAddress, MessageFlags,
    NewAccount, Provider, ProviderMessage, ProviderThread, ThreadFlags, ThreadRecord,
    ThreadSummary,
};
pub use outlook::OutlookClient;
pub use provider::http::{HttpTransport, RetryPolicy, UreqTransport};
pub use provider::{
    ChangeSet, ClientCache, DefaultProviderFactory, LabelUpdate, ListThreadsOptions,
    ProviderClient, ProviderError, ProviderFactory, ThreadPage, ThreadRef, TokenSet,
};
pub use storage::{InMemorySyncStore, SqliteSyncStore, SyncStore};
pub use sync::{
    // Orchestration
    SyncOrchestrator, SyncResult, PhaseOutcome,
    run_backfill_chain, run_sync_sweep, run_token_refresh_sweep, due_accounts, pending_backfills,
    SweepReport,
    // Building blocks
    deduplicate_threads, fetch_threads_parallel, process_batch, process_thread,
    get_phase_date_range,
    // Timing
    cooldown_elapsed, estimate_time_remaining,
};
