//! Sync engine: dedup, fetch, ingest, phased backfill and incremental sync
//!
//! Every write goes through idempotent upserts keyed by provider ids, so any
//! operation here can be re-run after a crash or a duplicate trigger.

mod context;
mod dedup;
mod fetch;
mod incremental;
mod ingest;
mod orchestrator;
mod phase;
mod scheduler;
mod timing;

pub use context::SyncContext;
pub use dedup::{DEDUP_CHUNK_SIZE, DedupResult, deduplicate_threads, get_or_create_thread_id};
pub use fetch::{
    FetchError, FetchOptions, FetchProgress, FetchResult, collect_thread_ids, fetch_threads_parallel,
};
pub use incremental::{SyncResult, sync_incremental};
pub use ingest::{
    BatchResult, IngestError, MetadataResult, ProcessOptions, ProcessOutcome, mark_thread_deleted,
    process_batch, process_thread, update_thread_metadata,
};
pub use orchestrator::{SyncOrchestrator, failed_threads_message};
pub use phase::{
    EXTENDED_WINDOW_DAYS, MAX_INCOMPLETE_RUNS, PRIORITY_WINDOW_DAYS, PhaseDateRange, PhaseOutcome, PhaseTuning,
    get_phase_date_range, run_phase,
};
pub use scheduler::{
    SweepReport, due_accounts, pending_backfills, run_backfill_chain, run_sync_sweep,
    run_token_refresh_sweep,
};
pub use timing::{cooldown_elapsed, estimate_time_remaining};
