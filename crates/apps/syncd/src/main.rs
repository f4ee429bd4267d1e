//! syncd - background mail sync daemon
//!
//! Runs the scheduled work for every connected account: token refresh,
//! incremental sync, and backfill chains for accounts that are still
//! importing. Pass `--once` to run a single tick and exit.

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

use mail_sync::{
    AesGcmCipher, BackfillPhase, Clock, DefaultProviderFactory, ProviderCredentials, SqliteSyncStore, SyncConfig,
    SyncError, SyncOrchestrator, SystemClock, UreqTransport, pending_backfills, run_backfill_chain,
    run_sync_sweep, run_token_refresh_sweep,
};

/// SQLite file in the mailsync data directory
const DB_FILE: &str = "sync.sqlite";

type ChainResult = (i64, Result<BackfillPhase, SyncError>);

/// Tracks at most one backfill chain per account
struct Backfills {
    running: HashSet<i64>,
    tasks: JoinSet<ChainResult>,
}

impl Backfills {
    fn new() -> Self {
        Self {
            running: HashSet::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Start a chain unless one is already running; returns whether it started
    fn spawn(&mut self, orchestrator: &Arc<SyncOrchestrator>, account_id: i64) -> bool {
        if !self.running.insert(account_id) {
            return false;
        }
        let orchestrator = orchestrator.clone();
        let attempts = orchestrator.config().max_phase_attempts;
        self.tasks.spawn(async move {
            let result = run_backfill_chain(orchestrator, account_id, attempts).await;
            (account_id, result)
        });
        true
    }

    fn finish(&mut self, joined: Result<ChainResult, JoinError>) {
        match joined {
            Ok((id, result)) => {
                self.running.remove(&id);
                match result {
                    Ok(phase) => info!("Backfill for account {} stopped at {}", id, phase),
                    Err(e) => warn!("Backfill for account {} failed: {}", id, e),
                }
            }
            Err(e) => error!("Backfill task panicked: {}", e),
        }
    }

    /// Collect chains that have finished without waiting
    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.finish(joined);
        }
    }

    async fn wait_all(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            self.finish(joined);
        }
    }
}

fn build_orchestrator() -> Result<Arc<SyncOrchestrator>> {
    let sync_config = SyncConfig::load().context("Failed to load sync config")?;
    let credentials = ProviderCredentials::load().context("Failed to load provider credentials")?;

    let key = credentials.token_key.clone().with_context(|| {
        format!(
            "No token encryption key configured; set {} or add token_key to credentials.json",
            mail_sync::config::TOKEN_KEY_ENV
        )
    })?;
    let cipher = AesGcmCipher::from_base64_key(&key).context("Invalid token encryption key")?;

    if credentials.google.is_none() {
        warn!("Google OAuth credentials not configured; Gmail accounts will fail to sync");
    }
    if credentials.microsoft.is_none() {
        warn!("Microsoft OAuth credentials not configured; Outlook accounts will fail to sync");
    }

    let db_path = config::ensure_data_dir()?.join(DB_FILE);
    let store = SqliteSyncStore::new(&db_path)
        .with_context(|| format!("Failed to open store at {}", db_path.display()))?;
    info!("Using store at {}", db_path.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = Arc::new(UreqTransport::new(sync_config.http_timeout()));
    let factory = DefaultProviderFactory::new(
        transport,
        credentials,
        clock.clone(),
        sync_config.retry.clone(),
    );

    Ok(Arc::new(SyncOrchestrator::new(
        Arc::new(store),
        Arc::new(factory),
        Arc::new(cipher),
        clock,
        sync_config,
    )))
}

/// Start chains for every active account whose backfill has not finished.
/// Picks up accounts connected since the last tick and chains that gave up.
fn resume_backfills(orchestrator: &Arc<SyncOrchestrator>, backfills: &mut Backfills) -> Result<()> {
    let accounts = orchestrator.store().list_accounts()?;
    for account_id in pending_backfills(&accounts) {
        if backfills.spawn(orchestrator, account_id) {
            info!("Starting backfill chain for account {}", account_id);
        }
    }
    Ok(())
}

async fn sync_tick(orchestrator: &Arc<SyncOrchestrator>, backfills: &mut Backfills) {
    backfills.reap();
    if let Err(e) = resume_backfills(orchestrator, backfills) {
        error!("Failed to resume backfills: {:#}", e);
    }

    match run_sync_sweep(orchestrator.clone()).await {
        Ok(report) => {
            for account_id in report.needs_backfill {
                match orchestrator.start_backfill(account_id) {
                    Ok(_) => {
                        backfills.spawn(orchestrator, account_id);
                    }
                    Err(e) => error!("Failed to restart backfill for account {}: {}", account_id, e),
                }
            }
        }
        Err(e) => error!("Sync sweep failed: {:#}", e),
    }

    orchestrator.clients().evict_expired();
}

async fn refresh_tick(orchestrator: &Arc<SyncOrchestrator>) {
    if let Err(e) = run_token_refresh_sweep(orchestrator.clone()).await {
        error!("Token refresh sweep failed: {:#}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let once = std::env::args().skip(1).any(|arg| arg == "--once");

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let orchestrator = build_orchestrator()?;
    let mut backfills = Backfills::new();

    if once {
        refresh_tick(&orchestrator).await;
        sync_tick(&orchestrator, &mut backfills).await;
        backfills.wait_all().await;
        return Ok(());
    }

    let mut sync_interval = tokio::time::interval(orchestrator.config().sync_interval());
    let mut refresh_interval = tokio::time::interval(orchestrator.config().token_refresh_interval());
    sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    refresh_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("syncd running");
    loop {
        tokio::select! {
            _ = refresh_interval.tick() => refresh_tick(&orchestrator).await,
            _ = sync_interval.tick() => sync_tick(&orchestrator, &mut backfills).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
