//! Per-account sync state machine
//!
//! Every run takes the account from `active` to `syncing` with a
//! compare-and-swap and hands it back through [`SyncGuard`], so no exit path
//! (error, timeout cancellation, panic) leaves an account stuck in `syncing`.

use log::{error, info, warn};
use std::sync::Arc;

use super::context::SyncContext;
use super::fetch::FetchOptions;
use super::incremental::{SyncResult, sync_incremental};
use super::phase::{PhaseOutcome, PhaseTuning, run_phase};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::crypto::{CredentialCipher, open_tokens, seal_tokens};
use crate::error::{SyncError, SyncErrorCode};
use crate::events::{EventSink, NoopEventSink};
use crate::models::{Account, AccountStatus, BackfillPhase, BackfillProgress, NewAccount, Provider};
use crate::provider::{ClientCache, ProviderClient, ProviderError, ProviderFactory, TokenSet};
use crate::storage::SyncStore;

/// Hands `syncing` back to `active` when dropped
struct SyncGuard {
    store: Arc<dyn SyncStore>,
    account_id: i64,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.finish_sync(self.account_id) {
            error!(
                "[SYNC] Failed to release sync status for account {}: {:#}",
                self.account_id, e
            );
        }
    }
}

/// Summary stored in `last_sync_error` when only individual threads failed
pub fn failed_threads_message(failed: usize) -> Option<String> {
    (failed > 0).then(|| format!("{} threads failed to sync", failed))
}

/// Drives incremental syncs, backfill phases and token refreshes for all
/// accounts in one store
pub struct SyncOrchestrator {
    store: Arc<dyn SyncStore>,
    factory: Arc<dyn ProviderFactory>,
    cipher: Arc<dyn CredentialCipher>,
    clients: ClientCache,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        factory: Arc<dyn ProviderFactory>,
        cipher: Arc<dyn CredentialCipher>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let clients = ClientCache::new(clock.clone(), config.client_cache_ttl());
        Self {
            store,
            factory,
            cipher,
            clients,
            clock,
            events: Arc::new(NoopEventSink),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn load_account(&self, account_id: i64) -> Result<Account, SyncError> {
        self.store
            .get_account(account_id)?
            .ok_or(SyncError::AccountNotFound(account_id))
    }

    /// Claim the account for a run
    fn begin(&self, account: &Account) -> Result<SyncGuard, SyncError> {
        match account.status {
            AccountStatus::Active => {}
            AccountStatus::Syncing => return Err(SyncError::AlreadySyncing),
            status => return Err(SyncError::NotEligible { status }),
        }
        if !self.store.try_begin_sync(account.id)? {
            return Err(SyncError::AlreadySyncing);
        }
        Ok(SyncGuard {
            store: self.store.clone(),
            account_id: account.id,
        })
    }

    /// Cached client for the account, built from its decrypted tokens
    fn client_for(&self, account: &Account) -> Result<Arc<dyn ProviderClient>, SyncError> {
        self.clients.get_or_try_insert(account.id, || {
            let tokens = open_tokens(
                self.cipher.as_ref(),
                &account.encrypted_access_token,
                &account.encrypted_refresh_token,
                account.token_expires_at,
            )?;
            self.factory
                .create(account, tokens)
                .map_err(|e| SyncError::Credentials(format!("{:#}", e)))
        })
    }

    /// Re-encrypt and store the client's tokens if they differ from `before`
    fn persist_tokens(&self, account_id: i64, client: &dyn ProviderClient, before: &TokenSet) {
        let current = client.current_tokens();
        if current == *before {
            return;
        }
        let stored = seal_tokens(self.cipher.as_ref(), &current)
            .map_err(SyncError::from)
            .and_then(|(access, refresh)| {
                self.store
                    .update_tokens(account_id, &access, &refresh, current.expires_at)
                    .map_err(SyncError::from)
            });
        match stored {
            Ok(()) => info!("[SYNC] Stored refreshed tokens for account {}", account_id),
            Err(e) => error!("[SYNC] Failed to store tokens for account {}: {}", account_id, e),
        }
    }

    /// Record a failed run. Authentication failures expire the account.
    fn record_failure(&self, account_id: i64, err: &SyncError) {
        if let SyncError::Provider(ProviderError::Authentication(_)) = err {
            warn!("[SYNC] Account {} credentials rejected, marking expired", account_id);
            if let Err(e) = self.store.set_account_status(account_id, AccountStatus::Expired) {
                error!("[SYNC] Failed to expire account {}: {:#}", account_id, e);
            }
            self.clients.invalidate(account_id);
        }

        let failure = err.to_failure();
        if let Err(e) = self
            .store
            .record_sync_result(account_id, self.clock.now(), Some(&failure.to_string()))
        {
            error!("[SYNC] Failed to record error for account {}: {:#}", account_id, e);
        }
    }

    async fn ensure_fresh(client: &dyn ProviderClient) -> Result<(), ProviderError> {
        if client.needs_refresh() {
            client.refresh_token().await?;
        }
        Ok(())
    }

    /// Apply the account's change feed since its stored cursor.
    ///
    /// A `FULL_SYNC_REQUIRED` outcome is returned as `Ok` with
    /// `success == false`; the caller starts a backfill.
    pub async fn perform_incremental_sync(&self, account_id: i64) -> Result<SyncResult, SyncError> {
        let account = self.load_account(account_id)?;
        let Some(cursor) = account.sync_cursor.clone() else {
            return Err(SyncError::NoCursor);
        };
        let _guard = self.begin(&account)?;

        let run = async {
            let client = self.client_for(&account)?;
            let before = client.current_tokens();
            let result = async {
                Self::ensure_fresh(client.as_ref()).await?;
                let ctx = SyncContext {
                    store: self.store.as_ref(),
                    client: client.as_ref(),
                    events: self.events.as_ref(),
                    now: self.clock.now(),
                };
                let options = FetchOptions {
                    concurrency: self.config.incremental_concurrency,
                    batch_delay: std::time::Duration::from_millis(self.config.incremental_batch_delay_ms),
                };
                sync_incremental(&ctx, &account, &cursor, options).await
            }
            .await;
            self.persist_tokens(account.id, client.as_ref(), &before);
            result
        };

        match run.await {
            Ok(result) => {
                let now = self.clock.now();
                if result.success {
                    if let Some(new_cursor) = &result.new_cursor {
                        self.store.save_sync_cursor(account.id, Some(new_cursor))?;
                    }
                    self.store.record_sync_result(
                        account.id,
                        now,
                        failed_threads_message(result.failed_threads).as_deref(),
                    )?;
                } else if let Some(failure) = &result.failure {
                    self.store
                        .record_sync_result(account.id, now, Some(&failure.to_string()))?;
                }
                Ok(result)
            }
            Err(e) => {
                error!("[SYNC] Incremental sync failed for account {}: {}", account.id, e);
                self.record_failure(account.id, &e);
                Err(e)
            }
        }
    }

    /// Run one backfill phase for the account
    pub async fn perform_backfill(
        &self,
        account_id: i64,
        phase: BackfillPhase,
    ) -> Result<PhaseOutcome, SyncError> {
        let account = self.load_account(account_id)?;
        let _guard = self.begin(&account)?;

        let run = async {
            let client = self.client_for(&account)?;
            let before = client.current_tokens();
            let result = async {
                Self::ensure_fresh(client.as_ref()).await?;
                let Some(tuning) = PhaseTuning::for_phase(phase) else {
                    return Ok(None);
                };
                let tuning = tuning.with_batch_delay(self.config.phase_batch_delay(phase));
                let ctx = SyncContext {
                    store: self.store.as_ref(),
                    client: client.as_ref(),
                    events: self.events.as_ref(),
                    now: self.clock.now(),
                };
                run_phase(&ctx, &account, phase, tuning).await.map(Some)
            }
            .await;
            self.persist_tokens(account.id, client.as_ref(), &before);
            result
        };

        match run.await {
            Ok(Some(outcome)) => {
                self.store.record_sync_result(
                    account.id,
                    self.clock.now(),
                    failed_threads_message(outcome.failed_threads).as_deref(),
                )?;
                Ok(outcome)
            }
            Ok(None) => Ok(PhaseOutcome {
                phase,
                total_threads: 0,
                new_threads: 0,
                existing_threads: 0,
                failed_threads: 0,
                phase_complete: true,
                next_phase: BackfillPhase::Complete,
                new_cursor: None,
            }),
            Err(e) => {
                error!(
                    "[BACKFILL] Phase {} failed for account {}: {}",
                    phase, account.id, e
                );
                self.record_failure(account.id, &e);
                Err(e)
            }
        }
    }

    /// Refresh the account's access token and store the result.
    ///
    /// An authentication failure marks the account expired.
    pub async fn refresh_account_token(&self, account_id: i64) -> Result<(), SyncError> {
        let account = self.load_account(account_id)?;
        if matches!(account.status, AccountStatus::Expired | AccountStatus::Revoked) {
            return Err(SyncError::NotEligible {
                status: account.status,
            });
        }

        let client = self.client_for(&account)?;
        let before = client.current_tokens();
        match client.refresh_token().await {
            Ok(_) => {
                self.persist_tokens(account.id, client.as_ref(), &before);
                Ok(())
            }
            Err(e) => {
                let err = SyncError::from(e);
                if err.code() == SyncErrorCode::AuthenticationFailed {
                    self.record_failure(account.id, &err);
                } else {
                    warn!("[SYNC] Token refresh failed for account {}: {}", account.id, err);
                }
                Err(err)
            }
        }
    }

    /// Reset the account's backfill to the priority phase and drop its
    /// change cursor; the next backfill phase takes a fresh one.
    pub fn start_backfill(&self, account_id: i64) -> Result<Account, SyncError> {
        let account = self.load_account(account_id)?;
        if matches!(account.status, AccountStatus::Expired | AccountStatus::Revoked) {
            return Err(SyncError::NotEligible {
                status: account.status,
            });
        }

        let progress = BackfillProgress::started(self.clock.now());
        self.store.save_backfill_progress(account.id, &progress)?;
        self.store.save_sync_cursor(account.id, None)?;
        info!("[BACKFILL] Backfill (re)started for account {}", account.id);
        self.load_account(account.id)
    }

    /// Store a newly connected (or reconnected) mailbox and reset its backfill
    pub fn connect_account(
        &self,
        org_id: i64,
        provider: Provider,
        email: &str,
        tokens: &TokenSet,
    ) -> Result<Account, SyncError> {
        let (access, refresh) = seal_tokens(self.cipher.as_ref(), tokens)?;
        let account = self.store.insert_account(
            NewAccount::new(org_id, provider, email).with_tokens(access, refresh, tokens.expires_at),
        )?;
        // A reconnect carries new tokens; the cached client holds the old ones
        self.clients.invalidate(account.id);
        info!("[SYNC] Connected {} account {} ({})", provider, account.id, email);
        self.start_backfill(account.id)
    }
}
