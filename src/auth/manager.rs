//! In-memory account pool, selection policy, and refresh scheduling.
//!
//! Thread-safe: the pool maps account ids to slots; each slot serializes
//! mutation behind its own lock so `select` always returns a stable
//! snapshot and two concurrent 403 handlers never refresh the same account
//! twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::auth::account::{Account, AccountStatus, Provider};
use crate::auth::refresh::RefreshDriver;
use crate::auth::store::CredentialStore;
use crate::config;
use crate::error::{Error, Result};

/// One pooled account with its serialization and bookkeeping state.
struct AccountSlot {
    account: RwLock<Account>,
    /// Serializes refresh; the loser rereads after the winner releases.
    refresh_lock: Mutex<()>,
    success: AtomicU64,
    failure: AtomicU64,
    /// Consecutive refresh failures; reset on success.
    refresh_failures: AtomicU32,
    /// Logical timestamp of the last selection (LRU tiebreak).
    last_used: AtomicU64,
    /// Cooldown deadline as millis since manager start; 0 = none.
    cooldown_until_ms: AtomicU64,
}

impl AccountSlot {
    fn new(account: Account) -> Self {
        Self {
            success: AtomicU64::new(account.success_count),
            failure: AtomicU64::new(account.failure_count),
            account: RwLock::new(account),
            refresh_lock: Mutex::new(()),
            refresh_failures: AtomicU32::new(0),
            last_used: AtomicU64::new(0),
            cooldown_until_ms: AtomicU64::new(0),
        }
    }
}

/// The authenticated-account pool executors draw from.
pub struct AuthManager {
    pool: RwLock<HashMap<String, Arc<AccountSlot>>>,
    store: Arc<dyn CredentialStore>,
    drivers: HashMap<Provider, Arc<dyn RefreshDriver>>,
    http: reqwest::Client,
    /// Monotonic selection clock for LRU.
    use_clock: AtomicU64,
    epoch: Instant,
    shutdown: Arc<Notify>,
}

impl AuthManager {
    pub fn new(store: Arc<dyn CredentialStore>, drivers: Vec<Box<dyn RefreshDriver>>) -> Self {
        let drivers = drivers
            .into_iter()
            .map(|d| (d.provider(), Arc::from(d)))
            .collect();
        Self {
            pool: RwLock::new(HashMap::new()),
            store,
            drivers,
            http: reqwest::Client::new(),
            use_clock: AtomicU64::new(1),
            epoch: Instant::now(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Populate the pool from the credential store.
    pub async fn load_all(&self) -> Result<usize> {
        let accounts = self.store.list()?;
        let count = accounts.len();
        let mut pool = self.pool.write().await;
        for account in accounts {
            pool.insert(account.id.clone(), Arc::new(AccountSlot::new(account)));
        }
        info!(count, "account pool loaded");
        Ok(count)
    }

    /// Register (or replace) a single account, persisting it.
    pub async fn register(&self, account: Account) -> Result<()> {
        self.store.save(&account)?;
        let mut pool = self.pool.write().await;
        pool.insert(account.id.clone(), Arc::new(AccountSlot::new(account)));
        Ok(())
    }

    /// Remove an account from the pool and the store.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.delete(id)?;
        self.pool.write().await.remove(id);
        Ok(())
    }

    /// Select an eligible account for a provider.
    ///
    /// Among accounts that are enabled, available, out of cooldown, and hold
    /// token material, the highest priority wins; ties go to the least
    /// recently used. Returns a stable snapshot.
    pub async fn select(&self, provider: Provider) -> Result<Account> {
        let now_ms = self.now_ms();
        let pool = self.pool.read().await;

        let mut best: Option<(i32, u64, Arc<AccountSlot>, Account)> = None;
        for slot in pool.values() {
            let account = slot.account.read().await;
            if account.provider() != provider
                || account.disabled
                || account.unavailable
                || !account.has_token_material()
            {
                continue;
            }
            if slot.cooldown_until_ms.load(Ordering::Acquire) > now_ms {
                continue;
            }
            let used = slot.last_used.load(Ordering::Acquire);
            let better = match &best {
                None => true,
                Some((priority, best_used, _, _)) => {
                    account.priority > *priority
                        || (account.priority == *priority && used < *best_used)
                }
            };
            if better {
                best = Some((account.priority, used, Arc::clone(slot), account.clone()));
            }
        }

        match best {
            Some((_, _, slot, account)) => {
                let tick = self.use_clock.fetch_add(1, Ordering::AcqRel);
                slot.last_used.store(tick, Ordering::Release);
                debug!(account = %account.id, provider = %provider, "account selected");
                Ok(account)
            }
            None => Err(Error::NoAccount(provider.to_string())),
        }
    }

    /// Write back a mutated account snapshot and persist it.
    pub async fn update(&self, account: Account) -> Result<()> {
        let pool = self.pool.read().await;
        match pool.get(&account.id) {
            Some(slot) => {
                let mut current = slot.account.write().await;
                *current = account.clone();
            }
            None => return Err(Error::storage(&account.id, "account not in pool")),
        }
        self.store.save(&account)
    }

    /// Fetch a snapshot of one account.
    pub async fn get(&self, id: &str) -> Option<Account> {
        let pool = self.pool.read().await;
        let slot = pool.get(id)?;
        let account = slot.account.read().await.clone();
        Some(account)
    }

    /// Record a successful request against an account.
    pub async fn record_success(&self, id: &str) {
        let pool = self.pool.read().await;
        if let Some(slot) = pool.get(id) {
            slot.success.fetch_add(1, Ordering::Relaxed);
            let mut account = slot.account.write().await;
            account.success_count = slot.success.load(Ordering::Relaxed);
            if account.status == AccountStatus::Cooldown {
                account.status = AccountStatus::Active;
            }
        }
    }

    /// Record a failed request; 429 and 5xx push the account into cooldown.
    pub async fn record_failure(&self, id: &str, error: &Error) {
        let pool = self.pool.read().await;
        let Some(slot) = pool.get(id) else { return };
        slot.failure.fetch_add(1, Ordering::Relaxed);

        let mut account = slot.account.write().await;
        account.failure_count = slot.failure.load(Ordering::Relaxed);
        if error.triggers_cooldown() {
            let backoff = error
                .retry_after_duration()
                .unwrap_or_else(|| config::constants(account.provider()).cooldown);
            let until = self.now_ms() + backoff.as_millis() as u64;
            slot.cooldown_until_ms.store(until, Ordering::Release);
            account.status = AccountStatus::Cooldown;
            warn!(account = %id, backoff_secs = backoff.as_secs(), "account entered cooldown");
        }
    }

    /// Force-refresh an account (the executor's 403 path).
    ///
    /// Refresh is serialized per account: the loser of the lock race rereads
    /// the account and skips the exchange if the winner already rotated it.
    pub async fn refresh_now(&self, id: &str) -> Result<Account> {
        self.refresh_inner(id, true).await
    }

    async fn refresh_inner(&self, id: &str, force: bool) -> Result<Account> {
        let slot = {
            let pool = self.pool.read().await;
            pool.get(id)
                .cloned()
                .ok_or_else(|| Error::storage(id, "account not in pool"))?
        };

        let _refresh_guard = slot.refresh_lock.lock().await;

        // Double-check: another task may have refreshed while we waited.
        let snapshot = slot.account.read().await.clone();
        if !force && !snapshot.needs_refresh() && !snapshot.access_token().is_empty() {
            return Ok(snapshot);
        }

        let driver = self
            .drivers
            .get(&snapshot.provider())
            .ok_or(Error::Unsupported("refresh"))?;

        match driver.refresh(&self.http, &snapshot).await {
            Ok(update) => {
                slot.refresh_failures.store(0, Ordering::Release);
                let mut account = slot.account.write().await;
                account.apply_refresh(update);
                account.unavailable = false;
                if account.status == AccountStatus::Exhausted {
                    account.status = AccountStatus::Active;
                }
                let updated = account.clone();
                drop(account);

                if let Err(e) = self.store.save(&updated) {
                    warn!(account = %id, error = %e, "failed to persist refreshed token");
                }
                info!(account = %id, "token refreshed");
                Ok(updated)
            }
            Err(e) => {
                let failures = slot.refresh_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= config::REFRESH_FAILURE_THRESHOLD {
                    let mut account = slot.account.write().await;
                    account.unavailable = true;
                    account.status = AccountStatus::Exhausted;
                    warn!(account = %id, failures, "account marked unavailable");
                }
                Err(e)
            }
        }
    }

    /// Spawn the cooperative refresh loop.
    ///
    /// Each tick scans the pool and refreshes any account whose wake time
    /// (`expiry - lead`) has passed. The handle stops on [`Self::shutdown`].
    pub fn spawn_scheduler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(&self);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config::SCHEDULER_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => manager.scheduler_pass().await,
                    _ = shutdown.notified() => {
                        debug!("refresh scheduler stopped");
                        return;
                    }
                }
            }
        })
    }

    /// One scheduler pass over the pool. Public so tests can drive ticks.
    pub async fn scheduler_pass(&self) {
        let due: Vec<String> = {
            let pool = self.pool.read().await;
            let mut due = Vec::new();
            for (id, slot) in pool.iter() {
                let account = slot.account.read().await;
                if account.disabled || account.unavailable {
                    continue;
                }
                if account.needs_refresh() && !account.refresh_token().is_empty() {
                    due.push(id.clone());
                }
            }
            due
        };

        for id in due {
            if let Err(e) = self.refresh_inner(&id, false).await {
                warn!(account = %id, error = %e, "scheduled refresh failed");
            }
        }
    }

    /// Stop the scheduler loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
