//! Credential Pool
//!
//! Exclusive-use pool of lightweight credentials (API tokens, accounts).
//!
//! # Selection
//!
//! `get()` picks uniformly at random among credentials that are:
//! - not currently checked out
//! - below the configured consecutive-failure maximum (if any)
//! - valid, or invalid with an elapsed cooldown (opportunistic revalidation)
//!
//! Every state mutation happens under one lock, so two concurrent callers can
//! never receive the same credential.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use super::credential::Credential;
use super::snapshot::SnapshotStore;
use crate::error::{GatewayError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Default window before an invalidated credential is reconsidered
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Credential pool behavior
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Window before an invalidated credential is reconsidered
    pub cooldown: Duration,
    /// Credentials with this many consecutive failures are never handed out
    pub max_failures: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            max_failures: None,
        }
    }
}

impl PoolConfig {
    /// Set the cooldown window
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set the consecutive-failure maximum
    #[must_use]
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }
}

/// Point-in-time pool counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Credentials known to the pool
    pub total: usize,
    /// Credentials currently checked out
    pub in_use: usize,
    /// Credentials flagged invalid
    pub invalid: usize,
    /// Credentials a `get()` could return right now
    pub available: usize,
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Default)]
struct PoolState {
    records: HashMap<String, Credential>,
    in_use: HashSet<String>,
}

/// Concurrent pool of exclusive-use credentials
pub struct CredentialPool {
    name: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    snapshot: Option<SnapshotStore>,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CredentialPool {
    /// Create an in-memory pool
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(PoolState::default()),
            snapshot: None,
        }
    }

    /// Create a pool backed by a persisted snapshot
    ///
    /// Failure counts and cached model selections from the previous run are
    /// reset on load.
    pub fn with_snapshot(name: impl Into<String>, config: PoolConfig, snapshot: SnapshotStore) -> Self {
        let mut records = snapshot.load();
        for credential in records.values_mut() {
            credential.failed_count = 0;
            credential.model = None;
        }
        let name = name.into();
        tracing::info!(pool = %name, count = records.len(), "Loaded credential snapshot");
        Self {
            name,
            config,
            state: Mutex::new(PoolState {
                records,
                in_use: HashSet::new(),
            }),
            snapshot: Some(snapshot),
        }
    }

    /// Pool name, used in logs and errors
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add credentials not already present
    ///
    /// Duplicates are detected by label, falling back to the secret. Returns
    /// the number of credentials added.
    pub fn seed(&self, credentials: impl IntoIterator<Item = Credential>) -> usize {
        let mut state = self.state.lock();
        let mut known: HashSet<String> = state
            .records
            .values()
            .map(|c| c.seed_key().to_string())
            .collect();
        let mut added = 0;
        for credential in credentials {
            if credential.seed_key().is_empty() || !known.insert(credential.seed_key().to_string()) {
                continue;
            }
            state.records.insert(credential.id.clone(), credential);
            added += 1;
        }
        if added > 0 {
            tracing::info!(pool = %self.name, added, total = state.records.len(), "Seeded credentials");
            self.persist(&state);
        }
        added
    }

    /// Whether a credential with this seed key exists
    #[must_use]
    pub fn contains_seed(&self, key: &str) -> bool {
        self.state.lock().records.values().any(|c| c.seed_key() == key)
    }

    /// Insert or replace a credential by id
    pub fn insert(&self, credential: Credential) {
        let mut state = self.state.lock();
        state.records.insert(credential.id.clone(), credential);
        self.persist(&state);
    }

    /// Check out a credential, or report exhaustion
    pub fn try_get(&self) -> Result<Credential> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let eligible: Vec<&str> = state
            .records
            .values()
            .filter(|c| self.is_eligible(c, &state.in_use, now))
            .map(|c| c.id.as_str())
            .collect();
        let Some(id) = eligible.choose(&mut rand::thread_rng()).map(|id| (*id).to_string()) else {
            return Err(GatewayError::PoolExhausted {
                pool: self.name.clone(),
            });
        };

        state.in_use.insert(id.clone());
        let credential = match state.records.get_mut(&id) {
            Some(credential) => credential,
            None => {
                return Err(GatewayError::PoolExhausted {
                    pool: self.name.clone(),
                })
            }
        };
        if credential.invalid {
            tracing::info!(pool = %self.name, credential = %id, "Revalidating credential after cooldown");
            credential.invalid = false;
            credential.cooldown_until = None;
        }
        credential.last_use_time = Some(now);
        credential.use_count += 1;
        let checked_out = credential.clone();
        self.persist(&state);

        tracing::debug!(pool = %self.name, credential = %id, "Credential checked out");
        Ok(checked_out)
    }

    /// Check out a credential, falling back to the empty sentinel
    #[must_use]
    pub fn get(&self) -> Credential {
        self.try_get().unwrap_or_else(|_| {
            tracing::warn!(pool = %self.name, "Credential pool run out");
            Credential::sentinel()
        })
    }

    /// Look up a credential without checking it out
    #[must_use]
    pub fn get_by_id(&self, id: &str) -> Option<Credential> {
        self.state.lock().records.get(id).cloned()
    }

    /// Mutate a credential in place; returns `false` if unknown
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Credential)) -> bool {
        let mut state = self.state.lock();
        let Some(credential) = state.records.get_mut(id) else {
            return false;
        };
        f(credential);
        self.persist(&state);
        true
    }

    /// Return a credential to the pool without touching its health
    pub fn release(&self, id: &str) {
        if self.state.lock().in_use.remove(id) {
            tracing::debug!(pool = %self.name, credential = %id, "Credential released");
        }
    }

    /// Soft-delete a credential until the cooldown elapses
    pub fn delete(&self, id: &str) {
        self.invalidate(id);
    }

    /// Mark a credential invalid for the configured cooldown
    pub fn invalidate(&self, id: &str) {
        self.invalidate_for(id, self.config.cooldown);
    }

    /// Mark a credential invalid for a custom recheck window
    pub fn invalidate_for(&self, id: &str, window: Duration) {
        let mut state = self.state.lock();
        state.in_use.remove(id);
        let Some(credential) = state.records.get_mut(id) else {
            return;
        };
        credential.failed_count += 1;
        credential.invalid = true;
        credential.cooldown_until = Some(deadline_after(Utc::now(), window));
        tracing::warn!(
            pool = %self.name,
            credential = %id,
            failures = credential.failed_count,
            recheck_in = ?window,
            "Credential invalidated"
        );
        self.persist(&state);
    }

    /// Administrative hard delete
    pub fn remove(&self, id: &str) -> Option<Credential> {
        let mut state = self.state.lock();
        state.in_use.remove(id);
        let removed = state.records.remove(id);
        if removed.is_some() {
            tracing::info!(pool = %self.name, credential = %id, "Credential removed");
            self.persist(&state);
        }
        removed
    }

    /// Count a failure; returns the new consecutive-failure count
    pub fn record_failure(&self, id: &str) -> u32 {
        let mut state = self.state.lock();
        let Some(credential) = state.records.get_mut(id) else {
            return 0;
        };
        credential.failed_count += 1;
        let failures = credential.failed_count;
        self.persist(&state);
        failures
    }

    /// Reset the consecutive-failure count
    pub fn record_success(&self, id: &str) {
        let mut state = self.state.lock();
        if let Some(credential) = state.records.get_mut(id) {
            if credential.failed_count != 0 {
                credential.failed_count = 0;
                self.persist(&state);
            }
        }
    }

    /// Clear failures and the invalid flag
    pub fn reset(&self, id: &str) -> bool {
        self.update(id, |c| {
            c.failed_count = 0;
            c.invalid = false;
            c.cooldown_until = None;
        })
    }

    /// Whether a credential is checked out
    #[must_use]
    pub fn is_in_use(&self, id: &str) -> bool {
        self.state.lock().in_use.contains(id)
    }

    /// All credentials, ordered by label then id
    #[must_use]
    pub fn list(&self) -> Vec<Credential> {
        let mut all: Vec<Credential> = self.state.lock().records.values().cloned().collect();
        all.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Number of credentials
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether the pool holds no credentials
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let now = Utc::now();
        let state = self.state.lock();
        PoolStats {
            total: state.records.len(),
            in_use: state.in_use.len(),
            invalid: state.records.values().filter(|c| c.invalid).count(),
            available: state
                .records
                .values()
                .filter(|c| self.is_eligible(c, &state.in_use, now))
                .count(),
        }
    }

    /// Write the snapshot now
    pub fn flush(&self) -> Result<()> {
        match &self.snapshot {
            Some(snapshot) => {
                snapshot.schedule(&self.state.lock().records);
                snapshot.flush()
            }
            None => Ok(()),
        }
    }

    fn is_eligible(&self, credential: &Credential, in_use: &HashSet<String>, now: DateTime<Utc>) -> bool {
        !in_use.contains(&credential.id)
            && self
                .config
                .max_failures
                .map_or(true, |max| credential.failed_count < max)
            && (!credential.invalid || credential.cooldown_elapsed(now))
    }

    fn persist(&self, state: &PoolState) {
        if let Some(snapshot) = &self.snapshot {
            snapshot.schedule(&state.records);
        }
    }
}

fn deadline_after(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DEFAULT_FLUSH_DEBOUNCE;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn pool_with(n: usize) -> CredentialPool {
        let pool = CredentialPool::new("test", PoolConfig::default());
        pool.seed((0..n).map(|i| Credential::new(format!("tok-{i}"))));
        pool
    }

    #[test]
    fn test_get_marks_in_use_and_release_reenables() {
        let pool = pool_with(1);
        let first = pool.get();
        assert!(!first.is_sentinel());
        assert!(pool.is_in_use(&first.id));
        assert_eq!(first.use_count, 1);
        assert!(first.last_use_time.is_some());

        assert!(pool.get().is_sentinel());

        pool.release(&first.id);
        let again = pool.get();
        assert_eq!(again.id, first.id);
        assert_eq!(again.use_count, 2);
    }

    #[test]
    fn test_empty_pool_returns_sentinel() {
        let pool = CredentialPool::new("empty", PoolConfig::default());
        assert!(pool.get().is_sentinel());
        assert!(matches!(
            pool.try_get(),
            Err(GatewayError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_invalidate_disables_until_cooldown() {
        let pool = pool_with(1);
        let credential = pool.get();
        pool.invalidate(&credential.id);

        let stored = pool.get_by_id(&credential.id).unwrap();
        assert!(stored.invalid);
        assert_eq!(stored.failed_count, 1);
        assert!(!pool.is_in_use(&credential.id));
        assert!(pool.get().is_sentinel());

        // Pretend the cooldown elapsed.
        pool.update(&credential.id, |c| {
            c.cooldown_until = Some(Utc::now() - chrono::Duration::seconds(1));
        });
        let revived = pool.get();
        assert_eq!(revived.id, credential.id);
        assert!(!revived.invalid);
        assert!(!pool.get_by_id(&credential.id).unwrap().invalid);
    }

    #[test]
    fn test_failure_maximum_excludes_credential() {
        let pool = CredentialPool::new("capped", PoolConfig::default().with_max_failures(2));
        pool.seed([Credential::new("a")]);
        let id = pool.list()[0].id.clone();

        assert_eq!(pool.record_failure(&id), 1);
        assert!(!pool.get().is_sentinel());
        pool.release(&id);

        assert_eq!(pool.record_failure(&id), 2);
        assert!(pool.get().is_sentinel());

        pool.record_success(&id);
        assert!(!pool.get().is_sentinel());
    }

    #[test]
    fn test_seed_skips_duplicates() {
        let pool = CredentialPool::new("dups", PoolConfig::default());
        assert_eq!(pool.seed([Credential::new("a"), Credential::new("a")]), 1);
        assert_eq!(
            pool.seed([Credential::account("x@y.z", "pw"), Credential::new("a")]),
            1
        );
        assert!(pool.contains_seed("x@y.z"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_remove_is_permanent() {
        let pool = pool_with(1);
        let id = pool.list()[0].id.clone();
        assert!(pool.remove(&id).is_some());
        assert!(pool.get_by_id(&id).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_stats() {
        let pool = pool_with(3);
        let a = pool.get();
        let b = pool.get();
        pool.invalidate(&b.id);
        assert_eq!(
            pool.stats(),
            PoolStats {
                total: 3,
                in_use: 1,
                invalid: 1,
                available: 1,
            }
        );
        pool.release(&a.id);
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn test_snapshot_reload_resets_failures_and_model() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::for_pool(dir.path(), "persisted", DEFAULT_FLUSH_DEBOUNCE);
        let id = {
            let pool = CredentialPool::with_snapshot("persisted", PoolConfig::default(), store.clone());
            pool.seed([Credential::new("tok")]);
            let c = pool.get();
            pool.record_failure(&c.id);
            pool.update(&c.id, |c| c.model = Some("gpt-4".into()));
            pool.flush().unwrap();
            c.id
        };

        let pool = CredentialPool::with_snapshot("persisted", PoolConfig::default(), store);
        let reloaded = pool.get_by_id(&id).unwrap();
        assert_eq!(reloaded.failed_count, 0);
        assert_eq!(reloaded.model, None);
        assert_eq!(reloaded.use_count, 1);
        assert!(!pool.is_in_use(&id));
    }

    #[test]
    fn test_concurrent_get_never_duplicates() {
        let pool = std::sync::Arc::new(pool_with(8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || pool.try_get().ok().map(|c| c.id))
            })
            .collect();
        let ids: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(unique.len(), 8);
    }
}
