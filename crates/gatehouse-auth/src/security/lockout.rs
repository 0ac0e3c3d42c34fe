//! Account and source-address lockout with exponential backoff.
//!
//! Failures are counted per account and, when enabled, per source address,
//! so both a distributed attack on one account and a credential-stuffing
//! sweep from one address trip a lockout. Account and address entries live
//! under separate key namespaces and can never collide.
//!
//! Lockout duration for the Nth lockout of a subject is
//! `min(base * 2^(N-1), max)`; the failure counter restarts from zero after
//! each lockout. A successful login clears the account entry, backoff
//! included.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::LockoutConfig;
use crate::error::{AuthError, AuthResult};
use crate::events::{EventQueue, SecurityEvent, emit};
use crate::metrics::{MetricsSink, names};
use crate::storage::{RecordStore, StoredRecord, remaining_until};
use crate::tasks::{CleanupHandle, spawn_periodic};

const USER_PREFIX: &str = "lockout:user:";
const ADDR_PREFIX: &str = "lockout:ip:";

/// What a lockout entry tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LockoutSubject {
    /// A username.
    Account(String),
    /// A source address.
    Address(IpAddr),
}

impl LockoutSubject {
    fn key(&self) -> String {
        match self {
            Self::Account(name) => format!("{USER_PREFIX}{name}"),
            Self::Address(addr) => format!("{ADDR_PREFIX}{addr}"),
        }
    }
}

impl fmt::Display for LockoutSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account(name) => f.write_str(name),
            Self::Address(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Failure history for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutEntry {
    pub subject: LockoutSubject,
    /// Failures since the last lockout or success.
    pub failed_attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_attempt: OffsetDateTime,
    /// Lockouts so far; drives the backoff.
    pub lockout_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub locked_until: Option<OffsetDateTime>,
    pub last_failed_addr: Option<String>,
    pub last_failed_agent: Option<String>,
}

impl LockoutEntry {
    fn new(subject: LockoutSubject) -> Self {
        Self {
            subject,
            failed_attempts: 0,
            last_attempt: OffsetDateTime::now_utc(),
            lockout_count: 0,
            locked_until: None,
            last_failed_addr: None,
            last_failed_agent: None,
        }
    }

    /// Remaining lockout time, if currently locked.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > OffsetDateTime::now_utc())
            .map(remaining_until)
    }
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    /// Whether the attempt is now blocked.
    pub locked: bool,
    /// Time until the block lifts; zero when not locked.
    pub remaining: Duration,
}

impl LockoutStatus {
    const OPEN: Self = Self {
        locked: false,
        remaining: Duration::ZERO,
    };

    fn locked(remaining: Duration) -> Self {
        Self {
            locked: true,
            remaining,
        }
    }

    /// Converts a locked status into `AuthError::Locked`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Locked` when `locked` is set.
    pub fn into_result(self) -> AuthResult<()> {
        if self.locked {
            Err(AuthError::locked(self.remaining))
        } else {
            Ok(())
        }
    }
}

/// Tracks failed logins and enforces lockouts.
#[derive(Clone)]
pub struct LockoutManager {
    config: Arc<std::sync::RwLock<LockoutConfig>>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventQueue>,
    // Serializes read-modify-write cycles on entries.
    guard: Arc<Mutex<()>>,
}

impl LockoutManager {
    /// Creates a manager over `store`.
    pub fn new(
        config: LockoutConfig,
        store: Arc<dyn RecordStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config: Arc::new(std::sync::RwLock::new(config)),
            store,
            metrics,
            events: None,
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Sends lockout notifications to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventQueue) -> Self {
        self.events = Some(events);
        self
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> LockoutConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Turns tracking on or off at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        match self.config.write() {
            Ok(mut config) => config.enabled = enabled,
            Err(poisoned) => poisoned.into_inner().enabled = enabled,
        }
        tracing::info!(enabled, "account lockout toggled");
    }

    fn lockout_duration(config: &LockoutConfig, lockout_count: u32) -> Duration {
        if !config.exponential_backoff {
            return config.lockout_duration.min(config.max_lockout_duration);
        }
        let factor = 2u32.checked_pow(lockout_count).unwrap_or(u32::MAX);
        config
            .lockout_duration
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(config.max_lockout_duration)
    }

    fn record_expiry(config: &LockoutConfig, entry: &LockoutEntry) -> OffsetDateTime {
        let anchor = entry
            .locked_until
            .map_or(entry.last_attempt, |until| until.max(entry.last_attempt));
        anchor
            .checked_add(time::Duration::try_from(config.retention).unwrap_or(time::Duration::DAY))
            .unwrap_or(anchor)
    }

    async fn load(&self, subject: &LockoutSubject) -> AuthResult<Option<LockoutEntry>> {
        match self.store.get(&subject.key()).await? {
            Some(record) if !record.is_expired() => record.decode().map(Some),
            _ => Ok(None),
        }
    }

    async fn save(&self, config: &LockoutConfig, entry: &LockoutEntry) -> AuthResult<()> {
        let record = StoredRecord::encode(entry, Self::record_expiry(config, entry))?;
        self.store.put(&entry.subject.key(), record).await
    }

    /// Adds one failure to `subject`'s entry. Caller holds the guard.
    ///
    /// Also returns the failures counted toward the current window, this one
    /// included; `None` when an active lock refused the attempt uncounted.
    async fn register_failure(
        &self,
        config: &LockoutConfig,
        subject: LockoutSubject,
        addr: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> AuthResult<(LockoutStatus, Option<u32>)> {
        let mut entry = self
            .load(&subject)
            .await?
            .unwrap_or_else(|| LockoutEntry::new(subject.clone()));

        if let Some(remaining) = entry.remaining() {
            return Ok((LockoutStatus::locked(remaining), None));
        }

        let now = OffsetDateTime::now_utc();
        entry.failed_attempts += 1;
        let counted = entry.failed_attempts;
        entry.last_attempt = now;
        entry.last_failed_addr = addr.map(|a| a.to_string());
        entry.last_failed_agent = user_agent.map(str::to_string);
        self.metrics
            .increment_counter(names::AUTH_FAILED_ATTEMPTS_TOTAL, &[]);

        let mut status = LockoutStatus::OPEN;
        if entry.failed_attempts >= config.max_attempts {
            let duration = Self::lockout_duration(config, entry.lockout_count);
            let until = now
                .checked_add(time::Duration::try_from(duration).unwrap_or(time::Duration::MAX))
                .unwrap_or(now);
            let failed = entry.failed_attempts;
            entry.lockout_count += 1;
            entry.failed_attempts = 0;
            entry.locked_until = Some(until);
            status = LockoutStatus::locked(duration);

            self.metrics.increment_counter(names::AUTH_LOCKOUTS_TOTAL, &[]);
            tracing::info!(
                subject = %subject,
                duration_secs = duration.as_secs(),
                lockout_count = entry.lockout_count,
                "subject locked out"
            );
            emit(
                self.events.as_ref(),
                SecurityEvent::LockedOut {
                    subject: subject.to_string(),
                    duration,
                    failed_attempts: failed,
                    lockout_count: entry.lockout_count,
                },
            );
        }

        self.save(config, &entry).await?;
        Ok((status, Some(counted)))
    }

    /// Records a failed login for `username` from `addr`.
    ///
    /// The account is evaluated first; if it is (or becomes) locked, the
    /// address is left alone. Otherwise the address is tracked too when
    /// enabled.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn record_failed_attempt(
        &self,
        username: &str,
        addr: Option<IpAddr>,
        user_agent: Option<&str>,
    ) -> AuthResult<LockoutStatus> {
        let config = self.config();
        if !config.enabled {
            return Ok(LockoutStatus::OPEN);
        }

        let _guard = self.guard.lock().await;
        let (account, counted) = self
            .register_failure(
                &config,
                LockoutSubject::Account(username.to_string()),
                addr,
                user_agent,
            )
            .await?;
        emit(
            self.events.as_ref(),
            SecurityEvent::LoginFailed {
                subject: Some(username.to_string()),
                source_addr: addr.map(|a| a.to_string()),
                reason: if counted.is_some() { "invalid_credentials" } else { "locked_out" }
                    .to_string(),
                failed_attempts: counted,
            },
        );
        if account.locked {
            return Ok(account);
        }

        match addr {
            Some(ip) if config.track_by_address => self
                .register_failure(&config, LockoutSubject::Address(ip), addr, user_agent)
                .await
                .map(|(status, _)| status),
            _ => Ok(account),
        }
    }

    /// Fast gate before verifying credentials.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn check_locked(
        &self,
        username: &str,
        addr: Option<IpAddr>,
    ) -> AuthResult<LockoutStatus> {
        let config = self.config();
        if !config.enabled {
            return Ok(LockoutStatus::OPEN);
        }

        let mut subjects = vec![LockoutSubject::Account(username.to_string())];
        if let Some(ip) = addr.filter(|_| config.track_by_address) {
            subjects.push(LockoutSubject::Address(ip));
        }

        let mut longest: Option<Duration> = None;
        for subject in &subjects {
            if let Some(remaining) = self.load(subject).await?.and_then(|e| e.remaining()) {
                longest = Some(longest.map_or(remaining, |l| l.max(remaining)));
            }
        }
        Ok(longest.map_or(LockoutStatus::OPEN, LockoutStatus::locked))
    }

    /// Clears the account entry after a successful login.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn record_successful_login(&self, username: &str) -> AuthResult<()> {
        let _guard = self.guard.lock().await;
        self.store
            .delete(&LockoutSubject::Account(username.to_string()).key())
            .await?;
        Ok(())
    }

    /// Administrative unlock.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn clear_lockout(&self, subject: &LockoutSubject) -> AuthResult<bool> {
        let _guard = self.guard.lock().await;
        let removed = self.store.delete(&subject.key()).await?;
        if removed {
            tracing::info!(subject = %subject, "lockout cleared");
            emit(
                self.events.as_ref(),
                SecurityEvent::LockoutCleared {
                    subject: subject.to_string(),
                },
            );
        }
        Ok(removed)
    }

    /// Entries currently locked, accounts and addresses alike.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn locked_accounts(&self) -> AuthResult<Vec<LockoutEntry>> {
        let mut locked = Vec::new();
        for prefix in [USER_PREFIX, ADDR_PREFIX] {
            for (key, record) in self.store.scan_prefix(prefix).await? {
                if record.is_expired() {
                    continue;
                }
                match record.decode::<LockoutEntry>() {
                    Ok(entry) if entry.remaining().is_some() => locked.push(entry),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(key = %key, error = %e, "skipping malformed lockout entry"),
                }
            }
        }
        Ok(locked)
    }

    /// Removes entries idle past the retention period.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the backend fails.
    pub async fn cleanup_expired(&self) -> AuthResult<usize> {
        let users = self.store.purge_expired(USER_PREFIX).await?;
        let addrs = self.store.purge_expired(ADDR_PREFIX).await?;
        Ok(users + addrs)
    }

    /// Starts a periodic sweep at the configured interval.
    pub fn start_cleanup(&self, token: CancellationToken) -> CleanupHandle {
        let this = self.clone();
        let interval = self.config().cleanup_interval;
        spawn_periodic("lockout_cleanup", interval, token, move || {
            let this = this.clone();
            async move { this.cleanup_expired().await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingMetrics;
    use crate::storage::MemoryRecordStore;

    const MIN: Duration = Duration::from_secs(60);

    fn manager_with(config: LockoutConfig) -> (LockoutManager, Arc<RecordingMetrics>) {
        let metrics = Arc::new(RecordingMetrics::new());
        (
            LockoutManager::new(config, Arc::new(MemoryRecordStore::new()), metrics.clone()),
            metrics,
        )
    }

    fn manager() -> (LockoutManager, Arc<RecordingMetrics>) {
        manager_with(LockoutConfig::default())
    }

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    async fn fail(manager: &LockoutManager, user: &str, n: u32, addr: Option<IpAddr>) -> LockoutStatus {
        let mut status = LockoutStatus::OPEN;
        for _ in 0..n {
            status = manager.record_failed_attempt(user, addr, Some("ua")).await.unwrap();
        }
        status
    }

    /// Lifts a lock without touching the backoff counter.
    async fn expire_lock(manager: &LockoutManager, subject: &LockoutSubject) {
        let config = manager.config();
        let mut entry = manager.load(subject).await.unwrap().unwrap();
        entry.locked_until = Some(OffsetDateTime::now_utc() - time::Duration::seconds(1));
        manager.save(&config, &entry).await.unwrap();
    }

    #[test]
    fn test_backoff_schedule() {
        let config = LockoutConfig::default();
        let expected = [15, 30, 60, 120, 240, 480, 960, 1440, 1440];
        for (n, minutes) in expected.iter().enumerate() {
            assert_eq!(
                LockoutManager::lockout_duration(&config, n as u32),
                MIN * *minutes,
                "lockout #{}",
                n + 1
            );
        }
        // Huge counters saturate at the cap.
        assert_eq!(
            LockoutManager::lockout_duration(&config, 200),
            config.max_lockout_duration
        );

        let flat = LockoutConfig {
            exponential_backoff: false,
            ..LockoutConfig::default()
        };
        assert_eq!(LockoutManager::lockout_duration(&flat, 5), MIN * 15);
    }

    #[tokio::test]
    async fn test_locks_after_max_attempts() {
        let (manager, metrics) = manager();
        let status = fail(&manager, "alice", 4, None).await;
        assert!(!status.locked);

        let status = fail(&manager, "alice", 1, None).await;
        assert!(status.locked);
        assert_eq!(status.remaining, MIN * 15);
        assert!(status.into_result().is_err());

        let checked = manager.check_locked("alice", None).await.unwrap();
        assert!(checked.locked);
        assert!(checked.remaining <= MIN * 15);
        assert_eq!(metrics.counter(names::AUTH_LOCKOUTS_TOTAL), 1);
        assert_eq!(metrics.counter(names::AUTH_FAILED_ATTEMPTS_TOTAL), 5);
    }

    #[tokio::test]
    async fn test_locked_attempts_do_not_increment() {
        let (manager, metrics) = manager();
        fail(&manager, "bob", 5, None).await;
        let status = fail(&manager, "bob", 3, None).await;
        assert!(status.locked);

        let entry = manager
            .load(&LockoutSubject::Account("bob".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.failed_attempts, 0);
        assert_eq!(entry.lockout_count, 1);
        assert_eq!(metrics.counter(names::AUTH_FAILED_ATTEMPTS_TOTAL), 5);
    }

    #[tokio::test]
    async fn test_exponential_backoff_across_lockouts() {
        let (manager, _) = manager();
        let subject = LockoutSubject::Account("carol".into());

        let first = fail(&manager, "carol", 5, None).await;
        assert_eq!(first.remaining, MIN * 15);

        expire_lock(&manager, &subject).await;
        assert!(!manager.check_locked("carol", None).await.unwrap().locked);

        let second = fail(&manager, "carol", 5, None).await;
        assert_eq!(second.remaining, MIN * 30);

        expire_lock(&manager, &subject).await;
        let third = fail(&manager, "carol", 5, None).await;
        assert_eq!(third.remaining, MIN * 60);
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let (manager, _) = manager();
        fail(&manager, "dave", 5, None).await;
        manager.record_successful_login("dave").await.unwrap();
        assert!(!manager.check_locked("dave", None).await.unwrap().locked);

        // Back to the base duration, not doubled.
        let status = fail(&manager, "dave", 5, None).await;
        assert_eq!(status.remaining, MIN * 15);
    }

    #[tokio::test]
    async fn test_address_tracking_catches_stuffing() {
        let (manager, _) = manager();
        let addr = ip("203.0.113.7");
        for i in 0..4 {
            let status = fail(&manager, &format!("user{i}"), 1, addr).await;
            assert!(!status.locked);
        }
        let status = fail(&manager, "user4", 1, addr).await;
        assert!(status.locked, "fifth failure from one address locks it");

        // A fresh account from the same address is gated.
        assert!(manager.check_locked("someone-new", addr).await.unwrap().locked);
        assert!(!manager.check_locked("someone-new", ip("198.51.100.1")).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_account_lock_skips_address() {
        let (manager, _) = manager();
        let addr = ip("203.0.113.9");
        fail(&manager, "erin", 5, addr).await;

        let entry = manager
            .load(&LockoutSubject::Address(addr.unwrap()))
            .await
            .unwrap()
            .unwrap();
        // The locking attempt itself was not counted against the address.
        assert_eq!(entry.failed_attempts, 4);
    }

    #[tokio::test]
    async fn test_address_and_account_namespaces_do_not_collide() {
        let (manager, _) = manager();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        // A username that looks like the display form of an address entry.
        fail(&manager, "ip:10.0.0.1", 5, None).await;

        assert!(manager.check_locked("ip:10.0.0.1", None).await.unwrap().locked);
        assert!(manager.load(&LockoutSubject::Address(addr)).await.unwrap().is_none());
        assert_eq!(LockoutSubject::Address(addr).to_string(), "ip:10.0.0.1");
    }

    #[tokio::test]
    async fn test_disabled_tracks_nothing() {
        let (manager, _) = manager();
        manager.set_enabled(false);
        let status = fail(&manager, "frank", 10, None).await;
        assert!(!status.locked);
        assert!(!manager.check_locked("frank", None).await.unwrap().locked);
        assert!(!manager.config().enabled);
    }

    #[tokio::test]
    async fn test_admin_clear_and_listing() {
        let (manager, _) = manager();
        fail(&manager, "gina", 5, None).await;
        fail(&manager, "hank", 2, None).await;

        let locked = manager.locked_accounts().await.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].subject, LockoutSubject::Account("gina".into()));

        let subject = LockoutSubject::Account("gina".into());
        assert!(manager.clear_lockout(&subject).await.unwrap());
        assert!(!manager.clear_lockout(&subject).await.unwrap());
        assert!(manager.locked_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_idle_entries() {
        let (manager, _) = manager();
        let config = manager.config();
        fail(&manager, "ivan", 2, None).await;
        fail(&manager, "judy", 5, None).await;

        // Age ivan's entry past the retention period.
        let subject = LockoutSubject::Account("ivan".into());
        let mut entry = manager.load(&subject).await.unwrap().unwrap();
        entry.last_attempt = OffsetDateTime::now_utc() - time::Duration::days(2);
        manager.save(&config, &entry).await.unwrap();

        assert_eq!(manager.cleanup_expired().await.unwrap(), 1);
        assert!(manager.load(&subject).await.unwrap().is_none());
        // Locked entries survive until the lock lifts.
        assert!(manager.check_locked("judy", None).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_lockout_event_emitted() {
        use crate::events::EventHandler;
        use async_trait::async_trait;

        #[derive(Default)]
        struct Capture(Mutex<Vec<SecurityEvent>>);

        #[async_trait]
        impl EventHandler for Capture {
            async fn handle(&self, event: SecurityEvent) {
                self.0.lock().await.push(event);
            }
        }

        let capture = Arc::new(Capture::default());
        let (queue, worker) = EventQueue::spawn(8, capture.clone(), crate::metrics::noop());
        let (manager, _) = manager();
        let manager = manager.with_events(queue);

        fail(&manager, "kim", 5, None).await;
        drop(manager);
        worker.await.unwrap();

        let events = capture.0.lock().await;
        let locked: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SecurityEvent::LockedOut { .. }))
            .collect();
        assert_eq!(locked.len(), 1);
        assert!(matches!(
            locked[0],
            SecurityEvent::LockedOut { subject, failed_attempts: 5, lockout_count: 1, .. }
                if subject == "kim"
        ));
    }

    #[tokio::test]
    async fn test_every_failure_emits_login_failed() {
        use crate::events::EventHandler;
        use async_trait::async_trait;

        #[derive(Default)]
        struct Capture(Mutex<Vec<SecurityEvent>>);

        #[async_trait]
        impl EventHandler for Capture {
            async fn handle(&self, event: SecurityEvent) {
                self.0.lock().await.push(event);
            }
        }

        let capture = Arc::new(Capture::default());
        let (queue, worker) = EventQueue::spawn(16, capture.clone(), crate::metrics::noop());
        let (manager, _) = manager_with(LockoutConfig {
            max_attempts: 3,
            ..LockoutConfig::default()
        });
        let manager = manager.with_events(queue);

        // Three counted failures, then one refused by the lock.
        fail(&manager, "lee", 4, ip("10.0.0.9")).await;
        drop(manager);
        worker.await.unwrap();

        let events = capture.0.lock().await;
        let failures: Vec<(Option<u32>, &str)> = events
            .iter()
            .filter_map(|e| match e {
                SecurityEvent::LoginFailed {
                    subject,
                    source_addr,
                    reason,
                    failed_attempts,
                } => {
                    assert_eq!(subject.as_deref(), Some("lee"));
                    assert_eq!(source_addr.as_deref(), Some("10.0.0.9"));
                    Some((*failed_attempts, reason.as_str()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            failures,
            vec![
                (Some(1), "invalid_credentials"),
                (Some(2), "invalid_credentials"),
                (Some(3), "invalid_credentials"),
                (None, "locked_out"),
            ]
        );
        assert_eq!(events.iter().filter(|e| e.kind() == "locked_out").count(), 1);
    }
}
