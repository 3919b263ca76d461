//! Per-user, per-workflow request quotas over a daily and a monthly window.
//!
//! Counters live behind [`QuotaStore`]; every check-and-mutate happens inside
//! one store operation so concurrent requests can never push `used` past the
//! limit. [`QuotaGate`] is the policy layer the orchestrator talks to. It
//! resolves limits, stamps the current time and fails closed when the store
//! cannot answer.

pub mod memory;
pub mod window;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock, to_rfc3339};

pub use memory::MemoryQuotaStore;

pub const DEFAULT_DAILY_LIMIT: u64 = 10;
pub const DEFAULT_MONTHLY_LIMIT: u64 = 300;
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(600);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaSubject {
    pub user_id: String,
    /// `None` scopes the quota to the user across all workflows.
    pub workflow_id: Option<String>,
}

impl QuotaSubject {
    pub fn new(user_id: impl Into<String>, workflow_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            workflow_id,
        }
    }

    pub fn for_workflow(user_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self::new(user_id, Some(workflow_id.into()))
    }

    /// Stable storage key. `*` stands for the global scope; workflow ids never
    /// contain it.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.user_id,
            self.workflow_id.as_deref().unwrap_or("*")
        )
    }
}

impl fmt::Display for QuotaSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub const ALL: [QuotaPeriod; 2] = [QuotaPeriod::Daily, QuotaPeriod::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Monthly => "monthly",
        }
    }
}

/// The window that blocked a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Daily,
    Monthly,
}

impl LimitType {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitType::Daily => "daily",
            LimitType::Monthly => "monthly",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub daily: u64,
    pub monthly: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            daily: DEFAULT_DAILY_LIMIT,
            monthly: DEFAULT_MONTHLY_LIMIT,
        }
    }
}

impl QuotaLimits {
    pub fn for_period(&self, period: QuotaPeriod) -> u64 {
        match period {
            QuotaPeriod::Daily => self.daily,
            QuotaPeriod::Monthly => self.monthly,
        }
    }
}

/// Store answer for a subject at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageLimitStatus {
    pub can_use: bool,
    pub daily_remaining: u64,
    pub monthly_remaining: u64,
    pub limit_type: Option<LimitType>,
    pub limit_reached: bool,
}

/// Gate answer. `allowed == false` with no `limit_type` means the store could
/// not be consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCheck {
    pub allowed: bool,
    pub daily_remaining: u64,
    pub monthly_remaining: u64,
    pub limit_type: Option<LimitType>,
}

impl QuotaCheck {
    pub fn unavailable() -> Self {
        Self {
            allowed: false,
            daily_remaining: 0,
            monthly_remaining: 0,
            limit_type: None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        !self.allowed && self.limit_type.is_none()
    }
}

impl From<UsageLimitStatus> for QuotaCheck {
    fn from(status: UsageLimitStatus) -> Self {
        Self {
            allowed: status.can_use,
            daily_remaining: status.daily_remaining,
            monthly_remaining: status.monthly_remaining,
            limit_type: status.limit_type,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    pub remaining_today: u64,
    pub remaining_month: u64,
    /// Start of the current daily window.
    pub last_reset: OffsetDateTime,
}

impl QuotaSnapshot {
    pub fn last_reset_rfc3339(&self) -> String {
        to_rfc3339(self.last_reset)
    }
}

#[derive(Debug, Error)]
pub enum QuotaStoreError {
    #[error("quota store backend error: {0}")]
    Backend(String),
    #[error("quota store state is corrupt: {0}")]
    Corrupt(String),
}

impl QuotaStoreError {
    pub fn backend(err: impl fmt::Display) -> Self {
        QuotaStoreError::Backend(err.to_string())
    }
}

/// Transactional persistence for quota counters. Each method is one atomic
/// operation: counters are provisioned with `limits` when missing, rolled into
/// the current window when their reset time has passed, then read or mutated.
/// Once provisioned, the stored limit is authoritative.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn check_usage_limit(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, QuotaStoreError>;

    /// Adds one request (and `tokens_used`) to both windows. Returns `false`
    /// without changing anything when either window is full.
    async fn increment_usage_count(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError>;

    /// Holds one unit of both windows for `reservation_id`. The returned status
    /// is the one observed before reserving; nothing is held when it says
    /// `can_use == false`.
    async fn reserve_usage(
        &self,
        reservation_id: &str,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, QuotaStoreError>;

    /// Turns a reservation into one used request. `false` when the reservation
    /// is unknown (already settled or reaped).
    async fn commit_reservation(
        &self,
        reservation_id: &str,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError>;

    async fn release_reservation(
        &self,
        reservation_id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError>;

    async fn usage_snapshot(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<QuotaSnapshot, QuotaStoreError>;
}

/// Limits applied when a subject's counters are first provisioned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub default_limits: QuotaLimits,
    pub per_workflow: HashMap<String, QuotaLimits>,
}

impl QuotaPolicy {
    pub fn new(default_limits: QuotaLimits) -> Self {
        Self {
            default_limits,
            per_workflow: HashMap::new(),
        }
    }

    pub fn with_workflow_limits(
        mut self,
        workflow_id: impl Into<String>,
        limits: QuotaLimits,
    ) -> Self {
        self.per_workflow.insert(workflow_id.into(), limits);
        self
    }

    pub fn limits_for(&self, subject: &QuotaSubject) -> QuotaLimits {
        subject
            .workflow_id
            .as_deref()
            .and_then(|workflow_id| self.per_workflow.get(workflow_id))
            .copied()
            .unwrap_or(self.default_limits)
    }
}

#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<dyn QuotaStore>,
    policy: Arc<QuotaPolicy>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for QuotaGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaGate")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl QuotaGate {
    pub fn new(store: Arc<dyn QuotaStore>, policy: QuotaPolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub async fn check(&self, subject: &QuotaSubject) -> QuotaCheck {
        let limits = self.policy.limits_for(subject);
        match self
            .store
            .check_usage_limit(subject, limits, self.clock.now())
            .await
        {
            Ok(status) => status.into(),
            Err(err) => {
                tracing::warn!(subject = %subject, error = %err, "quota check failed; denying");
                QuotaCheck::unavailable()
            }
        }
    }

    pub async fn increment(&self, subject: &QuotaSubject, tokens_used: u64) -> bool {
        let limits = self.policy.limits_for(subject);
        match self
            .store
            .increment_usage_count(subject, limits, tokens_used, self.clock.now())
            .await
        {
            Ok(incremented) => incremented,
            Err(err) => {
                tracing::warn!(subject = %subject, error = %err, "quota increment failed");
                false
            }
        }
    }

    /// Atomic check-and-reserve. A permit is returned only when the request was
    /// admitted.
    pub async fn admit(
        &self,
        reservation_id: &str,
        subject: &QuotaSubject,
    ) -> (QuotaCheck, Option<QuotaPermit>) {
        let limits = self.policy.limits_for(subject);
        let status = match self
            .store
            .reserve_usage(reservation_id, subject, limits, self.clock.now())
            .await
        {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(subject = %subject, error = %err, "quota reservation failed; denying");
                return (QuotaCheck::unavailable(), None);
            }
        };

        let check = QuotaCheck::from(status);
        if !check.allowed {
            return (check, None);
        }
        let permit = QuotaPermit {
            store: self.store.clone(),
            clock: self.clock.clone(),
            reservation_id: reservation_id.to_string(),
            subject: subject.clone(),
            settled: false,
        };
        (check, Some(permit))
    }

    pub async fn snapshot(&self, subject: &QuotaSubject) -> Result<QuotaSnapshot, QuotaStoreError> {
        let limits = self.policy.limits_for(subject);
        self.store
            .usage_snapshot(subject, limits, self.clock.now())
            .await
    }
}

/// One reserved unit of quota. Settle it exactly once with [`commit`] or
/// [`release`]; a permit dropped unsettled is released in the background.
///
/// [`commit`]: QuotaPermit::commit
/// [`release`]: QuotaPermit::release
pub struct QuotaPermit {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    reservation_id: String,
    subject: QuotaSubject,
    settled: bool,
}

impl fmt::Debug for QuotaPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaPermit")
            .field("reservation_id", &self.reservation_id)
            .field("subject", &self.subject)
            .field("settled", &self.settled)
            .finish()
    }
}

impl QuotaPermit {
    pub fn reservation_id(&self) -> &str {
        &self.reservation_id
    }

    pub fn subject(&self) -> &QuotaSubject {
        &self.subject
    }

    /// Counts the request against both windows.
    pub async fn commit(mut self, tokens_used: u64) -> bool {
        self.settled = true;
        match self
            .store
            .commit_reservation(&self.reservation_id, tokens_used, self.clock.now())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    reservation_id = %self.reservation_id,
                    subject = %self.subject,
                    "quota reservation expired before commit"
                );
                false
            }
            Err(err) => {
                tracing::warn!(
                    reservation_id = %self.reservation_id,
                    subject = %self.subject,
                    error = %err,
                    "quota commit failed"
                );
                false
            }
        }
    }

    pub async fn release(mut self) {
        self.settled = true;
        if let Err(err) = self
            .store
            .release_reservation(&self.reservation_id, self.clock.now())
            .await
        {
            tracing::warn!(
                reservation_id = %self.reservation_id,
                error = %err,
                "quota release failed; reservation will expire"
            );
        }
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let now = self.clock.now();
        let reservation_id = std::mem::take(&mut self.reservation_id);
        handle.spawn(async move {
            if let Err(err) = store.release_reservation(&reservation_id, now).await {
                tracing::warn!(
                    reservation_id = %reservation_id,
                    error = %err,
                    "quota release of dropped permit failed; reservation will expire"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    struct BrokenStore;

    #[async_trait]
    impl QuotaStore for BrokenStore {
        async fn check_usage_limit(
            &self,
            _subject: &QuotaSubject,
            _limits: QuotaLimits,
            _now: OffsetDateTime,
        ) -> Result<UsageLimitStatus, QuotaStoreError> {
            Err(QuotaStoreError::Backend("connection refused".to_string()))
        }

        async fn increment_usage_count(
            &self,
            _subject: &QuotaSubject,
            _limits: QuotaLimits,
            _tokens_used: u64,
            _now: OffsetDateTime,
        ) -> Result<bool, QuotaStoreError> {
            Err(QuotaStoreError::Backend("connection refused".to_string()))
        }

        async fn reserve_usage(
            &self,
            _reservation_id: &str,
            _subject: &QuotaSubject,
            _limits: QuotaLimits,
            _now: OffsetDateTime,
        ) -> Result<UsageLimitStatus, QuotaStoreError> {
            Err(QuotaStoreError::Backend("connection refused".to_string()))
        }

        async fn commit_reservation(
            &self,
            _reservation_id: &str,
            _tokens_used: u64,
            _now: OffsetDateTime,
        ) -> Result<bool, QuotaStoreError> {
            Err(QuotaStoreError::Backend("connection refused".to_string()))
        }

        async fn release_reservation(
            &self,
            _reservation_id: &str,
            _now: OffsetDateTime,
        ) -> Result<bool, QuotaStoreError> {
            Err(QuotaStoreError::Backend("connection refused".to_string()))
        }

        async fn usage_snapshot(
            &self,
            _subject: &QuotaSubject,
            _limits: QuotaLimits,
            _now: OffsetDateTime,
        ) -> Result<QuotaSnapshot, QuotaStoreError> {
            Err(QuotaStoreError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn store_failures_fail_closed() {
        let gate = QuotaGate::new(Arc::new(BrokenStore), QuotaPolicy::default());
        let subject = QuotaSubject::for_workflow("u1", "wf");

        let check = gate.check(&subject).await;
        assert!(!check.allowed);
        assert!(check.is_unavailable());
        assert_eq!(check.daily_remaining, 0);

        let (check, permit) = gate.admit("req-1", &subject).await;
        assert!(check.is_unavailable());
        assert!(permit.is_none());

        assert!(!gate.increment(&subject, 5).await);
        assert!(gate.snapshot(&subject).await.is_err());
    }

    #[tokio::test]
    async fn per_workflow_limits_override_defaults() {
        let policy = QuotaPolicy::new(QuotaLimits::default()).with_workflow_limits(
            "expensive",
            QuotaLimits {
                daily: 1,
                monthly: 5,
            },
        );
        let gate = QuotaGate::new(Arc::new(MemoryQuotaStore::new()), policy);

        let cheap = QuotaSubject::for_workflow("u1", "cheap");
        let expensive = QuotaSubject::for_workflow("u1", "expensive");
        assert_eq!(gate.check(&cheap).await.daily_remaining, 10);
        assert_eq!(gate.check(&expensive).await.daily_remaining, 1);
        assert_eq!(gate.check(&expensive).await.monthly_remaining, 5);
    }

    #[tokio::test]
    async fn permit_commit_and_release() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-10 12:00 UTC)));
        let gate = QuotaGate::new(Arc::new(MemoryQuotaStore::new()), QuotaPolicy::default())
            .with_clock(clock.clone());
        let subject = QuotaSubject::for_workflow("u1", "wf");

        let (check, permit) = gate.admit("req-1", &subject).await;
        assert!(check.allowed);
        assert_eq!(check.daily_remaining, 10);
        let permit = permit.expect("permit");
        assert_eq!(gate.check(&subject).await.daily_remaining, 9);
        permit.release().await;
        assert_eq!(gate.check(&subject).await.daily_remaining, 10);

        let (_, permit) = gate.admit("req-2", &subject).await;
        assert!(permit.expect("permit").commit(120).await);
        let snapshot = gate.snapshot(&subject).await.expect("snapshot");
        assert_eq!(snapshot.daily_used, 1);
        assert_eq!(snapshot.monthly_used, 1);
        assert_eq!(snapshot.remaining_today, 9);
        assert_eq!(snapshot.remaining_month, 299);
        assert_eq!(snapshot.last_reset, datetime!(2024-05-10 00:00 UTC));
    }

    #[tokio::test]
    async fn dropped_permit_is_released() {
        let gate = QuotaGate::new(Arc::new(MemoryQuotaStore::new()), QuotaPolicy::default());
        let subject = QuotaSubject::for_workflow("u1", "wf");

        let (_, permit) = gate.admit("req-1", &subject).await;
        drop(permit);
        for _ in 0..50 {
            if gate.check(&subject).await.daily_remaining == 10 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("dropped permit was never released");
    }

    /// Admits through a real store but fails every release.
    struct StuckReleaseStore {
        inner: MemoryQuotaStore,
        release_attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl QuotaStore for StuckReleaseStore {
        async fn check_usage_limit(
            &self,
            subject: &QuotaSubject,
            limits: QuotaLimits,
            now: OffsetDateTime,
        ) -> Result<UsageLimitStatus, QuotaStoreError> {
            self.inner.check_usage_limit(subject, limits, now).await
        }

        async fn increment_usage_count(
            &self,
            subject: &QuotaSubject,
            limits: QuotaLimits,
            tokens_used: u64,
            now: OffsetDateTime,
        ) -> Result<bool, QuotaStoreError> {
            self.inner
                .increment_usage_count(subject, limits, tokens_used, now)
                .await
        }

        async fn reserve_usage(
            &self,
            reservation_id: &str,
            subject: &QuotaSubject,
            limits: QuotaLimits,
            now: OffsetDateTime,
        ) -> Result<UsageLimitStatus, QuotaStoreError> {
            self.inner
                .reserve_usage(reservation_id, subject, limits, now)
                .await
        }

        async fn commit_reservation(
            &self,
            reservation_id: &str,
            tokens_used: u64,
            now: OffsetDateTime,
        ) -> Result<bool, QuotaStoreError> {
            self.inner
                .commit_reservation(reservation_id, tokens_used, now)
                .await
        }

        async fn release_reservation(
            &self,
            _reservation_id: &str,
            _now: OffsetDateTime,
        ) -> Result<bool, QuotaStoreError> {
            self.release_attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(QuotaStoreError::Backend("connection reset".to_string()))
        }

        async fn usage_snapshot(
            &self,
            subject: &QuotaSubject,
            limits: QuotaLimits,
            now: OffsetDateTime,
        ) -> Result<QuotaSnapshot, QuotaStoreError> {
            self.inner.usage_snapshot(subject, limits, now).await
        }
    }

    #[tokio::test]
    async fn failed_background_release_leaves_reservation_to_expire() {
        let store = Arc::new(StuckReleaseStore {
            inner: MemoryQuotaStore::new(),
            release_attempts: std::sync::atomic::AtomicUsize::new(0),
        });
        let gate = QuotaGate::new(store.clone(), QuotaPolicy::default());
        let subject = QuotaSubject::for_workflow("u1", "wf");

        let (_, permit) = gate.admit("req-1", &subject).await;
        drop(permit.expect("permit"));
        for _ in 0..50 {
            if store
                .release_attempts
                .load(std::sync::atomic::Ordering::SeqCst)
                == 1
            {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            store
                .release_attempts
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(gate.check(&subject).await.daily_remaining, 9);
    }
}
