use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::window::{CounterState, usage_status};
use super::{
    DEFAULT_RESERVATION_TTL, QuotaLimits, QuotaPeriod, QuotaSnapshot, QuotaStore, QuotaStoreError,
    QuotaSubject, UsageLimitStatus,
};
use crate::clock::unix_millis;

/// Single-process quota store. Every operation runs under one lock, which is
/// what makes check-and-increment atomic here.
#[derive(Debug)]
pub struct MemoryQuotaStore {
    state: Mutex<MemoryState>,
    reservation_ttl: Duration,
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<(String, QuotaPeriod), CounterState>,
    reservations: HashMap<String, Reservation>,
}

#[derive(Debug)]
struct Reservation {
    subject_key: String,
    created_at_ms: i64,
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            reservation_ttl: DEFAULT_RESERVATION_TTL,
        }
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    /// Seeds (or overwrites) one counter, provisioning it for the window that
    /// contains `now`.
    pub fn set_counter(
        &self,
        subject: &QuotaSubject,
        period: QuotaPeriod,
        limit: u64,
        used: u64,
        now: OffsetDateTime,
    ) -> Result<(), QuotaStoreError> {
        let mut state = self.lock()?;
        let counter = state
            .counters
            .entry((subject.key(), period))
            .or_insert_with(|| CounterState::provision(period, limit, now));
        counter.limit = limit;
        counter.used = used;
        Ok(())
    }

    /// Raw counter state, for inspection.
    pub fn counter(
        &self,
        subject: &QuotaSubject,
        period: QuotaPeriod,
    ) -> Result<Option<CounterState>, QuotaStoreError> {
        let state = self.lock()?;
        Ok(state.counters.get(&(subject.key(), period)).copied())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, QuotaStoreError> {
        self.state
            .lock()
            .map_err(|_| QuotaStoreError::Corrupt("quota state lock poisoned".to_string()))
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.reservation_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

impl MemoryState {
    fn reap_expired(&mut self, now_ms: i64, ttl_ms: i64) {
        let expired: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, reservation)| reservation.created_at_ms.saturating_add(ttl_ms) <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(reservation) = self.reservations.remove(&id) {
                tracing::debug!(reservation_id = %id, "reaping expired quota reservation");
                self.unreserve(&reservation.subject_key);
            }
        }
    }

    fn unreserve(&mut self, subject_key: &str) {
        for period in QuotaPeriod::ALL {
            if let Some(counter) = self.counters.get_mut(&(subject_key.to_string(), period)) {
                counter.reserved = counter.reserved.saturating_sub(1);
            }
        }
    }

    fn load(&mut self, key: &str, limits: QuotaLimits, now: OffsetDateTime) -> [CounterState; 2] {
        QuotaPeriod::ALL.map(|period| {
            let counter = self
                .counters
                .entry((key.to_string(), period))
                .or_insert_with(|| CounterState::provision(period, limits.for_period(period), now));
            counter.roll_forward(period, now);
            *counter
        })
    }

    fn save(&mut self, key: &str, counters: [CounterState; 2]) {
        for (period, counter) in QuotaPeriod::ALL.into_iter().zip(counters) {
            self.counters.insert((key.to_string(), period), counter);
        }
    }

    /// Rolls an existing subject's counters forward without provisioning.
    fn roll_existing(&mut self, key: &str, now: OffsetDateTime) -> Option<[CounterState; 2]> {
        let mut out = Vec::with_capacity(2);
        for period in QuotaPeriod::ALL {
            let counter = self.counters.get_mut(&(key.to_string(), period))?;
            counter.roll_forward(period, now);
            out.push(*counter);
        }
        out.try_into().ok()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn check_usage_limit(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, QuotaStoreError> {
        let ttl_ms = self.ttl_ms();
        let mut state = self.lock()?;
        state.reap_expired(unix_millis(now), ttl_ms);
        let [daily, monthly] = state.load(&subject.key(), limits, now);
        Ok(usage_status(&daily, &monthly))
    }

    async fn increment_usage_count(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError> {
        let ttl_ms = self.ttl_ms();
        let key = subject.key();
        let mut state = self.lock()?;
        state.reap_expired(unix_millis(now), ttl_ms);
        let [mut daily, mut monthly] = state.load(&key, limits, now);
        if !usage_status(&daily, &monthly).can_use {
            return Ok(false);
        }
        for counter in [&mut daily, &mut monthly] {
            counter.used += 1;
            counter.tokens_used = counter.tokens_used.saturating_add(tokens_used);
        }
        state.save(&key, [daily, monthly]);
        Ok(true)
    }

    async fn reserve_usage(
        &self,
        reservation_id: &str,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<UsageLimitStatus, QuotaStoreError> {
        let ttl_ms = self.ttl_ms();
        let key = subject.key();
        let mut state = self.lock()?;
        state.reap_expired(unix_millis(now), ttl_ms);
        if state.reservations.contains_key(reservation_id) {
            return Err(QuotaStoreError::Corrupt(format!(
                "reservation {reservation_id} already exists"
            )));
        }
        let [mut daily, mut monthly] = state.load(&key, limits, now);
        let status = usage_status(&daily, &monthly);
        if !status.can_use {
            return Ok(status);
        }
        daily.reserved += 1;
        monthly.reserved += 1;
        state.save(&key, [daily, monthly]);
        state.reservations.insert(
            reservation_id.to_string(),
            Reservation {
                subject_key: key,
                created_at_ms: unix_millis(now),
            },
        );
        Ok(status)
    }

    async fn commit_reservation(
        &self,
        reservation_id: &str,
        tokens_used: u64,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError> {
        let ttl_ms = self.ttl_ms();
        let mut state = self.lock()?;
        state.reap_expired(unix_millis(now), ttl_ms);
        let Some(reservation) = state.reservations.remove(reservation_id) else {
            return Ok(false);
        };
        let Some([mut daily, mut monthly]) = state.roll_existing(&reservation.subject_key, now)
        else {
            return Err(QuotaStoreError::Corrupt(format!(
                "reservation {reservation_id} has no counters"
            )));
        };
        for counter in [&mut daily, &mut monthly] {
            counter.reserved = counter.reserved.saturating_sub(1);
            counter.used += 1;
            counter.tokens_used = counter.tokens_used.saturating_add(tokens_used);
        }
        state.save(&reservation.subject_key, [daily, monthly]);
        Ok(true)
    }

    async fn release_reservation(
        &self,
        reservation_id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, QuotaStoreError> {
        let ttl_ms = self.ttl_ms();
        let mut state = self.lock()?;
        state.reap_expired(unix_millis(now), ttl_ms);
        let Some(reservation) = state.reservations.remove(reservation_id) else {
            return Ok(false);
        };
        state.unreserve(&reservation.subject_key);
        Ok(true)
    }

    async fn usage_snapshot(
        &self,
        subject: &QuotaSubject,
        limits: QuotaLimits,
        now: OffsetDateTime,
    ) -> Result<QuotaSnapshot, QuotaStoreError> {
        let ttl_ms = self.ttl_ms();
        let mut state = self.lock()?;
        state.reap_expired(unix_millis(now), ttl_ms);
        let [daily, monthly] = state.load(&subject.key(), limits, now);
        Ok(QuotaSnapshot {
            daily_used: daily.used,
            daily_limit: daily.limit,
            monthly_used: monthly.used,
            monthly_limit: monthly.limit,
            remaining_today: daily.remaining(),
            remaining_month: monthly.remaining(),
            last_reset: daily.window_start(),
        })
    }
}
