//! Calendar windows (UTC) and the counter arithmetic shared by every store.

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};

use super::{LimitType, QuotaPeriod, UsageLimitStatus};
use crate::clock::{from_unix_millis, unix_millis};

pub fn window_start(period: QuotaPeriod, now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    let date = match period {
        QuotaPeriod::Daily => now.date(),
        QuotaPeriod::Monthly => now.date().replace_day(1).unwrap_or(now.date()),
    };
    date.with_time(Time::MIDNIGHT).assume_utc()
}

pub fn next_reset(period: QuotaPeriod, now: OffsetDateTime) -> OffsetDateTime {
    let start = window_start(period, now);
    match period {
        QuotaPeriod::Daily => start + Duration::days(1),
        QuotaPeriod::Monthly => {
            let (year, month) = match start.month() {
                time::Month::December => (start.year() + 1, time::Month::January),
                month => (start.year(), month.next()),
            };
            Date::from_calendar_date(year, month, 1)
                .map(|date| date.with_time(Time::MIDNIGHT).assume_utc())
                .unwrap_or(start + Duration::days(31))
        }
    }
}

/// One period's counter for one subject. Times are unix milliseconds so the
/// same value round-trips through SQLite unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub limit: u64,
    pub used: u64,
    pub reserved: u64,
    pub tokens_used: u64,
    pub window_start_ms: i64,
    pub reset_at_ms: i64,
}

impl CounterState {
    pub fn provision(period: QuotaPeriod, limit: u64, now: OffsetDateTime) -> Self {
        Self {
            limit,
            used: 0,
            reserved: 0,
            tokens_used: 0,
            window_start_ms: unix_millis(window_start(period, now)),
            reset_at_ms: unix_millis(next_reset(period, now)),
        }
    }

    /// Starts a new window when `reset_at` has passed. Reservations are carried
    /// over. Returns whether a reset happened.
    pub fn roll_forward(&mut self, period: QuotaPeriod, now: OffsetDateTime) -> bool {
        if unix_millis(now) < self.reset_at_ms {
            return false;
        }
        self.used = 0;
        self.tokens_used = 0;
        self.window_start_ms = unix_millis(window_start(period, now));
        self.reset_at_ms = unix_millis(next_reset(period, now)).max(self.reset_at_ms);
        true
    }

    pub fn remaining(&self) -> u64 {
        self.limit
            .saturating_sub(self.used.saturating_add(self.reserved))
    }

    pub fn window_start(&self) -> OffsetDateTime {
        from_unix_millis(self.window_start_ms)
    }

    pub fn reset_at(&self) -> OffsetDateTime {
        from_unix_millis(self.reset_at_ms)
    }
}

/// Daily is reported before monthly when both are exhausted.
pub fn usage_status(daily: &CounterState, monthly: &CounterState) -> UsageLimitStatus {
    let daily_remaining = daily.remaining();
    let monthly_remaining = monthly.remaining();
    let limit_type = if daily_remaining == 0 {
        Some(LimitType::Daily)
    } else if monthly_remaining == 0 {
        Some(LimitType::Monthly)
    } else {
        None
    };
    UsageLimitStatus {
        can_use: limit_type.is_none(),
        daily_remaining,
        monthly_remaining,
        limit_type,
        limit_reached: limit_type.is_some(),
    }
}
