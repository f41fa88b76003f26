// ABOUTME: Per-project request rate limiting with fixed minute and day windows
// ABOUTME: Lock-free bucket updates and standard X-RateLimit response headers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! # Rate limiter
//!
//! Fixed windows per `(project, window)`: a minute window and a calendar-day
//! window, both checked on every authenticated request. Buckets live in a
//! concurrent map keyed by project; each entry is updated under its own
//! shard lock, so projects never contend with each other.

use crate::constants::limits;
use crate::errors::{AppError, ErrorCode};
use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Per-project limit overrides; defaults apply when absent
#[derive(Debug, Clone, Copy)]
pub struct ProjectLimits {
    /// Requests per minute
    pub per_minute: u32,
    /// Requests per calendar day
    pub per_day: u32,
}

impl Default for ProjectLimits {
    fn default() -> Self {
        Self {
            per_minute: limits::RATE_LIMIT_PER_MINUTE,
            per_day: limits::RATE_LIMIT_PER_DAY,
        }
    }
}

#[derive(Debug)]
struct Buckets {
    minute_start: i64,
    minute_count: u32,
    day_start: i64,
    day_count: u32,
}

/// Outcome of a rate-limit check, also the source of the response headers
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Ceiling of the constraining window
    pub limit: u32,
    /// Requests left in the constraining window
    pub remaining: u32,
    /// Unix seconds when the constraining window resets
    pub reset_at: i64,
    /// Seconds to wait when rejected
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// Convert a rejection into the surfaced error, carrying the standard
    /// rate-limit headers alongside `Retry-After`.
    #[must_use]
    pub fn into_error(self) -> AppError {
        AppError::new(ErrorCode::RateLimited, ErrorCode::RateLimited.description())
            .with_retry_after(self.retry_after_secs)
            .with_header(crate::constants::headers::RATE_LIMIT_LIMIT, self.limit.to_string())
            .with_header(
                crate::constants::headers::RATE_LIMIT_REMAINING,
                self.remaining.to_string(),
            )
            .with_header(crate::constants::headers::RATE_LIMIT_RESET, self.reset_at.to_string())
    }
}

/// Process-wide limiter; buckets are process-local by design (each worker
/// enforces its own slice, the store is never on this path)
pub struct RateLimiter {
    buckets: DashMap<Uuid, Buckets>,
    overrides: DashMap<Uuid, ProjectLimits>,
}

impl RateLimiter {
    /// Limiter with default tiers
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            overrides: DashMap::new(),
        }
    }

    /// Install per-project limits (dashboard-configured tiers)
    pub fn set_project_limits(&self, project_id: Uuid, project_limits: ProjectLimits) {
        self.overrides.insert(project_id, project_limits);
    }

    /// Count one request against the project and decide.
    #[must_use]
    pub fn check(&self, project_id: Uuid) -> RateLimitDecision {
        self.check_at(project_id, Utc::now())
    }

    /// Deterministic-clock variant backing [`Self::check`]
    #[must_use]
    pub fn check_at(&self, project_id: Uuid, now: DateTime<Utc>) -> RateLimitDecision {
        let project_limits = self
            .overrides
            .get(&project_id)
            .map_or_else(ProjectLimits::default, |entry| *entry);

        let minute_start = now.timestamp() - i64::from(now.second());
        let day_start = day_window_start(now);

        let mut entry = self.buckets.entry(project_id).or_insert_with(|| Buckets {
            minute_start,
            minute_count: 0,
            day_start,
            day_count: 0,
        });

        if entry.minute_start != minute_start {
            entry.minute_start = minute_start;
            entry.minute_count = 0;
        }
        if entry.day_start != day_start {
            entry.day_start = day_start;
            entry.day_count = 0;
        }

        let minute_exceeded = entry.minute_count >= project_limits.per_minute;
        let day_exceeded = entry.day_count >= project_limits.per_day;

        if minute_exceeded || day_exceeded {
            // report the window that actually blocks, preferring the one
            // that frees up later
            let minute_reset = minute_start + 60;
            let day_reset = day_start + 86_400;
            let (limit, reset_at) = if day_exceeded {
                (project_limits.per_day, day_reset)
            } else {
                (project_limits.per_minute, minute_reset)
            };
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after_secs: (reset_at - now.timestamp()).max(1) as u64,
            };
        }

        entry.minute_count += 1;
        entry.day_count += 1;

        // headers reflect the tighter of the two windows
        let minute_remaining = project_limits.per_minute - entry.minute_count;
        let day_remaining = project_limits.per_day - entry.day_count;
        let (limit, remaining, reset_at) = if day_remaining < minute_remaining {
            (project_limits.per_day, day_remaining, day_start + 86_400)
        } else {
            (project_limits.per_minute, minute_remaining, minute_start + 60)
        };

        RateLimitDecision {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after_secs: 0,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn day_window_start(now: DateTime<Utc>) -> i64 {
    now.date_naive().and_hms_opt(0, 0, 0).map_or_else(
        || now.timestamp() - now.timestamp().rem_euclid(86_400),
        |midnight| midnight.and_utc().timestamp(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn minute_window_enforced() {
        let limiter = RateLimiter::new();
        let project = Uuid::new_v4();
        limiter.set_project_limits(
            project,
            ProjectLimits {
                per_minute: 3,
                per_day: 100,
            },
        );
        let now = Utc::now();

        for _ in 0..3 {
            assert!(limiter.check_at(project, now).allowed);
        }
        let rejected = limiter.check_at(project, now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.limit, 3);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after_secs >= 1);

        // a new minute clears the window
        let later = now + Duration::seconds(61);
        assert!(limiter.check_at(project, later).allowed);
    }

    #[test]
    fn day_window_enforced_across_minutes() {
        let limiter = RateLimiter::new();
        let project = Uuid::new_v4();
        limiter.set_project_limits(
            project,
            ProjectLimits {
                per_minute: 100,
                per_day: 2,
            },
        );
        let now = Utc::now();

        assert!(limiter.check_at(project, now).allowed);
        assert!(limiter.check_at(project, now + Duration::minutes(2)).allowed);
        let rejected = limiter.check_at(project, now + Duration::minutes(4));
        assert!(!rejected.allowed);
        assert_eq!(rejected.limit, 2);
    }

    #[test]
    fn projects_do_not_share_buckets() {
        let limiter = RateLimiter::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        limiter.set_project_limits(
            a,
            ProjectLimits {
                per_minute: 1,
                per_day: 10,
            },
        );
        let now = Utc::now();

        assert!(limiter.check_at(a, now).allowed);
        assert!(!limiter.check_at(a, now).allowed);
        // project b is untouched by a's exhaustion
        assert!(limiter.check_at(b, now).allowed);
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = RateLimiter::new();
        let project = Uuid::new_v4();
        let now = Utc::now();

        let first = limiter.check_at(project, now);
        let second = limiter.check_at(project, now);
        assert!(first.remaining > second.remaining);
    }
}
