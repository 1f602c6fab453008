use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use http::StatusCode;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::ServiceError;
use crate::response::ResponseHead;
use crate::util::{epoch_seconds, parse_http_date};

pub const DEFAULT_CLOCK_SKEW_THRESHOLD: Duration = Duration::from_secs(4 * 60);

const CLOCK_SKEW_ERROR_CODES: [&str; 6] = [
    "RequestTimeTooSkewed",
    "RequestExpired",
    "RequestInTheFuture",
    "InvalidSignatureException",
    "SignatureDoesNotMatch",
    "AuthFailure",
];

pub(crate) fn is_clock_skew_error_code(code: &str) -> bool {
    CLOCK_SKEW_ERROR_CODES.contains(&code)
}

static GLOBAL_TIME_OFFSET: OnceLock<ClockSkewState> = OnceLock::new();

/// Shared estimate of `local - server` time, in seconds.
///
/// Clients use the process-wide cell from [`ClockSkewState::global`] unless
/// given their own.
#[derive(Clone, Debug, Default)]
pub struct ClockSkewState {
    offset_seconds: Arc<AtomicI64>,
}

impl ClockSkewState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Self {
        GLOBAL_TIME_OFFSET.get_or_init(Self::new).clone()
    }

    pub fn offset_seconds(&self) -> i64 {
        self.offset_seconds.load(Ordering::Acquire)
    }

    pub fn set_offset_seconds(&self, offset_seconds: i64) {
        self.offset_seconds.store(offset_seconds, Ordering::Release);
    }
}

/// Decides when the local clock has drifted far enough from the service's
/// to correct signing times.
pub struct ClockSkewAdjuster {
    threshold: Duration,
    clock: Arc<dyn Clock>,
    state: ClockSkewState,
}

impl std::fmt::Debug for ClockSkewAdjuster {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClockSkewAdjuster")
            .field("threshold", &self.threshold)
            .field("state", &self.state)
            .finish()
    }
}

impl Default for ClockSkewAdjuster {
    fn default() -> Self {
        Self::new(ClockSkewState::global(), DEFAULT_CLOCK_SKEW_THRESHOLD)
    }
}

impl ClockSkewAdjuster {
    pub fn new(state: ClockSkewState, threshold: Duration) -> Self {
        Self::with_clock(state, threshold, Arc::new(SystemClock))
    }

    pub fn with_clock(state: ClockSkewState, threshold: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold,
            clock,
            state,
        }
    }

    pub fn state(&self) -> &ClockSkewState {
        &self.state
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Records the skew seen on a successful response. Returns the new
    /// shared offset when one was stored.
    pub fn update_estimated_skew(&self, response: &ResponseHead) -> Option<i64> {
        let server_time = parse_http_date(&response.headers)?;
        let skew = self.skew_seconds(self.clock.now_system(), server_time);
        if !self.exceeds_threshold(skew) {
            return None;
        }
        debug!(skew_seconds = skew, "estimated clock skew updated from response");
        self.state.set_offset_seconds(skew);
        Some(skew)
    }

    /// Offset the next attempt should sign with, or `None` when the error is
    /// not attributable to clock skew.
    ///
    /// `current_offset` is the offset the failed attempt was signed with.
    pub fn get_adjustment(
        &self,
        current_offset: i64,
        response: &ResponseHead,
        error: &ServiceError,
    ) -> Option<i64> {
        let server_time = parse_http_date(&response.headers)
            .or_else(|| server_time_from_message(&error.message))?;
        let now = self.clock.now_system();
        let signed_at = epoch_seconds(now) - current_offset as f64;
        let observed_skew = (signed_at - epoch_seconds(server_time)).round() as i64;

        let skew_error = error.error_code().is_some_and(is_clock_skew_error_code);
        let auth_error =
            response.status == StatusCode::UNAUTHORIZED || response.status == StatusCode::FORBIDDEN;
        if !skew_error && !(auth_error && self.exceeds_threshold(observed_skew)) {
            return None;
        }

        let offset = self.skew_seconds(now, server_time);
        debug!(
            current_offset,
            offset,
            error_code = error.error_code().unwrap_or(""),
            "adjusting request time offset for clock skew"
        );
        self.state.set_offset_seconds(offset);
        Some(offset)
    }

    fn skew_seconds(&self, local: SystemTime, server: SystemTime) -> i64 {
        (epoch_seconds(local) - epoch_seconds(server)).round() as i64
    }

    fn exceeds_threshold(&self, skew_seconds: i64) -> bool {
        skew_seconds.unsigned_abs() >= self.threshold.as_secs()
    }
}

/// Pulls the last compact ISO-8601 timestamp (`20240101T120000Z`) out of an
/// error message, which is where services put their own time.
fn server_time_from_message(message: &str) -> Option<SystemTime> {
    message
        .split(|character: char| !character.is_ascii_alphanumeric())
        .filter_map(parse_compact_timestamp)
        .last()
}

fn parse_compact_timestamp(token: &str) -> Option<SystemTime> {
    let bytes = token.as_bytes();
    if bytes.len() != 16 || bytes[8] != b'T' || bytes[15] != b'Z' {
        return None;
    }
    let number = |range: std::ops::Range<usize>| -> Option<i64> {
        let text = token.get(range)?;
        if !text.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        text.parse().ok()
    };
    let year = number(0..4)?;
    let month = number(4..6)?;
    let day = number(6..8)?;
    let hour = number(9..11)?;
    let minute = number(11..13)?;
    let second = number(13..15)?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60 {
        return None;
    }

    let seconds = days_from_civil(year, month, day) * 86_400 + hour * 3_600 + minute * 60 + second;
    let seconds = u64::try_from(seconds).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(seconds))
}

// Howard Hinnant's days-from-civil.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let year_of_era = year - era * 400;
    let shifted_month = (month + 9) % 12;
    let day_of_year = (153 * shifted_month + 2) / 5 + day - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * 146_097 + day_of_era - 719_468
}
