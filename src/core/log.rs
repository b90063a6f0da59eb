/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Log output formatting and rate limited warnings

use chrono::Local;
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;

pub struct DomainStoreLogFormatter;

impl<S, N> FormatEvent<S, N> for DomainStoreLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "{} {} {}",
            Local::now().format("%FT%T%.6f"),
            metadata.level(),
            metadata.target()
        )?;

        if let Some(line) = metadata.line() {
            write!(&mut writer, ":{line}")?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        }

        write!(writer, ":")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Lets one message through per interval and counts the ones it swallowed.
///
/// Used for warnings that a misbehaving DNS client can trigger on every packet.
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    state: Mutex<RateLimitState>,
}

#[derive(Debug)]
struct RateLimitState {
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(RateLimitState {
                last_emit: None,
                suppressed: 0,
            }),
        }
    }

    /// Returns `Some(suppressed_count)` when the caller should log now.
    pub fn check(&self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Option<u64> {
        let mut state = self.state.lock();
        let due = state
            .last_emit
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            state.suppressed += 1;
            return None;
        }
        state.last_emit = Some(now);
        Some(std::mem::take(&mut state.suppressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_log_counts_suppressed() {
        let limiter = RateLimitedLog::new(Duration::from_secs(120));
        let start = Instant::now();
        assert_eq!(limiter.check_at(start), Some(0));
        assert_eq!(limiter.check_at(start + Duration::from_secs(1)), None);
        assert_eq!(limiter.check_at(start + Duration::from_secs(2)), None);
        assert_eq!(limiter.check_at(start + Duration::from_secs(121)), Some(2));
    }
}
