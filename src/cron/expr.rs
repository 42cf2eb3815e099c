//! Cron expression handling.
//!
//! Expressions follow the Quartz layout: `sec min hour day-of-month month
//! day-of-week [year]`, with `?` meaning "no specific value". Plain 5-field
//! Unix expressions are accepted too and fire at second zero. All times are
//! UTC.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::error::{MasterError, Result};

/// Bring an expression into the form the `cron` crate parses.
fn normalize(expr: &str) -> String {
    let expr = expr.trim().replace('?', "*");
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr)
    } else {
        expr
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        if expr.trim().is_empty() {
            return Err(MasterError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: "empty expression".to_string(),
            });
        }
        let schedule = Schedule::from_str(&normalize(expr)).map_err(|e| {
            MasterError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            source: expr.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// First fire time at or after `at`.
    pub fn next_at_or_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&(at - Duration::seconds(1)))
            .find(|t| *t >= at)
    }

    /// Every fire time in `[start, end)`.
    ///
    /// Fails with a validation error instead of materializing more than
    /// `limit` entries.
    pub fn fire_times(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let mut times = Vec::new();
        let mut next = self.next_at_or_after(start);
        while let Some(t) = next {
            if t >= end {
                break;
            }
            if times.len() == limit {
                return Err(MasterError::Validation(format!(
                    "cron expression '{}' fires more than {} times between {} and {}",
                    self.source, limit, start, end
                )));
            }
            times.push(t);
            next = self.next_after(t);
        }
        Ok(times)
    }
}
