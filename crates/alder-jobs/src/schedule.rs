//! Validated 5-field POSIX cron expressions.
//!
//! The underlying `cron` crate speaks a seconds-extended dialect; this
//! wrapper accepts only the classic 5-field form (minute, hour, day of
//! month, month, day of week), pins the seconds field to `0`, and evaluates
//! everything in UTC. Ranges, lists, steps, and wildcards all work;
//! `@`-macros and the seconds/years extensions are rejected.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{JobError, Result};

/// Bound on accepted expression length.
const MAX_EXPRESSION_LENGTH: usize = 256;

/// A validated 5-field POSIX cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    expression: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    /// Parse and validate a 5-field POSIX cron expression.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(JobError::InvalidCron {
                expression: input.to_string(),
                reason: "expression is empty".to_string(),
            });
        }
        if input.len() > MAX_EXPRESSION_LENGTH {
            let head: String = input.chars().take(32).collect();
            return Err(JobError::InvalidCron {
                expression: format!("{head}…"),
                reason: format!("expression exceeds {MAX_EXPRESSION_LENGTH} characters"),
            });
        }
        if input.starts_with('@') {
            return Err(JobError::InvalidCron {
                expression: input.to_string(),
                reason: "@-macros are not supported; spell out the five fields".to_string(),
            });
        }

        let fields: Vec<&str> = input.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(JobError::InvalidCron {
                expression: input.to_string(),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        }

        let expression = fields.join(" ");
        // The cron crate expects a leading seconds field; pin it to zero so
        // firings align with whole minutes.
        let padded = format!("0 {expression}");
        let schedule = cron::Schedule::from_str(&padded).map_err(|e| JobError::InvalidCron {
            expression: expression.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self { expression, schedule })
    }

    /// The normalised 5-field expression.
    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// The first firing instant strictly after `after`, in UTC. `None` when
    /// the expression has no future firing.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronExpr {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
