//! Job state machine transitions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::{JobError, JobRecord, JobStatus, RetryPolicy};

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id}: cannot {action} from status '{from}'")]
pub struct InvalidTransition {
    pub job_id: String,
    pub from: JobStatus,
    pub action: &'static str,
}

/// Result of applying a handler outcome to a `processing` record
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Completed(JobRecord),
    /// Back to `queued`; redeliver after `delay`
    Retry { record: JobRecord, delay: Duration },
    Failed(JobRecord),
}

impl Transition {
    pub fn record(&self) -> &JobRecord {
        match self {
            Transition::Completed(record) | Transition::Failed(record) => record,
            Transition::Retry { record, .. } => record,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Transition::Completed(record) | Transition::Failed(record) => record,
            Transition::Retry { record, .. } => record,
        }
    }
}

impl JobRecord {
    fn require(&self, status: JobStatus, action: &'static str) -> Result<(), InvalidTransition> {
        if self.status == status {
            Ok(())
        } else {
            Err(InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                action,
            })
        }
    }

    fn into_failed(mut self, code: &str, message: String, now: DateTime<Utc>) -> JobRecord {
        self.status = JobStatus::Failed;
        self.error_code = Some(code.to_string());
        self.error_message = Some(message);
        self.result = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        self
    }

    /// queued → processing. `started_at` is kept from the first claim.
    pub fn claimed(&self, now: DateTime<Utc>) -> Result<JobRecord, InvalidTransition> {
        self.require(JobStatus::Queued, "claim")?;
        let mut next = self.clone();
        next.status = JobStatus::Processing;
        next.started_at = Some(self.started_at.unwrap_or(now));
        next.updated_at = now;
        Ok(next)
    }

    /// Fold a handler outcome into the record.
    ///
    /// Transient failures consume an attempt and either requeue with a backoff
    /// delay or exhaust the budget (`max_attempts_exceeded`). Permanent
    /// failures fail immediately and leave `attempts` untouched.
    pub fn apply(
        &self,
        outcome: Result<Value, JobError>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Transition, InvalidTransition> {
        self.require(JobStatus::Processing, "apply outcome")?;
        let mut next = self.clone();

        let error = match outcome {
            Ok(result) => {
                next.status = JobStatus::Completed;
                next.result = Some(result);
                next.completed_at = Some(now);
                next.updated_at = now;
                return Ok(Transition::Completed(next));
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            return Ok(Transition::Failed(next.into_failed(
                &error.code,
                error.message,
                now,
            )));
        }

        next.attempts = (next.attempts + 1).min(next.max_attempts);
        next.last_error = Some(error.to_string());

        if next.attempts >= next.max_attempts {
            let message = format!(
                "gave up after {} attempts, last error: {}",
                next.attempts, error
            );
            return Ok(Transition::Failed(next.into_failed(
                "max_attempts_exceeded",
                message,
                now,
            )));
        }

        next.status = JobStatus::Queued;
        next.updated_at = now;
        let delay = policy.delay_for(next.attempts);
        Ok(Transition::Retry { record: next, delay })
    }

    /// queued → failed(`cancelled`)
    pub fn cancelled(&self, now: DateTime<Utc>) -> Result<JobRecord, InvalidTransition> {
        self.require(JobStatus::Queued, "cancel")?;
        Ok(self
            .clone()
            .into_failed("cancelled", "cancelled before processing".to_string(), now))
    }

    /// Fail a non-terminal record without running it (e.g. unknown kind)
    pub fn failed_with(
        &self,
        code: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, InvalidTransition> {
        if self.is_terminal() {
            return Err(InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                action: "fail",
            });
        }
        Ok(self.clone().into_failed(code, message.into(), now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(900))
    }

    fn fresh(max_attempts: u32) -> JobRecord {
        JobRecord::new("user-1", JobKind::Transcript, json!({"video_url": "https://youtu.be/x"}), max_attempts)
    }

    fn assert_invariants(record: &JobRecord) {
        assert!(record.attempts <= record.max_attempts);
        assert_eq!(record.completed_at.is_some(), record.is_terminal());
        assert_eq!(record.error_code.is_some(), record.status == JobStatus::Failed);
        if record.result.is_some() {
            assert_eq!(record.status, JobStatus::Completed);
        }
    }

    #[test]
    fn test_claim_sets_started_once() {
        let record = fresh(3);
        let t0 = Utc::now();
        let claimed = record.claimed(t0).unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.started_at, Some(t0));
        assert_eq!(record.status, JobStatus::Queued);

        let retry = claimed
            .apply(Err(JobError::transient("rate_limited", "429")), &policy(), t0)
            .unwrap()
            .into_record();
        let later = t0 + chrono::Duration::seconds(60);
        let reclaimed = retry.claimed(later).unwrap();
        assert_eq!(reclaimed.started_at, Some(t0));
    }

    #[test]
    fn test_claim_requires_queued() {
        let processing = fresh(3).claimed(Utc::now()).unwrap();
        let err = processing.claimed(Utc::now()).unwrap_err();
        assert_eq!(err.from, JobStatus::Processing);
    }

    #[test]
    fn test_success_completes() {
        let now = Utc::now();
        let claimed = fresh(3).claimed(now).unwrap();
        let transition = claimed.apply(Ok(json!({"text": "hi"})), &policy(), now).unwrap();

        let Transition::Completed(record) = transition else {
            panic!("expected completion");
        };
        assert_eq!(record.result, Some(json!({"text": "hi"})));
        assert_eq!(record.completed_at, Some(now));
        assert_invariants(&record);
    }

    #[test]
    fn test_three_transient_failures_exhaust_attempts() {
        let mut record = fresh(3);
        let now = Utc::now();

        for expected_attempts in 1..=2 {
            let transition = record
                .claimed(now)
                .unwrap()
                .apply(Err(JobError::transient("timeout", "upstream slow")), &policy(), now)
                .unwrap();
            let Transition::Retry { record: next, delay } = transition else {
                panic!("expected retry on attempt {}", expected_attempts);
            };
            assert_eq!(next.status, JobStatus::Queued);
            assert_eq!(next.attempts, expected_attempts);
            assert!(delay <= policy().window(expected_attempts));
            assert_eq!(next.last_error.as_deref(), Some("timeout: upstream slow"));
            assert_invariants(&next);
            record = next;
        }

        let transition = record
            .claimed(now)
            .unwrap()
            .apply(Err(JobError::transient("timeout", "upstream slow")), &policy(), now)
            .unwrap();
        let Transition::Failed(record) = transition else {
            panic!("expected failure");
        };
        assert_eq!(record.error_code.as_deref(), Some("max_attempts_exceeded"));
        assert_eq!(record.attempts, 3);
        assert_invariants(&record);
    }

    #[test]
    fn test_permanent_failure_keeps_attempts() {
        let now = Utc::now();
        let transition = fresh(3)
            .claimed(now)
            .unwrap()
            .apply(Err(JobError::invalid_payload("video_url missing")), &policy(), now)
            .unwrap();

        let Transition::Failed(record) = transition else {
            panic!("expected failure");
        };
        assert_eq!(record.attempts, 0);
        assert_eq!(record.error_code.as_deref(), Some("invalid_payload"));
        assert_eq!(record.error_message.as_deref(), Some("video_url missing"));
        assert_invariants(&record);
    }

    #[test]
    fn test_single_attempt_job_fails_on_first_transient() {
        let now = Utc::now();
        let transition = fresh(1)
            .claimed(now)
            .unwrap()
            .apply(Err(JobError::transient("timeout", "slow")), &policy(), now)
            .unwrap();
        assert!(matches!(transition, Transition::Failed(_)));
        assert_eq!(transition.record().attempts, 1);
    }

    #[test]
    fn test_apply_requires_processing() {
        let err = fresh(3)
            .apply(Ok(json!({})), &policy(), Utc::now())
            .unwrap_err();
        assert_eq!(err.from, JobStatus::Queued);
    }

    #[test]
    fn test_cancel_only_from_queued() {
        let now = Utc::now();
        let cancelled = fresh(3).cancelled(now).unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error_code.as_deref(), Some("cancelled"));
        assert_invariants(&cancelled);

        assert!(cancelled.cancelled(now).is_err());
        assert!(fresh(3).claimed(now).unwrap().cancelled(now).is_err());
    }

    #[test]
    fn test_terminal_states_never_change() {
        let now = Utc::now();
        let failed = fresh(3).failed_with("unknown_job_kind", "no handler", now).unwrap();
        assert_invariants(&failed);

        assert!(failed.claimed(now).is_err());
        assert!(failed.apply(Ok(json!({})), &policy(), now).is_err());
        assert!(failed.failed_with("other", "again", now).is_err());
    }
}
