//! Submit/poll orchestration for asynchronous upstream jobs.
//!
//! The poller owns only the loop: spacing, deadline, attempt budget and
//! cancellation. Upstream request shapes and status vocabularies stay with
//! the adapter, which supplies `submit`, `poll` and a classifier.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{ConfigError, JobError, ProviderError};
use crate::warnings::WarningCollector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed { reason: Option<String> },
    /// Status string the classifier did not recognize. Not terminal.
    Unknown { status: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Case-insensitive word lists mapping one upstream's native status strings
/// onto [`JobStatus`]. Anything unlisted classifies as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusVocabulary {
    pending: Vec<String>,
    succeeded: Vec<String>,
    failed: Vec<String>,
}

impl StatusVocabulary {
    pub fn new(pending: &[&str], succeeded: &[&str], failed: &[&str]) -> Self {
        let lower = |words: &[&str]| {
            words
                .iter()
                .map(|word| word.to_ascii_lowercase())
                .collect::<Vec<_>>()
        };
        Self {
            pending: lower(pending),
            succeeded: lower(succeeded),
            failed: lower(failed),
        }
    }

    pub fn classify(&self, status: &str, failure_reason: Option<&str>) -> JobStatus {
        let normalized = status.trim().to_ascii_lowercase();
        if self.succeeded.contains(&normalized) {
            JobStatus::Succeeded
        } else if self.failed.contains(&normalized) {
            JobStatus::Failed {
                reason: Some(
                    failure_reason
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("job ended with status {status:?}")),
                ),
            }
        } else if self.pending.contains(&normalized) {
            JobStatus::Pending
        } else {
            JobStatus::Unknown {
                status: status.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Minimum spacing between the end of one poll and the start of the next.
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    /// Growth of the spacing after each pending poll; 1.0 keeps it fixed.
    pub backoff_factor: f64,
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            max_attempts: None,
            backoff_factor: 1.0,
            max_interval: interval,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff_factor = factor;
        self.max_interval = max_interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidPollPolicy {
                reason: "interval must be > 0".to_string(),
            });
        }
        if self.timeout.is_none() && self.max_attempts.is_none() {
            return Err(ConfigError::InvalidPollPolicy {
                reason: "either timeout or max_attempts must be set".to_string(),
            });
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::InvalidPollPolicy {
                reason: "timeout must be > 0".to_string(),
            });
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::InvalidPollPolicy {
                reason: "max_attempts must be >= 1".to_string(),
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidPollPolicy {
                reason: format!("backoff_factor must be >= 1.0: {}", self.backoff_factor),
            });
        }
        if self.max_interval < self.interval {
            return Err(ConfigError::InvalidPollPolicy {
                reason: "max_interval must be >= interval".to_string(),
            });
        }
        Ok(())
    }

    /// Spacing after the `attempt`-th poll (1-based).
    fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(300)),
            max_attempts: None,
            backoff_factor: 1.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

/// What an adapter's `submit` returns: the upstream id plus the first
/// observed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission<T> {
    pub id: String,
    pub payload: T,
}

#[derive(Debug, Clone)]
pub struct JobHandle<T> {
    pub id: String,
    pub status: JobStatus,
    pub payload: T,
    pub submitted_at: Instant,
}

#[derive(Debug, Clone)]
pub struct JobOutcome<T> {
    pub job_id: String,
    pub status: JobStatus,
    pub payload: T,
    /// Poll calls made, not counting the submission.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T: Serialize> JobOutcome<T> {
    /// Returns the payload of a succeeded job, or `JobError::Failed`.
    pub fn into_succeeded(self) -> Result<T, JobError> {
        match self.status {
            JobStatus::Succeeded => Ok(self.payload),
            JobStatus::Failed { reason } => Err(JobError::Failed {
                job_id: self.job_id,
                reason,
                last_payload: serde_json::to_value(&self.payload).ok(),
            }),
            JobStatus::Pending | JobStatus::Unknown { .. } => Err(JobError::Failed {
                job_id: self.job_id,
                reason: Some("job did not reach a terminal state".to_string()),
                last_payload: serde_json::to_value(&self.payload).ok(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobPoller {
    policy: PollPolicy,
}

impl JobPoller {
    pub fn new(policy: PollPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Performs the upstream "create job" call once. Never retried.
    pub async fn submit<T, S, Fut, C>(
        &self,
        submit: S,
        classify: &C,
        cancel: &CancellationToken,
    ) -> Result<JobHandle<T>, ProviderError>
    where
        S: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobSubmission<T>, ProviderError>>,
        C: Fn(&T) -> JobStatus,
    {
        let submission = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(JobError::Canceled { job_id: None, attempts: 0 }.into());
            }
            result = submit() => result?,
        };

        let status = classify(&submission.payload);
        info!(job_id = %submission.id, ?status, "job submitted");

        Ok(JobHandle {
            id: submission.id,
            status,
            payload: submission.payload,
            submitted_at: Instant::now(),
        })
    }

    /// Polls until `classify` reports a terminal status, the deadline passes,
    /// the attempt budget runs out, or `cancel` fires. Always polls at least
    /// once and never issues overlapping polls.
    pub async fn poll_until_terminal<T, P, Fut, C>(
        &self,
        handle: JobHandle<T>,
        mut poll: P,
        classify: C,
        cancel: &CancellationToken,
        warnings: &mut WarningCollector,
    ) -> Result<JobOutcome<T>, JobError>
    where
        T: Serialize,
        P: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        C: Fn(&T) -> JobStatus,
    {
        let job_id = handle.id;
        let started = Instant::now();
        let deadline = self.policy.timeout.map(|timeout| started + timeout);
        let mut last_payload = handle.payload;
        let mut unknown_seen = Vec::new();
        let mut attempts: u32 = 0;

        if let JobStatus::Unknown { status } = &handle.status {
            note_unknown_status(warnings, &mut unknown_seen, status);
        }

        loop {
            if cancel.is_cancelled() {
                return Err(canceled(&job_id, attempts));
            }

            attempts += 1;
            let request = poll(job_id.clone());
            let result = match deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(canceled(&job_id, attempts)),
                    result = timeout_at(deadline, request) => match result {
                        Ok(result) => result,
                        Err(_) => {
                            return Err(self.timed_out(&job_id, attempts, started, &last_payload));
                        }
                    },
                },
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(canceled(&job_id, attempts)),
                    result = request => result,
                },
            };

            let payload = result.map_err(|error| {
                warn!(job_id = %job_id, attempt = attempts, %error, "job poll failed");
                JobError::PollTransport {
                    job_id: job_id.clone(),
                    attempt: attempts,
                    source: Box::new(error),
                }
            })?;

            let status = classify(&payload);
            debug!(job_id = %job_id, attempt = attempts, ?status, "job polled");

            if let JobStatus::Unknown { status } = &status {
                note_unknown_status(warnings, &mut unknown_seen, status);
            }

            if status.is_terminal() {
                info!(job_id = %job_id, attempts, ?status, "job reached terminal state");
                return Ok(JobOutcome {
                    job_id,
                    status,
                    payload,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
            last_payload = payload;

            if self
                .policy
                .max_attempts
                .is_some_and(|max_attempts| attempts >= max_attempts)
            {
                warn!(job_id = %job_id, attempts, "job attempts exhausted");
                return Err(JobError::AttemptsExhausted {
                    job_id,
                    attempts,
                    last_payload: serde_json::to_value(&last_payload).ok(),
                });
            }

            let mut wake = Instant::now() + self.policy.delay_after(attempts);
            if let Some(deadline) = deadline {
                wake = wake.min(deadline);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(canceled(&job_id, attempts)),
                _ = sleep_until(wake) => {}
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(self.timed_out(&job_id, attempts, started, &last_payload));
            }
        }
    }

    /// Submits, then polls unless the first observed status is already terminal.
    pub async fn run<T, S, SFut, P, PFut, C>(
        &self,
        submit: S,
        poll: P,
        classify: C,
        cancel: &CancellationToken,
        warnings: &mut WarningCollector,
    ) -> Result<JobOutcome<T>, ProviderError>
    where
        T: Serialize,
        S: FnOnce() -> SFut,
        SFut: Future<Output = Result<JobSubmission<T>, ProviderError>>,
        P: FnMut(String) -> PFut,
        PFut: Future<Output = Result<T, ProviderError>>,
        C: Fn(&T) -> JobStatus,
    {
        let handle = self.submit(submit, &classify, cancel).await?;

        if handle.status.is_terminal() {
            return Ok(JobOutcome {
                job_id: handle.id,
                status: handle.status,
                payload: handle.payload,
                attempts: 0,
                elapsed: Duration::ZERO,
            });
        }

        Ok(self
            .poll_until_terminal(handle, poll, classify, cancel, warnings)
            .await?)
    }

    fn timed_out<T: Serialize>(
        &self,
        job_id: &str,
        attempts: u32,
        started: Instant,
        last_payload: &T,
    ) -> JobError {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        warn!(job_id = %job_id, attempts, elapsed_ms, "job timed out");
        JobError::TimedOut {
            job_id: job_id.to_string(),
            attempts,
            elapsed_ms,
            last_payload: serde_json::to_value(last_payload).ok(),
        }
    }
}

fn canceled(job_id: &str, attempts: u32) -> JobError {
    debug!(job_id = %job_id, attempts, "job polling canceled");
    JobError::Canceled {
        job_id: Some(job_id.to_string()),
        attempts,
    }
}

fn note_unknown_status(
    warnings: &mut WarningCollector,
    unknown_seen: &mut Vec<String>,
    status: &str,
) {
    if unknown_seen.iter().any(|seen| seen == status) {
        return;
    }
    unknown_seen.push(status.to_string());
    warnings.missing_field(
        "job.status",
        format!("unrecognized job status {status:?}; polling continued"),
    );
}
