//! Operation context
//!
//! Passed to every coordinator entry point. Carries cancellation, an optional
//! deadline and a trace id shared by everything done on behalf of one call.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Cancellation + deadline for one coordinator call
#[derive(Debug, Clone)]
pub struct OpContext {
    pub trace_id: String,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_at(Instant::now() + timeout)
    }

    /// Set (or tighten) the deadline
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Child context: same trace and deadline, cancelled together with the parent
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cap `timeout` by whatever is left of the deadline
    pub fn effective_timeout(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(timeout),
            None => timeout,
        }
    }

    /// Fail fast between steps if the caller gave up
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(OrchestratorError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Race `fut` against cancellation and the deadline
    pub async fn bound<F, T>(&self, subject: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let budget_ms = self
            .remaining()
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let sleep = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            res = fut => res,
            _ = self.cancellation.cancelled() => Err(OrchestratorError::Cancelled),
            _ = sleep => Err(OrchestratorError::Timeout {
                subject: subject.to_string(),
                timeout_ms: budget_ms,
            }),
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}
