use crate::error::{PersistenceError, Result};
use std::future::{Future, pending};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Per-call context passed to every operation that reaches the driver.
///
/// Carries the trace (correlation) id used to tag errors and log lines, and
/// optionally a caller-owned cancellation token and a deadline. Both are
/// raced against each driver call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    trace_id: String,
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            cancellation: None,
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Drive `fut` to completion unless the caller cancels or the deadline
    /// passes first.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<PersistenceError>,
    {
        if self.is_cancelled() {
            return Err(PersistenceError::Cancelled {
                trace_id: self.trace_id.clone(),
            });
        }

        let cancelled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(PersistenceError::Cancelled {
                trace_id: self.trace_id.clone(),
            }),
            _ = expired => Err(PersistenceError::Timeout {
                trace_id: self.trace_id.clone(),
            }),
            res = fut => res.map_err(Into::into),
        }
    }
}

impl From<&str> for CallContext {
    fn from(trace_id: &str) -> Self {
        Self::new(trace_id)
    }
}

impl From<String> for CallContext {
    fn from(trace_id: String) -> Self {
        Self::new(trace_id)
    }
}
