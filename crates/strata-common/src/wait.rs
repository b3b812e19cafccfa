//! Bounded polling for eventually-consistent provider resources
//!
//! Every wait-for-active / wait-for-deleted step in Strata goes through
//! [`wait_until`]. Exceeding the timeout is an error, never a silent continue.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::lifecycle::ResourceState;
use crate::{Error, Result};

/// Polling interval and hard timeout for one resource class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Time between checks
    pub interval: Duration,
    /// Maximum total wait
    pub timeout: Duration,
}

impl WaitPolicy {
    /// Create a wait policy
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Policy from whole seconds
    pub const fn secs(interval: u64, timeout: u64) -> Self {
        Self::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }
}

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Transient errors keep polling, anything else stops immediately
pub type PollResult<T> = Result<Option<T>>;

/// Poll `check` until it yields a value or the policy's timeout expires.
///
/// The check always runs at least once.
pub async fn wait_until<T, F, Fut>(policy: WaitPolicy, description: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();

    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(what = %description, elapsed_secs = start.elapsed().as_secs(), "Waiting...");
            }
            Err(e) if e.is_retryable() => {
                debug!(what = %description, error = %e, "Transient error while polling");
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= policy.timeout {
            return Err(Error::timeout(description, policy.timeout));
        }
        tokio::time::sleep(policy.interval).await;
    }
}

/// Wait until a resource check reports `target`.
///
/// A `Failed` state aborts the wait with a provider error naming the resource.
pub async fn wait_for_state<F, Fut>(
    policy: WaitPolicy,
    what: &str,
    target: ResourceState,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ResourceState>>,
{
    wait_until(policy, what, || {
        let observed = check();
        let target = target.clone();
        async move {
            match observed.await? {
                state if state == target => Ok(Some(())),
                ResourceState::Failed(reason) => Err(Error::provider_fatal(
                    what,
                    "wait",
                    format!("resource entered Failed state: {}", reason),
                )),
                _ => Ok(None),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::ErrorKind;

    fn fast() -> WaitPolicy {
        WaitPolicy::new(Duration::from_millis(1), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn returns_value_once_ready() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        let value = wait_until(fast(), "thing", || {
            let p = p.clone();
            async move {
                if p.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(None)
                } else {
                    Ok(Some("ready"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_timeout_error() {
        let policy = WaitPolicy::secs(30, 120);
        let err = wait_until(policy, "control plane active", || async {
            PollResult::<()>::Ok(None)
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("control plane active"));
    }

    #[tokio::test]
    async fn transient_errors_keep_polling() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        wait_until(fast(), "nat", || {
            let p = p.clone();
            async move {
                if p.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::provider_transient("aws/ec2", "Describe", "throttled"))
                } else {
                    Ok(Some(()))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let err = wait_until(fast(), "vpc", || async {
            PollResult::<()>::Err(Error::provider_fatal("aws/ec2", "Describe", "denied"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProviderFatal);
    }

    #[tokio::test]
    async fn failed_resource_state_aborts_wait() {
        let err = wait_for_state(fast(), "node group", ResourceState::Active, || async {
            Ok(ResourceState::Failed("AsgInstanceLaunchFailures".into()))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProviderFatal);
        assert!(err.to_string().contains("AsgInstanceLaunchFailures"));
    }

    #[tokio::test]
    async fn waits_for_absent() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        wait_for_state(fast(), "cluster", ResourceState::Absent, || {
            let p = p.clone();
            async move {
                Ok(if p.fetch_add(1, Ordering::SeqCst) < 1 {
                    ResourceState::Deleting
                } else {
                    ResourceState::Absent
                })
            }
        })
        .await
        .unwrap();
    }
}
