use crate::{Error, Result};
use std::{future::Future, time::Duration};
use tokio::time;

/// Bounds the retries of an optimistic read-modify-write cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: usize,
    pub interval: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_millis(10),
        }
    }
}

/// Runs `attempt` until it completes with anything other than a store
/// conflict, re-running it from scratch after each conflict.
///
/// Each attempt must re-read the state it modifies.
pub async fn on_conflict<T, F, Fut>(backoff: Backoff, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Err(Error::Store(error)) if error.is_conflict() => {
                if attempts >= backoff.attempts {
                    tracing::warn!(attempts, %error, "Giving up after repeated conflicts");
                    return Err(Error::RetriesExhausted {
                        attempts,
                        source: error,
                    });
                }
                tracing::debug!(attempts, %error, "Retrying after conflict");
                time::sleep(backoff.interval).await;
            }
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conflict() -> Error {
        Error::Store(store::Error::Conflict {
            kind: "secret",
            name: "claim".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_conflicts_until_success() {
        let calls = &AtomicUsize::new(0);
        let res = on_conflict(Backoff::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let calls = &AtomicUsize::new(0);
        let res: Result<()> = on_conflict(Backoff::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;
        assert!(matches!(
            res,
            Err(Error::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn does_not_retry_other_errors() {
        let calls = &AtomicUsize::new(0);
        let res: Result<()> = on_conflict(Backoff::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::SelfConnection)
        })
        .await;
        assert!(matches!(res, Err(Error::SelfConnection)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
