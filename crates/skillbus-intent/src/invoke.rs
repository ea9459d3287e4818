//! Bounded invocation of skill code.
//!
//! Every call into a skill runs on its own tokio task so that a timeout or a
//! session close can abort it and a panic stays inside the task.  Failures
//! are logged here and reported as an [`Invocation`] variant; they never
//! propagate to the caller as errors.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Result;

/// How a bounded skill call ended.
#[derive(Debug)]
pub(crate) enum Invocation<T> {
    /// The skill returned a value.
    Completed(T),
    /// The skill returned an error or panicked.
    Failed(String),
    /// The call exceeded its timeout and was aborted.
    TimedOut,
    /// The cancel signal fired and the call was aborted.
    Cancelled,
}

/// Run `work` on its own task, bounded by `timeout` and, when given, by the
/// `cancel` signal flipping to `true`.
pub(crate) async fn invoke<T, F>(
    what: &'static str,
    skill_id: &str,
    timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
    work: F,
) -> Invocation<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let mut task = tokio::spawn(work);

    tokio::select! {
        joined = tokio::time::timeout(timeout, &mut task) => match joined {
            Ok(Ok(Ok(value))) => Invocation::Completed(value),
            Ok(Ok(Err(e))) => {
                tracing::warn!(skill_id = %skill_id, what, error = %e, "skill handler failed");
                Invocation::Failed(e.to_string())
            }
            Ok(Err(join)) => {
                tracing::error!(skill_id = %skill_id, what, error = %join, "skill handler panicked");
                Invocation::Failed(join.to_string())
            }
            Err(_) => {
                task.abort();
                tracing::warn!(skill_id = %skill_id, what, ?timeout, "skill handler timed out, cancelled");
                Invocation::TimedOut
            }
        },
        () = wait_closed(cancel) => {
            task.abort();
            tracing::info!(skill_id = %skill_id, what, "session closed, skill handler cancelled");
            Invocation::Cancelled
        }
    }
}

/// Stand-in for "never" when a deadline would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// The instant `after` from now, clamped to [`FAR_FUTURE`].
pub(crate) fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after.min(FAR_FUTURE)).unwrap_or(now)
}

/// `deadline` pushed back by `by`, unchanged when that would overflow.
pub(crate) fn extend_deadline(deadline: Instant, by: Duration) -> Instant {
    deadline.checked_add(by.min(FAR_FUTURE)).unwrap_or(deadline)
}

/// Resolve once `signal` reads `true`.  Never resolves without a signal or
/// when the sender goes away first.
pub(crate) async fn wait_closed(signal: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = signal {
        if rx.wait_for(|closed| *closed).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntentError;

    #[tokio::test]
    async fn completes_and_reports_errors() {
        let ok = invoke("test", "s", Duration::from_secs(1), None, async { Ok::<_, IntentError>(7) }).await;
        assert!(matches!(ok, Invocation::Completed(7)));

        let err: Invocation<()> = invoke("test", "s", Duration::from_secs(1), None, async {
            Err(IntentError::Internal("boom".into()))
        })
        .await;
        assert!(matches!(err, Invocation::Failed(_)));
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let broken = true;
        let result: Invocation<()> = invoke("test", "s", Duration::from_secs(1), None, async move {
            if broken {
                panic!("skill bug");
            }
            Ok::<_, IntentError>(())
        })
        .await;
        assert!(matches!(result, Invocation::Failed(_)));
    }

    #[tokio::test]
    async fn times_out() {
        let result: Invocation<()> = invoke("test", "s", Duration::from_millis(20), None, async {
            std::future::pending::<()>().await;
            Ok::<_, IntentError>(())
        })
        .await;
        assert!(matches!(result, Invocation::TimedOut));
    }

    #[tokio::test]
    async fn cancel_signal_aborts() {
        let (tx, rx) = watch::channel(false);
        let call = tokio::spawn(invoke("test", "s", Duration::from_secs(5), Some(rx), async {
            std::future::pending::<()>().await;
            Ok::<_, IntentError>(())
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(true);
        assert!(matches!(call.await.unwrap(), Invocation::Cancelled));
    }

    #[tokio::test]
    async fn dropped_signal_never_cancels() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let result = invoke("test", "s", Duration::from_secs(1), Some(rx), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, IntentError>("done")
        })
        .await;
        assert!(matches!(result, Invocation::Completed("done")));
    }

    #[tokio::test]
    async fn huge_deadlines_saturate() {
        let start = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > start + Duration::from_secs(365 * 24 * 60 * 60));

        let extended = extend_deadline(deadline, Duration::MAX);
        assert!(extended >= deadline);

        let soon = deadline_after(Duration::from_millis(5));
        assert_eq!(extend_deadline(soon, Duration::from_millis(5)), soon + Duration::from_millis(5));
    }
}
