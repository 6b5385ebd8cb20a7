//! Thread and runtime helpers shared by workers, the control loop and the drain timer.

use crate::error::{MqError, MqResult};
use std::future::Future;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};
use tracing::warn;

/// Single-threaded runtime driven by a dedicated OS thread.
pub(crate) fn current_thread_runtime() -> MqResult<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(MqError::from)
}

/// Run `future` to completion from synchronous code.
///
/// The future runs on a scoped helper thread with its own runtime, so this is safe to call
/// from inside another runtime.
pub(crate) fn run_blocking<F>(future: F) -> MqResult<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    std::thread::scope(|scope| {
        scope
            .spawn(|| current_thread_runtime().map(|rt| rt.block_on(future)))
            .join()
            .map_err(|_| MqError::Internal("blocking task panicked".into()))?
    })
}

/// Wait up to `timeout` for a thread to finish.
///
/// A thread still running at the deadline is detached and keeps running in the background;
/// returns `false` in that case.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration, what: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                thread = what,
                timeout_ms = timeout.as_millis() as u64,
                "Thread did not exit in time, detaching"
            );
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        warn!(thread = what, "Thread exited with a panic");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_blocking_outside_runtime() {
        assert_eq!(run_blocking(async { 40 + 2 }).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_run_blocking_inside_runtime() {
        let value = String::from("borrowed");
        let len = run_blocking(async { value.len() }).unwrap();
        assert_eq!(len, 8);
    }

    #[test]
    fn test_join_bounded() {
        let quick = std::thread::spawn(|| {});
        assert!(join_bounded(quick, Duration::from_secs(1), "quick"));

        let slow = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(300)));
        assert!(!join_bounded(slow, Duration::from_millis(20), "slow"));
    }
}
