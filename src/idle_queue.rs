use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Tracks in-flight storage operations of one database so shutdown can wait
/// until none are running.
#[derive(Default)]
pub struct IdleQueue {
    running: AtomicUsize,
    idle: Notify,
}

/// Decrements the running count when the wrapped call finishes or is dropped.
struct RunningGuard<'a>(&'a IdleQueue);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl IdleQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `fut` as a tracked operation.
    pub async fn wrap_call<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.running.fetch_add(1, Ordering::AcqRel);
        let _guard = RunningGuard(self);
        fut.await
    }

    pub fn is_idle(&self) -> bool {
        self.running.load(Ordering::Acquire) == 0
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Resolves once no tracked operation is running.
    pub async fn request_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a completion in between is not missed
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn idle_when_nothing_runs() {
        let queue = IdleQueue::new();
        assert!(queue.is_idle());
        queue.request_idle().await;
    }

    #[tokio::test]
    async fn waits_for_in_flight_calls() {
        let queue = IdleQueue::new();
        let (release, wait) = oneshot::channel::<()>();

        let q = Arc::clone(&queue);
        let call = tokio::spawn(async move {
            q.wrap_call(async {
                let _ = wait.await;
                7
            })
            .await
        });
        tokio::task::yield_now().await;
        assert_eq!(queue.running(), 1);

        let q = Arc::clone(&queue);
        let idle = tokio::spawn(async move { q.request_idle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!idle.is_finished());

        release.send(()).unwrap();
        assert_eq!(call.await.unwrap(), 7);
        idle.await.unwrap();
        assert!(queue.is_idle());
    }
}
