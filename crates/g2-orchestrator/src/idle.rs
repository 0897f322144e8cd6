//! A resettable idle timer: fires `on_expire` once if `idle` elapses without a
//! `reset()` call, used by both the message pipeline and the task scheduler to
//! close a container's stdin when no new output has arrived for a while.

use std::{future::Future, time::Duration};

use tokio::sync::mpsc;

pub struct IdleTimer {
    reset_tx: mpsc::UnboundedSender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl IdleTimer {
    pub fn spawn<F, Fut>(idle: Duration, mut on_expire: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();
        let handle = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(idle, reset_rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => break,
                    Err(_) => {
                        on_expire().await;
                        break;
                    }
                }
            }
        });
        Self { reset_tx, handle }
    }

    /// Reset-on-results only: session-update-only frames must not call this.
    pub fn reset(&self) {
        let _ = self.reset_tx.send(());
    }

    /// A cloneable, `'static` handle that resets this timer, for use from a task
    /// that outlives the scope holding the `IdleTimer` itself.
    pub fn reset_handle(&self) -> impl Fn() + Send + Clone + 'static {
        let tx = self.reset_tx.clone();
        move || {
            let _ = tx.send(());
        }
    }

    /// Stop the timer without firing `on_expire`.
    pub fn clear(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn fires_on_expire_once_idle() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let timer = IdleTimer::spawn(Duration::from_millis(30), move || {
            let fired = fired_clone.clone();
            async move {
                fired.store(true, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fired.load(Ordering::SeqCst));
        drop(timer);
    }

    #[tokio::test]
    async fn reset_prevents_expiry_within_the_window() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let timer = IdleTimer::spawn(Duration::from_millis(50), move || {
            let fired = fired_clone.clone();
            async move {
                fired.store(true, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        timer.reset();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
        timer.clear();
    }
}
