//! Shutdown hooks, run in registration order once the broker is stopping.
//!
//! The registry freezes when `run()` starts: late registrations are dropped
//! rather than racing the teardown they would have been part of. Each hook
//! gets its own deadline so one stuck resource cannot hold the exit hostage.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// Per-hook deadline during shutdown.
const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

type HookFuture = Pin<Box<dyn Future<Output = crate::Result<()>> + Send>>;
type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

#[derive(Default)]
pub struct Cleaners {
    /// `None` once shutdown has started.
    hooks: Mutex<Option<Vec<(String, Hook)>>>,
}

impl Cleaners {
    pub fn new() -> Cleaners {
        Cleaners {
            hooks: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register a hook to run at shutdown. Ignored (with a log line) if
    /// shutdown has already begun.
    pub fn register<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let name = name.into();

        match &mut *self.hooks.lock().unwrap() {
            Some(hooks) => {
                hooks.push((name, Box::new(move || -> HookFuture { Box::pin(hook()) })));
            }
            None => {
                tracing::debug!(%name, "shutdown already started; ignoring cleanup hook");
            }
        }
    }

    /// Invoke every registered hook in registration order, each under its
    /// own timeout. Failures are logged, never fatal.
    pub async fn run(&self) {
        let hooks = self.hooks.lock().unwrap().take().unwrap_or_default();

        tracing::debug!(count = hooks.len(), "running cleanup hooks");

        for (name, hook) in hooks {
            match tokio::time::timeout(HOOK_TIMEOUT, hook()).await {
                Ok(Ok(())) => tracing::debug!(%name, "cleanup hook finished"),
                Ok(Err(e)) => tracing::error!(%name, "cleanup hook failed: {e:#}"),
                Err(_) => tracing::error!(%name, timeout = ?HOOK_TIMEOUT, "cleanup hook timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let cleaners = Cleaners::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3 {
            let order = Arc::clone(&order);
            cleaners.register(format!("hook-{index}"), move || async move {
                order.lock().unwrap().push(index);
                Ok(())
            });
        }

        cleaners.run().await;
        assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
    }

    #[tokio::test]
    async fn registrations_after_shutdown_are_ignored() {
        let cleaners = Cleaners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        cleaners.run().await;

        let counter = Arc::clone(&calls);
        cleaners.register("late", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        cleaners.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_failing_hook_does_not_stop_the_rest() {
        let cleaners = Cleaners::new();
        let ran = Arc::new(AtomicUsize::new(0));

        cleaners.register("broken", || async {
            Err(color_eyre::eyre::eyre!("nope"))
        });

        let counter = Arc::clone(&ran);
        cleaners.register("fine", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        cleaners.run().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
