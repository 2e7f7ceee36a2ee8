use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{error, warn};

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Process-wide cancellation context. Sessions register a best-effort
/// teardown here instead of installing their own signal handlers; on
/// interrupt every still-registered cleanup runs before the process
/// exits.
pub struct CancelContext {
    cleanups: Mutex<HashMap<u64, CleanupFn>>,
    next_id: AtomicU64,
    cancelled: AtomicBool,
    handler_installed: AtomicBool,
}

impl CancelContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cleanups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancelled: AtomicBool::new(false),
            handler_installed: AtomicBool::new(false),
        })
    }

    /// Hooks Ctrl-C. Safe to call once per process; later calls are
    /// no-ops.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        if self.handler_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })?;

        let ctx = self.clone();
        tokio::spawn(async move {
            if rx.recv().await.is_some() {
                warn!("Interrupt received, tearing down registered sessions");
                ctx.cancelled.store(true, Ordering::SeqCst);
                ctx.run_cleanups().await;
                std::process::exit(130);
            }
        });

        Ok(())
    }

    /// Registers a cleanup and returns the id used to deregister it
    /// after an orderly teardown.
    pub fn register<F, Fut>(&self, cleanup: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let boxed: CleanupFn = Box::new(move || Box::pin(cleanup()));
        match self.cleanups.lock() {
            Ok(mut map) => {
                map.insert(id, boxed);
            }
            Err(e) => error!("Cleanup registry poisoned: {}", e),
        }
        id
    }

    pub fn deregister(&self, id: u64) {
        if let Ok(mut map) = self.cleanups.lock() {
            map.remove(&id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs and drains every registered cleanup. Cleanups are themselves
    /// best-effort and must not panic.
    pub async fn run_cleanups(&self) {
        let drained: Vec<CleanupFn> = match self.cleanups.lock() {
            Ok(mut map) => std::mem::take(&mut *map).into_values().collect(),
            Err(e) => {
                error!("Cleanup registry poisoned: {}", e);
                Vec::new()
            }
        };
        for cleanup in drained {
            cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn cleanups_run_once_and_deregistered_ones_do_not() {
        let ctx = CancelContext::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_a = ran.clone();
        let _keep = ctx.register(move || async move {
            ran_a.fetch_add(1, Ordering::SeqCst);
        });

        let ran_b = ran.clone();
        let removed = ctx.register(move || async move {
            ran_b.fetch_add(10, Ordering::SeqCst);
        });
        ctx.deregister(removed);

        ctx.run_cleanups().await;
        ctx.run_cleanups().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn starts_uncancelled() {
        let ctx = CancelContext::new();
        assert!(!ctx.is_cancelled());
    }
}
