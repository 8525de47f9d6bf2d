use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::Notify;

/// Counts outstanding teardown work (open sockets, the terminate routine) so
/// the process can wait for it before exiting.
#[derive(Clone, Default)]
pub struct CleanupGroup {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: AtomicUsize,
    idle: Notify,
}

impl CleanupGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn done(&self) {
        let previous = self
            .inner
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.inner.idle.notify_waiters(),
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(target = "local_run::cleanup", "cleanup done called without matching add")
            }
        }
    }

    /// Registers one unit of work that completes when the guard drops.
    pub fn guard(&self) -> CleanupGuard {
        self.add();
        CleanupGuard {
            group: self.clone(),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct CleanupGuard {
    group: CleanupGroup,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.group.done();
    }
}
