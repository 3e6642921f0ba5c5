//! Delivers resolver events to the indexing service.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::collaborators::IndexingService;
use crate::config::NotificationConfig;
use crate::resolver::ResolverEvent;

pub struct Notifier {
    indexer: Arc<dyn IndexingService>,
    terminal_delay: Duration,
    reindex_delay: Duration,
    /// Objects with a reindex already scheduled.
    pending: Cache<String, ()>,
    tasks: Mutex<JoinSet<()>>,
}

impl Notifier {
    pub fn new(indexer: Arc<dyn IndexingService>, config: &NotificationConfig) -> Self {
        Self {
            indexer,
            terminal_delay: config.terminal_step_delay(),
            reindex_delay: config.reindex_delay(),
            pending: Cache::builder().build(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Deliver events in order. Step notifications are awaited (after the
    /// terminal delay); reindexes run in the background, at most one pending
    /// per object.
    pub async fn deliver(&self, events: Vec<ResolverEvent>) {
        for event in events {
            match event {
                ResolverEvent::StepUpdated(step) => {
                    // Workaround: the index consumer can process this message
                    // before it sees the completed status.
                    if !self.terminal_delay.is_zero() {
                        tokio::time::sleep(self.terminal_delay).await;
                    }
                    if let Err(e) = self.indexer.step_updated(&step).await {
                        warn!(step = %step.key, error = %e, "Step update notification failed");
                    }
                }
                ResolverEvent::Reindex { object_id } => self.schedule_reindex(object_id).await,
            }
        }
    }

    async fn schedule_reindex(&self, object_id: String) {
        let entry = self.pending.entry(object_id.clone()).or_insert(()).await;
        if !entry.is_fresh() {
            debug!(object_id = %object_id, "Reindex already pending");
            return;
        }

        let indexer = Arc::clone(&self.indexer);
        let pending = self.pending.clone();
        let delay = self.reindex_delay;
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            pending.invalidate(&object_id).await;
            if let Err(e) = indexer.reindex(&object_id).await {
                warn!(object_id = %object_id, error = %e, "Deferred reindex failed");
            }
        });
    }

    /// Wait for every scheduled reindex to finish.
    pub async fn flush(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("terminal_delay", &self.terminal_delay)
            .field("reindex_delay", &self.reindex_delay)
            .finish()
    }
}
