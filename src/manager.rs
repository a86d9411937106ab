use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tail::{LogSource, PrefixTemplate, Tail, TailExit};
use crate::types::{Line, TailOptions, Target, TargetEvent, TargetId};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct TailHandle {
    tail: Arc<Tail>,
    stop: CancellationToken,
    task: Id,
}

impl TailHandle {
    fn stop(&self) {
        eprintln!("{}", self.tail.stop_banner());
        self.stop.cancel();
    }
}

/// Owner of the active-tail table.
///
/// Only the task driving [`TailManager::run`] touches the table, so it
/// needs no locking.
pub struct TailManager<L> {
    logs: L,
    template: PrefixTemplate,
    options: Arc<TailOptions>,
    lines: mpsc::Sender<Line>,
    shutdown: CancellationToken,
    tails: HashMap<TargetId, TailHandle>,
    owners: HashMap<Id, TargetId>,
    workers: JoinSet<TailExit>,
    grace: Duration,
}

impl<L: LogSource> TailManager<L> {
    pub fn new(
        logs: L,
        template: PrefixTemplate,
        options: TailOptions,
        lines: mpsc::Sender<Line>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            logs,
            template,
            options: Arc::new(options),
            lines,
            shutdown,
            tails: HashMap::new(),
            owners: HashMap::new(),
            workers: JoinSet::new(),
            grace: SHUTDOWN_GRACE,
        }
    }

    fn len(&self) -> usize {
        self.tails.len()
    }

    /// Start tailing `target` unless it is already tailed. Returns whether a
    /// worker was started.
    pub fn on_add(&mut self, target: Target) -> bool {
        let id = target.id();
        if self.tails.contains_key(&id) {
            debug!("Already tailing {}, ignoring", id);
            return false;
        }

        let tail = Arc::new(Tail::new(target, &self.template, self.options.clone()));
        let stop = self.shutdown.child_token();
        let worker = tail
            .clone()
            .run(self.logs.clone(), self.lines.clone(), stop.clone());
        let task = self.workers.spawn(worker).id();

        debug!("Started tailing {}", id);
        self.owners.insert(task, id.clone());
        self.tails.insert(id, TailHandle { tail, stop, task });
        true
    }

    /// Stop tailing `target` if it is tailed. Returns whether a worker was
    /// stopped.
    pub fn on_remove(&mut self, target: &Target) -> bool {
        let id = target.id();
        match self.tails.remove(&id) {
            Some(handle) => {
                debug!("Stopping tail for {}", id);
                handle.stop();
                true
            }
            None => {
                debug!("Not tailing {}, ignoring removal", id);
                false
            }
        }
    }

    /// Drop the table entry of a worker that finished, unless the entry
    /// already belongs to a newer worker.
    fn reap(&mut self, task: Id) {
        let Some(id) = self.owners.remove(&task) else {
            return;
        };
        if self.tails.get(&id).is_some_and(|handle| handle.task == task) {
            debug!("Tail for {} ended", id);
            self.tails.remove(&id);
        }
    }

    /// Apply target events until cancellation, then wait for every worker.
    pub async fn run(mut self, mut events: mpsc::Receiver<TargetEvent>) {
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(TargetEvent::Added(target)) => {
                        self.on_add(target);
                    }
                    Some(TargetEvent::Removed(target)) => {
                        self.on_remove(&target);
                    }
                    None => {
                        debug!("Target events closed with {} active tails", self.len());
                        events_open = false;
                    }
                },
                Some(joined) = self.workers.join_next_with_id(), if !self.workers.is_empty() => {
                    match joined {
                        Ok((task, exit)) => {
                            debug!(?exit, "Tail task finished");
                            self.reap(task);
                        }
                        Err(err) => {
                            warn!("Tail task failed: {}", err);
                            self.reap(err.id());
                        }
                    }
                }
            }
        }

        self.stop_all().await;
    }

    /// Every stop token is a child of the shutdown token, so the workers are
    /// already on their way out; wait for them, then abort stragglers.
    async fn stop_all(&mut self) {
        self.tails.clear();
        self.owners.clear();

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(self.grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} tails did not stop within {:?}, aborting them",
                self.workers.len(),
                self.grace
            );
            self.workers.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{FakeLogs, target};

    fn manager(logs: FakeLogs) -> (TailManager<FakeLogs>, mpsc::Receiver<Line>, CancellationToken) {
        let (tx, rx) = mpsc::channel(100);
        let shutdown = CancellationToken::new();
        let manager = TailManager::new(
            logs,
            PrefixTemplate::default_for(false),
            TailOptions::default(),
            tx,
            shutdown.clone(),
        );
        (manager, rx, shutdown)
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop() {
        let logs = FakeLogs::new(&[]).held_open();
        let (mut manager, _rx, _shutdown) = manager(logs.clone());

        assert!(manager.on_add(target("web-1", "app")));
        assert!(!manager.on_add(target("web-1", "app")));
        assert!(manager.on_add(target("web-1", "sidecar")));
        assert_eq!(manager.len(), 2);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(logs.opens(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_remove_is_noop() {
        let logs = FakeLogs::new(&[]).held_open();
        let (mut manager, _rx, _shutdown) = manager(logs);

        assert!(!manager.on_remove(&target("web-1", "app")));
        manager.on_add(target("web-1", "app"));
        assert!(manager.on_remove(&target("web-1", "app")));
        assert!(!manager.on_remove(&target("web-1", "app")));
        assert_eq!(manager.len(), 0);

        assert!(manager.on_add(target("web-1", "app")));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_worker_is_reaped() {
        let logs = FakeLogs::new(&["hello"]);
        let (manager, mut lines, shutdown) = manager(logs.clone());
        let (tx, events) = mpsc::channel(1);
        let task = tokio::spawn(manager.run(events));

        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        assert_eq!(lines.recv().await.map(|l| l.message), Some("hello".to_string()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the first worker ended with its stream, so this starts a new one
        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        assert_eq!(lines.recv().await.map(|l| l.message), Some("hello".to_string()));
        assert_eq!(logs.opens(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_every_worker() {
        let logs = FakeLogs::new(&["line"]).held_open();
        let (manager, mut lines, shutdown) = manager(logs);
        let (tx, events) = mpsc::channel(1);
        let task = tokio::spawn(manager.run(events));

        for container in ["app", "sidecar", "proxy"] {
            tx.send(TargetEvent::Added(target("web-1", container))).await.unwrap();
        }
        for _ in 0..3 {
            assert!(lines.recv().await.is_some());
        }

        shutdown.cancel();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("manager should stop")
            .unwrap();

        // every sender is gone once the workers and the manager are done
        assert_eq!(lines.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_events_keep_tails_until_cancellation() {
        let logs = FakeLogs::new(&["line"]).held_open();
        let (manager, mut lines, shutdown) = manager(logs);
        let (tx, events) = mpsc::channel(1);
        let task = tokio::spawn(manager.run(events));

        tx.send(TargetEvent::Added(target("web-1", "app"))).await.unwrap();
        drop(tx);
        assert!(lines.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(lines.recv().await, None);
    }
}
