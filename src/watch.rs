use anyhow::{Context, bail};
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::Event;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 16;

/// Consecutive watch failures tolerated before the subscription is given up.
pub const MAX_WATCH_ERRORS: u32 = 10;

/// Self-resuming pod watch. Failures are reported in-stream and the next
/// poll retries, re-listing when the server says the resource version is
/// too old.
pub type PodEventStream = BoxStream<'static, anyhow::Result<Event<Pod>>>;

/// Cluster side of a list+watch subscription.
pub trait WatchSource: Send + Sync + 'static {
    fn watch(&self) -> PodEventStream;
}

/// Continuous pod change event, with reconnects hidden.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl ResourceEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            ResourceEvent::Added(pod) | ResourceEvent::Modified(pod) | ResourceEvent::Deleted(pod) => {
                pod
            }
        }
    }
}

type PodKey = (String, String);

fn pod_key(pod: &Pod) -> PodKey {
    (pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Run the initial list and spawn the task that keeps the watch alive.
///
/// A failure before the initial list completes is returned as an error.
/// Afterwards failures are retried with exponential backoff; the returned
/// channel closes on cancellation or after `max_errors` consecutive
/// failures.
pub async fn watch_pods<S: WatchSource>(
    source: &S,
    max_errors: u32,
    shutdown: CancellationToken,
) -> anyhow::Result<mpsc::Receiver<ResourceEvent>> {
    let mut stream = source.watch().default_backoff().boxed();
    let initial = initial_list(&mut stream).await?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let watcher = ResourceWatcher {
        stream,
        max_errors,
        errors: 0,
        known: HashMap::new(),
        relisted: None,
        tx,
        shutdown,
    };
    tokio::spawn(watcher.run(initial));
    Ok(rx)
}

async fn initial_list(stream: &mut PodEventStream) -> anyhow::Result<Vec<Pod>> {
    let mut pods = Vec::new();
    while let Some(event) = stream.next().await {
        match event.context("failed to list pods")? {
            Event::Init => {}
            Event::InitApply(pod) | Event::Apply(pod) => pods.push(pod),
            Event::Delete(pod) => {
                let key = pod_key(&pod);
                pods.retain(|p| pod_key(p) != key);
            }
            Event::InitDone => return Ok(pods),
        }
    }
    bail!("pod watch ended before the initial list completed")
}

struct ResourceWatcher {
    stream: PodEventStream,
    max_errors: u32,
    errors: u32,
    /// Last seen object per pod, used to synthesize deletions on re-list.
    known: HashMap<PodKey, Pod>,
    /// Pods announced by the re-list in progress.
    relisted: Option<HashSet<PodKey>>,
    tx: mpsc::Sender<ResourceEvent>,
    shutdown: CancellationToken,
}

impl ResourceWatcher {
    async fn run(mut self, initial: Vec<Pod>) {
        for pod in initial {
            if !self.emit(ResourceEvent::Added(pod)).await {
                return;
            }
        }

        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                item = self.stream.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    self.errors = 0;
                    if !self.apply(event).await {
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.errors += 1;
                    debug!(attempt = self.errors, "Pod watch failed: {:#}", err);
                    if self.errors >= self.max_errors {
                        warn!(
                            "Pod watch failed {} times in a row; no further pod changes will be observed",
                            self.errors
                        );
                        return;
                    }
                }
                None => {
                    warn!("Pod watch ended; no further pod changes will be observed");
                    return;
                }
            }
        }
    }

    async fn apply(&mut self, event: Event<Pod>) -> bool {
        match event {
            Event::Apply(pod) => {
                let event = if self.known.contains_key(&pod_key(&pod)) {
                    ResourceEvent::Modified(pod)
                } else {
                    ResourceEvent::Added(pod)
                };
                self.emit(event).await
            }
            Event::Delete(pod) => self.emit(ResourceEvent::Deleted(pod)).await,
            Event::Init => {
                debug!("Re-listing pods");
                self.relisted = Some(HashSet::new());
                true
            }
            Event::InitApply(pod) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(pod_key(&pod));
                }
                self.emit(ResourceEvent::Added(pod)).await
            }
            Event::InitDone => {
                let Some(seen) = self.relisted.take() else {
                    return true;
                };
                let vanished: Vec<Pod> = self
                    .known
                    .iter()
                    .filter(|(key, _)| !seen.contains(*key))
                    .map(|(_, pod)| pod.clone())
                    .collect();
                for pod in vanished {
                    if !self.emit(ResourceEvent::Deleted(pod)).await {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Forward one event, remembering the object. Returns false once the
    /// watcher should stop.
    async fn emit(&mut self, event: ResourceEvent) -> bool {
        let key = pod_key(event.pod());
        match &event {
            ResourceEvent::Deleted(_) => {
                self.known.remove(&key);
            }
            ResourceEvent::Added(pod) | ResourceEvent::Modified(pod) => {
                self.known.insert(key, pod.clone());
            }
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}
