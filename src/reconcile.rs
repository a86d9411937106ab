use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};
use kube::ResourceExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{ContainerStateMatcher, Target, TargetEvent};
use crate::watch::ResourceEvent;

/// Decisions are handed over one at a time so a slow consumer stalls the
/// reconciler instead of queueing stale decisions.
const DECISION_BUFFER: usize = 1;

/// Name and state filters deciding which containers get tailed.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    pub pod: Regex,
    pub exclude_pod: Vec<Regex>,
    pub container: Regex,
    pub exclude_container: Vec<Regex>,
    pub init_containers: bool,
    pub ephemeral_containers: bool,
    pub states: Vec<ContainerStateMatcher>,
}

impl TargetFilter {
    fn accepts_pod(&self, name: &str) -> bool {
        self.pod.is_match(name) && !self.exclude_pod.iter().any(|re| re.is_match(name))
    }

    fn accepts_container(&self, name: &str) -> bool {
        self.container.is_match(name) && !self.exclude_container.iter().any(|re| re.is_match(name))
    }

    fn state_matches(&self, state: Option<&ContainerState>) -> bool {
        self.states.iter().any(|m| m.matches(state))
    }

    /// Turn one pod change into add/remove decisions for its containers.
    pub fn classify(&self, event: &ResourceEvent) -> Vec<TargetEvent> {
        let pod = event.pod();
        let name = pod.name_any();
        if !self.accepts_pod(&name) {
            return Vec::new();
        }

        let target = |container: &str| Target {
            node: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            namespace: pod.namespace().unwrap_or_default(),
            pod: name.clone(),
            container: container.to_string(),
        };

        match event {
            ResourceEvent::Added(_) | ResourceEvent::Modified(_) => self
                .container_statuses(pod)
                .filter(|status| self.accepts_container(&status.name))
                .map(|status| {
                    if self.state_matches(status.state.as_ref()) {
                        TargetEvent::Added(target(&status.name))
                    } else {
                        TargetEvent::Removed(target(&status.name))
                    }
                })
                .collect(),
            // Status is unreliable on deletion, so go by what the spec declares.
            ResourceEvent::Deleted(_) => self
                .declared_containers(pod)
                .into_iter()
                .filter(|name| self.accepts_container(name))
                .map(|name| TargetEvent::Removed(target(name)))
                .collect(),
        }
    }

    fn container_statuses<'a>(&self, pod: &'a Pod) -> impl Iterator<Item = &'a ContainerStatus> {
        let status = pod.status.as_ref();
        let current = status.and_then(|s| s.container_statuses.as_deref());
        let init = status
            .and_then(|s| s.init_container_statuses.as_deref())
            .filter(|_| self.init_containers);
        let ephemeral = status
            .and_then(|s| s.ephemeral_container_statuses.as_deref())
            .filter(|_| self.ephemeral_containers);

        [current, init, ephemeral]
            .into_iter()
            .flat_map(|statuses| statuses.unwrap_or_default())
    }

    fn declared_containers<'a>(&self, pod: &'a Pod) -> Vec<&'a str> {
        let Some(spec) = pod.spec.as_ref() else {
            return Vec::new();
        };

        let mut names: Vec<&str> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        if self.init_containers {
            names.extend(spec.init_containers.iter().flatten().map(|c| c.name.as_str()));
        }
        if self.ephemeral_containers {
            names.extend(
                spec.ephemeral_containers
                    .iter()
                    .flatten()
                    .map(|c| c.name.as_str()),
            );
        }
        names
    }
}

/// Spawn the task turning pod events into target decisions.
///
/// The returned channel closes when the event stream ends or on
/// cancellation.
pub fn spawn_reconciler(
    filter: TargetFilter,
    mut events: mpsc::Receiver<ResourceEvent>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<TargetEvent> {
    let (tx, rx) = mpsc::channel(DECISION_BUFFER);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!("Pod event stream ended");
                break;
            };

            for decision in filter.classify(&event) {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = tx.send(decision) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    rx
}
