use clap::ValueEnum;
use k8s_openapi::api::core::v1::ContainerState;
use regex::Regex;
use std::fmt;

/// Identity of a single container instance inside a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub node: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl Target {
    pub fn id(&self) -> TargetId {
        TargetId {
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
            container: self.container.clone(),
        }
    }
}

/// Key of the active-tail table. Kept as separate fields so names that
/// contain separators can never collide.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TargetId {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Add/remove decision produced by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Added(Target),
    Removed(Target),
}

/// One log line on its way to the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub prefix: String,
    pub message: String,
}

impl Line {
    /// Leading token of the message, up to the first space. With
    /// timestamps enabled this is the RFC3339 timestamp.
    pub fn sort_key(&self) -> &str {
        self.message
            .split_once(' ')
            .map_or(self.message.as_str(), |(head, _)| head)
    }
}

/// Per-worker configuration, shared by every tail.
#[derive(Debug, Clone, Default)]
pub struct TailOptions {
    pub timestamps: bool,
    pub since_seconds: Option<i64>,
    pub tail_lines: Option<i64>,
    pub include: Vec<Regex>,
    pub exclude: Vec<Regex>,
    pub show_namespace: bool,
}

/// Predicate over a container's runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ContainerStateMatcher {
    Running,
    Waiting,
    Terminated,
    All,
}

impl ContainerStateMatcher {
    pub fn matches(&self, state: Option<&ContainerState>) -> bool {
        match self {
            ContainerStateMatcher::All => true,
            ContainerStateMatcher::Running => state.is_some_and(|s| s.running.is_some()),
            ContainerStateMatcher::Waiting => state.is_some_and(|s| s.waiting.is_some()),
            ContainerStateMatcher::Terminated => state.is_some_and(|s| s.terminated.is_some()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStateRunning, ContainerStateWaiting};
    use std::collections::HashSet;

    fn line(message: &str) -> Line {
        Line {
            prefix: "p".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_sort_key_takes_leading_token() {
        assert_eq!(line("2024-01-01T00:00:00Z started").sort_key(), "2024-01-01T00:00:00Z");
        assert_eq!(line("nospace").sort_key(), "nospace");
        assert_eq!(line(" leading").sort_key(), "");
    }

    #[test]
    fn test_target_id_does_not_collide_on_separators() {
        let a = Target {
            node: String::new(),
            namespace: "a-b".to_string(),
            pod: "c".to_string(),
            container: "d".to_string(),
        };
        let b = Target {
            node: String::new(),
            namespace: "a".to_string(),
            pod: "b-c".to_string(),
            container: "d".to_string(),
        };
        let ids: HashSet<TargetId> = [a.id(), b.id()].into_iter().collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(a.id().to_string(), "a-b/c/d");
    }

    #[test]
    fn test_state_matchers() {
        let running = ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        };
        let waiting = ContainerState {
            waiting: Some(ContainerStateWaiting::default()),
            ..Default::default()
        };

        assert!(ContainerStateMatcher::Running.matches(Some(&running)));
        assert!(!ContainerStateMatcher::Running.matches(Some(&waiting)));
        assert!(ContainerStateMatcher::Waiting.matches(Some(&waiting)));
        assert!(!ContainerStateMatcher::Terminated.matches(Some(&running)));
        assert!(!ContainerStateMatcher::Running.matches(None));
        assert!(ContainerStateMatcher::All.matches(None));
    }
}
