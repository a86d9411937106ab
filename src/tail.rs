use anyhow::bail;
use crossterm::style::{Color, Stylize};
use futures::stream::{BoxStream, StreamExt};
use kube::api::LogParams;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{Line, TailOptions, Target};
use crate::utils::get_colors;

/// Emitted by the container runtime in place of log output once the
/// container is gone.
pub const NO_SUCH_CONTAINER: &str = "rpc error: code = Unknown desc = Error: No such container";

pub type LineStream = BoxStream<'static, io::Result<String>>;

/// Follows the log of a single container.
pub trait LogSource: Clone + Send + Sync + 'static {
    fn open(
        &self,
        target: &Target,
        params: LogParams,
    ) -> impl Future<Output = anyhow::Result<LineStream>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Namespace,
    Pod,
    Container,
    Node,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(Field),
}

/// Line prefix layout, e.g. `{namespace} {pod} {container}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixTemplate {
    segments: Vec<Segment>,
}

impl PrefixTemplate {
    pub fn parse(template: &str) -> anyhow::Result<Self> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => bail!("unclosed '{{' in template '{}'", template),
                        }
                    }
                    let field = match name.trim() {
                        "namespace" => Field::Namespace,
                        "pod" => Field::Pod,
                        "container" => Field::Container,
                        "node" => Field::Node,
                        other => bail!("unknown field '{}' in template '{}'", other, template),
                    };
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => bail!("unbalanced '}}' in template '{}'", template),
                c => text.push(c),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Self { segments })
    }

    pub fn default_for(show_namespace: bool) -> Self {
        let mut segments = Vec::new();
        if show_namespace {
            segments.push(Segment::Field(Field::Namespace));
            segments.push(Segment::Text(" ".to_string()));
        }
        segments.push(Segment::Field(Field::Pod));
        segments.push(Segment::Text(" ".to_string()));
        segments.push(Segment::Field(Field::Container));
        Self { segments }
    }

    pub fn render(&self, target: &Target, (pod_color, container_color): (Color, Color)) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            let piece = match segment {
                Segment::Text(text) => text.clone(),
                Segment::Field(Field::Namespace) => target.namespace.as_str().with(pod_color).to_string(),
                Segment::Field(Field::Pod) => target.pod.as_str().with(pod_color).to_string(),
                Segment::Field(Field::Node) => target.node.as_str().with(pod_color).to_string(),
                Segment::Field(Field::Container) => {
                    target.container.as_str().with(container_color).to_string()
                }
            };
            out.push_str(&piece);
        }
        out
    }
}

/// Errors that only mean the container went away.
fn is_expected_close(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return true;
    }
    let message = err.to_string();
    message.contains("body closed") || message.contains("closed before message completed")
}

/// Why a tail worker returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailExit {
    /// Stopped or cancelled.
    Stopped,
    /// The log stream ended, or the server closed it with the container.
    Ended,
    /// The line channel is gone.
    Disconnected,
    OpenFailed,
    ReadFailed,
}

pub struct Tail {
    target: Target,
    options: Arc<TailOptions>,
    colors: (Color, Color),
    prefix: String,
}

impl Tail {
    pub fn new(target: Target, template: &PrefixTemplate, options: Arc<TailOptions>) -> Self {
        let colors = get_colors(&target.pod);
        let prefix = template.render(&target, colors);
        Self {
            target,
            options,
            colors,
            prefix,
        }
    }

    pub fn start_banner(&self) -> String {
        let (pod_color, container_color) = self.colors;
        let pod = self.target.pod.as_str().with(pod_color);
        let container = self.target.container.as_str().with(container_color);
        if self.options.show_namespace {
            let namespace = self.target.namespace.as_str().with(pod_color);
            format!("{} {} {} › {}", "+".green().bold(), namespace, pod, container)
        } else {
            format!("{} {} › {}", "+".green().bold(), pod, container)
        }
    }

    pub fn stop_banner(&self) -> String {
        let (pod_color, _) = self.colors;
        let pod = self.target.pod.as_str().with(pod_color);
        if self.options.show_namespace {
            let namespace = self.target.namespace.as_str().with(pod_color);
            format!("{} {} {}", "-".red().bold(), namespace, pod)
        } else {
            format!("{} {}", "-".red().bold(), pod)
        }
    }

    fn log_params(&self) -> LogParams {
        LogParams {
            follow: true,
            timestamps: self.options.timestamps,
            container: Some(self.target.container.clone()),
            since_seconds: self.options.since_seconds,
            tail_lines: self.options.tail_lines,
            ..Default::default()
        }
    }

    /// Apply the line filters, returning the line to forward if it survives.
    pub fn accept(&self, raw: String) -> Option<Line> {
        if raw.starts_with(NO_SUCH_CONTAINER) {
            return None;
        }
        if self.options.exclude.iter().any(|re| re.is_match(&raw)) {
            return None;
        }
        if !self.options.include.is_empty() && !self.options.include.iter().any(|re| re.is_match(&raw)) {
            return None;
        }
        Some(Line {
            prefix: self.prefix.clone(),
            message: raw,
        })
    }

    /// Stream the container's log into `lines` until the stream ends or
    /// `stop` fires. `stop` is expected to be a child of the process-wide
    /// shutdown token, so cancellation also ends the worker silently.
    pub async fn run<L: LogSource>(
        self: Arc<Self>,
        logs: L,
        lines: mpsc::Sender<Line>,
        stop: CancellationToken,
    ) -> TailExit {
        eprintln!("{}", self.start_banner());
        let id = self.target.id();

        let opened = tokio::select! {
            _ = stop.cancelled() => return TailExit::Stopped,
            opened = logs.open(&self.target, self.log_params()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Error opening stream to {}: {:#}", id, err);
                return TailExit::OpenFailed;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => return TailExit::Stopped,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(raw)) => {
                    let Some(line) = self.accept(raw) else {
                        continue;
                    };
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => return TailExit::Stopped,
                        sent = lines.send(line) => {
                            if sent.is_err() {
                                return TailExit::Disconnected;
                            }
                        }
                    }
                }
                Some(Err(err)) if is_expected_close(&err) => {
                    debug!("Log stream for {} closed by the server", id);
                    return TailExit::Ended;
                }
                Some(Err(err)) => {
                    warn!("Error reading stream for {}: {}", id, err);
                    return TailExit::ReadFailed;
                }
                None => {
                    debug!("Log stream for {} ended", id);
                    return TailExit::Ended;
                }
            }
        }
    }
}
