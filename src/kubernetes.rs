use anyhow::Context;
use futures::io::AsyncBufReadExt;
use futures::stream::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{Config as WatcherConfig, watcher};
use kube::{Api, Client, Config};
use std::path::Path;
use std::pin::pin;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::tail::{LineStream, LogSource};
use crate::types::Target;
use crate::watch::{PodEventStream, WatchSource};

/// Server-side watch timeout; kube rejects anything at or above 295s.
const WATCH_TIMEOUT_SECS: u32 = 290;
const STREAM_BUFFER: usize = 16;

pub async fn initialize_client(kubeconfig: Option<&Path>, context: Option<&str>) -> anyhow::Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None if context.is_some() => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| anyhow::anyhow!("Context '{}' not found in kubeconfig: {}", context.unwrap_or_default(), e))?,
        None => Config::infer().await?,
    };

    let client = Client::try_from(config)?;
    info!("Using namespace {} by default", client.default_namespace());
    Ok(client)
}

/// Resolve the namespace to watch; `None` means all namespaces.
pub fn resolve_namespace(client: &Client, namespace: Option<&str>, all_namespaces: bool) -> Option<String> {
    if all_namespaces {
        return None;
    }
    Some(
        namespace
            .map(str::to_string)
            .unwrap_or_else(|| client.default_namespace().to_string()),
    )
}

/// Pods in one namespace (or all), narrowed by label and field selectors.
pub struct KubePods {
    api: Api<Pod>,
    label_selector: Option<String>,
    field_selector: Option<String>,
}

impl KubePods {
    pub fn new(
        client: Client,
        namespace: Option<&str>,
        label_selector: Option<String>,
        field_selector: Option<String>,
    ) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self {
            api,
            label_selector,
            field_selector,
        }
    }

    fn watcher_config(&self) -> WatcherConfig {
        let mut config = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(labels) = &self.label_selector {
            config = config.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            config = config.fields(fields);
        }
        config
    }
}

impl WatchSource for KubePods {
    fn watch(&self) -> PodEventStream {
        watcher(self.api.clone(), self.watcher_config())
            .map_err(anyhow::Error::from)
            .boxed()
    }
}

/// Container logs fetched through the pods/log subresource.
#[derive(Clone)]
pub struct KubeLogs {
    client: Client,
}

impl KubeLogs {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl LogSource for KubeLogs {
    async fn open(&self, target: &Target, params: LogParams) -> anyhow::Result<LineStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let pod = target.pod.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let reader = match api.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = ready_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let mut lines = pin!(reader.lines());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    line = lines.next() => {
                        let Some(line) = line else { break };
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        ready_rx
            .await
            .context("log task exited before the request completed")??;
        Ok(ReceiverStream::new(rx).boxed())
    }
}
