//! Watch transport against the Kubernetes API server.
//!
//! The engine consumes one event channel per resource kind through the
//! [`WatchConnector`] trait; the implementation here backs those channels
//! with raw apiserver watches so a reconnect can resume from the last
//! observed resourceVersion. Tests plug in channel-backed connectors
//! instead.

use std::path::Path;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::api::WatchParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ErrorResponse, WatchEvent};
use kube::{Api, Client, Config};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Kube2lbError;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// A watch event for one resource kind, already stripped of transport
/// details.
#[derive(Debug)]
pub enum ResourceEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// The server reported an error in-band; the payload is its status when
    /// one was decoded.
    Error(Option<ErrorResponse>),
}

/// The three per-kind event channels produced by one connection. Dropping
/// the set stops the forwarder tasks feeding it.
pub struct WatchStreams {
    pub nodes: mpsc::Receiver<ResourceEvent<Node>>,
    pub services: mpsc::Receiver<ResourceEvent<Service>>,
    pub endpoints: mpsc::Receiver<ResourceEvent<Endpoints>>,
    tasks: Vec<JoinHandle<()>>,
}

impl WatchStreams {
    pub fn new(
        nodes: mpsc::Receiver<ResourceEvent<Node>>,
        services: mpsc::Receiver<ResourceEvent<Service>>,
        endpoints: mpsc::Receiver<ResourceEvent<Endpoints>>,
    ) -> Self {
        Self {
            nodes,
            services,
            endpoints,
            tasks: Vec::new(),
        }
    }

    fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }
}

impl Drop for WatchStreams {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Creates the per-kind watch channels for the engine.
#[async_trait]
pub trait WatchConnector: Send + Sync {
    /// Open all three watches, resuming from `last_resource_version` when
    /// non-empty. Failing any single watch fails the connection.
    async fn connect(&self, last_resource_version: &str) -> Result<WatchStreams, Kube2lbError>;
}

/// [`WatchConnector`] backed by a real apiserver connection.
pub struct KubernetesConnector {
    client: Client,
}

impl KubernetesConnector {
    /// Build a client from an explicit kubeconfig, an apiserver URL, or the
    /// inferred environment (in-cluster config or `~/.kube/config`).
    pub async fn new(
        apiserver: Option<&str>,
        kubecfg: Option<&Path>,
    ) -> Result<Self, Kube2lbError> {
        let mut config = match kubecfg {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| Kube2lbError::ClientConfig(e.to_string()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Kube2lbError::ClientConfig(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Kube2lbError::ClientConfig(e.to_string()))?,
        };
        if let Some(url) = apiserver {
            config.cluster_url = url
                .parse()
                .map_err(|e| Kube2lbError::ClientConfig(format!("invalid apiserver URL: {e}")))?;
        }
        info!(master = %config.cluster_url, "using kubernetes master");
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WatchConnector for KubernetesConnector {
    async fn connect(&self, last_resource_version: &str) -> Result<WatchStreams, Kube2lbError> {
        let params = WatchParams::default();

        // Streams created before a failing one are dropped, which closes
        // their watches.
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_stream = nodes
            .watch(&params, last_resource_version)
            .await
            .map_err(|e| watch_error("nodes", &e))?
            .boxed();

        let services: Api<Service> = Api::all(self.client.clone());
        let service_stream = services
            .watch(&params, last_resource_version)
            .await
            .map_err(|e| watch_error("services", &e))?
            .boxed();

        let endpoints: Api<Endpoints> = Api::all(self.client.clone());
        let endpoints_stream = endpoints
            .watch(&params, last_resource_version)
            .await
            .map_err(|e| watch_error("endpoints", &e))?
            .boxed();

        let (node_tx, node_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (service_tx, service_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (endpoints_tx, endpoints_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let tasks = vec![
            forward("nodes", node_stream, node_tx),
            forward("services", service_stream, service_tx),
            forward("endpoints", endpoints_stream, endpoints_tx),
        ];

        Ok(WatchStreams::new(node_rx, service_rx, endpoints_rx).with_tasks(tasks))
    }
}

fn watch_error(kind: &'static str, err: &kube::Error) -> Kube2lbError {
    Kube2lbError::Watch {
        kind,
        message: err.to_string(),
    }
}

/// Pump one raw watch stream into its event channel. Ends (closing the
/// channel) when the server closes the watch or the transport fails, which
/// the engine answers with a reconnect.
fn forward<K>(
    kind: &'static str,
    mut stream: BoxStream<'static, kube::Result<WatchEvent<K>>>,
    tx: mpsc::Sender<ResourceEvent<K>>,
) -> JoinHandle<()>
where
    K: Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(WatchEvent::Added(obj)) => ResourceEvent::Added(obj),
                Ok(WatchEvent::Modified(obj)) => ResourceEvent::Modified(obj),
                Ok(WatchEvent::Deleted(obj)) => ResourceEvent::Deleted(obj),
                Ok(WatchEvent::Bookmark(_)) => continue,
                Ok(WatchEvent::Error(status)) => ResourceEvent::Error(Some(status)),
                Err(e) => {
                    warn!(kind, error = %e, "watch stream error");
                    break;
                }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    })
}
