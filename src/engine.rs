//! The reconciliation engine.
//!
//! Owns the per-kind stores and the dispatch loop over the watch channels,
//! decides which events are meaningful, and drives the render-and-notify
//! cycle through the anti-burst updater.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use k8s_openapi::api::core::v1::Service;
#[cfg(test)]
use k8s_openapi::api::core::v1::{Endpoints, Node};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, FirstRenderPolicy};
use crate::endpoints::EndpointsHelper;
use crate::error::Kube2lbError;
use crate::kubernetes::{ResourceEvent, WatchConnector, WatchStreams};
use crate::notifier::Notifier;
use crate::store::{EndpointsStore, EventStore, NodeStore, ServiceStore};
use crate::template::{ClusterInformation, PortSpec, ServiceInformation, TemplateExecutor};
use crate::updater::{updater, UpdateFn, Updater};
use crate::validators::ServiceValidator;

/// Comma-separated DNS names a service answers to besides the generated ones.
pub const EXTERNAL_DOMAINS_ANNOTATION: &str = "kube2lb/external-domains";
/// JSON object mapping port names to template modes.
pub const PORT_MODE_ANNOTATION: &str = "kube2lb/port-mode";
/// JSON object mapping port names to backend timeouts in seconds.
pub const BACKEND_TIMEOUT_ANNOTATION: &str = "kube2lb/backend-timeout";

const RECONNECT_POLL: Duration = Duration::from_secs(5);

/// What the dispatch of one event asks the watch loop to do.
enum EventOutcome {
    Handled {
        signal: bool,
        resource_version: Option<String>,
    },
    Reset,
}

/// Watches the cluster and keeps the rendered configuration in sync.
pub struct Engine {
    connector: Arc<dyn WatchConnector>,
    config: EngineConfig,
    templates: Vec<Arc<dyn TemplateExecutor>>,
    notifiers: Vec<Notifier>,
    validators: Vec<Box<dyn ServiceValidator>>,
    node_store: NodeStore,
    service_store: ServiceStore,
    endpoints_store: EndpointsStore,
    first_cycle: AtomicBool,
}

impl Engine {
    pub fn new(connector: Arc<dyn WatchConnector>, config: EngineConfig) -> Self {
        Self {
            connector,
            config,
            templates: Vec::new(),
            notifiers: Vec::new(),
            validators: Vec::new(),
            node_store: NodeStore::new(),
            service_store: ServiceStore::new(),
            endpoints_store: EndpointsStore::new(),
            first_cycle: AtomicBool::new(true),
        }
    }

    pub fn add_template(&mut self, template: Arc<dyn TemplateExecutor>) {
        self.templates.push(template);
    }

    pub fn add_notifier(&mut self, notifier: Notifier) {
        self.notifiers.push(notifier);
    }

    pub fn add_validator(&mut self, validator: Box<dyn ServiceValidator>) {
        self.validators.push(validator);
    }

    /// Run until cancellation or a terminal failure: a failed initial
    /// connection, an exhausted reconnect budget, or a fatal first render.
    pub async fn watch(self: Arc<Self>, token: CancellationToken) -> Result<(), Kube2lbError> {
        let updater_token = token.child_token();
        let result = self.watch_inner(&token, &updater_token).await;
        updater_token.cancel();
        result
    }

    async fn watch_inner(
        self: &Arc<Self>,
        token: &CancellationToken,
        updater_token: &CancellationToken,
    ) -> Result<(), Kube2lbError> {
        let mut last_resource_version = String::new();
        let mut streams = self.connector.connect(&last_resource_version).await?;

        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let (update_handle, update_task) =
            updater(self.update_fn(fatal_tx), self.config.update_timeout);
        tokio::spawn(update_task.run(updater_token.clone()));

        loop {
            let reconnect =
                self.dispatch(&mut streams, &mut last_resource_version, &update_handle, &mut fatal_rx, token)
                    .await?;
            if !reconnect {
                return Ok(());
            }
            streams = self.reconnect(&last_resource_version, token).await?;
        }
    }

    /// Pump events until the connection has to be rebuilt. Returns false on
    /// cancellation, true when a reconnect is needed.
    async fn dispatch(
        self: &Arc<Self>,
        streams: &mut WatchStreams,
        last_resource_version: &mut String,
        update_handle: &Updater,
        fatal_rx: &mut mpsc::Receiver<Kube2lbError>,
        token: &CancellationToken,
    ) -> Result<bool, Kube2lbError> {
        loop {
            let outcome = tokio::select! {
                () = token.cancelled() => return Ok(false),
                Some(err) = fatal_rx.recv() => {
                    error!("failing on first update, check configuration");
                    return Err(err);
                }
                event = streams.nodes.recv() => match event {
                    Some(event) => apply_event(&self.node_store, event, "node"),
                    None => return Ok(true),
                },
                event = streams.services.recv() => match event {
                    Some(event) => apply_event(&self.service_store, event, "service"),
                    None => return Ok(true),
                },
                event = streams.endpoints.recv() => match event {
                    Some(event) => apply_event(&self.endpoints_store, event, "endpoints"),
                    None => return Ok(true),
                },
            };

            match outcome {
                EventOutcome::Handled {
                    signal,
                    resource_version,
                } => {
                    if let Some(version) = resource_version {
                        *last_resource_version = version;
                    }
                    if signal {
                        update_handle.signal().await;
                    }
                }
                EventOutcome::Reset => {
                    self.node_store.reset();
                    self.service_store.reset();
                    self.endpoints_store.reset();
                    last_resource_version.clear();
                    if self.config.first_render_policy == FirstRenderPolicy::FatalOnResyncFirst {
                        self.first_cycle.store(true, Ordering::SeqCst);
                    }
                    return Ok(true);
                }
            }
        }
    }

    async fn reconnect(
        &self,
        last_resource_version: &str,
        token: &CancellationToken,
    ) -> Result<WatchStreams, Kube2lbError> {
        warn!("connection closed, trying to reconnect");
        let deadline = Instant::now() + self.config.reconnect_timeout;
        loop {
            match self.connector.connect(last_resource_version).await {
                Ok(streams) => return Ok(streams),
                Err(e) => {
                    if Instant::now() >= deadline {
                        error!(error = %e, "reconnect budget exhausted");
                        return Err(e);
                    }
                    warn!(error = %e, "reconnect failed, retrying");
                    tokio::select! {
                        () = token.cancelled() => return Err(e),
                        () = sleep(RECONNECT_POLL) => {}
                    }
                }
            }
        }
    }

    fn update_fn(self: &Arc<Self>, fatal_tx: mpsc::Sender<Kube2lbError>) -> UpdateFn {
        let engine = self.clone();
        Arc::new(move |update_token| {
            let engine = engine.clone();
            let fatal_tx = fatal_tx.clone();
            async move {
                let first = engine.first_cycle.load(Ordering::SeqCst);
                match engine.update(update_token).await {
                    Ok(()) => {
                        engine.first_cycle.store(false, Ordering::SeqCst);
                    }
                    Err(e) => {
                        error!(error = %e, "couldn't update state");
                        let fatal = first
                            && engine.config.first_render_policy != FirstRenderPolicy::NeverFatal;
                        if fatal {
                            let _ = fatal_tx.send(e).await;
                        }
                    }
                }
            }
            .boxed()
        })
    }

    /// One render-and-notify cycle.
    async fn update(&self, token: CancellationToken) -> Result<(), Kube2lbError> {
        let info = self.build_cluster_information();
        debug!(
            services = info.services.len(),
            ports = info.ports.len(),
            nodes = info.nodes.len(),
            "rendering cluster state"
        );

        let mut failure = None;
        for template in &self.templates {
            if let Err(e) = template.execute(&info) {
                error!(error = %e, "couldn't write template");
                failure = Some(e);
            }
        }

        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&token).await {
                warn!(error = %e, "couldn't notify");
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Build the snapshot templates render from. Pure function of the
    /// stores and the configuration.
    pub fn build_cluster_information(&self) -> ClusterInformation {
        let nodes = self.node_store.names();
        let endpoints_list = self.endpoints_store.list();
        let helper = EndpointsHelper::new(&endpoints_list);

        let mut services = Vec::new();
        for service in self.service_store.list() {
            self.collect_service(&service, &helper, &mut services);
        }

        // Deduplicate frontend ports by canonical form; BTreeMap keeps the
        // result stable across renders.
        let ports: Vec<PortSpec> = services
            .iter()
            .map(|s| (s.port.to_string(), s.port.clone()))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();

        ClusterInformation {
            services,
            ports,
            nodes,
            domain: self.config.domain.clone(),
        }
    }

    fn collect_service(
        &self,
        service: &Service,
        helper: &EndpointsHelper,
        out: &mut Vec<ServiceInformation>,
    ) {
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_default();

        let Some(spec) = service.spec.as_ref() else {
            return;
        };
        let service_type = spec.type_.as_deref().unwrap_or("");
        if service_type != "NodePort" && service_type != "LoadBalancer" {
            return;
        }

        let annotations = Annotations::parse(service);

        let ports_map = helper.service_ports_map(service);
        if ports_map.is_empty() {
            info!(service = %name, namespace = %namespace, "no endpoints for service, skipping");
            return;
        }

        for validator in &self.validators {
            if let Err(e) = validator.validate_service(service) {
                warn!(service = %name, namespace = %namespace, error = %e, "skipping service");
                return;
            }
        }

        let mut ip = self.config.default_lb_ip;
        if service_type == "LoadBalancer" {
            if let Some(lb_ip) = spec.load_balancer_ip.as_deref().filter(|s| !s.is_empty()) {
                match lb_ip.parse::<IpAddr>() {
                    Ok(parsed) => ip = parsed,
                    Err(_) => warn!(
                        service = %name,
                        namespace = %namespace,
                        load_balancer_ip = %lb_ip,
                        "unparseable load balancer IP, using default"
                    ),
                }
            }
        }

        for port in spec.ports.iter().flatten() {
            let port_name = port.name.clone().unwrap_or_default();
            let mode = annotations
                .port_modes
                .get(&port_name)
                .cloned()
                .unwrap_or_else(|| self.config.default_port_mode.clone());
            let protocol = port
                .protocol
                .clone()
                .unwrap_or_else(|| "TCP".to_string());
            let target_port = match port.target_port.as_ref() {
                Some(IntOrString::Int(value)) => *value,
                Some(IntOrString::String(_)) => 0,
                None => port.port,
            };
            out.push(ServiceInformation {
                name: name.clone(),
                namespace: namespace.clone(),
                port: PortSpec {
                    ip,
                    port: port.port,
                    mode: mode.to_lowercase(),
                    protocol: protocol.to_lowercase(),
                },
                endpoints: ports_map.get(&target_port).cloned().unwrap_or_default(),
                node_port: port.node_port.unwrap_or(0),
                external: annotations.external.clone(),
                timeout: annotations.timeouts.get(&port_name).copied(),
            });
        }
    }
}

/// Parsed service annotations; malformed payloads degrade to absent.
struct Annotations {
    external: Vec<String>,
    port_modes: HashMap<String, String>,
    timeouts: HashMap<String, u64>,
}

impl Annotations {
    fn parse(service: &Service) -> Self {
        let annotations = service.annotations();
        let name = service.name_any();

        let external = annotations
            .get(EXTERNAL_DOMAINS_ANNOTATION)
            .filter(|v| !v.is_empty())
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        let port_modes = parse_json_annotation(annotations.get(PORT_MODE_ANNOTATION), || {
            warn!(service = %name, annotation = PORT_MODE_ANNOTATION, "couldn't parse annotation");
        });
        let timeouts = parse_json_annotation(annotations.get(BACKEND_TIMEOUT_ANNOTATION), || {
            warn!(service = %name, annotation = BACKEND_TIMEOUT_ANNOTATION, "couldn't parse annotation");
        });

        Self {
            external,
            port_modes,
            timeouts,
        }
    }
}

fn parse_json_annotation<T: serde::de::DeserializeOwned>(
    value: Option<&String>,
    on_error: impl Fn(),
) -> HashMap<String, T> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return HashMap::new();
    };
    match serde_json::from_str(value) {
        Ok(parsed) => parsed,
        Err(_) => {
            on_error();
            HashMap::new()
        }
    }
}

/// Apply one event to its store and decide whether the updater needs a
/// signal. Added events for known keys run the same suppression as
/// Modified: after a reconnect the server replays the world as Added.
fn apply_event<K, S>(store: &S, event: ResourceEvent<K>, kind: &'static str) -> EventOutcome
where
    K: ResourceExt,
    S: EventStore<K>,
{
    match event {
        ResourceEvent::Added(obj) => upsert(store, obj, kind, false),
        ResourceEvent::Modified(obj) => upsert(store, obj, kind, true),
        ResourceEvent::Deleted(obj) => {
            let resource_version = obj.resource_version();
            store.delete(&obj);
            debug!(kind, name = %obj.name_any(), "object deleted");
            EventOutcome::Handled {
                signal: true,
                resource_version,
            }
        }
        ResourceEvent::Error(status) => {
            match status {
                Some(status) => warn!(kind, message = %status.message, "error event on watch"),
                None => warn!(kind, "error event on watch"),
            }
            EventOutcome::Reset
        }
    }
}

fn upsert<K, S>(store: &S, obj: K, kind: &'static str, modified: bool) -> EventOutcome
where
    K: ResourceExt,
    S: EventStore<K>,
{
    let resource_version = obj.resource_version();
    let new = Arc::new(obj);
    let old = store.update(new.clone());
    let signal = match old {
        None => {
            if modified {
                warn!(kind, name = %new.name_any(), "modified event for unknown object");
            }
            true
        }
        Some(old) => !store.equal(old.as_ref(), new.as_ref()),
    };
    EventOutcome::Handled {
        signal,
        resource_version,
    }
}
