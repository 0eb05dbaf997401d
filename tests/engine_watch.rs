//! End-to-end tests of the watch loop: events in, rendered snapshots and
//! reload notifications out, driven through scripted watch connections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use kube2lb::config::{EngineConfig, FirstRenderPolicy};
use kube2lb::engine::{Engine, EXTERNAL_DOMAINS_ANNOTATION};
use kube2lb::error::Kube2lbError;
use kube2lb::kubernetes::{ResourceEvent, WatchConnector, WatchStreams};
use kube2lb::notifier::Notifier;
use kube2lb::template::{ClusterInformation, TemplateExecutor};

struct Feeds {
    nodes: mpsc::Sender<ResourceEvent<Node>>,
    services: mpsc::Sender<ResourceEvent<Service>>,
    endpoints: mpsc::Sender<ResourceEvent<Endpoints>>,
}

fn feeds_and_streams() -> (Feeds, WatchStreams) {
    let (nodes_tx, nodes_rx) = mpsc::channel(64);
    let (services_tx, services_rx) = mpsc::channel(64);
    let (endpoints_tx, endpoints_rx) = mpsc::channel(64);
    (
        Feeds {
            nodes: nodes_tx,
            services: services_tx,
            endpoints: endpoints_tx,
        },
        WatchStreams::new(nodes_rx, services_rx, endpoints_rx),
    )
}

/// Hands out a scripted sequence of connection attempts and records the
/// resource version each attempt resumed from.
struct ScriptedConnector {
    connections: Mutex<VecDeque<Result<WatchStreams, Kube2lbError>>>,
    versions: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    fn new(connections: Vec<Result<WatchStreams, Kube2lbError>>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(connections.into()),
            versions: Mutex::new(Vec::new()),
        })
    }

    fn versions(&self) -> Vec<String> {
        self.versions.lock().unwrap().clone()
    }
}

#[async_trait]
impl WatchConnector for ScriptedConnector {
    async fn connect(&self, last_resource_version: &str) -> Result<WatchStreams, Kube2lbError> {
        self.versions
            .lock()
            .unwrap()
            .push(last_resource_version.to_string());
        self.connections
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(Kube2lbError::ClientConfig(
                    "no scripted connection left".to_string(),
                ))
            })
    }
}

/// Records every snapshot it is asked to render; can be told to fail.
struct RecordingTemplate {
    executions: Mutex<Vec<ClusterInformation>>,
    fail: AtomicBool,
}

impl RecordingTemplate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            executions: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn failing() -> Arc<Self> {
        let template = Self::new();
        template.fail.store(true, Ordering::SeqCst);
        template
    }

    fn count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    fn last(&self) -> ClusterInformation {
        self.executions
            .lock()
            .unwrap()
            .last()
            .expect("no render recorded")
            .clone()
    }
}

impl TemplateExecutor for RecordingTemplate {
    fn execute(&self, info: &ClusterInformation) -> Result<(), Kube2lbError> {
        self.executions.lock().unwrap().push(info.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Kube2lbError::Config("scripted render failure".to_string()));
        }
        Ok(())
    }
}

fn node(name: &str, uid: &str, rv: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn service(name: &str, service_type: &str, rv: &str, annotations: &[(&str, &str)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("test".to_string()),
            uid: Some("svc-1".to_string()),
            resource_version: Some(rv.to_string()),
            annotations: (!annotations.is_empty()).then(|| {
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(80)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoints(name: &str, rv: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("test".to_string()),
            uid: Some("ep-1".to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some("http".to_string()),
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

fn engine_with(
    connector: Arc<dyn WatchConnector>,
    template: Arc<RecordingTemplate>,
    policy: FirstRenderPolicy,
) -> Arc<Engine> {
    let config = EngineConfig {
        domain: "kube2lb.test".to_string(),
        first_render_policy: policy,
        ..Default::default()
    };
    let mut engine = Engine::new(connector, config);
    engine.add_template(template);
    engine.add_notifier(Notifier::parse("debug:").unwrap());
    Arc::new(engine)
}

async fn wait_for_renders(template: &RecordingTemplate, n: usize) {
    for _ in 0..200 {
        if template.count() >= n {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("expected {n} renders, saw {}", template.count());
}

#[tokio::test(start_paused = true)]
async fn first_reconcile_builds_the_expected_snapshot() {
    let (feeds, streams) = feeds_and_streams();
    let connector = ScriptedConnector::new(vec![Ok(streams)]);
    let template = RecordingTemplate::new();
    let engine = engine_with(connector.clone(), template.clone(), FirstRenderPolicy::FatalOnResyncFirst);

    let token = CancellationToken::new();
    let watch = tokio::spawn(engine.watch(token.clone()));

    feeds
        .nodes
        .send(ResourceEvent::Added(node("node1", "1", "1")))
        .await
        .unwrap();
    feeds
        .nodes
        .send(ResourceEvent::Added(node("node2", "2", "2")))
        .await
        .unwrap();
    feeds
        .nodes
        .send(ResourceEvent::Deleted(node("node1", "1", "1")))
        .await
        .unwrap();
    feeds
        .services
        .send(ResourceEvent::Added(service("service1", "NodePort", "3", &[])))
        .await
        .unwrap();
    feeds
        .services
        .send(ResourceEvent::Added(service("service2", "ClusterIP", "4", &[])))
        .await
        .unwrap();
    feeds
        .endpoints
        .send(ResourceEvent::Added(endpoints(
            "service1",
            "5",
            &["10.0.0.1", "10.0.0.2"],
        )))
        .await
        .unwrap();
    feeds
        .endpoints
        .send(ResourceEvent::Modified(endpoints("service1", "6", &["10.0.0.1"])))
        .await
        .unwrap();

    wait_for_renders(&template, 1).await;
    sleep(Duration::from_secs(3)).await;

    let info = template.last();
    assert_eq!(info.nodes, vec!["node2"]);
    assert_eq!(info.domain, "kube2lb.test");
    assert_eq!(info.services.len(), 1);
    let svc = &info.services[0];
    assert_eq!(svc.name, "service1");
    assert_eq!(svc.endpoints.len(), 1);
    assert_eq!(svc.endpoints[0].ip, "10.0.0.1");
    assert_eq!(svc.endpoints[0].port, 80);
    assert_eq!(svc.port.port, 80);
    assert_eq!(svc.port.mode, "http");
    assert_eq!(svc.port.protocol, "tcp");

    // A node modification that changes nothing meaningful must not trigger
    // another render.
    let renders = template.count();
    feeds
        .nodes
        .send(ResourceEvent::Modified(node("node2", "2", "7")))
        .await
        .unwrap();
    sleep(Duration::from_secs(3)).await;
    assert_eq!(template.count(), renders);

    // Adding an annotation is a meaningful change and shows up in the next
    // snapshot.
    feeds
        .services
        .send(ResourceEvent::Modified(service(
            "service1",
            "NodePort",
            "8",
            &[(EXTERNAL_DOMAINS_ANNOTATION, "service1.example.com")],
        )))
        .await
        .unwrap();
    wait_for_renders(&template, renders + 1).await;

    let info = template.last();
    assert_eq!(info.services.len(), 1);
    assert_eq!(info.services[0].external, vec!["service1.example.com"]);

    token.cancel();
    watch.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_from_last_resource_version() {
    let (feeds_a, streams_a) = feeds_and_streams();
    let (feeds_b, streams_b) = feeds_and_streams();
    let connector = ScriptedConnector::new(vec![
        Ok(streams_a),
        Err(Kube2lbError::ClientConfig("connection refused".to_string())),
        Ok(streams_b),
    ]);
    let template = RecordingTemplate::new();
    let engine = engine_with(connector.clone(), template.clone(), FirstRenderPolicy::FatalOnResyncFirst);

    let token = CancellationToken::new();
    let watch = tokio::spawn(engine.watch(token.clone()));

    feeds_a
        .nodes
        .send(ResourceEvent::Added(node("node1", "1", "1")))
        .await
        .unwrap();
    wait_for_renders(&template, 1).await;

    feeds_a
        .services
        .send(ResourceEvent::Added(service("service1", "NodePort", "9", &[])))
        .await
        .unwrap();
    wait_for_renders(&template, 2).await;

    // Closing the channels simulates the server dropping the watch; the
    // second connection attempt fails, the third succeeds.
    drop(feeds_a);
    sleep(Duration::from_secs(30)).await;

    let versions = connector.versions();
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[0], "");
    assert_eq!(versions[1], "9");
    assert_eq!(versions[2], "9");

    // The replay after reconnect carries already-known state; no render.
    let renders = template.count();
    feeds_b
        .nodes
        .send(ResourceEvent::Added(node("node1", "1", "12")))
        .await
        .unwrap();
    feeds_b
        .services
        .send(ResourceEvent::Added(service("service1", "NodePort", "9", &[])))
        .await
        .unwrap();
    sleep(Duration::from_secs(3)).await;
    assert_eq!(template.count(), renders);

    token.cancel();
    watch.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_first_render_is_fatal() {
    let (feeds, streams) = feeds_and_streams();
    let connector = ScriptedConnector::new(vec![Ok(streams)]);
    let template = RecordingTemplate::failing();
    let engine = engine_with(connector, template, FirstRenderPolicy::FatalOnResyncFirst);

    let token = CancellationToken::new();
    let watch = tokio::spawn(engine.watch(token));

    feeds
        .nodes
        .send(ResourceEvent::Added(node("node1", "1", "1")))
        .await
        .unwrap();

    let result = watch.await.unwrap();
    assert!(result.is_err(), "first render failure should stop the watch");
}

#[tokio::test(start_paused = true)]
async fn failed_first_render_is_survivable_when_configured() {
    let (feeds, streams) = feeds_and_streams();
    let connector = ScriptedConnector::new(vec![Ok(streams)]);
    let template = RecordingTemplate::failing();
    let engine = engine_with(connector, template.clone(), FirstRenderPolicy::NeverFatal);

    let token = CancellationToken::new();
    let watch = tokio::spawn(engine.watch(token.clone()));

    feeds
        .nodes
        .send(ResourceEvent::Added(node("node1", "1", "1")))
        .await
        .unwrap();
    wait_for_renders(&template, 1).await;
    sleep(Duration::from_secs(5)).await;
    assert!(!watch.is_finished());

    token.cancel();
    watch.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn later_render_failures_are_not_fatal() {
    let (feeds, streams) = feeds_and_streams();
    let connector = ScriptedConnector::new(vec![Ok(streams)]);
    let template = RecordingTemplate::new();
    let engine = engine_with(connector, template.clone(), FirstRenderPolicy::FatalOnResyncFirst);

    let token = CancellationToken::new();
    let watch = tokio::spawn(engine.watch(token.clone()));

    feeds
        .nodes
        .send(ResourceEvent::Added(node("node1", "1", "1")))
        .await
        .unwrap();
    wait_for_renders(&template, 1).await;

    template.fail.store(true, Ordering::SeqCst);
    feeds
        .nodes
        .send(ResourceEvent::Added(node("node2", "2", "2")))
        .await
        .unwrap();
    wait_for_renders(&template, 2).await;
    sleep(Duration::from_secs(5)).await;
    assert!(!watch.is_finished());

    token.cancel();
    watch.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn startup_connection_failure_is_terminal() {
    let connector = ScriptedConnector::new(vec![Err(Kube2lbError::ClientConfig(
        "connection refused".to_string(),
    ))]);
    let template = RecordingTemplate::new();
    let engine = engine_with(connector, template, FirstRenderPolicy::FatalOnResyncFirst);

    let result = engine.watch(CancellationToken::new()).await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn reconnect_budget_exhaustion_is_terminal() {
    let (feeds, streams) = feeds_and_streams();
    // Only the initial connection succeeds; every retry fails.
    let connector = ScriptedConnector::new(vec![Ok(streams)]);
    let template = RecordingTemplate::new();
    let engine = engine_with(connector.clone(), template, FirstRenderPolicy::FatalOnResyncFirst);

    let token = CancellationToken::new();
    let watch = tokio::spawn(engine.watch(token));

    drop(feeds);
    let result = watch.await.unwrap();
    assert!(result.is_err(), "exhausted reconnect budget should stop the watch");
    // Initial connection plus five minutes of retries every five seconds.
    assert!(connector.versions().len() > 10);
}
