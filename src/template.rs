//! Cluster snapshot model and configuration rendering.
//!
//! Templates are user supplied; the engine hands them a [`ClusterInformation`]
//! snapshot plus a small set of helper functions and writes the result over
//! the configured output path.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use minijinja::value::ViaDeserialize;
use minijinja::{context, Environment, Value};
use serde::{Deserialize, Serialize};

use crate::endpoints::ServiceEndpoint;
use crate::error::Kube2lbError;

/// Default server name template when none is configured.
pub const DEFAULT_SERVER_NAME_TEMPLATE: &str =
    "{{ service.name }}.{{ service.namespace }}.svc.{{ domain }}";

/// A frontend port as seen by the load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    pub ip: IpAddr,
    pub port: i32,
    pub mode: String,
    pub protocol: String,
}

impl fmt::Display for PortSpec {
    /// Canonical form, also the deduplication key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.ip, self.port, self.protocol, self.mode
        )
    }
}

/// One service port and its backends, as handed to templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInformation {
    pub name: String,
    pub namespace: String,
    pub port: PortSpec,
    pub endpoints: Vec<ServiceEndpoint>,
    pub node_port: i32,
    pub external: Vec<String>,
    /// Backend timeout in seconds, when the service annotates one for this port.
    pub timeout: Option<u64>,
}

/// The snapshot templates render from. Rebuilt on every update cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInformation {
    pub services: Vec<ServiceInformation>,
    pub ports: Vec<PortSpec>,
    pub nodes: Vec<String>,
    pub domain: String,
}

/// A DNS name (or, with a `~` prefix, a regular expression) a service
/// answers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerName {
    pub name: String,
    pub is_regexp: bool,
    pub regexp: String,
}

impl ServerName {
    fn from_name(name: String) -> Self {
        let is_regexp = name.starts_with('~');
        let regexp = name.trim_start_matches('~').to_string();
        Self {
            name,
            is_regexp,
            regexp,
        }
    }
}

/// Compiled server name templates, applied per service at render time.
pub struct ServerNameRenderer {
    env: Environment<'static>,
    names: Vec<String>,
}

impl ServerNameRenderer {
    /// Compile a comma-separated list of server name templates. An empty
    /// argument falls back to [`DEFAULT_SERVER_NAME_TEMPLATE`].
    pub fn new(templates_arg: &str) -> Result<Self, Kube2lbError> {
        let templates_arg = if templates_arg.is_empty() {
            DEFAULT_SERVER_NAME_TEMPLATE
        } else {
            templates_arg
        };
        let mut env = Environment::new();
        let mut names = Vec::new();
        for (i, template) in templates_arg.split(',').enumerate() {
            let name = format!("server-name-{i}");
            env.add_template_owned(name.clone(), template.to_string())?;
            names.push(name);
        }
        Ok(Self { env, names })
    }

    /// The deduplicated union of every template applied to the service and
    /// the service's external domains, in first-seen order.
    pub fn server_names(
        &self,
        service: &ServiceInformation,
        domain: &str,
    ) -> Result<Vec<ServerName>, minijinja::Error> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in &self.names {
            let rendered = self
                .env
                .get_template(name)?
                .render(context! { service => service, domain => domain })?;
            if seen.insert(rendered.clone()) {
                out.push(rendered);
            }
        }
        for external in &service.external {
            if seen.insert(external.clone()) {
                out.push(external.clone());
            }
        }
        Ok(out.into_iter().map(ServerName::from_name).collect())
    }
}

/// Something that can consume a snapshot. The file-backed implementation is
/// [`Template`]; tests substitute recorders.
pub trait TemplateExecutor: Send + Sync {
    fn execute(&self, info: &ClusterInformation) -> Result<(), Kube2lbError>;
}

/// A user template and the output path it renders to.
pub struct Template {
    source: PathBuf,
    path: PathBuf,
    server_names: Arc<ServerNameRenderer>,
}

impl Template {
    pub fn new(
        source: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
        server_names: Arc<ServerNameRenderer>,
    ) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
            server_names,
        }
    }

    fn environment(&self, domain: String) -> Environment<'static> {
        let mut env = Environment::new();
        env.add_function("escape_node", |name: String| {
            name.replace(['.', ':'], "_")
        });
        env.add_function("int_range", |n: i64, initial: i64, step: i64| -> Vec<i64> {
            (0..n).map(|i| initial + i * step).collect()
        });
        let server_names = self.server_names.clone();
        env.add_function(
            "server_names",
            move |service: ViaDeserialize<ServiceInformation>,
                  domain_arg: Option<String>|
                  -> Result<Value, minijinja::Error> {
                let domain = domain_arg.as_deref().unwrap_or(domain.as_str());
                let names = server_names.server_names(&service, domain)?;
                Ok(Value::from_serialize(&names))
            },
        );
        env
    }
}

impl TemplateExecutor for Template {
    /// Render the snapshot. The output is written to a sibling file and
    /// renamed into place so a failed render never truncates the previous
    /// configuration.
    fn execute(&self, info: &ClusterInformation) -> Result<(), Kube2lbError> {
        let source = fs::read_to_string(&self.source)?;
        let mut env = self.environment(info.domain.clone());
        env.add_template_owned("config", source)?;
        let rendered = env.get_template("config")?.render(info)?;
        write_config(&self.path, rendered.as_bytes())?;
        Ok(())
    }
}

fn write_config(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}
