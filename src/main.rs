use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kube2lb::config::{EngineConfig, FirstRenderPolicy};
use kube2lb::engine::Engine;
use kube2lb::kubernetes::KubernetesConnector;
use kube2lb::memdump::spawn_memdump_handler;
use kube2lb::notifier::Notifier;
use kube2lb::template::{ServerNameRenderer, Template, DEFAULT_SERVER_NAME_TEMPLATE};
use kube2lb::validators::{AddressableLoadBalancerIp, EphemeralPortsRange};

/// Generates load balancer configuration from the state of a Kubernetes
/// cluster and notifies the load balancer process on changes.
#[derive(Parser, Debug)]
#[command(name = "kube2lb", version, about)]
struct Cli {
    /// Kubernetes API server URL
    #[arg(long)]
    apiserver: Option<String>,

    /// Path to kubernetes client configuration
    #[arg(long)]
    kubecfg: Option<PathBuf>,

    /// DNS domain for the cluster
    #[arg(long, default_value = "local")]
    domain: String,

    /// Configuration path to generate
    #[arg(long)]
    config: Option<PathBuf>,

    /// Configuration source template
    #[arg(long)]
    template: Option<PathBuf>,

    /// Notifier definition (kind:payload)
    #[arg(long)]
    notify: Option<String>,

    /// Default mode for service ports
    #[arg(long, default_value = "http")]
    default_port_mode: String,

    /// Default IP for load balanced frontends
    #[arg(long, default_value = "0.0.0.0")]
    default_lb_ip: IpAddr,

    /// Seconds to keep retrying a lost API server connection
    #[arg(long, default_value_t = 300)]
    reconnect_timeout: u64,

    /// Update timeout in seconds
    #[arg(long, default_value_t = 10.0)]
    update_timeout: f64,

    /// Comma-separated list of templates to generate server names
    #[arg(long, default_value = DEFAULT_SERVER_NAME_TEMPLATE)]
    server_name_templates: String,

    /// When a failed render should terminate the process
    #[arg(long, value_enum, default_value_t = FirstRenderPolicy::FatalOnResyncFirst)]
    first_render_policy: FirstRenderPolicy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let template_path = match cli.template {
        Some(path) if path.exists() => path,
        Some(path) => bail!("template {} doesn't exist", path.display()),
        None => bail!("template not defined"),
    };

    let config_path = cli.config.context("configuration path not defined")?;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&config_path)
        .with_context(|| format!("cannot open {} to write", config_path.display()))?;

    let notify = match cli.notify.as_deref() {
        Some(notify) if !notify.is_empty() => notify,
        _ => bail!("notifier cannot be empty"),
    };
    let notifier = Notifier::parse(notify).context("couldn't initialize notifier")?;

    let server_names = Arc::new(
        ServerNameRenderer::new(&cli.server_name_templates)
            .context("couldn't initialize server name templates")?,
    );

    spawn_memdump_handler().context("couldn't install SIGUSR2 handler")?;

    let connector = KubernetesConnector::new(cli.apiserver.as_deref(), cli.kubecfg.as_deref())
        .await
        .context("couldn't connect with Kubernetes API server")?;

    let config = EngineConfig {
        domain: cli.domain,
        default_port_mode: cli.default_port_mode,
        default_lb_ip: cli.default_lb_ip,
        reconnect_timeout: Duration::from_secs(cli.reconnect_timeout),
        update_timeout: Duration::from_secs_f64(cli.update_timeout),
        first_render_policy: cli.first_render_policy,
    };

    let mut engine = Engine::new(Arc::new(connector), config);
    engine.add_template(Arc::new(Template::new(
        template_path,
        config_path,
        server_names,
    )));
    engine.add_notifier(notifier);
    engine.add_validator(Box::new(EphemeralPortsRange::from_host()));
    engine.add_validator(Box::new(AddressableLoadBalancerIp::from_host()));
    let engine = Arc::new(engine);

    let token = CancellationToken::new();
    let mut watch = tokio::spawn(engine.watch(token.clone()));

    tokio::select! {
        result = &mut watch => {
            return result
                .context("watch task panicked")?
                .context("couldn't watch Kubernetes API server");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            token.cancel();
        }
    }

    watch
        .await
        .context("watch task panicked")?
        .context("couldn't watch Kubernetes API server")?;
    Ok(())
}
