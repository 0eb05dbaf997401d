//! Engine configuration.
//!
//! Everything the engine needs beyond its collaborators lives here; the
//! values come from the command line and are passed in explicitly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use clap::ValueEnum;

/// What happens when a render cycle fails while the caches have just been
/// (re)built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FirstRenderPolicy {
    /// Only the very first render after startup is fatal.
    FatalOnFirst,
    /// The first render after startup and after every cache rebuild is
    /// fatal.
    FatalOnResyncFirst,
    /// Render failures are never fatal.
    NeverFatal,
}

impl fmt::Display for FirstRenderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FirstRenderPolicy::FatalOnFirst => "fatal-on-first",
            FirstRenderPolicy::FatalOnResyncFirst => "fatal-on-resync-first",
            FirstRenderPolicy::NeverFatal => "never-fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// DNS domain of the cluster, exposed to templates.
    pub domain: String,
    /// Port mode used when a service doesn't annotate one.
    pub default_port_mode: String,
    /// Frontend IP used when a service doesn't carry a load balancer IP.
    pub default_lb_ip: IpAddr,
    /// Total budget for reconnection attempts before giving up.
    pub reconnect_timeout: Duration,
    /// Budget for a single render-and-notify cycle.
    pub update_timeout: Duration,
    pub first_render_policy: FirstRenderPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: "local".to_string(),
            default_port_mode: "http".to_string(),
            default_lb_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reconnect_timeout: Duration::from_secs(300),
            update_timeout: Duration::from_secs(10),
            first_render_policy: FirstRenderPolicy::FatalOnResyncFirst,
        }
    }
}
