//! Sanity checks applied to services before they reach the configuration.
//!
//! Validators are assembled into an explicit list when the engine is built;
//! a rejected service is skipped for the current snapshot and nothing else.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::warn;

use crate::error::Kube2lbError;

const EPHEMERAL_PORT_RANGE_PATH: &str = "/proc/sys/net/ipv4/ip_local_port_range";
const NONLOCAL_BIND_PATH: &str = "/proc/sys/net/ipv4/ip_nonlocal_bind";

const ADDRESSES_EXPIRATION: Duration = Duration::from_secs(5);

/// A sanity check over a single service.
pub trait ServiceValidator: Send + Sync {
    fn validate_service(&self, service: &Service) -> Result<(), Kube2lbError>;
}

/// Rejects services exposing ports inside the host's ephemeral port range;
/// the kernel could hand any of those ports to an outgoing connection.
pub struct EphemeralPortsRange {
    enabled: bool,
    low: i32,
    high: i32,
}

impl EphemeralPortsRange {
    pub fn new(low: i32, high: i32) -> Self {
        Self {
            enabled: true,
            low,
            high,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            low: 0,
            high: 0,
        }
    }

    /// Read the range from the running kernel; the check is disabled when
    /// the range cannot be read.
    pub fn from_host() -> Self {
        match fs::read_to_string(EPHEMERAL_PORT_RANGE_PATH) {
            Ok(contents) => {
                let mut fields = contents.split_whitespace();
                let low = fields.next().and_then(|f| f.parse().ok());
                let high = fields.next().and_then(|f| f.parse().ok());
                match (low, high) {
                    (Some(low), Some(high)) => Self::new(low, high),
                    _ => {
                        warn!(
                            path = EPHEMERAL_PORT_RANGE_PATH,
                            %contents,
                            "unparseable ephemeral port range, skipping ephemeral port checks"
                        );
                        Self::disabled()
                    }
                }
            }
            Err(e) => {
                warn!(
                    path = EPHEMERAL_PORT_RANGE_PATH,
                    error = %e,
                    "couldn't read ephemeral port range, skipping ephemeral port checks"
                );
                Self::disabled()
            }
        }
    }
}

impl fmt::Display for EphemeralPortsRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.low, self.high)
    }
}

impl ServiceValidator for EphemeralPortsRange {
    fn validate_service(&self, service: &Service) -> Result<(), Kube2lbError> {
        if !self.enabled {
            return Ok(());
        }
        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref());
        for port in ports.into_iter().flatten() {
            if port.port >= self.low && port.port <= self.high {
                return Err(Kube2lbError::Validation(format!(
                    "port {} of service {}/{} is in the ephemeral port range ({}), check your configuration",
                    port.port,
                    service.namespace().unwrap_or_default(),
                    service.name_any(),
                    self
                )));
            }
        }
        Ok(())
    }
}

/// Rejects LoadBalancer services whose `loadBalancerIP` this host could not
/// bind. The interface address list is refreshed at most every 5 seconds.
pub struct AddressableLoadBalancerIp {
    check_local_bind: bool,
    addresses: Mutex<CachedAddresses>,
}

struct CachedAddresses {
    addresses: Vec<IpAddr>,
    fetched_at: Option<Instant>,
}

impl AddressableLoadBalancerIp {
    /// Read `ip_nonlocal_bind` from the running kernel; when non-local binds
    /// are allowed (or the key is unreadable) only IP syntax is checked.
    pub fn from_host() -> Self {
        let check_local_bind = match fs::read_to_string(NONLOCAL_BIND_PATH) {
            Ok(contents) => contents.trim() == "0",
            Err(e) => {
                warn!(
                    path = NONLOCAL_BIND_PATH,
                    error = %e,
                    "couldn't read ip_nonlocal_bind, skipping load balancer IP bind checks"
                );
                false
            }
        };
        Self {
            check_local_bind,
            addresses: Mutex::new(CachedAddresses {
                addresses: Vec::new(),
                fetched_at: None,
            }),
        }
    }

    /// Build a validator with a fixed address list, bypassing the host
    /// interfaces. Used by tests.
    pub fn with_addresses(addresses: Vec<IpAddr>) -> Self {
        Self {
            check_local_bind: true,
            addresses: Mutex::new(CachedAddresses {
                addresses,
                fetched_at: Some(Instant::now()),
            }),
        }
    }

    fn local_addresses(&self) -> Result<Vec<IpAddr>, Kube2lbError> {
        let mut cached = self.addresses.lock().expect("address cache lock poisoned");
        let expired = match cached.fetched_at {
            None => true,
            Some(at) => at.elapsed() > ADDRESSES_EXPIRATION,
        };
        if expired {
            cached.addresses = interface_addresses()?;
            cached.fetched_at = Some(Instant::now());
        }
        Ok(cached.addresses.clone())
    }
}

fn interface_addresses() -> Result<Vec<IpAddr>, Kube2lbError> {
    let mut addresses = Vec::new();
    let interfaces = nix::ifaddrs::getifaddrs()
        .map_err(|e| Kube2lbError::Validation(format!("couldn't list interface addresses: {e}")))?;
    for interface in interfaces {
        let Some(storage) = interface.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            addresses.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            addresses.push(IpAddr::V6(sin6.ip()));
        }
    }
    Ok(addresses)
}

impl ServiceValidator for AddressableLoadBalancerIp {
    fn validate_service(&self, service: &Service) -> Result<(), Kube2lbError> {
        let Some(spec) = service.spec.as_ref() else {
            return Ok(());
        };
        if spec.type_.as_deref() != Some("LoadBalancer") {
            return Ok(());
        }
        let Some(lb_ip) = spec.load_balancer_ip.as_deref().filter(|ip| !ip.is_empty()) else {
            return Ok(());
        };

        let ip: IpAddr = lb_ip.parse().map_err(|_| {
            Kube2lbError::Validation(format!(
                "couldn't parse IP '{}' for service {}/{}",
                lb_ip,
                service.namespace().unwrap_or_default(),
                service.name_any()
            ))
        })?;

        if self.check_local_bind {
            let addresses = match self.local_addresses() {
                Ok(addresses) => addresses,
                Err(e) => {
                    warn!(error = %e, "couldn't obtain local interface addresses");
                    return Ok(());
                }
            };
            if !addresses.contains(&ip) {
                return Err(Kube2lbError::Validation(format!(
                    "service {}/{} cannot be bound to load balancer IP {}, check your configuration",
                    service.namespace().unwrap_or_default(),
                    service.name_any(),
                    lb_ip
                )));
            }
        }

        Ok(())
    }
}
