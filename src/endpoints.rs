//! Flattening of Endpoints subsets into per-port address lists.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

/// A single backend address for a service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Target pod name when the address carries one, the IP otherwise.
    pub name: String,
    pub ip: String,
    pub port: i32,
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Indexes an Endpoints list so services can look up their backends.
pub struct EndpointsHelper {
    endpoints_map: HashMap<String, Arc<Endpoints>>,
}

fn meta_key(name: &str, namespace: &str) -> String {
    format!("{name} {namespace}")
}

impl EndpointsHelper {
    pub fn new(endpoints: &[Arc<Endpoints>]) -> Self {
        let endpoints_map = endpoints
            .iter()
            .map(|e| {
                (
                    meta_key(&e.name_any(), &e.namespace().unwrap_or_default()),
                    e.clone(),
                )
            })
            .collect();
        Self { endpoints_map }
    }

    /// Backend addresses for the given service, keyed by endpoint port
    /// number. Empty when no Endpoints entry matches the service.
    pub fn service_ports_map(&self, service: &Service) -> HashMap<i32, Vec<ServiceEndpoint>> {
        let mut m = HashMap::new();
        let key = meta_key(&service.name_any(), &service.namespace().unwrap_or_default());
        let Some(endpoints) = self.endpoints_map.get(&key) else {
            return m;
        };
        for subset in endpoints.subsets.iter().flatten() {
            for port in subset.ports.iter().flatten() {
                let mut addresses = Vec::new();
                for address in subset.addresses.iter().flatten() {
                    if address.ip.is_empty() {
                        continue;
                    }
                    let name = address
                        .target_ref
                        .as_ref()
                        .and_then(|r| r.name.clone())
                        .unwrap_or_else(|| address.ip.clone());
                    addresses.push(ServiceEndpoint {
                        name,
                        ip: address.ip.clone(),
                        port: port.port,
                    });
                }
                m.insert(port.port, addresses);
            }
        }
        m
    }
}
