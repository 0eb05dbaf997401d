//! Per-kind local caches with change-significance comparison.
//!
//! Each store keeps the last observed object per key and decides whether a
//! replacement is a meaningful change for that kind. The comparison is what
//! keeps cosmetic apiserver updates (resourceVersion bumps with identical
//! content) from rewriting the load balancer configuration.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::ResourceExt;

/// Store operations the event dispatch loop needs, independent of kind.
pub trait EventStore<K> {
    /// Insert or replace, returning the previously stored object.
    fn update(&self, obj: Arc<K>) -> Option<Arc<K>>;
    /// Remove, returning the previously stored object.
    fn delete(&self, obj: &K) -> Option<Arc<K>>;
    /// Kind-specific significance comparison.
    fn equal(&self, old: &K, new: &K) -> bool;
    /// Drop everything; used when the watch stream reports an error and the
    /// caches have to be rebuilt from a replay.
    fn reset(&self);
}

/// Thread-safe keyed cache shared by the kind-specific stores.
pub struct LocalStore<K> {
    objects: RwLock<HashMap<String, Arc<K>>>,
}

impl<K: ResourceExt> LocalStore<K> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn key(obj: &K) -> String {
        format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
    }

    pub fn update(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = Self::key(&obj);
        let mut objects = self.objects.write().expect("store lock poisoned");
        objects.insert(key, obj)
    }

    pub fn delete(&self, obj: &K) -> Option<Arc<K>> {
        let key = Self::key(obj);
        let mut objects = self.objects.write().expect("store lock poisoned");
        objects.remove(&key)
    }

    pub fn reset(&self) {
        let mut objects = self.objects.write().expect("store lock poisoned");
        objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn values(&self) -> Vec<Arc<K>> {
        let objects = self.objects.read().expect("store lock poisoned");
        objects.values().cloned().collect()
    }
}

impl<K: ResourceExt> Default for LocalStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Node cache. Only node names reach the rendered configuration, so only a
/// name change is significant.
#[derive(Default)]
pub struct NodeStore {
    store: LocalStore<Node>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all known nodes, sorted for deterministic rendering.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .store
            .values()
            .iter()
            .map(|node| node.name_any())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl EventStore<Node> for NodeStore {
    fn update(&self, obj: Arc<Node>) -> Option<Arc<Node>> {
        self.store.update(obj)
    }

    fn delete(&self, obj: &Node) -> Option<Arc<Node>> {
        self.store.delete(obj)
    }

    fn equal(&self, old: &Node, new: &Node) -> bool {
        old.name_any() == new.name_any()
    }

    fn reset(&self) {
        self.store.reset();
    }
}

/// Service cache. Any server-acknowledged mutation is significant.
#[derive(Default)]
pub struct ServiceStore {
    store: LocalStore<Service>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Arc<Service>> {
        self.store.values()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl EventStore<Service> for ServiceStore {
    fn update(&self, obj: Arc<Service>) -> Option<Arc<Service>> {
        self.store.update(obj)
    }

    fn delete(&self, obj: &Service) -> Option<Arc<Service>> {
        self.store.delete(obj)
    }

    fn equal(&self, old: &Service, new: &Service) -> bool {
        old.uid() == new.uid() && old.resource_version() == new.resource_version()
    }

    fn reset(&self) {
        self.store.reset();
    }
}

/// Endpoints cache. Significant only when the flattened address set changes;
/// subset regrouping with the same addresses is cosmetic.
#[derive(Default)]
pub struct EndpointsStore {
    store: LocalStore<Endpoints>,
}

impl EndpointsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Arc<Endpoints>> {
        self.store.values()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

fn flattened_addresses(endpoints: &Endpoints) -> HashSet<String> {
    let mut addresses = HashSet::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            for address in subset.addresses.iter().flatten() {
                addresses.insert(format!("{}:{}", address.ip, port.port));
            }
        }
    }
    addresses
}

impl EventStore<Endpoints> for EndpointsStore {
    fn update(&self, obj: Arc<Endpoints>) -> Option<Arc<Endpoints>> {
        self.store.update(obj)
    }

    fn delete(&self, obj: &Endpoints) -> Option<Arc<Endpoints>> {
        self.store.delete(obj)
    }

    fn equal(&self, old: &Endpoints, new: &Endpoints) -> bool {
        if old.uid() == new.uid() && old.resource_version() == new.resource_version() {
            return true;
        }
        flattened_addresses(old) == flattened_addresses(new)
    }

    fn reset(&self) {
        self.store.reset();
    }
}
