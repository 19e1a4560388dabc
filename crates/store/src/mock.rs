//! In-memory Store for unit testing
//!
//! Stores resources in memory behind the same [`Store`] trait the live
//! implementation uses, with the API server's resource-version discipline
//! modeled faithfully: every write bumps the version, and a write carrying
//! a stale version fails with [`StoreError::Conflict`]. Tests can also
//! inject artificial conflicts to exercise retry paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::ObjectMeta;

use crds::{SpiderEndpoint, SpiderIPPool, SpiderReservedIP, SpiderSubnet};

use crate::error::StoreError;
use crate::Store;

/// Mock [`Store`] for testing.
#[derive(Clone, Default)]
pub struct MockStore {
    ippools: Arc<Mutex<HashMap<String, SpiderIPPool>>>,
    endpoints: Arc<Mutex<HashMap<(String, String), SpiderEndpoint>>>,
    reserved_ips: Arc<Mutex<Vec<SpiderReservedIP>>>,
    subnets: Arc<Mutex<HashMap<String, SpiderSubnet>>>,
    pods: Arc<Mutex<HashMap<(String, String), Pod>>>,
    namespaces: Arc<Mutex<HashMap<String, Namespace>>>,
    nodes: Arc<Mutex<HashMap<String, Node>>>,
    statefulsets: Arc<Mutex<HashMap<(String, String), StatefulSet>>>,
    replicasets: Arc<Mutex<HashMap<(String, String), ReplicaSet>>>,
    // Injected failures per pool name: (updates to let through, forced
    // conflicts after that).
    pool_status_conflicts: Arc<Mutex<HashMap<String, (u32, u32)>>>,
    next_rv: Arc<AtomicU64>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_rv(&self) -> String {
        (self.next_rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, meta: &mut ObjectMeta) {
        meta.resource_version = Some(self.bump_rv());
    }

    // ------------------------------------------------------------------
    // Test setup
    // ------------------------------------------------------------------

    pub fn add_ippool(&self, mut pool: SpiderIPPool) {
        let name = pool.metadata.name.clone().expect("pool must be named");
        self.stamp(&mut pool.metadata);
        self.ippools.lock().unwrap().insert(name, pool);
    }

    pub fn add_endpoint(&self, mut endpoint: SpiderEndpoint) {
        let key = (
            endpoint.metadata.namespace.clone().expect("endpoint namespace"),
            endpoint.metadata.name.clone().expect("endpoint name"),
        );
        self.stamp(&mut endpoint.metadata);
        self.endpoints.lock().unwrap().insert(key, endpoint);
    }

    pub fn add_reserved_ip(&self, reserved: SpiderReservedIP) {
        self.reserved_ips.lock().unwrap().push(reserved);
    }

    pub fn add_subnet(&self, subnet: SpiderSubnet) {
        let name = subnet.metadata.name.clone().expect("subnet must be named");
        self.subnets.lock().unwrap().insert(name, subnet);
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().expect("pod must be named"),
        );
        self.pods.lock().unwrap().insert(key, pod);
    }

    pub fn add_namespace(&self, namespace: Namespace) {
        let name = namespace.metadata.name.clone().expect("namespace must be named");
        self.namespaces.lock().unwrap().insert(name, namespace);
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().expect("node must be named");
        self.nodes.lock().unwrap().insert(name, node);
    }

    pub fn add_statefulset(&self, statefulset: StatefulSet) {
        let key = (
            statefulset.metadata.namespace.clone().unwrap_or_default(),
            statefulset.metadata.name.clone().expect("statefulset must be named"),
        );
        self.statefulsets.lock().unwrap().insert(key, statefulset);
    }

    pub fn add_replicaset(&self, replicaset: ReplicaSet) {
        let key = (
            replicaset.metadata.namespace.clone().unwrap_or_default(),
            replicaset.metadata.name.clone().expect("replicaset must be named"),
        );
        self.replicasets.lock().unwrap().insert(key, replicaset);
    }

    /// Forces the next `count` status updates of the named pool to fail
    /// with `Conflict`, regardless of resource version.
    pub fn inject_pool_status_conflicts(&self, pool: &str, count: u32) {
        self.inject_pool_status_conflicts_after(pool, 0, count);
    }

    /// Lets `skip` status updates of the named pool through, then forces
    /// `count` conflicts. Useful to break a rollback while the preceding
    /// allocation succeeds.
    pub fn inject_pool_status_conflicts_after(&self, pool: &str, skip: u32, count: u32) {
        self.pool_status_conflicts
            .lock()
            .unwrap()
            .insert(pool.to_string(), (skip, count));
    }

    // ------------------------------------------------------------------
    // Test inspection
    // ------------------------------------------------------------------

    pub fn ippool(&self, name: &str) -> Option<SpiderIPPool> {
        self.ippools.lock().unwrap().get(name).cloned()
    }

    pub fn endpoint(&self, namespace: &str, name: &str) -> Option<SpiderEndpoint> {
        self.endpoints
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get_ippool(&self, name: &str) -> Result<SpiderIPPool, StoreError> {
        self.ippools
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("SpiderIPPool {}", name)))
    }

    async fn list_ippools(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<SpiderIPPool>, StoreError> {
        let pools = self.ippools.lock().unwrap();
        Ok(pools
            .values()
            .filter(|pool| {
                let pool_labels = pool.metadata.labels.clone().unwrap_or_default();
                labels
                    .iter()
                    .all(|(k, v)| pool_labels.get(k).map(|pv| pv == v).unwrap_or(false))
            })
            .cloned()
            .collect())
    }

    async fn update_ippool_status(
        &self,
        pool: &SpiderIPPool,
    ) -> Result<SpiderIPPool, StoreError> {
        let name = pool
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::NotFound("SpiderIPPool <unnamed>".to_string()))?;

        {
            let mut conflicts = self.pool_status_conflicts.lock().unwrap();
            if let Some((skip, remaining)) = conflicts.get_mut(&name) {
                if *skip > 0 {
                    *skip -= 1;
                } else if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Conflict(format!("SpiderIPPool {}", name)));
                }
            }
        }

        let mut pools = self.ippools.lock().unwrap();
        let stored = pools
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(format!("SpiderIPPool {}", name)))?;
        if stored.metadata.resource_version != pool.metadata.resource_version {
            return Err(StoreError::Conflict(format!("SpiderIPPool {}", name)));
        }

        stored.status = pool.status.clone();
        stored.metadata.resource_version = Some(self.bump_rv());
        Ok(stored.clone())
    }

    async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SpiderEndpoint, StoreError> {
        self.endpoints
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("SpiderEndpoint {}/{}", namespace, name)))
    }

    async fn create_endpoint(
        &self,
        endpoint: &SpiderEndpoint,
    ) -> Result<SpiderEndpoint, StoreError> {
        let key = (
            endpoint.metadata.namespace.clone().unwrap_or_default(),
            endpoint.metadata.name.clone().unwrap_or_default(),
        );
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "SpiderEndpoint {}/{} already exists",
                key.0, key.1
            )));
        }
        let mut created = endpoint.clone();
        created.metadata.resource_version = Some(self.bump_rv());
        endpoints.insert(key, created.clone());
        Ok(created)
    }

    async fn update_endpoint(
        &self,
        endpoint: &SpiderEndpoint,
    ) -> Result<SpiderEndpoint, StoreError> {
        let key = (
            endpoint.metadata.namespace.clone().unwrap_or_default(),
            endpoint.metadata.name.clone().unwrap_or_default(),
        );
        let mut endpoints = self.endpoints.lock().unwrap();
        let stored = endpoints
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("SpiderEndpoint {}/{}", key.0, key.1)))?;
        if stored.metadata.resource_version != endpoint.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "SpiderEndpoint {}/{}",
                key.0, key.1
            )));
        }
        let status = stored.status.clone();
        *stored = endpoint.clone();
        stored.status = status;
        stored.metadata.resource_version = Some(self.bump_rv());
        Ok(stored.clone())
    }

    async fn update_endpoint_status(
        &self,
        endpoint: &SpiderEndpoint,
    ) -> Result<SpiderEndpoint, StoreError> {
        let key = (
            endpoint.metadata.namespace.clone().unwrap_or_default(),
            endpoint.metadata.name.clone().unwrap_or_default(),
        );
        let mut endpoints = self.endpoints.lock().unwrap();
        let stored = endpoints
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("SpiderEndpoint {}/{}", key.0, key.1)))?;
        if stored.metadata.resource_version != endpoint.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "SpiderEndpoint {}/{}",
                key.0, key.1
            )));
        }
        stored.status = endpoint.status.clone();
        stored.metadata.resource_version = Some(self.bump_rv());
        Ok(stored.clone())
    }

    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.endpoints
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_reserved_ips(&self) -> Result<Vec<SpiderReservedIP>, StoreError> {
        Ok(self.reserved_ips.lock().unwrap().clone())
    }

    async fn get_subnet(&self, name: &str) -> Result<SpiderSubnet, StoreError> {
        self.subnets
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("SpiderSubnet {}", name)))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Pod {}/{}", namespace, name)))
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, StoreError> {
        self.namespaces
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Namespace {}", name)))
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Node {}", name)))
    }

    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, StoreError> {
        self.statefulsets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("StatefulSet {}/{}", namespace, name)))
    }

    async fn get_replicaset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, StoreError> {
        self.replicasets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ReplicaSet {}/{}", namespace, name)))
    }

    async fn merge_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut pods = self.pods.lock().unwrap();
        let pod = pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("Pod {}/{}", namespace, name)))?;
        let merged = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (k, v) in annotations {
            merged.insert(k, v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str) -> SpiderIPPool {
        let mut pool = SpiderIPPool::default();
        pool.metadata.name = Some(name.to_string());
        pool
    }

    #[tokio::test]
    async fn test_stale_status_update_conflicts() {
        let store = MockStore::new();
        store.add_ippool(pool("p1"));

        let first = store.get_ippool("p1").await.unwrap();
        let second = store.get_ippool("p1").await.unwrap();

        store.update_ippool_status(&first).await.unwrap();
        let err = store.update_ippool_status(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_fresh_read_after_conflict_succeeds() {
        let store = MockStore::new();
        store.add_ippool(pool("p1"));

        let stale = store.get_ippool("p1").await.unwrap();
        store
            .update_ippool_status(&store.get_ippool("p1").await.unwrap())
            .await
            .unwrap();
        assert!(store.update_ippool_status(&stale).await.is_err());

        let fresh = store.get_ippool("p1").await.unwrap();
        store.update_ippool_status(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_conflicts_drain() {
        let store = MockStore::new();
        store.add_ippool(pool("p1"));
        store.inject_pool_status_conflicts("p1", 2);

        for _ in 0..2 {
            let fresh = store.get_ippool("p1").await.unwrap();
            assert!(store.update_ippool_status(&fresh).await.unwrap_err().is_conflict());
        }
        let fresh = store.get_ippool("p1").await.unwrap();
        store.update_ippool_status(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_label_filtered_list() {
        let store = MockStore::new();
        let mut labeled = pool("p1");
        labeled.metadata.labels = Some(BTreeMap::from([(
            "ipam.spidernet.io/ippool-version".to_string(),
            "IPv4".to_string(),
        )]));
        store.add_ippool(labeled);
        store.add_ippool(pool("p2"));

        let selector = BTreeMap::from([(
            "ipam.spidernet.io/ippool-version".to_string(),
            "IPv4".to_string(),
        )]);
        let matched = store.list_ippools(&selector).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].metadata.name.as_deref(), Some("p1"));
    }
}
