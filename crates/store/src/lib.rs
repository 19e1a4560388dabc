//! Typed cluster state access
//!
//! The [`Store`] trait is the only seam through which the IPAM core talks
//! to the cluster API. It abstracts typed read/list/create/update/delete
//! over the four Spiderpool CRDs plus the collaborator objects the core
//! consults (Pod, Namespace, Node, StatefulSet, ReplicaSet), which the
//! deployment serves from informer caches.
//!
//! Updates are optimistically concurrent: the object carries the resource
//! version it was read at, and a stale write surfaces
//! [`StoreError::Conflict`] so the caller can re-read and retry.
//!
//! Two implementations ship here: [`KubeStore`] against a live API server,
//! and [`MockStore`] for unit tests.

mod error;
mod kube_store;
mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};

use crds::{SpiderEndpoint, SpiderIPPool, SpiderReservedIP, SpiderSubnet};

pub use error::{ignore_not_found, StoreError};
pub use kube_store::KubeStore;
pub use mock::MockStore;

/// Typed access to the cluster state the IPAM core reads and mutates.
///
/// All methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait Store: Send + Sync {
    // SpiderIPPool (cluster-scoped)
    async fn get_ippool(&self, name: &str) -> Result<SpiderIPPool, StoreError>;

    /// Lists pools whose labels contain every given pair. Used to map a
    /// SpiderSubnet to the pool minted for one application.
    async fn list_ippools(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<SpiderIPPool>, StoreError>;

    async fn update_ippool_status(
        &self,
        pool: &SpiderIPPool,
    ) -> Result<SpiderIPPool, StoreError>;

    // SpiderEndpoint (namespaced)
    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<SpiderEndpoint, StoreError>;
    async fn create_endpoint(&self, endpoint: &SpiderEndpoint) -> Result<SpiderEndpoint, StoreError>;
    async fn update_endpoint(&self, endpoint: &SpiderEndpoint) -> Result<SpiderEndpoint, StoreError>;
    async fn update_endpoint_status(
        &self,
        endpoint: &SpiderEndpoint,
    ) -> Result<SpiderEndpoint, StoreError>;
    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    // SpiderReservedIP / SpiderSubnet (read-only for the core)
    async fn list_reserved_ips(&self) -> Result<Vec<SpiderReservedIP>, StoreError>;
    async fn get_subnet(&self, name: &str) -> Result<SpiderSubnet, StoreError>;

    // Collaborator reads
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError>;
    async fn get_namespace(&self, name: &str) -> Result<Namespace, StoreError>;
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;
    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, StoreError>;
    async fn get_replicaset(&self, namespace: &str, name: &str)
        -> Result<ReplicaSet, StoreError>;

    /// Merges the given annotations into the Pod, keeping the others.
    async fn merge_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;
}
