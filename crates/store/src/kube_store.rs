//! Store implementation over a live Kubernetes API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde_json::json;

use crds::{SpiderEndpoint, SpiderIPPool, SpiderReservedIP, SpiderSubnet};

use crate::error::StoreError;
use crate::Store;

/// [`Store`] backed by typed `kube::Api` handles.
///
/// The client is threaded through the constructor; there are no
/// process-global handles.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ippools(&self) -> Api<SpiderIPPool> {
        Api::all(self.client.clone())
    }

    fn endpoints(&self, namespace: &str) -> Api<SpiderEndpoint> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_err(object: &str, err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(response) if response.code == 409 => {
            StoreError::Conflict(object.to_string())
        }
        kube::Error::Api(response) if response.code == 404 => {
            StoreError::NotFound(object.to_string())
        }
        _ => StoreError::Kube(err),
    }
}

fn object_name<K: Resource>(resource: &K) -> String {
    match (resource.meta().namespace.as_deref(), resource.meta().name.as_deref()) {
        (Some(ns), Some(name)) => format!("{}/{}", ns, name),
        (None, Some(name)) => name.to_string(),
        _ => "<unnamed>".to_string(),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_ippool(&self, name: &str) -> Result<SpiderIPPool, StoreError> {
        self.ippools()
            .get(name)
            .await
            .map_err(|e| map_err(&format!("SpiderIPPool {}", name), e))
    }

    async fn list_ippools(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<SpiderIPPool>, StoreError> {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let lp = ListParams::default().labels(&selector);
        let list = self
            .ippools()
            .list(&lp)
            .await
            .map_err(|e| map_err("SpiderIPPool list", e))?;
        Ok(list.items)
    }

    async fn update_ippool_status(
        &self,
        pool: &SpiderIPPool,
    ) -> Result<SpiderIPPool, StoreError> {
        let name = pool
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::NotFound("SpiderIPPool <unnamed>".to_string()))?;
        self.ippools()
            .replace_status(name, &PostParams::default(), serde_json::to_vec(pool)?)
            .await
            .map_err(|e| map_err(&format!("SpiderIPPool {}", name), e))
    }

    async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SpiderEndpoint, StoreError> {
        self.endpoints(namespace)
            .get(name)
            .await
            .map_err(|e| map_err(&format!("SpiderEndpoint {}/{}", namespace, name), e))
    }

    async fn create_endpoint(
        &self,
        endpoint: &SpiderEndpoint,
    ) -> Result<SpiderEndpoint, StoreError> {
        let namespace = endpoint.metadata.namespace.as_deref().unwrap_or_default();
        self.endpoints(namespace)
            .create(&PostParams::default(), endpoint)
            .await
            .map_err(|e| map_err(&format!("SpiderEndpoint {}", object_name(endpoint)), e))
    }

    async fn update_endpoint(
        &self,
        endpoint: &SpiderEndpoint,
    ) -> Result<SpiderEndpoint, StoreError> {
        let namespace = endpoint.metadata.namespace.as_deref().unwrap_or_default();
        let name = endpoint
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::NotFound("SpiderEndpoint <unnamed>".to_string()))?;
        self.endpoints(namespace)
            .replace(name, &PostParams::default(), endpoint)
            .await
            .map_err(|e| map_err(&format!("SpiderEndpoint {}/{}", namespace, name), e))
    }

    async fn update_endpoint_status(
        &self,
        endpoint: &SpiderEndpoint,
    ) -> Result<SpiderEndpoint, StoreError> {
        let namespace = endpoint.metadata.namespace.as_deref().unwrap_or_default();
        let name = endpoint
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::NotFound("SpiderEndpoint <unnamed>".to_string()))?;
        self.endpoints(namespace)
            .replace_status(name, &PostParams::default(), serde_json::to_vec(endpoint)?)
            .await
            .map_err(|e| map_err(&format!("SpiderEndpoint {}/{}", namespace, name), e))
    }

    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .endpoints(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let mapped = map_err(&format!("SpiderEndpoint {}/{}", namespace, name), e);
                if mapped.is_not_found() {
                    Ok(())
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn list_reserved_ips(&self) -> Result<Vec<SpiderReservedIP>, StoreError> {
        let api: Api<SpiderReservedIP> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_err("SpiderReservedIP list", e))?;
        Ok(list.items)
    }

    async fn get_subnet(&self, name: &str) -> Result<SpiderSubnet, StoreError> {
        let api: Api<SpiderSubnet> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| map_err(&format!("SpiderSubnet {}", name), e))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| map_err(&format!("Pod {}/{}", namespace, name), e))
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, StoreError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| map_err(&format!("Namespace {}", name), e))
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| map_err(&format!("Node {}", name), e))
    }

    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, StoreError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_err(&format!("StatefulSet {}/{}", namespace, name), e))
    }

    async fn get_replicaset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, StoreError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_err(&format!("ReplicaSet {}/{}", namespace, name), e))
    }

    async fn merge_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let patch = json!({
            "metadata": {
                "annotations": annotations,
            }
        });
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(&format!("Pod {}/{}", namespace, name), e))?;
        Ok(())
    }
}
