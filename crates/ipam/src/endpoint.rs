//! Endpoint record management.
//!
//! The SpiderEndpoint is the durable "who holds which IP" record of one
//! Pod. It is created on the first allocation, patched as NICs complete,
//! cleared on release or rollback, and deleted once the finalizer is
//! stripped. For StatefulSet Pods the record deliberately outlives the Pod
//! so a recreated Pod of the same name can re-attach to its old addresses.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::ResourceExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crds::{
    PodIPAllocation, SpiderEndpoint, WorkloadEndpointStatus, KIND_POD, KIND_STATEFULSET,
    SPIDER_FINALIZER,
};
use store::{Store, StoreError};

use crate::error::IpamError;
use crate::pod::TopController;

#[derive(Debug, Clone)]
pub struct EndpointManagerConfig {
    pub max_conflict_retries: u32,
    pub conflict_retry_unit: Duration,
    pub max_history_records: usize,
}

impl Default for EndpointManagerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
            conflict_retry_unit: Duration::from_millis(300),
            max_history_records: 100,
        }
    }
}

/// Creates, mutates and garbage-collects SpiderEndpoints.
pub struct EndpointManager {
    store: Arc<dyn Store>,
    config: EndpointManagerConfig,
}

impl EndpointManager {
    pub fn new(store: Arc<dyn Store>, config: EndpointManagerConfig) -> Self {
        Self { store, config }
    }

    pub async fn get_endpoint_by_name(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<SpiderEndpoint, IpamError> {
        Ok(self.store.get_endpoint(namespace, pod_name).await?)
    }

    /// Creates the Endpoint for a Pod's first allocation and stamps the new
    /// container as `current`.
    ///
    /// The Pod becomes the owner except when it is controlled by a
    /// StatefulSet: that record must survive Pod recreation, so no owner
    /// reference is set and only the finalizer ties its lifecycle to the
    /// release path.
    pub async fn mark_ip_allocation(
        &self,
        container_id: &str,
        pod: &Pod,
        top_controller: &TopController,
    ) -> Result<SpiderEndpoint, IpamError> {
        let mut endpoint = SpiderEndpoint::default();
        endpoint.metadata.name = Some(pod.name_any());
        endpoint.metadata.namespace = pod.namespace();
        endpoint.metadata.finalizers = Some(vec![SPIDER_FINALIZER.to_string()]);

        if top_controller.kind != KIND_STATEFULSET {
            endpoint.metadata.owner_references = Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: KIND_POD.to_string(),
                name: pod.name_any(),
                uid: pod.metadata.uid.clone().unwrap_or_default(),
                ..Default::default()
            }]);
        }

        debug!(
            "Create a new Endpoint {}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        );
        let mut created = self.store.create_endpoint(&endpoint).await?;

        let allocation = PodIPAllocation {
            container_id: container_id.to_string(),
            node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            ips: Vec::new(),
            creation_time: Some(Time(chrono::Utc::now())),
        };
        created.status = Some(WorkloadEndpointStatus {
            current: Some(allocation.clone()),
            history: vec![allocation],
            owner_controller_type: Some(top_controller.kind.clone()),
            owner_controller_name: Some(top_controller.name.clone()),
        });

        Ok(self.store.update_endpoint_status(&created).await?)
    }

    /// Replaces `current` when a new container arrives for an existing
    /// Endpoint, e.g. after a StatefulSet restart.
    ///
    /// Refuses when the record is terminating on behalf of a different Pod
    /// instance: a Pod deleted and recreated under the same name before
    /// the old addresses were recycled.
    pub async fn re_mark_ip_allocation(
        &self,
        container_id: &str,
        pod: &Pod,
        endpoint: &mut SpiderEndpoint,
    ) -> Result<(), IpamError> {
        if endpoint.metadata.deletion_timestamp.is_some() {
            if let Some(owner) = endpoint
                .metadata
                .owner_references
                .as_ref()
                .and_then(|refs| refs.first())
            {
                if Some(&owner.uid) != pod.metadata.uid.as_ref() {
                    return Err(IpamError::DeleteCreateRace(format!(
                        "{}/{}",
                        endpoint.metadata.namespace.as_deref().unwrap_or_default(),
                        owner.name
                    )));
                }
            }
        }

        let status = endpoint.status.get_or_insert_with(Default::default);
        if let Some(current) = &status.current {
            if current.container_id == container_id {
                return Ok(());
            }
        }

        let allocation = PodIPAllocation {
            container_id: container_id.to_string(),
            node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            ips: Vec::new(),
            creation_time: Some(Time(chrono::Utc::now())),
        };
        status.current = Some(allocation.clone());
        status.history.insert(0, allocation);
        self.truncate_history(status);

        debug!(
            "Change the current container ID of the Endpoint {}/{}",
            endpoint.metadata.namespace.as_deref().unwrap_or_default(),
            endpoint.metadata.name.as_deref().unwrap_or_default(),
        );
        *endpoint = self.store.update_endpoint_status(endpoint).await?;
        Ok(())
    }

    /// Records the per-NIC details of the matching container on `current`
    /// and mirrors them onto the history head in the same status update.
    pub async fn patch_ip_allocation(
        &self,
        allocation: &PodIPAllocation,
        endpoint: &mut SpiderEndpoint,
    ) -> Result<(), IpamError> {
        let status = endpoint
            .status
            .as_mut()
            .ok_or_else(|| IpamError::InvariantViolation("patch an unmarked Endpoint".to_string()))?;
        let current_id = status
            .current
            .as_ref()
            .map(|c| c.container_id.clone())
            .ok_or_else(|| IpamError::InvariantViolation("patch an unmarked Endpoint".to_string()))?;

        if status
            .history
            .first()
            .map(|h| h.container_id != current_id)
            .unwrap_or(true)
        {
            return Err(IpamError::InvariantViolation(
                "data of the Endpoint is corrupt".to_string(),
            ));
        }
        if current_id != allocation.container_id {
            return Err(IpamError::InvariantViolation(
                "patch a mismarked Endpoint".to_string(),
            ));
        }

        let updated = {
            let current = status.current.as_mut().unwrap();
            current.ips = allocation.ips.clone();
            current.clone()
        };
        status.history[0] = updated;

        *endpoint = self.store.update_endpoint_status(endpoint).await?;
        Ok(())
    }

    /// Drops `current` if it belongs to the given container. Clearing an
    /// Endpoint that is already gone, empty, or re-owned by a newer
    /// container is a no-op.
    pub async fn clear_current_ip_allocation(
        &self,
        container_id: &str,
        endpoint: Option<&SpiderEndpoint>,
    ) -> Result<(), IpamError> {
        let Some(endpoint) = endpoint else {
            return Ok(());
        };
        let Some(current) = endpoint.status.as_ref().and_then(|s| s.current.as_ref()) else {
            return Ok(());
        };
        if current.container_id != container_id {
            return Ok(());
        }

        let mut cleared = endpoint.clone();
        if let Some(status) = cleared.status.as_mut() {
            status.current = None;
        }
        match self.store.update_endpoint_status(&cleared).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// StatefulSet re-attach: points the existing `current` at the new
    /// container and node without touching the recorded addresses.
    pub async fn reallocate_current_ip_allocation(
        &self,
        container_id: &str,
        node: &str,
        endpoint: &mut SpiderEndpoint,
    ) -> Result<(), IpamError> {
        let status = endpoint.status.get_or_insert_with(Default::default);
        let current = status.current.as_mut().ok_or_else(|| {
            IpamError::InvariantViolation(
                "must be allocated before re-allocation".to_string(),
            )
        })?;

        if current.container_id == container_id {
            return Ok(());
        }
        current.container_id = container_id.to_string();
        current.node = Some(node.to_string());

        let refreshed = current.clone();
        status.history.insert(0, refreshed);
        self.truncate_history(status);

        *endpoint = self.store.update_endpoint_status(endpoint).await?;
        Ok(())
    }

    /// Strips the sentinel finalizer under the usual conflict-retry budget,
    /// letting the record finally be deleted. Missing records are fine.
    pub async fn remove_finalizer(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        pod_name: &str,
    ) -> Result<(), IpamError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(IpamError::Canceled);
            }

            let mut endpoint = match self.store.get_endpoint(namespace, pod_name).await {
                Ok(endpoint) => endpoint,
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let finalizers = endpoint.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == SPIDER_FINALIZER) {
                return Ok(());
            }
            finalizers.retain(|f| f != SPIDER_FINALIZER);

            match self.store.update_endpoint(&endpoint).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    if attempt == self.config.max_conflict_retries {
                        return Err(IpamError::RetriesExhausted {
                            retries: self.config.max_conflict_retries,
                            detail: format!(
                                "failed to remove finalizer {} from Endpoint {}/{}",
                                SPIDER_FINALIZER, namespace, pod_name
                            ),
                        });
                    }
                    let ceiling = 1u64 << (attempt + 1).min(16);
                    let factor = rand::thread_rng().gen_range(0..ceiling);
                    tokio::time::sleep(self.config.conflict_retry_unit * factor as u32).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn delete_endpoint(&self, namespace: &str, pod_name: &str) -> Result<(), IpamError> {
        Ok(self.store.delete_endpoint(namespace, pod_name).await?)
    }

    fn truncate_history(&self, status: &mut WorkloadEndpointStatus) {
        if status.history.len() > self.config.max_history_records {
            warn!(
                "threshold of historical IP allocation records (<={}) exceeded",
                self.config.max_history_records
            );
            status.history.truncate(self.config.max_history_records);
        }
    }
}

/// Looks up the allocation recorded for `(container, nic)`, scanning
/// `current` first and then the history. The boolean tells whether the
/// match is the live lease; a historical hit on the release path means
/// concurrent lifecycles of the same Pod.
pub fn retrieve_ip_allocation(
    container_id: &str,
    nic: &str,
    endpoint: Option<&SpiderEndpoint>,
) -> Option<(PodIPAllocation, bool)> {
    let status = endpoint?.status.as_ref()?;

    if let Some(current) = &status.current {
        if current.container_id == container_id && current.ips.iter().any(|d| d.nic == nic) {
            return Some((current.clone(), true));
        }
    }

    status
        .history
        .iter()
        .find(|h| h.container_id == container_id && h.ips.iter().any(|d| d.nic == nic))
        .map(|h| (h.clone(), false))
}
