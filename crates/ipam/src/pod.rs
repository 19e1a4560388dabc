//! Pod inspection helpers: allocatability, owner resolution, StatefulSet
//! scale checks.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crds::{KIND_POD, KIND_REPLICASET, KIND_STATEFULSET, OWNER_NONE};
use store::{Store, StoreError};

use crate::error::IpamError;

/// The workload at the top of a Pod's owner chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopController {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Phases in which a Pod may still receive an allocation. A terminating
/// Pod never does, whatever its phase claims.
pub fn check_pod_allocatable(pod: &Pod) -> (String, bool) {
    if pod.metadata.deletion_timestamp.is_some() {
        return ("Terminating".to_string(), false);
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let allocatable = matches!(phase.as_str(), "Pending" | "Running");
    (phase, allocatable)
}

/// Kind and name of the Pod's direct controller, or `None`/the Pod itself
/// when it has no controller reference.
pub fn owner_controller(pod: &Pod) -> (String, String) {
    match pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
    {
        Some(owner) => (owner.kind.clone(), owner.name.clone()),
        None => (OWNER_NONE.to_string(), String::new()),
    }
}

/// Resolves the top of the Pod's owner chain, walking one ReplicaSet hop
/// up to its Deployment. Pods without a controller resolve to themselves
/// with kind `Pod`.
pub async fn top_controller(
    store: &Arc<dyn Store>,
    pod: &Pod,
) -> Result<TopController, IpamError> {
    let namespace = pod.namespace().unwrap_or_default();

    let owner = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)));
    let owner = match owner {
        Some(owner) => owner,
        None => {
            return Ok(TopController {
                kind: KIND_POD.to_string(),
                namespace,
                name: pod.name_any(),
                uid: pod.metadata.uid.clone().unwrap_or_default(),
            })
        }
    };

    if owner.kind == KIND_REPLICASET {
        let replicaset = store.get_replicaset(&namespace, &owner.name).await?;
        if let Some(rs_owner) = replicaset
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
        {
            return Ok(TopController {
                kind: rs_owner.kind.clone(),
                namespace,
                name: rs_owner.name.clone(),
                uid: rs_owner.uid.clone(),
            });
        }
    }

    Ok(TopController {
        kind: owner.kind.clone(),
        namespace,
        name: owner.name.clone(),
        uid: owner.uid.clone(),
    })
}

/// Whether a StatefulSet Pod is still within its controller's scale, i.e.
/// its ordinal is below the desired replica count. Such a Pod is being
/// restarted in place and must keep its lease.
pub async fn is_valid_statefulset_pod(
    store: &Arc<dyn Store>,
    namespace: &str,
    pod_name: &str,
) -> Result<bool, IpamError> {
    let (sts_name, ordinal) = match split_ordinal(pod_name) {
        Some(parts) => parts,
        None => return Ok(false),
    };

    let statefulset = match store.get_statefulset(namespace, sts_name).await {
        Ok(sts) => sts,
        Err(StoreError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let replicas = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    Ok(ordinal < replicas as i64)
}

/// Splits `db-0` into `("db", 0)`.
fn split_ordinal(pod_name: &str) -> Option<(&str, i64)> {
    let (name, ordinal) = pod_name.rsplit_once('-')?;
    let ordinal = ordinal.parse::<i64>().ok()?;
    Some((name, ordinal))
}

/// Guard used on the allocate path: owner must be a StatefulSet and the
/// feature enabled.
pub fn owned_by_statefulset(owner_kind: &str) -> bool {
    owner_kind == KIND_STATEFULSET
}
