//! Candidate filtering and cross-pool verification.
//!
//! Filtering removes pools that cannot serve this Pod (terminating,
//! disabled, wrong family, exhausted, or failing an affinity selector) and
//! fails only when a whole `(nic, family)` group is left empty.
//! Verification then requires the surviving pools of one request to agree
//! on a VLAN.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::warn;

use store::Store;

use crate::error::{aggregate, IpamError};
use crate::ippool::IPPoolManager;
use crate::selector;
use crate::types::ToBeAllocated;

/// Excludes candidate pools a Pod may not draw from.
pub struct CandidateFilter {
    store: Arc<dyn Store>,
}

impl CandidateFilter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Walks every `(nic, family, pool)` triple and drops rejected pools.
    /// A `(nic, family)` group losing all its pools aborts the request.
    pub async fn filter_pool_candidates(
        &self,
        tt: &mut [ToBeAllocated],
        pod: &Pod,
    ) -> Result<(), IpamError> {
        for t in tt.iter_mut() {
            for candidate in t.pool_candidates.iter_mut() {
                let mut errs = Vec::new();
                let mut selected = Vec::new();
                for pool in &candidate.pools {
                    match self.select_by_pod(candidate.ip_version, pool, pod).await {
                        Ok(()) => selected.push(pool.clone()),
                        Err(e) => {
                            warn!(
                                "IPPool {} is filtered for Pod {}/{}: {}",
                                pool,
                                pod.namespace().unwrap_or_default(),
                                pod.name_any(),
                                e
                            );
                            errs.push(e);
                        }
                    }
                }

                if selected.is_empty() {
                    return Err(IpamError::NoAvailablePool(format!(
                        "all IPv{} IPPools {:?} of {} filtered out: {}",
                        candidate.ip_version,
                        candidate.pools,
                        t.nic,
                        aggregate(&errs)
                    )));
                }
                candidate.pools = selected;
            }
        }
        Ok(())
    }

    /// One pool's eligibility for one Pod; the error is the rejection
    /// reason.
    async fn select_by_pod(
        &self,
        ip_version: i64,
        pool_name: &str,
        pod: &Pod,
    ) -> Result<(), IpamError> {
        let pool = self.store.get_ippool(pool_name).await?;

        if pool.metadata.deletion_timestamp.is_some() {
            return Err(IpamError::WrongInput(format!(
                "terminating IPPool {}",
                pool_name
            )));
        }

        if pool.spec.disable.unwrap_or(false) {
            return Err(IpamError::WrongInput(format!(
                "disabled IPPool {}",
                pool_name
            )));
        }

        if pool.spec.ip_version != ip_version {
            return Err(IpamError::WrongInput(format!(
                "expected an IPv{} IPPool, but the version of IPPool {} is IPv{}",
                ip_version, pool_name, pool.spec.ip_version
            )));
        }

        if let Some(status) = &pool.status {
            if let (Some(total), Some(allocated)) =
                (status.total_ip_count, status.allocated_ip_count)
            {
                if total - allocated == 0 {
                    return Err(IpamError::IpUsedOut(pool_name.to_string()));
                }
            }
        }

        if let Some(node_affinity) = &pool.spec.node_affinity {
            let node_name = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default();
            let node = self.store.get_node(&node_name).await?;
            let labels = node.metadata.labels.unwrap_or_default();
            if !selector::matches(node_affinity, &labels) {
                return Err(IpamError::WrongInput(format!(
                    "unmatched Node affinity of IPPool {}",
                    pool_name
                )));
            }
        }

        if let Some(ns_affinity) = &pool.spec.namespace_affinity {
            let namespace = self
                .store
                .get_namespace(&pod.namespace().unwrap_or_default())
                .await?;
            let labels = namespace.metadata.labels.unwrap_or_default();
            if !selector::matches(ns_affinity, &labels) {
                return Err(IpamError::WrongInput(format!(
                    "unmatched Namespace affinity of IPPool {}",
                    pool_name
                )));
            }
        }

        if let Some(pod_affinity) = &pool.spec.pod_affinity {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            if !selector::matches(pod_affinity, &labels) {
                return Err(IpamError::WrongInput(format!(
                    "unmatched Pod affinity of IPPool {}",
                    pool_name
                )));
            }
        }

        Ok(())
    }
}

/// All pools selected for one request must carry the same VLAN.
pub async fn verify_pool_candidates(
    pool_manager: &IPPoolManager,
    tt: &[ToBeAllocated],
) -> Result<(), IpamError> {
    for t in tt {
        let all_pools: Vec<String> = t
            .pool_candidates
            .iter()
            .flat_map(|c| c.pools.iter().cloned())
            .collect();
        let (vlan_to_pools, same) = pool_manager.check_vlan_same(&all_pools).await?;
        if !same {
            return Err(IpamError::WrongInput(format!(
                "VLANs of the IPPools are not the same: {:?}",
                vlan_to_pools
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{IPPoolSpec, IPPoolStatus, SpiderIPPool, IPV4};
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;
    use store::MockStore;

    use crate::types::PoolCandidate;

    fn v4_pool(name: &str) -> SpiderIPPool {
        let mut pool = SpiderIPPool::default();
        pool.metadata.name = Some(name.to_string());
        pool.spec = IPPoolSpec {
            ip_version: 4,
            subnet: "10.0.0.0/24".to_string(),
            ips: vec!["10.0.0.2-10.0.0.10".to_string()],
            ..Default::default()
        };
        pool
    }

    fn scheduled_pod(node: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("ns1".to_string());
        pod.metadata.name = Some("app-0".to_string());
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        });
        pod
    }

    fn plan(pools: &[&str]) -> Vec<ToBeAllocated> {
        vec![ToBeAllocated {
            nic: "eth0".to_string(),
            clean_gateway: false,
            pool_candidates: vec![PoolCandidate {
                ip_version: IPV4,
                pools: pools.iter().map(|s| s.to_string()).collect(),
            }],
        }]
    }

    #[tokio::test]
    async fn test_node_affinity_filters_unmatched_pool() {
        let store = MockStore::new();
        let mut pa = v4_pool("pa");
        pa.spec.node_affinity = Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "zone".to_string(),
                "east".to_string(),
            )])),
            ..Default::default()
        });
        store.add_ippool(pa);
        store.add_ippool(v4_pool("pb"));

        let mut node = Node::default();
        node.metadata.name = Some("node-west".to_string());
        node.metadata.labels = Some(BTreeMap::from([(
            "zone".to_string(),
            "west".to_string(),
        )]));
        store.add_node(node);

        let filter = CandidateFilter::new(Arc::new(store.clone()));
        let mut tt = plan(&["pa", "pb"]);
        filter
            .filter_pool_candidates(&mut tt, &scheduled_pod("node-west"))
            .await
            .unwrap();
        assert_eq!(tt[0].pool_candidates[0].pools, vec!["pb"]);
    }

    #[tokio::test]
    async fn test_disabled_and_terminating_pools_are_filtered() {
        let store = MockStore::new();
        let mut disabled = v4_pool("disabled");
        disabled.spec.disable = Some(true);
        store.add_ippool(disabled);
        let mut terminating = v4_pool("terminating");
        terminating.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        store.add_ippool(terminating);
        store.add_ippool(v4_pool("ok"));

        let filter = CandidateFilter::new(Arc::new(store.clone()));
        let mut tt = plan(&["disabled", "terminating", "ok"]);
        filter
            .filter_pool_candidates(&mut tt, &scheduled_pod("node1"))
            .await
            .unwrap();
        assert_eq!(tt[0].pool_candidates[0].pools, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_filtered() {
        let store = MockStore::new();
        let mut exhausted = v4_pool("exhausted");
        exhausted.status = Some(IPPoolStatus {
            total_ip_count: Some(2),
            allocated_ip_count: Some(2),
            ..Default::default()
        });
        store.add_ippool(exhausted);

        let filter = CandidateFilter::new(Arc::new(store.clone()));
        let mut tt = plan(&["exhausted"]);
        let err = filter
            .filter_pool_candidates(&mut tt, &scheduled_pod("node1"))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::NoAvailablePool(_)));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_filtered() {
        let store = MockStore::new();
        let mut v6 = v4_pool("v6");
        v6.spec.ip_version = 6;
        v6.spec.subnet = "fd00::/64".to_string();
        v6.spec.ips = vec!["fd00::2-fd00::5".to_string()];
        store.add_ippool(v6);

        let filter = CandidateFilter::new(Arc::new(store.clone()));
        let mut tt = plan(&["v6"]);
        let err = filter
            .filter_pool_candidates(&mut tt, &scheduled_pod("node1"))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::NoAvailablePool(_)));
    }

    #[tokio::test]
    async fn test_vlan_mismatch_fails_verification() {
        let store = MockStore::new();
        let mut a = v4_pool("a");
        a.spec.vlan = Some(100);
        store.add_ippool(a);
        let mut b = v4_pool("b");
        b.spec.vlan = Some(200);
        store.add_ippool(b);

        let manager = IPPoolManager::new(
            Arc::new(store.clone()),
            3,
            std::time::Duration::from_millis(1),
        );
        let err = verify_pool_candidates(&manager, &plan(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::WrongInput(_)));
    }
}
