//! Per-pool IP allocation.
//!
//! All pool mutations go through the Store's optimistic concurrency: read
//! the pool, mutate the status, write it back, and on conflict re-read and
//! retry under a bounded jittered backoff. No locks are held across Store
//! calls.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use kube::ResourceExt;
use k8s_openapi::api::core::v1::Pod;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crds::{IPAllocationDetail, PoolIPAllocation, SpiderIPPool};
use store::Store;

use crate::error::IpamError;
use crate::iprange::{assignable_count, expand_ranges};
use crate::types::{bare_ip, IPAndID, IPConfig};

/// Conflict-safe reservation and release of addresses within pools.
pub struct IPPoolManager {
    store: Arc<dyn Store>,
    max_conflict_retries: u32,
    conflict_retry_unit: Duration,
}

impl IPPoolManager {
    pub fn new(
        store: Arc<dyn Store>,
        max_conflict_retries: u32,
        conflict_retry_unit: Duration,
    ) -> Self {
        Self {
            store,
            max_conflict_retries,
            conflict_retry_unit,
        }
    }

    /// Sleeps `rand(0..2^(attempt+1))` units, or returns `Canceled` if the
    /// token fires first.
    async fn backoff(
        &self,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<(), IpamError> {
        let ceiling = 1u64 << (attempt + 1).min(16);
        let factor = rand::thread_rng().gen_range(0..ceiling);
        let delay = self.conflict_retry_unit * factor as u32;
        tokio::select! {
            _ = cancel.cancelled() => Err(IpamError::Canceled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Union of all reserved ranges of the given family.
    async fn reserved_ips(&self, ip_version: i64) -> Result<Vec<IpAddr>, IpamError> {
        let mut reserved = Vec::new();
        for item in self.store.list_reserved_ips().await? {
            if item.spec.ip_version == ip_version {
                reserved.extend(expand_ranges(ip_version, &item.spec.ips)?);
            }
        }
        Ok(reserved)
    }

    /// Reserves one free address of the pool for `(container, nic)`.
    ///
    /// The free set is everything in `spec.ips` minus exclusions, cluster
    /// reservations and live allocations; the lowest address wins. Returns
    /// the address as `ip/prefix` together with the pool snapshot the
    /// caller derives routes from.
    pub async fn allocate_ip(
        &self,
        cancel: &CancellationToken,
        pool_name: &str,
        container_id: &str,
        nic: &str,
        pod: &Pod,
    ) -> Result<(IPConfig, SpiderIPPool), IpamError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(IpamError::Canceled);
            }

            let mut pool = self.store.get_ippool(pool_name).await?;
            let version = pool.spec.ip_version;

            let mut free = expand_ranges(version, &pool.spec.ips)?;
            for excluded in expand_ranges(version, &pool.spec.exclude_ips)? {
                free.remove(&excluded);
            }
            for reserved in self.reserved_ips(version).await? {
                free.remove(&reserved);
            }

            let status = pool.status.get_or_insert_with(Default::default);
            if let Some(allocated) = &status.allocated_ips {
                for key in allocated.keys() {
                    if let Ok(ip) = IpAddr::from_str(key) {
                        free.remove(&ip);
                    }
                }
            }

            let ip = match free.into_iter().next() {
                Some(ip) => ip,
                None => return Err(IpamError::PoolExhausted(pool_name.to_string())),
            };

            let allocated = status.allocated_ips.get_or_insert_with(BTreeMap::new);
            allocated.insert(
                ip.to_string(),
                PoolIPAllocation {
                    container_id: container_id.to_string(),
                    nic: nic.to_string(),
                    node: pod
                        .spec
                        .as_ref()
                        .and_then(|s| s.node_name.clone())
                        .unwrap_or_default(),
                    pod: format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any()),
                },
            );
            status.allocated_ip_count = Some(allocated.len() as i64);
            if status.total_ip_count.is_none() {
                status.total_ip_count =
                    Some(assignable_count(version, &pool.spec.ips, &pool.spec.exclude_ips)?);
            }

            match self.store.update_ippool_status(&pool).await {
                Ok(updated) => {
                    let prefix = subnet_prefix(&pool.spec.subnet)?;
                    let config = IPConfig {
                        address: format!("{}/{}", ip, prefix),
                        gateway: pool.spec.gateway.clone(),
                        nic: nic.to_string(),
                        version,
                        ip_pool: pool_name.to_string(),
                        vlan: pool.spec.vlan,
                    };
                    return Ok((config, updated));
                }
                Err(e) if e.is_conflict() => {
                    if attempt == self.max_conflict_retries {
                        return Err(IpamError::RetriesExhausted {
                            retries: self.max_conflict_retries,
                            detail: format!(
                                "failed to allocate IP from IPPool {}",
                                pool_name
                            ),
                        });
                    }
                    debug!(
                        "Conflict writing IPPool {}, retry {}",
                        pool_name,
                        attempt + 1
                    );
                    self.backoff(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Deletes allocation entries owned by the given containers. An entry
    /// whose recorded container differs is left alone, so a stale release
    /// from a prior container cannot evict the current lease. Missing
    /// entries count as released.
    pub async fn release_ips(
        &self,
        cancel: &CancellationToken,
        pool_name: &str,
        ip_and_ids: &[IPAndID],
    ) -> Result<(), IpamError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(IpamError::Canceled);
            }

            let mut pool = self.store.get_ippool(pool_name).await?;
            let status = pool.status.get_or_insert_with(Default::default);
            let allocated = match &mut status.allocated_ips {
                Some(allocated) => allocated,
                None => return Ok(()),
            };

            let mut changed = false;
            for entry in ip_and_ids {
                if let Some(existing) = allocated.get(&entry.ip) {
                    if existing.container_id == entry.container_id {
                        allocated.remove(&entry.ip);
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(());
            }
            status.allocated_ip_count = Some(allocated.len() as i64);

            match self.store.update_ippool_status(&pool).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    if attempt == self.max_conflict_retries {
                        return Err(IpamError::RetriesExhausted {
                            retries: self.max_conflict_retries,
                            detail: format!(
                                "failed to release IPs {:?} from IPPool {}",
                                ip_and_ids, pool_name
                            ),
                        });
                    }
                    self.backoff(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Rewrites the recorded claimant of a Pod's previous allocation to a
    /// new container, preserving the addresses. Used on StatefulSet
    /// re-attach.
    pub async fn update_allocated_ips(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        pod: &Pod,
        detail: &IPAllocationDetail,
    ) -> Result<(), IpamError> {
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();

        if let (Some(pool), Some(address)) = (&detail.ipv4_pool, &detail.ipv4) {
            self.reassign_entry(cancel, pool, bare_ip(address), container_id, &node)
                .await?;
        }
        if let (Some(pool), Some(address)) = (&detail.ipv6_pool, &detail.ipv6) {
            self.reassign_entry(cancel, pool, bare_ip(address), container_id, &node)
                .await?;
        }
        Ok(())
    }

    async fn reassign_entry(
        &self,
        cancel: &CancellationToken,
        pool_name: &str,
        ip: &str,
        container_id: &str,
        node: &str,
    ) -> Result<(), IpamError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(IpamError::Canceled);
            }

            let mut pool = self.store.get_ippool(pool_name).await?;
            let status = pool.status.get_or_insert_with(Default::default);
            let entry = status
                .allocated_ips
                .as_mut()
                .and_then(|allocated| allocated.get_mut(ip))
                .ok_or_else(|| {
                    IpamError::InvariantViolation(format!(
                        "previous allocation of IP {} is lost in IPPool {}",
                        ip, pool_name
                    ))
                })?;

            if entry.container_id == container_id {
                return Ok(());
            }
            entry.container_id = container_id.to_string();
            entry.node = node.to_string();

            match self.store.update_ippool_status(&pool).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    if attempt == self.max_conflict_retries {
                        return Err(IpamError::RetriesExhausted {
                            retries: self.max_conflict_retries,
                            detail: format!(
                                "failed to reassign IP {} of IPPool {}",
                                ip, pool_name
                            ),
                        });
                    }
                    self.backoff(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Collects the VLAN of every named pool. The second return is false
    /// when they disagree.
    pub async fn check_vlan_same(
        &self,
        pools: &[String],
    ) -> Result<(BTreeMap<i64, Vec<String>>, bool), IpamError> {
        let mut vlan_to_pools: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for name in pools {
            let pool = self.store.get_ippool(name).await?;
            vlan_to_pools
                .entry(pool.spec.vlan.unwrap_or(0))
                .or_default()
                .push(name.clone());
        }
        let same = vlan_to_pools.len() <= 1;
        Ok((vlan_to_pools, same))
    }
}

fn subnet_prefix(subnet: &str) -> Result<u8, IpamError> {
    let network = IpNetwork::from_str(subnet)
        .map_err(|_| IpamError::WrongInput(format!("invalid subnet {}", subnet)))?;
    Ok(network.prefix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::IPPoolSpec;
    use store::MockStore;

    fn manager(store: &MockStore) -> IPPoolManager {
        IPPoolManager::new(
            Arc::new(store.clone()),
            3,
            Duration::from_millis(1),
        )
    }

    fn v4_pool(name: &str, ips: &[&str], exclude: &[&str]) -> SpiderIPPool {
        let mut pool = SpiderIPPool::default();
        pool.metadata.name = Some(name.to_string());
        pool.spec = IPPoolSpec {
            ip_version: 4,
            subnet: "10.0.0.0/24".to_string(),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            exclude_ips: exclude.iter().map(|s| s.to_string()).collect(),
            gateway: Some("10.0.0.1".to_string()),
            vlan: Some(0),
            ..Default::default()
        };
        pool
    }

    fn test_pod(namespace: &str, name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.name = Some(name.to_string());
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some("node1".to_string()),
            ..Default::default()
        });
        pod
    }

    #[tokio::test]
    async fn test_allocates_lowest_free_ip() {
        let store = MockStore::new();
        store.add_ippool(v4_pool("p1", &["10.0.0.2-10.0.0.5"], &[]));
        let cancel = CancellationToken::new();

        let (config, _) = manager(&store)
            .allocate_ip(&cancel, "p1", "c1", "eth0", &test_pod("ns1", "app-0"))
            .await
            .unwrap();

        assert_eq!(config.address, "10.0.0.2/24");
        assert_eq!(config.gateway.as_deref(), Some("10.0.0.1"));

        let pool = store.ippool("p1").unwrap();
        let status = pool.status.unwrap();
        let allocated = status.allocated_ips.unwrap();
        assert_eq!(allocated["10.0.0.2"].container_id, "c1");
        assert_eq!(allocated["10.0.0.2"].pod, "ns1/app-0");
        assert_eq!(status.allocated_ip_count, Some(1));
        assert_eq!(status.total_ip_count, Some(4));
    }

    #[tokio::test]
    async fn test_exclusions_and_reservations_are_skipped() {
        let store = MockStore::new();
        store.add_ippool(v4_pool("p1", &["10.0.0.2-10.0.0.5"], &["10.0.0.2"]));
        let mut reserved = crds::SpiderReservedIP::default();
        reserved.metadata.name = Some("r1".to_string());
        reserved.spec = crds::ReservedIPSpec {
            ip_version: 4,
            ips: vec!["10.0.0.3".to_string()],
        };
        store.add_reserved_ip(reserved);
        let cancel = CancellationToken::new();

        let (config, _) = manager(&store)
            .allocate_ip(&cancel, "p1", "c1", "eth0", &test_pod("ns1", "app-0"))
            .await
            .unwrap();
        assert_eq!(config.address, "10.0.0.4/24");
    }

    #[tokio::test]
    async fn test_empty_free_set_is_exhausted() {
        let store = MockStore::new();
        store.add_ippool(v4_pool("p1", &["10.0.0.2"], &["10.0.0.2"]));
        let cancel = CancellationToken::new();

        let err = manager(&store)
            .allocate_ip(&cancel, "p1", "c1", "eth0", &test_pod("ns1", "app-0"))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = MockStore::new();
        store.add_ippool(v4_pool("p1", &["10.0.0.2-10.0.0.5"], &[]));
        store.inject_pool_status_conflicts("p1", 2);
        let cancel = CancellationToken::new();

        manager(&store)
            .allocate_ip(&cancel, "p1", "c1", "eth0", &test_pod("ns1", "app-0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retries_exhaust() {
        let store = MockStore::new();
        store.add_ippool(v4_pool("p1", &["10.0.0.2-10.0.0.5"], &[]));
        store.inject_pool_status_conflicts("p1", 10);
        let cancel = CancellationToken::new();

        let err = manager(&store)
            .allocate_ip(&cancel, "p1", "c1", "eth0", &test_pod("ns1", "app-0"))
            .await
            .unwrap_err();
        assert!(matches!(err, IpamError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_guards_container_id() {
        let store = MockStore::new();
        store.add_ippool(v4_pool("p1", &["10.0.0.2-10.0.0.5"], &[]));
        let cancel = CancellationToken::new();
        let mgr = manager(&store);

        mgr.allocate_ip(&cancel, "p1", "c1", "eth0", &test_pod("ns1", "app-0"))
            .await
            .unwrap();

        // Release with the wrong container leaves the lease alone.
        let stale = vec![IPAndID {
            ip: "10.0.0.2".to_string(),
            container_id: "c0".to_string(),
        }];
        mgr.release_ips(&cancel, "p1", &stale).await.unwrap();
        assert!(store
            .ippool("p1")
            .unwrap()
            .status
            .unwrap()
            .allocated_ips
            .unwrap()
            .contains_key("10.0.0.2"));

        let owned = vec![IPAndID {
            ip: "10.0.0.2".to_string(),
            container_id: "c1".to_string(),
        }];
        mgr.release_ips(&cancel, "p1", &owned).await.unwrap();
        // A second release of the same tuple is a no-op.
        mgr.release_ips(&cancel, "p1", &owned).await.unwrap();

        let status = store.ippool("p1").unwrap().status.unwrap();
        assert!(status.allocated_ips.unwrap().is_empty());
        assert_eq!(status.allocated_ip_count, Some(0));
    }

    #[tokio::test]
    async fn test_reassign_preserves_ip() {
        let store = MockStore::new();
        store.add_ippool(v4_pool("p1", &["10.0.0.7"], &[]));
        let cancel = CancellationToken::new();
        let mgr = manager(&store);

        mgr.allocate_ip(&cancel, "p1", "c1", "eth0", &test_pod("ns1", "db-0"))
            .await
            .unwrap();

        let detail = IPAllocationDetail {
            nic: "eth0".to_string(),
            ipv4: Some("10.0.0.7/24".to_string()),
            ipv4_pool: Some("p1".to_string()),
            ..Default::default()
        };
        mgr.update_allocated_ips(&cancel, "c2", &test_pod("ns1", "db-0"), &detail)
            .await
            .unwrap();

        let allocated = store
            .ippool("p1")
            .unwrap()
            .status
            .unwrap()
            .allocated_ips
            .unwrap();
        assert_eq!(allocated["10.0.0.7"].container_id, "c2");
    }

    #[tokio::test]
    async fn test_vlan_check() {
        let store = MockStore::new();
        let mut a = v4_pool("a", &["10.0.0.2"], &[]);
        a.spec.vlan = Some(100);
        let mut b = v4_pool("b", &["10.0.0.3"], &[]);
        b.spec.vlan = Some(100);
        let mut c = v4_pool("c", &["10.0.0.4"], &[]);
        c.spec.vlan = Some(200);
        store.add_ippool(a);
        store.add_ippool(b);
        store.add_ippool(c);
        let mgr = manager(&store);

        let (_, same) = mgr
            .check_vlan_same(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(same);

        let (vlans, same) = mgr
            .check_vlan_same(&["a".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert!(!same);
        assert_eq!(vlans.len(), 2);
    }
}
