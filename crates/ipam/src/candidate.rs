//! Candidate pool selection.
//!
//! Resolves the ordered list of pools to try for one request from layered
//! configuration, first match wins:
//!
//! 1. SpiderSubnet Pod annotations (pools minted per application)
//! 2. `ipam.spidernet.io/ippools` Pod annotation (per-NIC list)
//! 3. `ipam.spidernet.io/ippool` Pod annotation
//! 4. Namespace default-pool annotations
//! 5. CNI network configuration defaults from the request
//! 6. Cluster default pools

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crds::{
    app_label_value, AnnoIPPoolItem, AnnoPodIPPoolValue, AnnoSubnetItem, AnnoSubnetValue,
    ANNO_NS_DEFAULT_V4_POOL, ANNO_NS_DEFAULT_V6_POOL, ANNO_POD_IPPOOL, ANNO_POD_IPPOOLS,
    ANNO_POD_SUBNET, ANNO_POD_SUBNETS, KIND_POD, LABEL_IPPOOL_OWNER_APPLICATION,
    LABEL_IPPOOL_OWNER_APPLICATION_UID, LABEL_IPPOOL_OWNER_SUBNET, LABEL_IPPOOL_VERSION,
    LABEL_IPPOOL_VERSION_V4, LABEL_IPPOOL_VERSION_V6, IPV4, IPV6, OWNER_NONE,
};
use store::Store;

use crate::config::IpamConfig;
use crate::error::IpamError;
use crate::pod::top_controller;
use crate::types::{PoolCandidate, ToBeAllocated};

/// Resolves pool candidates for one `(pod, nic)` from the layered sources.
pub struct CandidateSelector {
    store: Arc<dyn Store>,
    config: IpamConfig,
}

impl CandidateSelector {
    pub fn new(store: Arc<dyn Store>, config: IpamConfig) -> Self {
        Self { store, config }
    }

    pub async fn get_pool_candidates(
        &self,
        cancel: &CancellationToken,
        nic: &str,
        default_v4_pools: &[String],
        default_v6_pools: &[String],
        clean_gateway: bool,
        pod: &Pod,
    ) -> Result<Vec<ToBeAllocated>, IpamError> {
        if self.config.enable_spider_subnet {
            if let Some(t) = self
                .get_pool_from_subnet(cancel, pod, nic, clean_gateway)
                .await?
            {
                return Ok(vec![t]);
            }
        }

        let annotations = pod.annotations();

        if let Some(anno) = annotations.get(ANNO_POD_IPPOOLS) {
            return get_pool_from_pod_anno_pools(anno, nic);
        }

        if let Some(anno) = annotations.get(ANNO_POD_IPPOOL) {
            return Ok(vec![get_pool_from_pod_anno_pool(anno, nic, clean_gateway)?]);
        }

        if let Some(t) = self
            .get_pool_from_ns(&pod.namespace().unwrap_or_default(), nic, clean_gateway)
            .await?
        {
            return Ok(vec![t]);
        }

        if let Some(t) =
            get_pool_from_netconf(nic, default_v4_pools, default_v6_pools, clean_gateway)
        {
            return Ok(vec![t]);
        }

        Ok(vec![self.get_cluster_default_pool(nic, clean_gateway)?])
    }

    /// Resolves pools minted from SpiderSubnets named on the Pod. The
    /// subnet controller creates those pools asynchronously, so an absent
    /// pool is polled for a bounded time before giving up.
    async fn get_pool_from_subnet(
        &self,
        cancel: &CancellationToken,
        pod: &Pod,
        nic: &str,
        clean_gateway: bool,
    ) -> Result<Option<ToBeAllocated>, IpamError> {
        let Some(subnets) = subnet_anno_config(pod, nic)? else {
            return Ok(None);
        };

        if self.config.enable_ipv4 && subnets.ipv4.is_empty() {
            return Err(IpamError::NoAvailablePool(
                "no IPv4 SpiderSubnet specified".to_string(),
            ));
        }
        if self.config.enable_ipv6 && subnets.ipv6.is_empty() {
            return Err(IpamError::NoAvailablePool(
                "no IPv6 SpiderSubnet specified".to_string(),
            ));
        }

        let controller = top_controller(&self.store, pod).await?;
        if controller.kind == KIND_POD || controller.kind == OWNER_NONE {
            return Err(IpamError::WrongInput(format!(
                "SpiderSubnet does not support the owner controller of Pod {}/{}",
                pod.namespace().unwrap_or_default(),
                pod.name_any()
            )));
        }

        let mut t = ToBeAllocated {
            nic: nic.to_string(),
            clean_gateway,
            pool_candidates: Vec::new(),
        };

        // A family named while disabled is ignored rather than enqueued.
        if self.config.enable_ipv4 {
            if let Some(subnet) = subnets.ipv4.first() {
                let pool = self
                    .wait_subnet_pool(cancel, subnet, LABEL_IPPOOL_VERSION_V4, &controller)
                    .await?;
                t.pool_candidates.push(PoolCandidate {
                    ip_version: IPV4,
                    pools: vec![pool],
                });
            }
        }
        if self.config.enable_ipv6 {
            if let Some(subnet) = subnets.ipv6.first() {
                let pool = self
                    .wait_subnet_pool(cancel, subnet, LABEL_IPPOOL_VERSION_V6, &controller)
                    .await?;
                t.pool_candidates.push(PoolCandidate {
                    ip_version: IPV6,
                    pools: vec![pool],
                });
            }
        }

        Ok(Some(t))
    }

    /// Polls for the pool minted from `subnet` for the given application.
    async fn wait_subnet_pool(
        &self,
        cancel: &CancellationToken,
        subnet: &str,
        version_label: &str,
        controller: &crate::pod::TopController,
    ) -> Result<String, IpamError> {
        let labels = BTreeMap::from([
            (
                LABEL_IPPOOL_OWNER_APPLICATION_UID.to_string(),
                controller.uid.clone(),
            ),
            (LABEL_IPPOOL_VERSION.to_string(), version_label.to_string()),
            (LABEL_IPPOOL_OWNER_SUBNET.to_string(), subnet.to_string()),
            (
                LABEL_IPPOOL_OWNER_APPLICATION.to_string(),
                app_label_value(&controller.kind, &controller.namespace, &controller.name),
            ),
        ]);

        for attempt in 0..=self.config.wait_subnet_pool_retries {
            let pools = match self.store.list_ippools(&labels).await {
                Ok(pools) => pools,
                Err(e) => {
                    if attempt == self.config.wait_subnet_pool_retries {
                        return Err(e.into());
                    }
                    warn!("Failed to list IPPools of SpiderSubnet {}: {}", subnet, e);
                    continue;
                }
            };

            match pools.len() {
                0 => {
                    if attempt == self.config.wait_subnet_pool_retries {
                        return Err(IpamError::NoAvailablePool(format!(
                            "no IPPool retrieved from SpiderSubnet {}",
                            subnet
                        )));
                    }
                    debug!(
                        "No IPPool retrieved from SpiderSubnet {} yet, waiting for the subnet controller",
                        subnet
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(IpamError::Canceled),
                        _ = tokio::time::sleep(self.config.wait_subnet_pool_time) => {}
                    }
                }
                1 => {
                    let name = pools[0].metadata.name.clone().unwrap_or_default();
                    debug!("Add IPPool {} of SpiderSubnet {} to candidates", name, subnet);
                    return Ok(name);
                }
                n => {
                    return Err(IpamError::InvariantViolation(format!(
                        "SpiderSubnet {} owns {} IPPools for application {}/{}/{}",
                        subnet, n, controller.kind, controller.namespace, controller.name
                    )));
                }
            }
        }

        Err(IpamError::NoAvailablePool(format!(
            "no IPPool retrieved from SpiderSubnet {}",
            subnet
        )))
    }

    async fn get_pool_from_ns(
        &self,
        namespace: &str,
        nic: &str,
        clean_gateway: bool,
    ) -> Result<Option<ToBeAllocated>, IpamError> {
        let ns = self.store.get_namespace(namespace).await?;
        let annotations = ns.metadata.annotations.unwrap_or_default();

        let v4_pools = parse_pool_list(annotations.get(ANNO_NS_DEFAULT_V4_POOL))?;
        let v6_pools = parse_pool_list(annotations.get(ANNO_NS_DEFAULT_V6_POOL))?;
        if v4_pools.is_empty() && v6_pools.is_empty() {
            return Ok(None);
        }

        info!(
            "Use IPPools from the default-pool annotations of Namespace {}",
            namespace
        );
        let mut t = ToBeAllocated {
            nic: nic.to_string(),
            clean_gateway,
            pool_candidates: Vec::new(),
        };
        if !v4_pools.is_empty() {
            t.pool_candidates.push(PoolCandidate {
                ip_version: IPV4,
                pools: v4_pools,
            });
        }
        if !v6_pools.is_empty() {
            t.pool_candidates.push(PoolCandidate {
                ip_version: IPV6,
                pools: v6_pools,
            });
        }
        Ok(Some(t))
    }

    fn get_cluster_default_pool(
        &self,
        nic: &str,
        clean_gateway: bool,
    ) -> Result<ToBeAllocated, IpamError> {
        if self.config.cluster_default_ipv4_ippool.is_empty()
            && self.config.cluster_default_ipv6_ippool.is_empty()
        {
            return Err(IpamError::NoAvailablePool(
                "no cluster default IPPool configured".to_string(),
            ));
        }

        let mut t = ToBeAllocated {
            nic: nic.to_string(),
            clean_gateway,
            pool_candidates: Vec::new(),
        };
        if !self.config.cluster_default_ipv4_ippool.is_empty() {
            t.pool_candidates.push(PoolCandidate {
                ip_version: IPV4,
                pools: self.config.cluster_default_ipv4_ippool.clone(),
            });
        }
        if !self.config.cluster_default_ipv6_ippool.is_empty() {
            t.pool_candidates.push(PoolCandidate {
                ip_version: IPV6,
                pools: self.config.cluster_default_ipv6_ippool.clone(),
            });
        }
        Ok(t)
    }

    /// Drops candidates of disabled families, then requires every enabled
    /// family to still be satisfiable.
    pub fn check_ip_version_enable(
        &self,
        tt: &mut Vec<ToBeAllocated>,
    ) -> Result<(), IpamError> {
        for t in tt.iter_mut() {
            t.pool_candidates.retain(|c| match c.ip_version {
                IPV4 => self.config.enable_ipv4,
                IPV6 => self.config.enable_ipv6,
                _ => false,
            });

            if self.config.enable_ipv4
                && !t.pool_candidates.iter().any(|c| c.ip_version == IPV4)
            {
                return Err(IpamError::NoAvailablePool(format!(
                    "interface {} has no IPv4 IPPool candidate while IPv4 is enabled",
                    t.nic
                )));
            }
            if self.config.enable_ipv6
                && !t.pool_candidates.iter().any(|c| c.ip_version == IPV6)
            {
                return Err(IpamError::NoAvailablePool(format!(
                    "interface {} has no IPv6 IPPool candidate while IPv6 is enabled",
                    t.nic
                )));
            }
        }
        Ok(())
    }
}

/// Merged subnet names from the `subnets`/`subnet` annotations, the per-NIC
/// array taking precedence.
fn subnet_anno_config(pod: &Pod, nic: &str) -> Result<Option<AnnoSubnetValue>, IpamError> {
    let annotations = pod.annotations();

    if let Some(anno) = annotations.get(ANNO_POD_SUBNETS) {
        let items: Vec<AnnoSubnetItem> = serde_json::from_str(anno).map_err(|e| {
            IpamError::WrongInput(format!("invalid annotation {}: {}", ANNO_POD_SUBNETS, e))
        })?;
        let item = items.into_iter().find(|i| i.interface == nic).ok_or_else(|| {
            IpamError::WrongInput(format!(
                "annotation {} names no entry for interface {}",
                ANNO_POD_SUBNETS, nic
            ))
        })?;
        return Ok(Some(AnnoSubnetValue {
            ipv4: item.ipv4,
            ipv6: item.ipv6,
        }));
    }

    if let Some(anno) = annotations.get(ANNO_POD_SUBNET) {
        let value: AnnoSubnetValue = serde_json::from_str(anno).map_err(|e| {
            IpamError::WrongInput(format!("invalid annotation {}: {}", ANNO_POD_SUBNET, e))
        })?;
        return Ok(Some(value));
    }

    Ok(None)
}

/// All entries of the per-NIC `ippools` annotation become allocation plans;
/// the requested interface must be among them.
fn get_pool_from_pod_anno_pools(
    anno: &str,
    nic: &str,
) -> Result<Vec<ToBeAllocated>, IpamError> {
    let items: Vec<AnnoIPPoolItem> = serde_json::from_str(anno).map_err(|e| {
        IpamError::WrongInput(format!("invalid annotation {}: {}", ANNO_POD_IPPOOLS, e))
    })?;
    if items.is_empty() {
        return Err(IpamError::WrongInput(format!(
            "annotation {} is empty",
            ANNO_POD_IPPOOLS
        )));
    }
    if !items.iter().any(|i| i.interface == nic) {
        return Err(IpamError::WrongInput(format!(
            "annotation {} names no entry for interface {}",
            ANNO_POD_IPPOOLS, nic
        )));
    }

    Ok(items
        .into_iter()
        .map(|item| {
            let mut t = ToBeAllocated {
                nic: item.interface,
                clean_gateway: item.clean_gateway.unwrap_or(false),
                pool_candidates: Vec::new(),
            };
            if !item.ipv4.is_empty() {
                t.pool_candidates.push(PoolCandidate {
                    ip_version: IPV4,
                    pools: item.ipv4,
                });
            }
            if !item.ipv6.is_empty() {
                t.pool_candidates.push(PoolCandidate {
                    ip_version: IPV6,
                    pools: item.ipv6,
                });
            }
            t
        })
        .collect())
}

fn get_pool_from_pod_anno_pool(
    anno: &str,
    nic: &str,
    clean_gateway: bool,
) -> Result<ToBeAllocated, IpamError> {
    let value: AnnoPodIPPoolValue = serde_json::from_str(anno).map_err(|e| {
        IpamError::WrongInput(format!("invalid annotation {}: {}", ANNO_POD_IPPOOL, e))
    })?;

    let mut t = ToBeAllocated {
        nic: nic.to_string(),
        clean_gateway: value.clean_gateway.unwrap_or(clean_gateway),
        pool_candidates: Vec::new(),
    };
    if !value.ipv4.is_empty() {
        t.pool_candidates.push(PoolCandidate {
            ip_version: IPV4,
            pools: value.ipv4,
        });
    }
    if !value.ipv6.is_empty() {
        t.pool_candidates.push(PoolCandidate {
            ip_version: IPV6,
            pools: value.ipv6,
        });
    }
    Ok(t)
}

fn get_pool_from_netconf(
    nic: &str,
    default_v4_pools: &[String],
    default_v6_pools: &[String],
    clean_gateway: bool,
) -> Option<ToBeAllocated> {
    if default_v4_pools.is_empty() && default_v6_pools.is_empty() {
        return None;
    }

    let mut t = ToBeAllocated {
        nic: nic.to_string(),
        clean_gateway,
        pool_candidates: Vec::new(),
    };
    if !default_v4_pools.is_empty() {
        t.pool_candidates.push(PoolCandidate {
            ip_version: IPV4,
            pools: default_v4_pools.to_vec(),
        });
    }
    if !default_v6_pools.is_empty() {
        t.pool_candidates.push(PoolCandidate {
            ip_version: IPV6,
            pools: default_v6_pools.to_vec(),
        });
    }
    Some(t)
}

fn parse_pool_list(anno: Option<&String>) -> Result<Vec<String>, IpamError> {
    match anno {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| IpamError::WrongInput(format!("invalid default-pool annotation: {}", e))),
    }
}
