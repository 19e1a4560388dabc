//! Request/response models and allocation bookkeeping types.

use std::collections::HashMap;

use crds::{IPAllocationDetail, Route, IPV4, IPV6};

/// Allocation request, one per CNI ADD.
#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    pub container_id: String,

    /// Interface to allocate for, e.g. `eth0`
    pub if_name: String,

    pub pod_namespace: String,
    pub pod_name: String,

    /// Fallback pools from the CNI network configuration
    pub default_ipv4_pools: Vec<String>,
    pub default_ipv6_pools: Vec<String>,

    /// Drop the pool's default-route contribution on this attachment
    pub clean_gateway: bool,
}

/// Allocation response: one IP per `(nic, family)` plus the routes to
/// install.
#[derive(Debug, Clone, Default)]
pub struct AddResponse {
    pub ips: Vec<IPConfig>,
    pub routes: Vec<RouteConfig>,
}

/// Release request, one per CNI DEL.
#[derive(Debug, Clone, Default)]
pub struct DelRequest {
    pub container_id: String,
    pub if_name: String,
    pub pod_namespace: String,
    pub pod_name: String,
}

/// One allocated address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IPConfig {
    /// Address with prefix length, e.g. `10.0.0.2/24`
    pub address: String,

    pub gateway: Option<String>,

    /// Interface the address is bound to inside the Pod
    pub nic: String,

    /// IP family, 4 or 6
    pub version: i64,

    /// Pool the address was drawn from
    pub ip_pool: String,

    pub vlan: Option<i64>,
}

/// One route to install, bound to a Pod interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub if_name: String,
    pub dst: String,
    pub gw: String,
}

/// The allocation plan for one NIC: candidates per family, tried in order.
#[derive(Debug, Clone)]
pub struct ToBeAllocated {
    pub nic: String,
    pub clean_gateway: bool,
    pub pool_candidates: Vec<PoolCandidate>,
}

/// An ordered list of pools to try for one IP family.
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    pub ip_version: i64,
    pub pools: Vec<String>,
}

/// Outcome of one successful per-candidate allocation.
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub ip: IPConfig,
    pub routes: Vec<RouteConfig>,
    pub clean_gateway: bool,
}

/// An IP paired with the container that claims to hold it, for release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IPAndID {
    /// Bare address, no prefix length
    pub ip: String,
    pub container_id: String,
}

/// Strips the prefix length from an `ip/len` address.
pub(crate) fn bare_ip(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}

/// Expands recorded per-NIC details back into response configs and routes,
/// for the retrieve paths.
pub fn convert_ip_details_to_configs_and_routes(
    details: &[IPAllocationDetail],
) -> (Vec<IPConfig>, Vec<RouteConfig>) {
    let mut ips = Vec::new();
    let mut routes = Vec::new();

    for detail in details {
        if let Some(ipv4) = &detail.ipv4 {
            ips.push(IPConfig {
                address: ipv4.clone(),
                gateway: detail.ipv4_gateway.clone(),
                nic: detail.nic.clone(),
                version: IPV4,
                ip_pool: detail.ipv4_pool.clone().unwrap_or_default(),
                vlan: detail.vlan,
            });
        }
        if let Some(ipv6) = &detail.ipv6 {
            ips.push(IPConfig {
                address: ipv6.clone(),
                gateway: detail.ipv6_gateway.clone(),
                nic: detail.nic.clone(),
                version: IPV6,
                ip_pool: detail.ipv6_pool.clone().unwrap_or_default(),
                vlan: detail.vlan,
            });
        }
        for route in &detail.routes {
            routes.push(RouteConfig {
                if_name: detail.nic.clone(),
                dst: route.dst.clone(),
                gw: route.gw.clone(),
            });
        }
    }

    (ips, routes)
}

/// Flattens allocation results into response configs and routes.
pub fn convert_results_to_configs_and_routes(
    results: &[AllocationResult],
) -> (Vec<IPConfig>, Vec<RouteConfig>) {
    let mut ips = Vec::new();
    let mut routes = Vec::new();
    for result in results {
        ips.push(result.ip.clone());
        routes.extend(result.routes.iter().cloned());
    }
    (ips, routes)
}

/// Merges per-family allocation results into one detail per NIC, the shape
/// recorded on the Endpoint.
pub fn convert_results_to_details(results: &[AllocationResult]) -> Vec<IPAllocationDetail> {
    let mut by_nic: Vec<IPAllocationDetail> = Vec::new();

    for result in results {
        let index = match by_nic.iter().position(|d| d.nic == result.ip.nic) {
            Some(index) => index,
            None => {
                by_nic.push(IPAllocationDetail {
                    nic: result.ip.nic.clone(),
                    clean_gateway: Some(result.clean_gateway),
                    ..Default::default()
                });
                by_nic.len() - 1
            }
        };
        let detail = &mut by_nic[index];

        if result.ip.version == IPV4 {
            detail.ipv4 = Some(result.ip.address.clone());
            detail.ipv4_pool = Some(result.ip.ip_pool.clone());
            detail.ipv4_gateway = result.ip.gateway.clone();
        } else {
            detail.ipv6 = Some(result.ip.address.clone());
            detail.ipv6_pool = Some(result.ip.ip_pool.clone());
            detail.ipv6_gateway = result.ip.gateway.clone();
        }
        detail.vlan = result.ip.vlan;
        detail.routes.extend(result.routes.iter().map(|r| Route {
            dst: r.dst.clone(),
            gw: r.gw.clone(),
        }));
    }

    by_nic
}

/// Groups recorded details by owning pool for the release fan-out.
pub fn group_ip_details(
    container_id: &str,
    details: &[IPAllocationDetail],
) -> HashMap<String, Vec<IPAndID>> {
    let mut by_pool: HashMap<String, Vec<IPAndID>> = HashMap::new();

    for detail in details {
        if let (Some(pool), Some(address)) = (&detail.ipv4_pool, &detail.ipv4) {
            by_pool.entry(pool.clone()).or_default().push(IPAndID {
                ip: bare_ip(address).to_string(),
                container_id: container_id.to_string(),
            });
        }
        if let (Some(pool), Some(address)) = (&detail.ipv6_pool, &detail.ipv6) {
            by_pool.entry(pool.clone()).or_default().push(IPAndID {
                ip: bare_ip(address).to_string(),
                container_id: container_id.to_string(),
            });
        }
    }

    by_pool
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_result(nic: &str, address: &str, pool: &str) -> AllocationResult {
        AllocationResult {
            ip: IPConfig {
                address: address.to_string(),
                gateway: Some("10.0.0.1".to_string()),
                nic: nic.to_string(),
                version: IPV4,
                ip_pool: pool.to_string(),
                vlan: Some(0),
            },
            routes: Vec::new(),
            clean_gateway: false,
        }
    }

    fn v6_result(nic: &str, address: &str, pool: &str) -> AllocationResult {
        AllocationResult {
            ip: IPConfig {
                address: address.to_string(),
                gateway: None,
                nic: nic.to_string(),
                version: IPV6,
                ip_pool: pool.to_string(),
                vlan: Some(0),
            },
            routes: Vec::new(),
            clean_gateway: false,
        }
    }

    #[test]
    fn test_results_merge_per_nic() {
        let results = vec![
            v4_result("eth0", "10.0.0.2/24", "p4"),
            v6_result("eth0", "fd00::2/64", "p6"),
        ];
        let details = convert_results_to_details(&results);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].ipv4.as_deref(), Some("10.0.0.2/24"));
        assert_eq!(details[0].ipv6.as_deref(), Some("fd00::2/64"));
        assert_eq!(details[0].ipv6_pool.as_deref(), Some("p6"));
    }

    #[test]
    fn test_details_round_trip_to_configs() {
        let results = vec![v4_result("eth0", "10.0.0.2/24", "p4")];
        let details = convert_results_to_details(&results);
        let (ips, _) = convert_ip_details_to_configs_and_routes(&details);
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].address, "10.0.0.2/24");
        assert_eq!(ips[0].ip_pool, "p4");
        assert_eq!(ips[0].version, IPV4);
    }

    #[test]
    fn test_group_by_pool_strips_prefix() {
        let results = vec![
            v4_result("eth0", "10.0.0.2/24", "p4"),
            v6_result("eth0", "fd00::2/64", "p6"),
        ];
        let details = convert_results_to_details(&results);
        let grouped = group_ip_details("c1", &details);
        assert_eq!(grouped["p4"][0].ip, "10.0.0.2");
        assert_eq!(grouped["p6"][0].ip, "fd00::2");
        assert_eq!(grouped["p4"][0].container_id, "c1");
    }
}
