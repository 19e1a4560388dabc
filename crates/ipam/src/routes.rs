//! Route derivation and the assignment annotation.
//!
//! A pool's `spec.routes` are attached to every address drawn from it,
//! rewritten to the Pod's interface. Request-level custom routes are
//! matched to the interface whose allocated subnet contains their gateway;
//! whatever matches nothing is reported back to the caller as leftovers.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crds::{AnnoPodAssignedEthxValue, Route, ANNO_POD_ASSIGNED_PREFIX, ANNO_POD_ROUTES, IPV4};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::error::IpamError;
use crate::types::{IPConfig, RouteConfig};

/// Rewrites a pool's routes onto the given interface.
pub fn convert_spec_routes(nic: &str, routes: &[Route]) -> Vec<RouteConfig> {
    routes
        .iter()
        .map(|route| RouteConfig {
            if_name: nic.to_string(),
            dst: route.dst.clone(),
            gw: route.gw.clone(),
        })
        .collect()
}

/// Parses the custom-route annotation of the Pod. The routes are not yet
/// bound to an interface; grouping happens once addresses are known.
pub fn get_custom_routes(pod: &Pod) -> Result<Vec<RouteConfig>, IpamError> {
    let Some(anno) = pod.annotations().get(ANNO_POD_ROUTES) else {
        return Ok(Vec::new());
    };

    let routes: Vec<Route> = serde_json::from_str(anno).map_err(|e| {
        IpamError::WrongInput(format!("invalid annotation {}: {}", ANNO_POD_ROUTES, e))
    })?;

    for route in &routes {
        IpNetwork::from_str(&route.dst).map_err(|_| {
            IpamError::WrongInput(format!("invalid custom route destination {}", route.dst))
        })?;
        IpAddr::from_str(&route.gw).map_err(|_| {
            IpamError::WrongInput(format!("invalid custom route gateway {}", route.gw))
        })?;
    }

    Ok(routes
        .into_iter()
        .map(|route| RouteConfig {
            if_name: String::new(),
            dst: route.dst,
            gw: route.gw,
        })
        .collect())
}

/// Moves the custom routes whose gateway falls inside the allocated
/// address's subnet onto that interface. Each route is consumed by at most
/// one address.
pub fn group_custom_routes_by_gw(
    custom_routes: &mut Vec<RouteConfig>,
    ip: &IPConfig,
) -> Result<Vec<RouteConfig>, IpamError> {
    let network = IpNetwork::from_str(&ip.address).map_err(|_| {
        IpamError::WrongInput(format!("invalid allocated address {}", ip.address))
    })?;

    let mut grouped = Vec::new();
    let mut remaining = Vec::new();
    for mut route in custom_routes.drain(..) {
        let gw = IpAddr::from_str(&route.gw).map_err(|_| {
            IpamError::WrongInput(format!("invalid custom route gateway {}", route.gw))
        })?;
        if network.contains(gw) {
            route.if_name = ip.nic.clone();
            grouped.push(route);
        } else {
            remaining.push(route);
        }
    }
    *custom_routes = remaining;

    Ok(grouped)
}

/// Builds the `ipam.spidernet.io/assigned-<nic>` annotations summarizing a
/// successful allocation, one entry per interface.
pub fn gen_ip_assignment_annotation(
    ips: &[IPConfig],
) -> Result<BTreeMap<String, String>, IpamError> {
    let mut per_nic: BTreeMap<String, AnnoPodAssignedEthxValue> = BTreeMap::new();

    for ip in ips {
        let entry = per_nic
            .entry(ip.nic.clone())
            .or_insert_with(|| AnnoPodAssignedEthxValue {
                interface: ip.nic.clone(),
                ..Default::default()
            });
        if ip.version == IPV4 {
            entry.ipv4 = Some(ip.address.clone());
            entry.ipv4_pool = Some(ip.ip_pool.clone());
        } else {
            entry.ipv6 = Some(ip.address.clone());
            entry.ipv6_pool = Some(ip.ip_pool.clone());
        }
        entry.vlan = ip.vlan;
    }

    let mut annotations = BTreeMap::new();
    for (nic, value) in per_nic {
        let raw = serde_json::to_string(&value)
            .map_err(|e| IpamError::WrongInput(format!("unserializable assignment: {}", e)))?;
        annotations.insert(format!("{}{}", ANNO_POD_ASSIGNED_PREFIX, nic), raw);
    }
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_config(nic: &str, address: &str) -> IPConfig {
        IPConfig {
            address: address.to_string(),
            gateway: Some("10.0.0.1".to_string()),
            nic: nic.to_string(),
            version: IPV4,
            ip_pool: "p4".to_string(),
            vlan: Some(0),
        }
    }

    #[test]
    fn test_spec_routes_are_bound_to_nic() {
        let routes = vec![Route {
            dst: "172.16.0.0/16".to_string(),
            gw: "10.0.0.1".to_string(),
        }];
        let converted = convert_spec_routes("net1", &routes);
        assert_eq!(converted[0].if_name, "net1");
        assert_eq!(converted[0].dst, "172.16.0.0/16");
    }

    #[test]
    fn test_custom_routes_grouped_by_gateway_subnet() {
        let mut custom = vec![
            RouteConfig {
                if_name: String::new(),
                dst: "172.16.0.0/16".to_string(),
                gw: "10.0.0.254".to_string(),
            },
            RouteConfig {
                if_name: String::new(),
                dst: "172.17.0.0/16".to_string(),
                gw: "192.168.0.1".to_string(),
            },
        ];

        let grouped =
            group_custom_routes_by_gw(&mut custom, &v4_config("eth0", "10.0.0.2/24")).unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].if_name, "eth0");
        assert_eq!(grouped[0].gw, "10.0.0.254");

        // The unmatched route stays behind.
        assert_eq!(custom.len(), 1);
        assert_eq!(custom[0].gw, "192.168.0.1");
    }

    #[test]
    fn test_each_route_consumed_once() {
        let mut custom = vec![RouteConfig {
            if_name: String::new(),
            dst: "172.16.0.0/16".to_string(),
            gw: "10.0.0.254".to_string(),
        }];

        let first =
            group_custom_routes_by_gw(&mut custom, &v4_config("eth0", "10.0.0.2/24")).unwrap();
        assert_eq!(first.len(), 1);
        let second =
            group_custom_routes_by_gw(&mut custom, &v4_config("net1", "10.0.0.3/24")).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_custom_route_parsing_rejects_garbage() {
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(BTreeMap::from([(
            ANNO_POD_ROUTES.to_string(),
            r#"[{"dst":"not-a-cidr","gw":"10.0.0.1"}]"#.to_string(),
        )]));
        assert!(matches!(
            get_custom_routes(&pod),
            Err(IpamError::WrongInput(_))
        ));
    }

    #[test]
    fn test_assignment_annotation_shape() {
        let ips = vec![
            v4_config("eth0", "10.0.0.2/24"),
            IPConfig {
                address: "fd00::2/64".to_string(),
                gateway: None,
                nic: "eth0".to_string(),
                version: 6,
                ip_pool: "p6".to_string(),
                vlan: Some(0),
            },
        ];
        let annotations = gen_ip_assignment_annotation(&ips).unwrap();
        let raw = &annotations["ipam.spidernet.io/assigned-eth0"];
        let value: AnnoPodAssignedEthxValue = serde_json::from_str(raw).unwrap();
        assert_eq!(value.interface, "eth0");
        assert_eq!(value.ipv4.as_deref(), Some("10.0.0.2/24"));
        assert_eq!(value.ipv6_pool.as_deref(), Some("p6"));
    }
}
