//! SpiderIPPool CRD
//!
//! The authoritative record of a contiguous address resource: which
//! addresses are assignable, which are withheld, and who currently holds
//! each one.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "spiderpool.spidernet.io",
    version = "v1",
    kind = "SpiderIPPool",
    status = "IPPoolStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// IP family of the pool, 4 or 6
    pub ip_version: i64,

    /// CIDR every address of the pool falls into
    pub subnet: String,

    /// Assignable ranges inside the subnet, `a.b.c.d-a.b.c.e` or single addresses
    #[serde(default)]
    pub ips: Vec<String>,

    /// Ranges to never assign
    #[serde(default, rename = "excludeIPs", skip_serializing_if = "Vec::is_empty")]
    pub exclude_ips: Vec<String>,

    /// Default gateway handed out with every allocation from this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// VLAN tag; all pools of one allocation must agree on it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,

    /// Routes attached to every allocation from this pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    /// Disabled pools are never selected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,

    /// Only Pods matching this selector may draw from the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<LabelSelector>,

    /// Only Pods in Namespaces matching this selector may draw from the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_affinity: Option<LabelSelector>,

    /// Only Pods scheduled to Nodes matching this selector may draw from the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<LabelSelector>,
}

/// A route handed out with an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,

    /// Gateway address
    pub gw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolStatus {
    /// Live allocations keyed by IP address
    #[serde(default, rename = "allocatedIPs", skip_serializing_if = "Option::is_none")]
    pub allocated_ips: Option<BTreeMap<String, PoolIPAllocation>>,

    /// Number of assignable addresses (`ips` minus `excludeIPs`)
    #[serde(default, rename = "totalIPCount", skip_serializing_if = "Option::is_none")]
    pub total_ip_count: Option<i64>,

    /// Number of live allocations; always `allocated_ips.len()`
    #[serde(default, rename = "allocatedIPCount", skip_serializing_if = "Option::is_none")]
    pub allocated_ip_count: Option<i64>,
}

/// The claimant of one allocated IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolIPAllocation {
    #[serde(rename = "containerID")]
    pub container_id: String,

    /// Interface the address is bound to inside the Pod
    pub nic: String,

    /// Node the Pod runs on
    pub node: String,

    /// `namespace/name` of the Pod
    pub pod: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ippool_spec_serializes_camel_case() {
        let spec = IPPoolSpec {
            ip_version: 4,
            subnet: "10.0.0.0/24".to_string(),
            ips: vec!["10.0.0.2-10.0.0.5".to_string()],
            exclude_ips: vec!["10.0.0.3".to_string()],
            gateway: Some("10.0.0.1".to_string()),
            vlan: Some(0),
            ..Default::default()
        };

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["ipVersion"], 4);
        assert_eq!(value["excludeIPs"][0], "10.0.0.3");
        assert!(value.get("podAffinity").is_none());
    }

    #[test]
    fn test_ippool_status_round_trip() {
        let mut allocated = BTreeMap::new();
        allocated.insert(
            "10.0.0.2".to_string(),
            PoolIPAllocation {
                container_id: "c1".to_string(),
                nic: "eth0".to_string(),
                node: "node1".to_string(),
                pod: "default/app-0".to_string(),
            },
        );
        let status = IPPoolStatus {
            allocated_ips: Some(allocated),
            total_ip_count: Some(4),
            allocated_ip_count: Some(1),
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"allocatedIPs\""));
        assert!(json.contains("\"containerID\":\"c1\""));

        let back: IPPoolStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.allocated_ip_count, Some(1));
        assert_eq!(
            back.allocated_ips.unwrap()["10.0.0.2"].pod,
            "default/app-0"
        );
    }
}
