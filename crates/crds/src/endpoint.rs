//! SpiderEndpoint CRD
//!
//! The per-Pod lease record. Namespace and name always equal the Pod's, so
//! the allocator can find it without an index. Everything of interest lives
//! in the status: the live allocation and a bounded history of past ones.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ippool::Route;

/// SpiderEndpoint carries no desired state; the spec is empty and the
/// status records what has actually been leased.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "spiderpool.spidernet.io",
    version = "v1",
    kind = "SpiderEndpoint",
    namespaced,
    status = "WorkloadEndpointStatus",
    derive = "Default"
)]
pub struct WorkloadEndpointSpec {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointStatus {
    /// The live allocation, or none when the Pod holds no lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<PodIPAllocation>,

    /// Past allocations, newest first; `history[0]` mirrors `current`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<PodIPAllocation>,

    /// Kind of the Pod's top controller (Deployment, StatefulSet, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_controller_type: Option<String>,

    /// Name of the Pod's top controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_controller_name: Option<String>,
}

/// One container's complete lease: which container, where it runs, and the
/// per-NIC address details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodIPAllocation {
    #[serde(rename = "containerID")]
    pub container_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IPAllocationDetail>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,
}

/// A per-NIC slice of a Pod's lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct IPAllocationDetail {
    /// Interface name inside the Pod, e.g. `eth0`
    pub nic: String,

    /// IPv4 address with prefix length, e.g. `10.0.0.2/24`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    /// IPv6 address with prefix length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_pool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_pool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_gateway: Option<String>,

    /// Drop the pool's default-route contribution on this attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_gateway: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_serializes_expected_keys() {
        let detail = IPAllocationDetail {
            nic: "eth0".to_string(),
            ipv4: Some("10.0.0.2/24".to_string()),
            ipv4_pool: Some("p4".to_string()),
            ipv4_gateway: Some("10.0.0.1".to_string()),
            vlan: Some(0),
            ..Default::default()
        };

        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["nic"], "eth0");
        assert_eq!(value["ipv4Pool"], "p4");
        assert_eq!(value["ipv4Gateway"], "10.0.0.1");
        assert!(value.get("ipv6").is_none());
    }

    #[test]
    fn test_status_history_defaults_empty() {
        let status: WorkloadEndpointStatus = serde_json::from_str("{}").unwrap();
        assert!(status.current.is_none());
        assert!(status.history.is_empty());
    }
}
