//! SpiderSubnet CRD
//!
//! The parent address space IPPools are minted from by a controller
//! external to this core. The IPAM core reads subnets for diagnostics
//! only; pool selection goes through the owner labels on the minted
//! pools themselves.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ippool::Route;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "spiderpool.spidernet.io",
    version = "v1",
    kind = "SpiderSubnet",
    status = "SubnetStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// IP family of the subnet, 4 or 6
    pub ip_version: i64,

    /// CIDR of the whole subnet
    pub subnet: String,

    /// Ranges available for pool minting
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default, rename = "excludeIPs", skip_serializing_if = "Vec::is_empty")]
    pub exclude_ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    /// Pools minted from this subnet, keyed by pool name; the value is the
    /// range the pool controls
    #[serde(default, rename = "controlledIPPools", skip_serializing_if = "Option::is_none")]
    pub controlled_ip_pools: Option<BTreeMap<String, String>>,

    #[serde(default, rename = "totalIPCount", skip_serializing_if = "Option::is_none")]
    pub total_ip_count: Option<i64>,

    #[serde(default, rename = "allocatedIPCount", skip_serializing_if = "Option::is_none")]
    pub allocated_ip_count: Option<i64>,
}
