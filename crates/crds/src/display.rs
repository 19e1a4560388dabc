//! Canonical string renderers for the CRD types.
//!
//! Log lines embed whole objects, so every type renders into one compact
//! `Kind{field:value,...}` line with absent optional fields shown as `nil`.

use std::fmt;

use crate::endpoint::{IPAllocationDetail, PodIPAllocation, SpiderEndpoint, WorkloadEndpointStatus};
use crate::ippool::{IPPoolSpec, IPPoolStatus, SpiderIPPool};
use crate::reservedip::{ReservedIPSpec, SpiderReservedIP};
use crate::subnet::{SpiderSubnet, SubnetSpec, SubnetStatus};

fn opt<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "nil".to_string(),
    }
}

impl fmt::Display for SpiderIPPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpiderIPPool{{Name:{},Spec:{},Status:{}}}",
            self.metadata.name.as_deref().unwrap_or("nil"),
            self.spec,
            opt(&self.status),
        )
    }
}

impl fmt::Display for IPPoolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPPoolSpec{{IPVersion:{},Subnet:{},IPs:{:?},ExcludeIPs:{:?},Gateway:{},Vlan:{},Routes:{:?},Disable:{}}}",
            self.ip_version,
            self.subnet,
            self.ips,
            self.exclude_ips,
            opt(&self.gateway),
            opt(&self.vlan),
            self.routes,
            opt(&self.disable),
        )
    }
}

impl fmt::Display for IPPoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocated = match &self.allocated_ips {
            Some(map) => format!("{:?}", map.keys().collect::<Vec<_>>()),
            None => "nil".to_string(),
        };
        write!(
            f,
            "IPPoolStatus{{AllocatedIPs:{},TotalIPCount:{},AllocatedIPCount:{}}}",
            allocated,
            opt(&self.total_ip_count),
            opt(&self.allocated_ip_count),
        )
    }
}

impl fmt::Display for SpiderEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpiderEndpoint{{Namespace:{},Name:{},Status:{}}}",
            self.metadata.namespace.as_deref().unwrap_or("nil"),
            self.metadata.name.as_deref().unwrap_or("nil"),
            opt(&self.status),
        )
    }
}

impl fmt::Display for WorkloadEndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let history = self
            .history
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "WorkloadEndpointStatus{{Current:{},History:[{}],OwnerControllerType:{},OwnerControllerName:{}}}",
            opt(&self.current),
            history,
            opt(&self.owner_controller_type),
            opt(&self.owner_controller_name),
        )
    }
}

impl fmt::Display for PodIPAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ips = self
            .ips
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "PodIPAllocation{{ContainerID:{},Node:{},IPs:[{}]}}",
            self.container_id,
            opt(&self.node),
            ips,
        )
    }
}

impl fmt::Display for IPAllocationDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPAllocationDetail{{NIC:{},IPv4:{},IPv6:{},IPv4Pool:{},IPv6Pool:{},Vlan:{},IPv4Gateway:{},IPv6Gateway:{},CleanGateway:{}}}",
            self.nic,
            opt(&self.ipv4),
            opt(&self.ipv6),
            opt(&self.ipv4_pool),
            opt(&self.ipv6_pool),
            opt(&self.vlan),
            opt(&self.ipv4_gateway),
            opt(&self.ipv6_gateway),
            opt(&self.clean_gateway),
        )
    }
}

impl fmt::Display for SpiderReservedIP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpiderReservedIP{{Name:{},Spec:{}}}",
            self.metadata.name.as_deref().unwrap_or("nil"),
            self.spec,
        )
    }
}

impl fmt::Display for ReservedIPSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReservedIPSpec{{IPVersion:{},IPs:{:?}}}",
            self.ip_version, self.ips
        )
    }
}

impl fmt::Display for SpiderSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpiderSubnet{{Name:{},Spec:{},Status:{}}}",
            self.metadata.name.as_deref().unwrap_or("nil"),
            self.spec,
            opt(&self.status),
        )
    }
}

impl fmt::Display for SubnetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubnetSpec{{IPVersion:{},Subnet:{},IPs:{:?},ExcludeIPs:{:?},Gateway:{},Vlan:{}}}",
            self.ip_version,
            self.subnet,
            self.ips,
            self.exclude_ips,
            opt(&self.gateway),
            opt(&self.vlan),
        )
    }
}

impl fmt::Display for SubnetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = match &self.controlled_ip_pools {
            Some(map) => format!("{:?}", map.keys().collect::<Vec<_>>()),
            None => "nil".to_string(),
        };
        write!(
            f,
            "SubnetStatus{{ControlledIPPools:{},TotalIPCount:{},AllocatedIPCount:{}}}",
            pools,
            opt(&self.total_ip_count),
            opt(&self.allocated_ip_count),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_display_elides_absent_fields() {
        let spec = IPPoolSpec {
            ip_version: 4,
            subnet: "10.0.0.0/24".to_string(),
            ips: vec!["10.0.0.2-10.0.0.5".to_string()],
            ..Default::default()
        };
        let rendered = spec.to_string();
        assert!(rendered.contains("Gateway:nil"));
        assert!(rendered.contains("IPVersion:4"));
    }

    #[test]
    fn test_allocation_display() {
        let allocation = PodIPAllocation {
            container_id: "c1".to_string(),
            node: Some("node1".to_string()),
            ips: vec![IPAllocationDetail {
                nic: "eth0".to_string(),
                ipv4: Some("10.0.0.2/24".to_string()),
                ..Default::default()
            }],
            creation_time: None,
        };
        let rendered = allocation.to_string();
        assert!(rendered.contains("ContainerID:c1"));
        assert!(rendered.contains("NIC:eth0"));
        assert!(rendered.contains("IPv6:nil"));
    }
}
