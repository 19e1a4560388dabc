//! Annotation keys, labels and other constants shared across the project.

/// Annotation prefix for all Pod/Namespace annotations consumed or written
/// by the IPAM core.
pub const ANNOTATION_PREFIX: &str = "ipam.spidernet.io";

// ============================================================================
// Pod annotations (consumed)
// ============================================================================

/// Single-object pool selection for the default NIC: `{"ipv4":[...],"ipv6":[...]}`.
pub const ANNO_POD_IPPOOL: &str = "ipam.spidernet.io/ippool";

/// Per-NIC pool selection: `[{"interface":"eth0","ipv4":[...],...}, ...]`.
pub const ANNO_POD_IPPOOLS: &str = "ipam.spidernet.io/ippools";

/// Subnet selection for the default NIC: `{"ipv4":[...],"ipv6":[...]}`.
pub const ANNO_POD_SUBNET: &str = "ipam.spidernet.io/subnet";

/// Per-NIC subnet selection, JSON array form.
pub const ANNO_POD_SUBNETS: &str = "ipam.spidernet.io/subnets";

/// Request-level custom routes: `[{"dst":"10.0.0.0/16","gw":"10.1.0.1"}, ...]`.
pub const ANNO_POD_ROUTES: &str = "ipam.spidernet.io/routes";

// ============================================================================
// Pod annotations (written)
// ============================================================================

/// Prefix of the per-NIC assignment annotation written after a successful
/// allocation. The full key is `ipam.spidernet.io/assigned-<nic>`.
pub const ANNO_POD_ASSIGNED_PREFIX: &str = "ipam.spidernet.io/assigned-";

// ============================================================================
// Namespace annotations (consumed)
// ============================================================================

/// Namespace default IPv4 pools, JSON string array.
pub const ANNO_NS_DEFAULT_V4_POOL: &str = "ipam.spidernet.io/defaultv4ippool";

/// Namespace default IPv6 pools, JSON string array.
pub const ANNO_NS_DEFAULT_V6_POOL: &str = "ipam.spidernet.io/defaultv6ippool";

// ============================================================================
// IPPool labels (set by the subnet controller on auto-created pools)
// ============================================================================

/// UID of the application (top controller) the pool was minted for.
pub const LABEL_IPPOOL_OWNER_APPLICATION_UID: &str = "ipam.spidernet.io/owner-application-uid";

/// IP family of the pool, `IPv4` or `IPv6`.
pub const LABEL_IPPOOL_VERSION: &str = "ipam.spidernet.io/ippool-version";

pub const LABEL_IPPOOL_VERSION_V4: &str = "IPv4";
pub const LABEL_IPPOOL_VERSION_V6: &str = "IPv6";

/// Name of the SpiderSubnet the pool was minted from.
pub const LABEL_IPPOOL_OWNER_SUBNET: &str = "ipam.spidernet.io/owner-spider-subnet";

/// `<kind>-<namespace>-<name>` of the owning application.
pub const LABEL_IPPOOL_OWNER_APPLICATION: &str = "ipam.spidernet.io/owner-application";

/// Canonical label value for the owning application of a subnet-minted pool.
pub fn app_label_value(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}-{}-{}", kind, namespace, name)
}

// ============================================================================
// Finalizer
// ============================================================================

/// Sentinel finalizer keeping an Endpoint alive until its IPs are released.
pub const SPIDER_FINALIZER: &str = "spiderpool.spidernet.io";

// ============================================================================
// Owner controller kinds
// ============================================================================

pub const KIND_STATEFULSET: &str = "StatefulSet";
pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_REPLICASET: &str = "ReplicaSet";
pub const KIND_DAEMONSET: &str = "DaemonSet";
pub const KIND_JOB: &str = "Job";
pub const KIND_POD: &str = "Pod";

/// Placeholder kind for Pods without any owner reference.
pub const OWNER_NONE: &str = "None";

/// IP family constants, matching the `ipVersion` CRD fields.
pub const IPV4: i64 = 4;
pub const IPV6: i64 = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_label_value() {
        assert_eq!(
            app_label_value("Deployment", "default", "nginx"),
            "Deployment-default-nginx"
        );
    }
}
