//! IPAM core configuration.

use std::time::Duration;

use crate::error::IpamError;
use crate::limiter::LimiterConfig;

/// Configuration of the IPAM core, loaded by the agent and threaded through
/// the constructor.
#[derive(Debug, Clone)]
pub struct IpamConfig {
    /// Serve IPv4 allocations
    pub enable_ipv4: bool,

    /// Serve IPv6 allocations
    pub enable_ipv6: bool,

    /// Preserve Endpoints across StatefulSet Pod recreation
    pub enable_statefulset: bool,

    /// Resolve pool candidates from SpiderSubnet annotations
    pub enable_spider_subnet: bool,

    /// Cluster-wide fallback pools, consulted last
    pub cluster_default_ipv4_ippool: Vec<String>,
    pub cluster_default_ipv6_ippool: Vec<String>,

    /// Bounded optimistic-concurrency retry budget on Store updates
    pub max_conflict_retries: u32,

    /// Unit of the jittered backoff between conflict retries
    pub conflict_retry_unit: Duration,

    /// Upper bound on `endpoint.status.history`
    pub max_history_records: usize,

    /// Sleep between polls for a subnet-minted pool that does not exist yet
    pub wait_subnet_pool_time: Duration,

    /// Number of polls before giving up on a subnet-minted pool
    pub wait_subnet_pool_retries: u32,

    pub limiter: LimiterConfig,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: true,
            enable_statefulset: true,
            enable_spider_subnet: true,
            cluster_default_ipv4_ippool: Vec::new(),
            cluster_default_ipv6_ippool: Vec::new(),
            max_conflict_retries: 5,
            conflict_retry_unit: Duration::from_millis(300),
            max_history_records: 100,
            wait_subnet_pool_time: Duration::from_secs(2),
            wait_subnet_pool_retries: 25,
            limiter: LimiterConfig::default(),
        }
    }
}

impl IpamConfig {
    pub fn validate(&self) -> Result<(), IpamError> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err(IpamError::MissingRequiredParam(
                "at least one enabled IP family".to_string(),
            ));
        }
        if self.max_history_records == 0 {
            return Err(IpamError::MissingRequiredParam(
                "a positive history record bound".to_string(),
            ));
        }
        if self.conflict_retry_unit.is_zero() {
            return Err(IpamError::MissingRequiredParam(
                "a non-zero conflict retry unit".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(IpamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_both_families_disabled_rejected() {
        let config = IpamConfig {
            enable_ipv4: false,
            enable_ipv6: false,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(IpamError::MissingRequiredParam(_))
        ));
    }
}
