//! Annotation payload types
//!
//! JSON shapes carried by the `ipam.spidernet.io/*` Pod and Namespace
//! annotations. Keys are defined in [`crate::constants`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Value of `ipam.spidernet.io/ippool`: pool selection for the default NIC.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnnoPodIPPoolValue {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_gateway: Option<bool>,
}

/// One element of `ipam.spidernet.io/ippools`: pool selection for a named NIC.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnnoIPPoolItem {
    /// Interface the selection applies to
    pub interface: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_gateway: Option<bool>,
}

/// Value of `ipam.spidernet.io/subnet`: subnet selection for the default NIC.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnnoSubnetValue {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,
}

/// One element of `ipam.spidernet.io/subnets`: subnet selection for a named NIC.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnnoSubnetItem {
    pub interface: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,
}

/// Value written to `ipam.spidernet.io/assigned-<nic>` after a successful
/// allocation, summarizing what the NIC got.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnnoPodAssignedEthxValue {
    pub interface: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_pool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_pool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ippool_annotation() {
        let raw = r#"{"ipv4":["p4-a","p4-b"],"ipv6":["p6"],"cleanGateway":true}"#;
        let value: AnnoPodIPPoolValue = serde_json::from_str(raw).unwrap();
        assert_eq!(value.ipv4, vec!["p4-a", "p4-b"]);
        assert_eq!(value.ipv6, vec!["p6"]);
        assert_eq!(value.clean_gateway, Some(true));
    }

    #[test]
    fn test_parse_ippools_annotation() {
        let raw = r#"[{"interface":"eth0","ipv4":["p4"]},{"interface":"net1","ipv6":["p6"]}]"#;
        let items: Vec<AnnoIPPoolItem> = serde_json::from_str(raw).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].interface, "eth0");
        assert!(items[0].ipv6.is_empty());
        assert_eq!(items[1].ipv6, vec!["p6"]);
    }

    #[test]
    fn test_parse_subnet_annotation() {
        let raw = r#"{"ipv4":["subnet-v4"]}"#;
        let value: AnnoSubnetValue = serde_json::from_str(raw).unwrap();
        assert_eq!(value.ipv4, vec!["subnet-v4"]);
        assert!(value.ipv6.is_empty());
    }

    #[test]
    fn test_assigned_annotation_elides_empty_fields() {
        let value = AnnoPodAssignedEthxValue {
            interface: "eth0".to_string(),
            ipv4_pool: Some("p4".to_string()),
            ipv4: Some("10.0.0.2/24".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"ipv4Pool\":\"p4\""));
        assert!(!json.contains("ipv6"));
    }
}
