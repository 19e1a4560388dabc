//! SpiderReservedIP CRD
//!
//! Addresses withheld from every pool of the matching family. Consulted
//! read-only when computing a pool's free set.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "spiderpool.spidernet.io",
    version = "v1",
    kind = "SpiderReservedIP",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ReservedIPSpec {
    /// IP family the reservation applies to, 4 or 6
    pub ip_version: i64,

    /// Reserved ranges, `a.b.c.d-a.b.c.e` or single addresses
    #[serde(default)]
    pub ips: Vec<String>,
}
