//! Spiderpool CRD definitions
//!
//! Kubernetes Custom Resource Definitions consumed by the IPAM core:
//! - `ippool` - SpiderIPPool, the authoritative record of an assignable address range
//! - `endpoint` - SpiderEndpoint, the per-Pod lease record
//! - `reservedip` - SpiderReservedIP, addresses withheld from every pool
//! - `subnet` - SpiderSubnet, the parent resource pools are minted from
//!
//! Plus the annotation payload types exchanged with Pods and Namespaces,
//! and the constants (annotation keys, labels, finalizer) shared across
//! the project.

pub mod annotations;
pub mod constants;
pub mod endpoint;
pub mod ippool;
pub mod reservedip;
pub mod subnet;

mod display;

pub use annotations::*;
pub use constants::*;
pub use endpoint::*;
pub use ippool::*;
pub use reservedip::*;
pub use subnet::*;
