//! Spiderpool IPAM core
//!
//! The IP-address-management heart of the CNI plugin: invoked once per
//! container network-attach and once per detach, it selects the right
//! pools for a Pod's interfaces, leases addresses from them, durably
//! records the leases on the Pod's Endpoint and releases everything on
//! teardown.
//!
//! The crate is library-scope. The CNI wire binding, webhooks, informers
//! and controllers all live outside; the only way in is [`Ipam::allocate`]
//! and [`Ipam::release`], and the only way out to the cluster is the
//! [`store::Store`] threaded through the constructor.

pub mod candidate;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod ippool;
pub mod iprange;
pub mod limiter;
pub mod metrics;
pub mod pod;
pub mod routes;
pub mod selector;
pub mod types;

mod ipam;

pub use config::IpamConfig;
pub use error::IpamError;
pub use self::ipam::Ipam;
pub use limiter::{Limiter, LimiterConfig, LimiterError};
pub use metrics::IpamMetrics;
pub use types::{AddRequest, AddResponse, DelRequest, IPConfig, RouteConfig};
