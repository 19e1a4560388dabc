//! IPAM-specific error types.

use thiserror::Error;

use store::StoreError;

/// Errors surfaced by the IPAM core.
///
/// The CNI binding maps these to wire error codes; inside the core they
/// drive retry and rollback decisions.
#[derive(Debug, Error)]
pub enum IpamError {
    /// A required argument or dependency was not supplied.
    #[error("{0} must be specified")]
    MissingRequiredParam(String),

    /// The request or cluster objects are malformed.
    #[error("wrong input: {0}")]
    WrongInput(String),

    /// The Pod is in a phase that can never hold an allocation.
    #[error("{0}")]
    AbortUnallocatable(String),

    /// Every candidate pool was rejected or refused the allocation.
    #[error("no available IPPool: {0}")]
    NoAvailablePool(String),

    /// A pool's free capacity reached zero, observed during filtering.
    #[error("all IP addresses of IPPool {0} are used out")]
    IpUsedOut(String),

    /// A pool's free set was empty at allocation time.
    #[error("no free IP address in IPPool {0}")]
    PoolExhausted(String),

    /// Optimistic-concurrency retries exhausted on a Store update.
    #[error("exhausted retry budget ({retries} times): {detail}")]
    RetriesExhausted { retries: u32, detail: String },

    /// A Pod was recreated with the same name while its Endpoint is still
    /// being recycled.
    #[error(
        "the IP addresses of Pod {0} are still being recycled; two Pods with the same \
         namespace and name may have been created in a very short time"
    )]
    DeleteCreateRace(String),

    /// Cluster state violates an invariant the core relies on.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The caller's cancellation token fired.
    #[error("operation canceled")]
    Canceled,

    /// One or more pools failed to release their addresses.
    #[error("failed to release all allocated IP addresses: {0}")]
    ReleaseFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IpamError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, IpamError::Canceled)
    }
}

/// Formats a list of errors into one aggregate message.
pub(crate) fn aggregate<E: std::fmt::Display>(errs: &[E]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
