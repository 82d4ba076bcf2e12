//! Load balancer boundary.
//!
//! The proxy does not manage cluster membership or health itself; it asks
//! an externally provided [`LoadBalancer`] for a host once routing has
//! resolved a cluster name. Pick failures are structured so the router can
//! increment the matching counter and answer with the right local reply.

use crate::{
    error::RoutingFailure,
    message::MessageMetadata,
};

/// Why a host pick failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickError {
    /// The named cluster is not configured.
    UnknownCluster,
    /// The cluster rejects new traffic.
    MaintenanceMode,
    /// The cluster has no healthy host.
    NoHealthyUpstream,
}

impl From<PickError> for RoutingFailure {
    fn from(error: PickError) -> Self {
        match error {
            PickError::UnknownCluster => Self::UnknownCluster,
            PickError::MaintenanceMode => Self::MaintenanceMode,
            PickError::NoHealthyUpstream => Self::NoHealthyUpstream,
        }
    }
}

/// Picks an upstream host from a cluster.
///
/// Implementations may consult the message for balancing context (for
/// example hashing on a header) but must not mutate it.
pub trait LoadBalancer: Send + Sync {
    /// Pick a host address for `cluster`.
    ///
    /// # Errors
    ///
    /// Returns a [`PickError`] naming why no host is available.
    fn pick_host(&self, cluster: &str, metadata: &MessageMetadata) -> Result<String, PickError>;
}
