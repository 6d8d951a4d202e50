//! Cluster coordination plane (§4.A–C): transport, membership/election/
//! replication service, and request redirection.

pub mod api;
pub mod redirector;
pub mod service;
pub mod shared_state;
pub mod transport;

pub use redirector::Redirector;
pub use service::{ClusterEvent, ClusterService};
