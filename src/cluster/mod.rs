//! Cluster-wide host coordination
//!
//! - [`coordinator`]: parallel fan-out and convergence waits
//! - [`discovery`]: dynamic vs. static iSCSI discovery per host

pub mod coordinator;
pub mod discovery;

pub use coordinator::{datastore_ready_on, datastore_visible_on, ClusterHostCoordinator};
pub use discovery::{classify_discovery, DiscoveredHost, DiscoveryPlan};
