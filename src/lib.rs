//! Cluster Storage Orchestrator
//!
//! Storage orchestration for hypervisor clusters: volumes, templates and
//! snapshots on shared datastores, and per-volume managed iSCSI datastores
//! that are provisioned and torn down across every host of a cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Storage Orchestrator                                │
//! │        command routing, helper VMs, temporary snapshots, metrics            │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Datastore       │  │ Managed Storage │  │ Template / Snapshot         │  │
//! │  │ Layout Resolver │  │ Gateway         │  │ Pipeline (OVF, OVA)         │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           │           ┌────────┴────────┐                │                   │
//! │           │           │ Cluster Host    │                │                   │
//! │           │           │ Coordinator     │                │                   │
//! │           │           └────────┬────────┘                │                   │
//! ├───────────┴────────────────────┴─────────────────────────┴───────────────────┤
//! │                   Hypervisor Ports (domain::ports)                           │
//! │        inventory, host storage systems, datastore browser, VM manager       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Session Pool              │  │   Simulated Cluster                 │   │
//! │  │   (per-endpoint cache)      │  │   (in-memory hypervisor)            │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: command model and the storage orchestrator
//! - [`layout`]: where a disk's backing files live and how they move
//! - [`cluster`]: fan-out and convergence waits across cluster hosts
//! - [`gateway`]: managed iSCSI and NFS datastore lifecycle
//! - [`pipeline`]: export, packaging and publication of disk images
//! - [`session`]: hypervisor session pool
//! - [`sim`]: simulated hypervisor cluster
//! - [`domain`]: core domain types and ports
//! - [`error`]: error types and handling

pub mod cluster;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod layout;
pub mod pipeline;
pub mod session;
pub mod sim;

// Re-export commonly used types
pub use cluster::{ClusterHostCoordinator, DiscoveryPlan};

pub use config::{CoordinatorConfig, LayoutConfig, OrchestratorConfig, PipelineConfig};

pub use controlplane::{
    CommandMetrics, CopyCommand, ObjectDescriptor, ObjectType, PrimaryStore, StorageAnswer, StorageCommand,
    StorageOrchestrator, StoreRef,
};

pub use domain::model::{
    CloneMode, ControllerKind, Datastore, DiskLayout, ManagedStorageTarget, Template, VolumeKind,
};
pub use domain::path::DatastorePath;
pub use domain::ports::{
    ClusterInventory, DatastoreBrowser, HostStorageSystem, HypervisorSession, SessionConnector, SessionRef,
    VmManager,
};

pub use error::{Error, ErrorAction, Result};

pub use gateway::ManagedStorageGateway;
pub use layout::DatastoreLayoutResolver;
pub use pipeline::TemplateSnapshotPipeline;
pub use session::{OrchestratorContext, SessionPool};
pub use sim::{SimFault, SimulatedCluster};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
