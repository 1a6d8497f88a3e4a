//! Storage Control Plane
//!
//! Entry point for storage commands sent by the cloud management tier.
//! Commands are routed to volume, template and snapshot flows which combine
//! the layout resolver, the managed storage gateway and the template
//! pipeline.

pub mod command;
pub mod helper;
pub mod metrics;
pub mod orchestrator;

mod snapshots;
mod templates;
mod volumes;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{
    route, CopyCommand, CopyOperation, NfsExport, ObjectDescriptor, ObjectType, PrimaryStore, StorageAnswer,
    StorageCommand, StoreRef, StoreRole,
};
pub use helper::HelperVm;
pub use metrics::CommandMetrics;
pub use orchestrator::{clone_strategy, StorageOrchestrator, WORKER_NAME_KEY};
