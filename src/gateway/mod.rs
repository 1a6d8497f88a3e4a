//! Datastore provisioning for managed (per-volume) storage

pub mod managed;

pub use managed::{ManagedStorageGateway, ProvisionStage};
