//! Domain Ports - boundaries between orchestration logic and the hypervisor
//!
//! The orchestrator never talks to a hypervisor directly. A session hands out
//! the four ports below; adapters (a management API client, or the in-memory
//! simulator in [`crate::sim`]) implement them.

use crate::domain::model::{
    CloneMode, ControllerKind, Datastore, HostMount, IscsiAdapter, ScsiDisk, StaticTarget,
    UnresolvedVolume, VmInfo,
};
use crate::domain::path::DatastorePath;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Host Storage System Port
// =============================================================================

/// Storage configuration of a single host.
///
/// Calls for one host are issued sequentially by the orchestrator; calls for
/// different hosts may run concurrently.
#[async_trait]
pub trait HostStorageSystem: Send + Sync {
    /// Host name, unique within the inventory
    fn name(&self) -> &str;

    /// The software iSCSI adapter, `None` when the host has none
    async fn iscsi_adapter(&self) -> Result<Option<IscsiAdapter>>;

    async fn add_static_targets(&self, adapter: &str, targets: &[StaticTarget]) -> Result<()>;

    async fn remove_static_targets(&self, adapter: &str, targets: &[StaticTarget]) -> Result<()>;

    /// Rescan every host bus adapter for new devices
    async fn rescan_all_hba(&self) -> Result<()>;

    /// Rescan for VMFS volumes on visible devices
    async fn rescan_vmfs(&self) -> Result<()>;

    /// SCSI disks visible to this host
    async fn scsi_disks(&self) -> Result<Vec<ScsiDisk>>;

    async fn create_vmfs_datastore(&self, name: &str, disk: &ScsiDisk) -> Result<Datastore>;

    async fn create_nfs_datastore(&self, name: &str, host: &str, export_path: &str) -> Result<Datastore>;

    /// Grow a VMFS datastore over the free space of its extent
    async fn expand_datastore(&self, name: &str) -> Result<()>;

    async fn unresolved_volumes(&self) -> Result<Vec<UnresolvedVolume>>;

    /// Assign a fresh signature to the volume on the given extents.
    /// Returns the name of the resulting datastore.
    async fn resignature(&self, extent_device_paths: &[String]) -> Result<String>;

    async fn mount_datastore(&self, name: &str) -> Result<()>;

    async fn unmount_datastore(&self, name: &str) -> Result<()>;

    /// Mount state of a datastore, `None` when this host does not know it
    async fn datastore_mount(&self, name: &str) -> Result<Option<HostMount>>;
}

pub type HostHandle = Arc<dyn HostStorageSystem>;

// =============================================================================
// Cluster Inventory Port
// =============================================================================

#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// Hosts of a cluster, in stable inventory order
    async fn cluster_hosts(&self, cluster: &str) -> Result<Vec<HostHandle>>;

    async fn find_datastore(&self, name: &str) -> Result<Option<Datastore>>;

    async fn rename_datastore(&self, current: &str, new_name: &str) -> Result<()>;
}

// =============================================================================
// Datastore File Port
// =============================================================================

#[async_trait]
pub trait DatastoreBrowser: Send + Sync {
    async fn file_exists(&self, path: &DatastorePath) -> Result<bool>;

    async fn folder_exists(&self, path: &DatastorePath) -> Result<bool>;

    /// Create a folder; succeeds if it already exists
    async fn make_directory(&self, path: &DatastorePath) -> Result<()>;

    /// Move a file. Fails if the source is missing or the destination exists.
    async fn move_file(&self, from: &DatastorePath, to: &DatastorePath) -> Result<()>;

    async fn delete_file(&self, path: &DatastorePath) -> Result<()>;

    /// Delete a folder and everything below it
    async fn delete_folder(&self, path: &DatastorePath) -> Result<()>;

    /// Names of the files and folders directly inside a folder
    async fn list_folder(&self, path: &DatastorePath) -> Result<Vec<String>>;

    /// Recursively search a datastore for a file name, skipping folders
    /// named in `exclude`, descending at most `max_depth` levels
    async fn search(
        &self,
        datastore: &str,
        file_name: &str,
        exclude: &[String],
        max_depth: usize,
    ) -> Result<Vec<DatastorePath>>;

    /// Size of a file in bytes
    async fn file_size(&self, path: &DatastorePath) -> Result<u64>;
}

// =============================================================================
// Virtual Machine Port
// =============================================================================

/// Parameters for creating an empty VM
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub datastore: String,
}

/// Parameters for cloning a VM
#[derive(Debug, Clone)]
pub struct CloneSpec {
    pub source_vm: String,
    pub name: String,
    pub datastore: String,
    pub mode: CloneMode,
    /// Clone only the disk whose chain contains this descriptor
    pub only_disk: Option<DatastorePath>,
}

#[async_trait]
pub trait VmManager: Send + Sync {
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>>;

    async fn list_vms(&self) -> Result<Vec<String>>;

    async fn create_vm(&self, spec: &VmSpec) -> Result<()>;

    async fn clone_vm(&self, spec: &CloneSpec) -> Result<()>;

    async fn power_off(&self, vm: &str) -> Result<()>;

    /// Remove the VM and delete every file it owns
    async fn destroy_vm(&self, vm: &str) -> Result<()>;

    /// Remove the VM from inventory, leaving files in place
    async fn unregister_vm(&self, vm: &str) -> Result<()>;

    /// Create a standalone virtual disk (descriptor plus flat data file)
    async fn create_virtual_disk(&self, path: &DatastorePath, capacity_bytes: u64) -> Result<()>;

    async fn attach_disk(&self, vm: &str, path: &DatastorePath, controller: ControllerKind) -> Result<()>;

    /// Remove a disk device from the VM, keeping its files
    async fn detach_disk(&self, vm: &str, path: &DatastorePath) -> Result<()>;

    async fn extend_disk(&self, path: &DatastorePath, capacity_bytes: u64) -> Result<()>;

    async fn create_snapshot(&self, vm: &str, name: &str) -> Result<()>;

    /// Remove a snapshot, consolidating the disk chain
    async fn remove_snapshot(&self, vm: &str, name: &str) -> Result<()>;

    /// Export the VM as a descriptor plus data files into a local directory
    async fn export_ovf(&self, vm: &str, dest_dir: &Path, base_name: &str) -> Result<()>;

    /// Import a descriptor from a local directory as a new VM
    async fn import_ovf(&self, descriptor: &Path, vm_name: &str, datastore: &str) -> Result<()>;
}

// =============================================================================
// Session Port
// =============================================================================

/// An authenticated connection to the hypervisor management endpoint
pub trait HypervisorSession: Send + Sync {
    fn endpoint(&self) -> &str;

    fn inventory(&self) -> Arc<dyn ClusterInventory>;

    fn files(&self) -> Arc<dyn DatastoreBrowser>;

    fn vms(&self) -> Arc<dyn VmManager>;
}

pub type SessionRef = Arc<dyn HypervisorSession>;

/// Establishes sessions against an endpoint
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<SessionRef>;
}
