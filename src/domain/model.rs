//! Domain Model - storage objects managed across the cluster

use crate::domain::path::DatastorePath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Disk Layout
// =============================================================================

/// The two on-disk conventions for a virtual disk's backing files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskLayout {
    /// `[ds] disk.vmdk`, the legacy convention used for unowned disks
    RootFlat,
    /// `[ds] vmName/disk.vmdk`
    PerVmFolder,
}

impl std::fmt::Display for DiskLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskLayout::RootFlat => write!(f, "root-flat"),
            DiskLayout::PerVmFolder => write!(f, "per-vm-folder"),
        }
    }
}

// =============================================================================
// Managed Storage
// =============================================================================

/// CHAP credentials for an iSCSI session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapCredentials {
    pub initiator_username: String,
    pub initiator_secret: String,
    /// Mutual CHAP, when the target authenticates back
    pub target_username: Option<String>,
    pub target_secret: Option<String>,
}

/// Identifies a LUN on a storage system. A parameter, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedStorageTarget {
    pub iqn: String,
    pub storage_host: String,
    pub storage_port: u16,
    #[serde(default)]
    pub chap: Option<ChapCredentials>,
}

impl ManagedStorageTarget {
    pub fn new(iqn: impl Into<String>, storage_host: impl Into<String>, storage_port: u16) -> Self {
        Self {
            iqn: iqn.into(),
            storage_host: storage_host.into(),
            storage_port,
            chap: None,
        }
    }

    /// `host:port` address used for send-target discovery
    pub fn address(&self) -> String {
        format!("{}:{}", self.storage_host, self.storage_port)
    }

    /// Deterministic name of the datastore formatted on this LUN
    pub fn datastore_name(&self) -> String {
        managed_datastore_name(&self.iqn)
    }
}

/// Datastore name for a managed LUN. IQNs may carry `/` which is not a
/// legal datastore name character.
pub fn managed_datastore_name(iqn: &str) -> String {
    iqn.trim().replace('/', "-")
}

/// Datastore name for an NFS export registered under a pool unique id
pub fn nfs_datastore_name(unique_id: &str) -> String {
    unique_id.replace('-', "")
}

// =============================================================================
// Datastore
// =============================================================================

/// File system type of a datastore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    Vmfs,
    Nfs,
}

impl std::fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatastoreKind::Vmfs => write!(f, "vmfs"),
            DatastoreKind::Nfs => write!(f, "nfs"),
        }
    }
}

/// What a datastore is backed by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatastoreBacking {
    Lun {
        iqn: String,
        storage_host: String,
        storage_port: u16,
    },
    Nfs {
        host: String,
        export_path: String,
    },
    Local,
}

/// Mount state of a datastore on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostMount {
    pub mounted: bool,
    pub accessible: bool,
}

impl HostMount {
    pub fn ready() -> Self {
        Self {
            mounted: true,
            accessible: true,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.mounted && self.accessible
    }
}

/// A named storage volume mountable by the hosts of a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datastore {
    pub name: String,
    pub kind: DatastoreKind,
    pub backing: DatastoreBacking,
    pub cluster: Option<String>,
    pub capacity_bytes: u64,
    /// Mount state keyed by host name
    pub mounts: BTreeMap<String, HostMount>,
}

impl Datastore {
    /// Ready when every listed host has it mounted and accessible
    pub fn is_ready_on<S: AsRef<str>>(&self, hosts: &[S]) -> bool {
        hosts.iter().all(|h| {
            self.mounts
                .get(h.as_ref())
                .map(HostMount::is_ready)
                .unwrap_or(false)
        })
    }

    /// The managed target behind this datastore, if it was provisioned
    /// on demand from a LUN
    pub fn managed_target(&self) -> Option<ManagedStorageTarget> {
        match &self.backing {
            DatastoreBacking::Lun {
                iqn,
                storage_host,
                storage_port,
            } if managed_datastore_name(iqn) == self.name => Some(ManagedStorageTarget::new(
                iqn.clone(),
                storage_host.clone(),
                *storage_port,
            )),
            _ => None,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.managed_target().is_some()
    }

    pub fn root(&self) -> DatastorePath {
        DatastorePath::root(self.name.clone())
    }
}

// =============================================================================
// Volumes, Templates, Snapshots
// =============================================================================

/// Role of a volume for its owning VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Root,
    Data,
}

/// A virtual disk known to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u64,
    pub uuid: String,
    pub size_bytes: u64,
    /// Base name of the top-of-chain descriptor, without extension
    pub path: String,
    pub layout: DiskLayout,
    pub vm_name: Option<String>,
    /// Backing files from newest to base
    pub chain: Vec<DatastorePath>,
}

/// Single supported packaged-archive format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Ova,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Ova => "ova",
        }
    }
}

/// A published, read-only disk image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: u64,
    pub name: String,
    pub archive_path: String,
    pub format: ArchiveFormat,
    pub virtual_size: u64,
    pub physical_size: u64,
}

/// Point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub path: String,
    pub parent_path: Option<String>,
    pub volume_path: String,
}

// =============================================================================
// Virtual Machines
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Bus a virtual disk is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Scsi,
    Ide,
    Sata,
    Nvme,
}

impl ControllerKind {
    /// Whether a disk on this bus can grow while the VM runs
    pub fn supports_hot_extend(&self) -> bool {
        !matches!(self, ControllerKind::Ide)
    }
}

impl Default for ControllerKind {
    fn default() -> Self {
        ControllerKind::Scsi
    }
}

/// A disk device on a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    /// Descriptor chain from the current top to the base
    pub chain: Vec<DatastorePath>,
    pub controller: ControllerKind,
    pub capacity_bytes: u64,
}

impl VirtualDisk {
    pub fn top(&self) -> Option<&DatastorePath> {
        self.chain.first()
    }

    /// Whether any file in the chain is the given disk (by base name)
    pub fn backs(&self, base_name: &str) -> bool {
        self.chain
            .iter()
            .any(|p| p.disk_base_name().map(|b| b == base_name).unwrap_or(false))
    }
}

/// Inventory view of a virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub datastore: String,
    pub power: PowerState,
    pub disks: Vec<VirtualDisk>,
    pub snapshots: Vec<String>,
}

impl VmInfo {
    pub fn is_running(&self) -> bool {
        self.power == PowerState::PoweredOn
    }

    /// Find the disk whose chain contains the given base name
    pub fn disk_backed_by(&self, base_name: &str) -> Option<&VirtualDisk> {
        self.disks.iter().find(|d| d.backs(base_name))
    }
}

/// How a VM clone materializes its disks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CloneMode {
    /// Independent copy of every disk
    Full,
    /// Differencing disks against the named snapshot of the source
    Linked { snapshot: String },
}

// =============================================================================
// Host Storage
// =============================================================================

/// A statically configured iSCSI target on a host adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticTarget {
    pub iqn: String,
    pub address: String,
    pub port: u16,
    pub chap: Option<ChapCredentials>,
}

impl From<&ManagedStorageTarget> for StaticTarget {
    fn from(target: &ManagedStorageTarget) -> Self {
        Self {
            iqn: target.iqn.clone(),
            address: target.storage_host.clone(),
            port: target.storage_port,
            chap: target.chap.clone(),
        }
    }
}

/// Software iSCSI adapter of a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiAdapter {
    pub device: String,
    /// `host:port` entries configured for dynamic (send-target) discovery
    pub send_targets: Vec<String>,
    pub static_targets: Vec<StaticTarget>,
}

impl IscsiAdapter {
    pub fn discovers_dynamically(&self, address: &str) -> bool {
        self.send_targets.iter().any(|t| t == address)
    }
}

/// A SCSI disk as seen by one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiDisk {
    pub device_path: String,
    /// Canonical device id (`naa.*`)
    pub device_id: String,
    pub capacity_bytes: u64,
    /// IQNs of the targets this disk is reachable through
    pub target_iqns: Vec<String>,
    /// Already holds a VMFS partition
    pub claimed: bool,
}

/// A VMFS volume whose signature clashes with an existing datastore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedVolume {
    pub vmfs_label: String,
    pub extent_device_paths: Vec<String>,
}
