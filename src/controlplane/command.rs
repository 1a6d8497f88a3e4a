//! Storage commands and answers
//!
//! Requests arrive as a tagged union. Copy requests are further routed by
//! the (type, store role) of their source and destination.

use crate::domain::model::{ControllerKind, ManagedStorageTarget, VolumeKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// =============================================================================
// Object Descriptors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Volume,
    Template,
    Snapshot,
    Iso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    Primary,
    Secondary,
}

/// NFS export a primary datastore is created from on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsExport {
    pub host: String,
    pub export_path: String,
    /// Pool unique id the datastore name is derived from
    pub unique_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryStore {
    /// Datastore name; ignored when `managed` or `nfs` is set
    #[serde(default)]
    pub datastore: String,
    pub cluster: String,
    #[serde(default)]
    pub managed: Option<ManagedStorageTarget>,
    #[serde(default)]
    pub nfs: Option<NfsExport>,
}

impl PrimaryStore {
    /// Name of the datastore this store maps to, without provisioning it
    pub fn datastore_name(&self) -> String {
        if let Some(target) = &self.managed {
            return target.datastore_name();
        }
        if let Some(nfs) = &self.nfs {
            return crate::domain::model::nfs_datastore_name(&nfs.unique_id);
        }
        self.datastore.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum StoreRef {
    Primary(PrimaryStore),
    Secondary {
        url: String,
        /// Local directory the export is mounted on
        mount_point: PathBuf,
    },
}

impl StoreRef {
    pub fn role(&self) -> StoreRole {
        match self {
            StoreRef::Primary(_) => StoreRole::Primary,
            StoreRef::Secondary { .. } => StoreRole::Secondary,
        }
    }

    pub fn primary(&self) -> Result<&PrimaryStore> {
        match self {
            StoreRef::Primary(store) => Ok(store),
            StoreRef::Secondary { url, .. } => Err(Error::Validation(format!("{} is not a primary store", url))),
        }
    }

    /// Local mount of a secondary store. Only NFS exports are supported.
    pub fn secondary_root(&self, operation: &str) -> Result<&Path> {
        match self {
            StoreRef::Secondary { url, mount_point } => {
                let protocol = url.split_once("://").map(|(p, _)| p).unwrap_or("");
                if protocol != "nfs" {
                    return Err(Error::UnsupportedProtocol {
                        protocol: protocol.to_string(),
                        operation: operation.to_string(),
                    });
                }
                Ok(mount_point)
            }
            StoreRef::Primary(store) => Err(Error::Validation(format!(
                "datastore {} is not a secondary store",
                store.datastore_name()
            ))),
        }
    }
}

/// One side of a storage request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub object_type: ObjectType,
    /// Disk base name on primary storage; path relative to the mount on
    /// secondary storage
    #[serde(default)]
    pub path: String,
    pub store: StoreRef,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub uuid: Option<String>,
    /// Unique name of a template
    #[serde(default)]
    pub name: Option<String>,
    /// Owning VM of a volume
    #[serde(default)]
    pub vm_name: Option<String>,
    #[serde(default)]
    pub volume_kind: Option<VolumeKind>,
    /// Volume a snapshot was taken from
    #[serde(default)]
    pub volume: Option<Box<ObjectDescriptor>>,
}

impl ObjectDescriptor {
    pub fn new(object_type: ObjectType, path: impl Into<String>, store: StoreRef) -> Self {
        Self {
            object_type,
            path: path.into(),
            store,
            size: 0,
            id: 0,
            uuid: None,
            name: None,
            vm_name: None,
            volume_kind: None,
            volume: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_vm(mut self, vm_name: impl Into<String>) -> Self {
        self.vm_name = Some(vm_name.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_volume(mut self, volume: ObjectDescriptor) -> Self {
        self.volume = Some(Box::new(volume));
        self
    }

    pub fn is_root(&self) -> bool {
        self.volume_kind == Some(VolumeKind::Root)
    }

    /// Directory of this object under its secondary-store mount. A path
    /// naming an archive resolves to the archive's directory.
    pub fn secondary_dir(&self, operation: &str) -> Result<PathBuf> {
        let root = self.store.secondary_root(operation)?;
        let relative = Path::new(&self.path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Validation(format!(
                "secondary path {} escapes the store mount",
                self.path
            )));
        }
        let relative = match relative.extension().and_then(|e| e.to_str()) {
            Some("ova") | Some("ovf") => relative.parent().unwrap_or(Path::new("")),
            _ => relative,
        };
        Ok(root.join(relative))
    }

    /// Base name for a new object: the path when given, else the uuid
    /// without dashes, else a fresh one
    pub fn base_name(&self) -> String {
        if !self.path.is_empty() {
            return self.path.clone();
        }
        match &self.uuid {
            Some(uuid) => uuid.replace('-', ""),
            None => uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCommand {
    pub source: ObjectDescriptor,
    pub destination: ObjectDescriptor,
    /// Wait budget of the dispatching tier. Not enforced here.
    #[serde(default)]
    pub wait_seconds: Option<u64>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StorageCommand {
    Copy(CopyCommand),
    CreateVolume {
        volume: ObjectDescriptor,
        #[serde(default)]
        context: BTreeMap<String, String>,
    },
    DeleteVolume {
        volume: ObjectDescriptor,
    },
    AttachVolume {
        volume: ObjectDescriptor,
        vm_name: String,
        #[serde(default)]
        controller: Option<ControllerKind>,
    },
    DetachVolume {
        volume: ObjectDescriptor,
        vm_name: String,
    },
    ResizeVolume {
        volume: ObjectDescriptor,
        new_size: u64,
    },
    DeleteSnapshot {
        snapshot: ObjectDescriptor,
    },
    ResignatureDatastore {
        cluster: String,
        scsi_device_id: String,
        target: ManagedStorageTarget,
    },
}

impl StorageCommand {
    /// Operation name used in logs, metrics and error context
    pub fn operation(&self) -> Result<&'static str> {
        Ok(match self {
            StorageCommand::Copy(copy) => route(&copy.source, &copy.destination)?.name(),
            StorageCommand::CreateVolume { .. } => "createVolume",
            StorageCommand::DeleteVolume { .. } => "deleteVolume",
            StorageCommand::AttachVolume { .. } => "attachVolume",
            StorageCommand::DetachVolume { .. } => "detachVolume",
            StorageCommand::ResizeVolume { .. } => "resizeVolume",
            StorageCommand::DeleteSnapshot { .. } => "deleteSnapshot",
            StorageCommand::ResignatureDatastore { .. } => "resignatureDatastore",
        })
    }
}

// =============================================================================
// Copy Routing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOperation {
    CopyTemplateToPrimary,
    CloneVolumeFromTemplate,
    CreateTemplateFromVolume,
    BackupSnapshot,
    CreateTemplateFromSnapshot,
    CreateVolumeFromSnapshot,
    CopyVolumeToSecondary,
    CopyVolumeFromSecondary,
}

impl CopyOperation {
    pub fn name(&self) -> &'static str {
        match self {
            CopyOperation::CopyTemplateToPrimary => "copyTemplateToPrimary",
            CopyOperation::CloneVolumeFromTemplate => "cloneVolumeFromTemplate",
            CopyOperation::CreateTemplateFromVolume => "createTemplateFromVolume",
            CopyOperation::BackupSnapshot => "backupSnapshot",
            CopyOperation::CreateTemplateFromSnapshot => "createTemplateFromSnapshot",
            CopyOperation::CreateVolumeFromSnapshot => "createVolumeFromSnapshot",
            CopyOperation::CopyVolumeToSecondary => "copyVolumeToSecondary",
            CopyOperation::CopyVolumeFromSecondary => "copyVolumeFromSecondary",
        }
    }
}

type RouteKey = (ObjectType, StoreRole, ObjectType, StoreRole);

const COPY_ROUTES: &[(RouteKey, CopyOperation)] = {
    use CopyOperation::*;
    use ObjectType::*;
    use StoreRole::*;
    &[
        ((Template, Secondary, Template, Primary), CopyTemplateToPrimary),
        ((Template, Primary, Volume, Primary), CloneVolumeFromTemplate),
        ((Iso, Secondary, Volume, Primary), CloneVolumeFromTemplate),
        ((Volume, Primary, Template, Secondary), CreateTemplateFromVolume),
        ((Snapshot, Primary, Snapshot, Secondary), BackupSnapshot),
        ((Snapshot, Secondary, Template, Secondary), CreateTemplateFromSnapshot),
        ((Snapshot, Primary, Template, Secondary), CreateTemplateFromSnapshot),
        ((Snapshot, Secondary, Volume, Primary), CreateVolumeFromSnapshot),
        ((Volume, Primary, Volume, Secondary), CopyVolumeToSecondary),
        ((Volume, Secondary, Volume, Primary), CopyVolumeFromSecondary),
    ]
};

/// Pick the copy operation for a source/destination pair
pub fn route(source: &ObjectDescriptor, destination: &ObjectDescriptor) -> Result<CopyOperation> {
    let key = (
        source.object_type,
        source.store.role(),
        destination.object_type,
        destination.store.role(),
    );
    COPY_ROUTES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, op)| *op)
        .ok_or_else(|| {
            Error::Validation(format!(
                "no copy route from {:?} on {:?} to {:?} on {:?}",
                key.0, key.1, key.2, key.3
            ))
        })
}

// =============================================================================
// Answers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAnswer {
    pub success: bool,
    pub error_message: Option<String>,
    pub updated: Option<ObjectDescriptor>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl StorageAnswer {
    pub fn ok(updated: Option<ObjectDescriptor>) -> Self {
        Self {
            success: true,
            error_message: None,
            updated,
            details: BTreeMap::new(),
        }
    }

    pub fn failed(err: &Error) -> Self {
        Self {
            success: false,
            error_message: Some(err.to_string()),
            updated: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}
