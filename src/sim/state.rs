//! In-memory state behind the simulated cluster

use crate::domain::model::{
    ControllerKind, Datastore, HostMount, IscsiAdapter, PowerState, VirtualDisk, VmInfo,
};
use crate::domain::path::{DatastorePath, DISK_EXTENSION};
use crate::error::{Error, Result};
use crate::sim::{SimEvent, SimFault};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// Disks and data files are allocated in whole MiB
pub(crate) const ALLOCATION_UNIT: u64 = 1 << 20;
pub(crate) const DESCRIPTOR_SIZE: u64 = 512;
pub(crate) const DELTA_INITIAL_SIZE: u64 = 16 * ALLOCATION_UNIT;
pub(crate) const VMX_SIZE: u64 = 4096;
/// Space a fresh VMFS leaves unused until the datastore is expanded
pub(crate) const VMFS_RESERVED: u64 = 1 << 30;
pub(crate) const NFS_CAPACITY: u64 = 1 << 40;

const MAX_CHAIN_DEPTH: usize = 64;

pub(crate) fn round_to_allocation(bytes: u64) -> u64 {
    bytes.div_ceil(ALLOCATION_UNIT) * ALLOCATION_UNIT
}

/// Data file next to a descriptor: `dir/base.vmdk` -> `dir/base-<suffix>.vmdk`
pub(crate) fn data_file(descriptor: &DatastorePath, suffix: &str) -> DatastorePath {
    let folder = descriptor
        .parent()
        .unwrap_or_else(|| DatastorePath::root(descriptor.datastore()));
    let base = descriptor.disk_base_name().unwrap_or(descriptor.file_name());
    folder.join(&format!("{}-{}.{}", base, suffix, DISK_EXTENSION))
}

pub(crate) fn descriptor_in(folder: &DatastorePath, base: &str) -> DatastorePath {
    folder.join(&format!("{}.{}", base, DISK_EXTENSION))
}

// =============================================================================
// Files
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct DiskMeta {
    pub capacity_bytes: u64,
    pub parent: Option<DatastorePath>,
    /// Created by a VM snapshot rather than as a disk of its own
    pub snapshot_delta: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SimFile {
    pub size: u64,
    /// Present on disk descriptors
    pub disk: Option<DiskMeta>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FileTree {
    pub files: BTreeMap<String, SimFile>,
    pub folders: BTreeSet<String>,
}

impl FileTree {
    /// Create a folder and all its ancestors
    pub fn ensure_folder(&mut self, relative: &str) {
        let mut acc = String::new();
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(part);
            self.folders.insert(acc.clone());
        }
    }

    pub fn folder_exists(&self, relative: &str) -> bool {
        relative.is_empty() || self.folders.contains(relative)
    }

    pub fn parent_exists(&self, relative: &str) -> bool {
        match relative.rfind('/') {
            Some(idx) => self.folders.contains(&relative[..idx]),
            None => true,
        }
    }

    /// Names of files and folders directly inside a folder
    pub fn children(&self, relative: &str) -> Vec<String> {
        let prefix = if relative.is_empty() {
            String::new()
        } else {
            format!("{}/", relative)
        };
        let direct = |path: &String| -> Option<String> {
            let rest = path.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let mut names: Vec<String> = self
            .folders
            .iter()
            .filter_map(direct)
            .chain(self.files.keys().filter_map(direct))
            .collect();
        names.sort();
        names
    }

    pub fn remove_folder(&mut self, relative: &str) {
        let prefix = format!("{}/", relative);
        self.files.retain(|path, _| !path.starts_with(&prefix));
        self.folders
            .retain(|path| path != relative && !path.starts_with(&prefix));
    }
}

// =============================================================================
// Storage
// =============================================================================

pub(crate) struct DatastoreState {
    pub info: Datastore,
    /// Device id of the backing LUN
    pub lun: Option<String>,
    pub tree: FileTree,
}

/// A VMFS image on a LUN that clashes with an existing signature
#[derive(Debug, Clone)]
pub(crate) struct VolumeImage {
    pub label: String,
    pub tree: FileTree,
    pub capacity_bytes: u64,
}

pub(crate) struct LunState {
    pub device_id: String,
    pub iqn: String,
    /// `host:port` of the storage system portal
    pub address: String,
    pub capacity_bytes: u64,
    /// Datastore formatted on this LUN
    pub formatted: Option<String>,
    pub image: Option<VolumeImage>,
}

impl LunState {
    pub fn device_path(&self) -> String {
        format!("/vmfs/devices/disks/{}", self.device_id)
    }

    pub fn portal(&self) -> (String, u16) {
        match self.address.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(3260)),
            None => (self.address.clone(), 3260),
        }
    }
}

pub(crate) struct HostState {
    pub cluster: String,
    pub adapter: Option<IscsiAdapter>,
    pub visible_luns: BTreeSet<String>,
}

// =============================================================================
// Virtual Machines
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct SimDisk {
    pub top: DatastorePath,
    pub controller: ControllerKind,
}

#[derive(Debug, Clone)]
pub(crate) struct SimSnapshot {
    pub name: String,
    /// Top of each disk when the snapshot was taken
    pub tops: Vec<DatastorePath>,
}

#[derive(Debug, Clone)]
pub(crate) struct VmState {
    pub name: String,
    pub datastore: String,
    pub power: PowerState,
    pub disks: Vec<SimDisk>,
    pub snapshots: Vec<SimSnapshot>,
}

impl VmState {
    pub fn folder(&self) -> DatastorePath {
        DatastorePath::new(self.datastore.clone(), self.name.clone())
    }
}

// =============================================================================
// Whole Inventory
// =============================================================================

#[derive(Default)]
pub(crate) struct SimState {
    /// Host names per cluster, in inventory order
    pub clusters: BTreeMap<String, Vec<String>>,
    pub hosts: BTreeMap<String, HostState>,
    pub luns: BTreeMap<String, LunState>,
    pub datastores: BTreeMap<String, DatastoreState>,
    pub vms: BTreeMap<String, VmState>,
    pub faults: Vec<(String, SimFault)>,
    pub events: Vec<SimEvent>,
    pub next_lun: u64,
    pub next_signature: u32,
}

impl SimState {
    /// Fail with an injected fault for this operation, if one is pending
    pub fn check(&mut self, op: &str) -> Result<()> {
        match self.faults.iter().position(|(o, _)| o == op) {
            Some(idx) => {
                let (_, fault) = self.faults.remove(idx);
                Err(fault.into_error(op))
            }
            None => Ok(()),
        }
    }

    pub fn record(&mut self, op: &str, detail: impl Into<String>) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(SimEvent {
            seq,
            at: Utc::now(),
            op: op.to_string(),
            detail: detail.into(),
        });
    }

    pub fn host(&self, name: &str) -> Result<&HostState> {
        self.hosts.get(name).ok_or_else(|| Error::not_found("Host", name))
    }

    pub fn host_mut(&mut self, name: &str) -> Result<&mut HostState> {
        self.hosts.get_mut(name).ok_or_else(|| Error::not_found("Host", name))
    }

    pub fn datastore(&self, name: &str) -> Result<&DatastoreState> {
        self.datastores
            .get(name)
            .ok_or_else(|| Error::not_found("Datastore", name))
    }

    pub fn datastore_mut(&mut self, name: &str) -> Result<&mut DatastoreState> {
        self.datastores
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Datastore", name))
    }

    pub fn vm(&self, name: &str) -> Result<&VmState> {
        self.vms.get(name).ok_or_else(|| Error::not_found("VM", name))
    }

    pub fn vm_mut(&mut self, name: &str) -> Result<&mut VmState> {
        self.vms.get_mut(name).ok_or_else(|| Error::not_found("VM", name))
    }

    pub fn file(&self, path: &DatastorePath) -> Option<&SimFile> {
        self.datastores
            .get(path.datastore())
            .and_then(|ds| ds.tree.files.get(path.relative()))
    }

    pub fn file_mut(&mut self, path: &DatastorePath) -> Option<&mut SimFile> {
        self.datastores
            .get_mut(path.datastore())
            .and_then(|ds| ds.tree.files.get_mut(path.relative()))
    }

    pub fn insert_file(&mut self, path: &DatastorePath, file: SimFile) -> Result<()> {
        let ds = self.datastore_mut(path.datastore())?;
        ds.tree.files.insert(path.relative().to_string(), file);
        Ok(())
    }

    pub fn remove_file(&mut self, path: &DatastorePath) -> Option<SimFile> {
        self.datastores
            .get_mut(path.datastore())
            .and_then(|ds| ds.tree.files.remove(path.relative()))
    }

    /// Descriptor, flat and differencing files of one chain element
    pub fn remove_disk_files(&mut self, descriptor: &DatastorePath) {
        self.remove_file(descriptor);
        for suffix in ["flat", "delta", "sesparse"] {
            self.remove_file(&data_file(descriptor, suffix));
        }
    }

    /// Chain from `top` down to the base disk
    pub fn disk_chain(&self, top: &DatastorePath) -> Vec<DatastorePath> {
        let mut chain = vec![top.clone()];
        let mut current = top.clone();
        while chain.len() < MAX_CHAIN_DEPTH {
            let parent = self
                .file(&current)
                .and_then(|f| f.disk.as_ref())
                .and_then(|d| d.parent.clone());
            match parent {
                Some(parent) => {
                    chain.push(parent.clone());
                    current = parent;
                }
                None => break,
            }
        }
        chain
    }

    pub fn disk_capacity(&self, descriptor: &DatastorePath) -> u64 {
        self.file(descriptor)
            .and_then(|f| f.disk.as_ref())
            .map(|d| d.capacity_bytes)
            .unwrap_or(0)
    }

    pub fn vm_info(&self, vm: &VmState) -> VmInfo {
        VmInfo {
            name: vm.name.clone(),
            datastore: vm.datastore.clone(),
            power: vm.power,
            disks: vm
                .disks
                .iter()
                .map(|d| VirtualDisk {
                    chain: self.disk_chain(&d.top),
                    controller: d.controller,
                    capacity_bytes: self.disk_capacity(&d.top),
                })
                .collect(),
            snapshots: vm.snapshots.iter().map(|s| s.name.clone()).collect(),
        }
    }

    /// Repoint every reference to a moved file
    pub fn relink(&mut self, from: &DatastorePath, to: &DatastorePath) {
        for ds in self.datastores.values_mut() {
            for file in ds.tree.files.values_mut() {
                if let Some(meta) = file.disk.as_mut() {
                    if meta.parent.as_ref() == Some(from) {
                        meta.parent = Some(to.clone());
                    }
                }
            }
        }
        for vm in self.vms.values_mut() {
            for disk in vm.disks.iter_mut().filter(|d| &d.top == from) {
                disk.top = to.clone();
            }
            for snapshot in vm.snapshots.iter_mut() {
                for top in snapshot.tops.iter_mut().filter(|t| *t == from) {
                    *top = to.clone();
                }
            }
        }
    }

    /// Rewrite paths after a datastore rename
    pub fn rename_references(&mut self, old: &str, new: &str) {
        let rename = |p: &mut DatastorePath| {
            if p.datastore() == old {
                *p = DatastorePath::new(new, p.relative());
            }
        };
        for ds in self.datastores.values_mut() {
            for file in ds.tree.files.values_mut() {
                if let Some(parent) = file.disk.as_mut().and_then(|m| m.parent.as_mut()) {
                    rename(parent);
                }
            }
        }
        for vm in self.vms.values_mut() {
            if vm.datastore == old {
                vm.datastore = new.to_string();
            }
            vm.disks.iter_mut().for_each(|d| rename(&mut d.top));
            for snapshot in vm.snapshots.iter_mut() {
                snapshot.tops.iter_mut().for_each(rename);
            }
        }
    }

    pub fn lun_by_iqn(&self, iqn: &str) -> Option<&LunState> {
        self.luns.values().find(|l| l.iqn == iqn)
    }

    /// Whether a host's adapter reaches a LUN through a static or
    /// send-target entry
    pub fn reaches(&self, host: &HostState, lun: &LunState) -> bool {
        let Some(adapter) = host.adapter.as_ref() else {
            return false;
        };
        let (portal, port) = lun.portal();
        adapter.discovers_dynamically(&lun.address)
            || adapter
                .static_targets
                .iter()
                .any(|t| t.iqn == lun.iqn && t.address == portal && t.port == port)
    }

    pub fn cluster_hosts(&self, cluster: &str) -> Vec<String> {
        self.clusters.get(cluster).cloned().unwrap_or_default()
    }

    /// Mount a datastore as ready on a set of hosts
    pub fn mount_on(&mut self, datastore: &str, hosts: &[String]) -> Result<()> {
        let ds = self.datastore_mut(datastore)?;
        for host in hosts {
            ds.info.mounts.insert(host.clone(), HostMount::ready());
        }
        Ok(())
    }
}
