//! Simulated VM manager: disks with backing chains, snapshots with
//! consolidation, and OVF export/import through local directories.

use crate::domain::model::{CloneMode, ControllerKind, PowerState, VmInfo};
use crate::domain::path::DatastorePath;
use crate::domain::ports::{CloneSpec, VmManager, VmSpec};
use crate::error::{Error, Result};
use crate::pipeline::ovf::{OvfDisk, OvfEnvelope, OvfFile, OVF_EXTENSION};
use crate::sim::state::{
    data_file, descriptor_in, round_to_allocation, DiskMeta, SimDisk, SimFile, SimSnapshot, SimState,
    VmState, ALLOCATION_UNIT, DELTA_INITIAL_SIZE, DESCRIPTOR_SIZE, VMX_SIZE,
};
use crate::sim::SimulatedCluster;
use async_trait::async_trait;
use std::path::Path;

/// Upper bound on bytes written per exported disk
const EXPORT_CHUNK: u64 = 64 * 1024;

/// `disk-000003` -> `disk`
fn chain_root_name(base: &str) -> &str {
    match base.rsplit_once('-') {
        Some((root, n)) if n.len() == 6 && n.bytes().all(|b| b.is_ascii_digit()) => root,
        _ => base,
    }
}

/// Disk `index` of a VM named `vm`: `vm`, `vm_1`, `vm_2`...
fn disk_base(vm: &str, index: usize) -> String {
    if index == 0 {
        vm.to_string()
    } else {
        format!("{}_{}", vm, index)
    }
}

impl SimState {
    fn create_vm_folder(&mut self, name: &str, datastore: &str) -> Result<DatastorePath> {
        if self.vms.contains_key(name) {
            return Err(Error::already_exists("VM", name));
        }
        let folder = DatastorePath::new(datastore, name);
        let ds = self.datastore_mut(datastore)?;
        ds.tree.ensure_folder(folder.relative());
        ds.tree.files.insert(
            format!("{}/{}.vmx", name, name),
            SimFile {
                size: VMX_SIZE,
                disk: None,
            },
        );
        Ok(folder)
    }

    /// Descriptor plus flat data file
    fn write_flat_disk(&mut self, descriptor: &DatastorePath, capacity_bytes: u64) -> Result<()> {
        self.insert_file(
            descriptor,
            SimFile {
                size: DESCRIPTOR_SIZE,
                disk: Some(DiskMeta {
                    capacity_bytes,
                    parent: None,
                    snapshot_delta: false,
                }),
            },
        )?;
        self.insert_file(
            &data_file(descriptor, "flat"),
            SimFile {
                size: round_to_allocation(capacity_bytes),
                disk: None,
            },
        )
    }

    /// Descriptor plus delta data file on top of `parent`
    fn write_delta_disk(&mut self, descriptor: &DatastorePath, parent: &DatastorePath, snapshot_delta: bool) -> Result<()> {
        let capacity_bytes = self.disk_capacity(parent);
        self.insert_file(
            descriptor,
            SimFile {
                size: DESCRIPTOR_SIZE,
                disk: Some(DiskMeta {
                    capacity_bytes,
                    parent: Some(parent.clone()),
                    snapshot_delta,
                }),
            },
        )?;
        self.insert_file(
            &data_file(descriptor, "delta"),
            SimFile {
                size: DELTA_INITIAL_SIZE,
                disk: None,
            },
        )
    }

    fn is_snapshot_delta(&self, path: &DatastorePath) -> bool {
        self.file(path)
            .and_then(|f| f.disk.as_ref())
            .map(|d| d.snapshot_delta)
            .unwrap_or(false)
    }

    /// Merge everything above `target` into it and make it the disk's top
    fn collapse(&mut self, vm: &str, index: usize, target: &DatastorePath) -> Result<()> {
        let top = self.vm(vm)?.disks[index].top.clone();
        let chain = self.disk_chain(&top);
        if !chain.contains(target) {
            return Ok(());
        }
        for element in chain {
            if &element == target {
                break;
            }
            self.remove_disk_files(&element);
        }
        self.vm_mut(vm)?.disks[index].top = target.clone();
        Ok(())
    }
}

#[async_trait]
impl VmManager for SimulatedCluster {
    async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>> {
        let mut state = self.state().write();
        state.check("vm.find")?;
        Ok(state.vms.get(name).map(|vm| state.vm_info(vm)))
    }

    async fn list_vms(&self) -> Result<Vec<String>> {
        let mut state = self.state().write();
        state.check("vm.list")?;
        Ok(state.vms.keys().cloned().collect())
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.create")?;
        state.create_vm_folder(&spec.name, &spec.datastore)?;
        state.vms.insert(
            spec.name.clone(),
            VmState {
                name: spec.name.clone(),
                datastore: spec.datastore.clone(),
                power: PowerState::PoweredOff,
                disks: Vec::new(),
                snapshots: Vec::new(),
            },
        );
        state.record("vm.create", spec.name.clone());
        Ok(())
    }

    async fn clone_vm(&self, spec: &CloneSpec) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.clone")?;

        let source = state.vm(&spec.source_vm)?.clone();
        let selected: Vec<(usize, SimDisk)> = source
            .disks
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, d)| match &spec.only_disk {
                Some(only) => state.disk_chain(&d.top).contains(only),
                None => true,
            })
            .collect();
        if let Some(only) = &spec.only_disk {
            if selected.is_empty() {
                return Err(Error::not_found("Disk", format!("{} on {}", only, spec.source_vm)));
            }
        }

        let snapshot = match &spec.mode {
            CloneMode::Linked { snapshot } => Some(
                source
                    .snapshots
                    .iter()
                    .find(|s| &s.name == snapshot)
                    .cloned()
                    .ok_or_else(|| Error::not_found("Snapshot", format!("{} on {}", snapshot, spec.source_vm)))?,
            ),
            CloneMode::Full => None,
        };

        let folder = state.create_vm_folder(&spec.name, &spec.datastore)?;
        let mut disks = Vec::new();
        for (n, (index, disk)) in selected.into_iter().enumerate() {
            let descriptor = descriptor_in(&folder, &disk_base(&spec.name, n));
            match &snapshot {
                Some(snapshot) => {
                    let parent = snapshot.tops.get(index).cloned().unwrap_or(disk.top.clone());
                    state.write_delta_disk(&descriptor, &parent, false)?;
                }
                None => {
                    let capacity = state.disk_capacity(&disk.top);
                    state.write_flat_disk(&descriptor, capacity)?;
                }
            }
            disks.push(SimDisk {
                top: descriptor,
                controller: disk.controller,
            });
        }

        state.vms.insert(
            spec.name.clone(),
            VmState {
                name: spec.name.clone(),
                datastore: spec.datastore.clone(),
                power: PowerState::PoweredOff,
                disks,
                snapshots: Vec::new(),
            },
        );
        let mode = match &spec.mode {
            CloneMode::Full => "full".to_string(),
            CloneMode::Linked { snapshot } => format!("linked@{}", snapshot),
        };
        state.record("vm.clone", format!("{} -> {} ({})", spec.source_vm, spec.name, mode));
        Ok(())
    }

    async fn power_off(&self, vm: &str) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.power_off")?;
        state.vm_mut(vm)?.power = PowerState::PoweredOff;
        state.record("vm.power_off", vm.to_string());
        Ok(())
    }

    async fn destroy_vm(&self, vm: &str) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.destroy")?;

        let target = state.vm(vm)?.clone();
        if target.power == PowerState::PoweredOn {
            return Err(Error::ResourceBusy {
                resource: vm.to_string(),
                reason: "VM is powered on".into(),
            });
        }

        // Only files inside the VM's own folder belong to it; shared bases
        // of linked clones live elsewhere.
        let folder = target.folder();
        for disk in &target.disks {
            for element in state.disk_chain(&disk.top) {
                if element.parent().as_ref() == Some(&folder) {
                    state.remove_disk_files(&element);
                }
            }
        }
        state.remove_file(&folder.join(&format!("{}.vmx", vm)));
        if let Ok(ds) = state.datastore_mut(&target.datastore) {
            if ds.tree.children(folder.relative()).is_empty() {
                ds.tree.remove_folder(folder.relative());
            }
        }

        state.vms.remove(vm);
        state.record("vm.destroy", vm.to_string());
        Ok(())
    }

    async fn unregister_vm(&self, vm: &str) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.unregister")?;
        state
            .vms
            .remove(vm)
            .ok_or_else(|| Error::not_found("VM", vm))?;
        state.record("vm.unregister", vm.to_string());
        Ok(())
    }

    async fn create_virtual_disk(&self, path: &DatastorePath, capacity_bytes: u64) -> Result<()> {
        let mut state = self.state().write();
        state.check("disk.create")?;

        let ds = state.datastore(path.datastore())?;
        if !ds.tree.parent_exists(path.relative()) {
            return Err(Error::not_found("Folder", path.parent().map(|p| p.to_string()).unwrap_or_default()));
        }
        if ds.tree.files.contains_key(path.relative()) {
            return Err(Error::already_exists("Disk", path.to_string()));
        }
        state.write_flat_disk(path, capacity_bytes)?;
        state.record("disk.create", format!("{} {}", path, capacity_bytes));
        Ok(())
    }

    async fn attach_disk(&self, vm: &str, path: &DatastorePath, controller: ControllerKind) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.attach_disk")?;

        if state.file(path).is_none() {
            return Err(Error::not_found("Disk", path.to_string()));
        }
        let target = state.vm_mut(vm)?;
        if target.disks.iter().any(|d| &d.top == path) {
            return Ok(());
        }
        target.disks.push(SimDisk {
            top: path.clone(),
            controller,
        });
        state.record("vm.attach_disk", format!("{} {}", vm, path));
        Ok(())
    }

    async fn detach_disk(&self, vm: &str, path: &DatastorePath) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.detach_disk")?;

        let index = state
            .vm(vm)?
            .disks
            .iter()
            .position(|d| state.disk_chain(&d.top).contains(path))
            .ok_or_else(|| Error::not_found("Disk", format!("{} on {}", path, vm)))?;
        state.vm_mut(vm)?.disks.remove(index);
        state.record("vm.detach_disk", format!("{} {}", vm, path));
        Ok(())
    }

    async fn extend_disk(&self, path: &DatastorePath, capacity_bytes: u64) -> Result<()> {
        let mut state = self.state().write();
        state.check("disk.extend")?;

        let current = state
            .file(path)
            .and_then(|f| f.disk.as_ref())
            .map(|d| d.capacity_bytes)
            .ok_or_else(|| Error::not_found("Disk", path.to_string()))?;
        if capacity_bytes < current {
            return Err(Error::Validation(format!(
                "cannot shrink {} from {} to {} bytes",
                path, current, capacity_bytes
            )));
        }
        let live_on_fixed_bus = state.vms.values().any(|vm| {
            vm.power == PowerState::PoweredOn
                && vm
                    .disks
                    .iter()
                    .any(|d| &d.top == path && !d.controller.supports_hot_extend())
        });
        if live_on_fixed_bus {
            return Err(Error::ResourceBusy {
                resource: path.to_string(),
                reason: "disk controller does not support hot extend".into(),
            });
        }

        if let Some(meta) = state.file_mut(path).and_then(|f| f.disk.as_mut()) {
            meta.capacity_bytes = capacity_bytes;
        }
        if let Some(flat) = state.file_mut(&data_file(path, "flat")) {
            flat.size = round_to_allocation(capacity_bytes);
        }
        state.record("disk.extend", format!("{} {}", path, capacity_bytes));
        Ok(())
    }

    async fn create_snapshot(&self, vm: &str, name: &str) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.snapshot.create")?;

        let target = state.vm(vm)?.clone();
        if target.snapshots.iter().any(|s| s.name == name) {
            return Err(Error::already_exists("Snapshot", format!("{} on {}", name, vm)));
        }

        let mut tops = Vec::new();
        let mut new_tops = Vec::new();
        for disk in &target.disks {
            let folder = disk
                .top
                .parent()
                .unwrap_or_else(|| DatastorePath::root(disk.top.datastore()));
            let root = chain_root_name(disk.top.disk_base_name().unwrap_or_default()).to_string();
            let delta = (1..)
                .map(|n| descriptor_in(&folder, &format!("{}-{:06}", root, n)))
                .find(|candidate| state.file(candidate).is_none())
                .unwrap_or_else(|| descriptor_in(&folder, &root));
            state.write_delta_disk(&delta, &disk.top, true)?;
            tops.push(disk.top.clone());
            new_tops.push(delta);
        }

        let target = state.vm_mut(vm)?;
        for (disk, top) in target.disks.iter_mut().zip(new_tops) {
            disk.top = top;
        }
        target.snapshots.push(SimSnapshot {
            name: name.to_string(),
            tops,
        });
        state.record("vm.snapshot.create", format!("{} {}", vm, name));
        Ok(())
    }

    async fn remove_snapshot(&self, vm: &str, name: &str) -> Result<()> {
        let mut state = self.state().write();
        state.check("vm.snapshot.remove")?;

        let target = state.vm(vm)?.clone();
        let position = target
            .snapshots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::not_found("Snapshot", format!("{} on {}", name, vm)))?;
        let removed = target.snapshots[position].clone();
        let was_latest = position + 1 == target.snapshots.len();
        state.vm_mut(vm)?.snapshots.remove(position);
        let remaining = target.snapshots.len() - 1;

        if remaining == 0 {
            // Consolidate every disk down to its first non-snapshot ancestor
            for (index, disk) in target.disks.iter().enumerate() {
                let base = state
                    .disk_chain(&disk.top)
                    .into_iter()
                    .find(|p| !state.is_snapshot_delta(p))
                    .unwrap_or_else(|| disk.top.clone());
                state.collapse(vm, index, &base)?;
            }
        } else if was_latest {
            for (index, top) in removed.tops.iter().enumerate().take(target.disks.len()) {
                state.collapse(vm, index, top)?;
            }
        }

        state.record("vm.snapshot.remove", format!("{} {}", vm, name));
        Ok(())
    }

    async fn export_ovf(&self, vm: &str, dest_dir: &Path, base_name: &str) -> Result<()> {
        let capacities: Vec<u64> = {
            let mut state = self.state().write();
            state.check("vm.export")?;
            let target = state.vm(vm)?;
            if target.power == PowerState::PoweredOn && target.snapshots.is_empty() {
                return Err(Error::ResourceBusy {
                    resource: vm.to_string(),
                    reason: "cannot export a running VM without a snapshot".into(),
                });
            }
            target.disks.iter().map(|d| state.disk_capacity(&d.top)).collect()
        };

        tokio::fs::create_dir_all(dest_dir).await?;
        let mut envelope = OvfEnvelope {
            name: vm.to_string(),
            ..Default::default()
        };
        for (i, capacity) in capacities.iter().enumerate() {
            let href = format!("{}-disk{}.vmdk", base_name, i);
            let bytes = (*capacity).min(EXPORT_CHUNK) as usize;
            let content: Vec<u8> = (0..bytes).map(|b| (b % 251) as u8).collect();
            tokio::fs::write(dest_dir.join(&href), &content).await?;

            let id = format!("file{}", i + 1);
            envelope.files.push(OvfFile {
                id: id.clone(),
                href,
                size: content.len() as u64,
            });
            envelope
                .disks
                .push(OvfDisk::with_capacity(&format!("vmdisk{}", i + 1), &id, *capacity));
        }
        let descriptor = dest_dir.join(format!("{}.{}", base_name, OVF_EXTENSION));
        tokio::fs::write(&descriptor, envelope.render()).await?;

        self.state()
            .write()
            .record("vm.export", format!("{} {}", vm, descriptor.display()));
        Ok(())
    }

    async fn import_ovf(&self, descriptor: &Path, vm_name: &str, datastore: &str) -> Result<()> {
        self.state().write().check("vm.import")?;

        let envelope = OvfEnvelope::parse(&tokio::fs::read_to_string(descriptor).await?)?;
        let dir = descriptor.parent().unwrap_or_else(|| Path::new("."));
        let mut capacities = Vec::new();
        for disk in &envelope.disks {
            if let Some(file) = envelope.file(&disk.file_ref) {
                if !tokio::fs::try_exists(dir.join(&file.href)).await? {
                    return Err(Error::not_found("OVF disk file", file.href.clone()));
                }
            }
            capacities.push(disk.capacity_bytes()?);
        }

        let mut state = self.state().write();
        let folder = state.create_vm_folder(vm_name, datastore)?;
        let mut disks = Vec::new();
        for (i, capacity) in capacities.into_iter().enumerate() {
            let path = descriptor_in(&folder, &disk_base(vm_name, i));
            state.write_flat_disk(&path, capacity.max(ALLOCATION_UNIT))?;
            disks.push(SimDisk {
                top: path,
                controller: ControllerKind::default(),
            });
        }
        state.vms.insert(
            vm_name.to_string(),
            VmState {
                name: vm_name.to_string(),
                datastore: datastore.to_string(),
                power: PowerState::PoweredOff,
                disks,
                snapshots: Vec::new(),
            },
        );
        state.record("vm.import", format!("{} {}", vm_name, descriptor.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DatastoreBrowser;
    use assert_matches::assert_matches;

    const GIB: u64 = 1 << 30;

    fn p(s: &str) -> DatastorePath {
        s.parse().unwrap()
    }

    async fn sim_with_vm() -> SimulatedCluster {
        let sim = SimulatedCluster::builder()
            .cluster("c1", 1)
            .local_datastore("ds1", "c1", 1 << 40)
            .build();
        sim.create_vm(&VmSpec {
            name: "vm".into(),
            datastore: "ds1".into(),
        })
        .await
        .unwrap();
        sim.create_virtual_disk(&p("[ds1] vm/root.vmdk"), 2 * GIB).await.unwrap();
        sim.attach_disk("vm", &p("[ds1] vm/root.vmdk"), ControllerKind::Scsi)
            .await
            .unwrap();
        sim
    }

    #[test]
    fn test_chain_root_name() {
        assert_eq!(chain_root_name("disk-000003"), "disk");
        assert_eq!(chain_root_name("my-disk"), "my-disk");
    }

    #[tokio::test]
    async fn test_snapshot_and_consolidate() {
        let sim = sim_with_vm().await;

        sim.create_snapshot("vm", "s1").await.unwrap();
        sim.create_snapshot("vm", "s2").await.unwrap();
        let vm = sim.find_vm("vm").await.unwrap().unwrap();
        assert_eq!(vm.disks[0].chain.len(), 3);
        assert_eq!(vm.disks[0].top().unwrap(), &p("[ds1] vm/root-000002.vmdk"));

        sim.remove_snapshot("vm", "s2").await.unwrap();
        let vm = sim.find_vm("vm").await.unwrap().unwrap();
        assert_eq!(vm.disks[0].top().unwrap(), &p("[ds1] vm/root-000001.vmdk"));

        sim.remove_snapshot("vm", "s1").await.unwrap();
        let vm = sim.find_vm("vm").await.unwrap().unwrap();
        assert_eq!(vm.disks[0].chain, vec![p("[ds1] vm/root.vmdk")]);
        assert!(!sim.file_exists(&p("[ds1] vm/root-000001.vmdk")).await.unwrap());
    }

    #[tokio::test]
    async fn test_linked_clone_references_snapshot_state() {
        let sim = sim_with_vm().await;
        sim.create_snapshot("vm", "base").await.unwrap();

        sim.clone_vm(&CloneSpec {
            source_vm: "vm".into(),
            name: "copy".into(),
            datastore: "ds1".into(),
            mode: CloneMode::Linked {
                snapshot: "base".into(),
            },
            only_disk: None,
        })
        .await
        .unwrap();

        let copy = sim.find_vm("copy").await.unwrap().unwrap();
        assert_eq!(
            copy.disks[0].chain,
            vec![p("[ds1] copy/copy.vmdk"), p("[ds1] vm/root.vmdk")]
        );
        assert!(sim.file_exists(&p("[ds1] copy/copy-delta.vmdk")).await.unwrap());

        sim.destroy_vm("copy").await.unwrap();
        assert!(!sim.folder_exists(&p("[ds1] copy")).await.unwrap());
        assert!(sim.file_exists(&p("[ds1] vm/root.vmdk")).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_rules() {
        let sim = sim_with_vm().await;
        let root = p("[ds1] vm/root.vmdk");

        assert_matches!(sim.extend_disk(&root, GIB).await, Err(Error::Validation(_)));
        sim.extend_disk(&root, 4 * GIB).await.unwrap();
        assert_eq!(sim.file_size(&p("[ds1] vm/root-flat.vmdk")).await.unwrap(), 4 * GIB);

        sim.detach_disk("vm", &root).await.unwrap();
        sim.attach_disk("vm", &root, ControllerKind::Ide).await.unwrap();
        sim.set_power("vm", PowerState::PoweredOn);
        assert_matches!(
            sim.extend_disk(&root, 8 * GIB).await,
            Err(Error::ResourceBusy { .. })
        );
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let sim = sim_with_vm().await;
        let dir = tempfile::tempdir().unwrap();

        sim.set_power("vm", PowerState::PoweredOn);
        assert_matches!(
            sim.export_ovf("vm", dir.path(), "backup").await,
            Err(Error::ResourceBusy { .. })
        );
        sim.set_power("vm", PowerState::PoweredOff);

        sim.export_ovf("vm", dir.path(), "backup").await.unwrap();
        assert!(dir.path().join("backup.ovf").exists());
        assert!(dir.path().join("backup-disk0.vmdk").exists());

        sim.import_ovf(&dir.path().join("backup.ovf"), "restored", "ds1")
            .await
            .unwrap();
        let restored = sim.find_vm("restored").await.unwrap().unwrap();
        assert_eq!(restored.disks.len(), 1);
        assert_eq!(restored.disks[0].capacity_bytes, 2 * GIB);
        assert_eq!(restored.disks[0].top().unwrap(), &p("[ds1] restored/restored.vmdk"));
    }
}
