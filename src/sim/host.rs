//! Simulated host storage system

use crate::domain::model::{
    Datastore, DatastoreBacking, DatastoreKind, HostMount, IscsiAdapter, ScsiDisk, StaticTarget,
    UnresolvedVolume,
};
use crate::domain::ports::HostStorageSystem;
use crate::error::{Error, Result};
use crate::sim::state::{DatastoreState, FileTree, SimState, NFS_CAPACITY, VMFS_RESERVED};
use crate::sim::{datastore_from_image, SimulatedCluster};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One host of the simulated inventory
pub struct SimHost {
    name: String,
    cluster: SimulatedCluster,
}

impl SimHost {
    pub(crate) fn new(name: &str, cluster: SimulatedCluster) -> Self {
        Self {
            name: name.to_string(),
            cluster,
        }
    }

    fn adapter_mut<'a>(&self, state: &'a mut SimState, device: &str) -> Result<&'a mut IscsiAdapter> {
        state
            .host_mut(&self.name)?
            .adapter
            .as_mut()
            .filter(|a| a.device == device)
            .ok_or_else(|| Error::not_found("iSCSI adapter", format!("{} on {}", device, self.name)))
    }

    fn cluster_name(&self, state: &SimState) -> Result<String> {
        Ok(state.host(&self.name)?.cluster.clone())
    }
}

#[async_trait]
impl HostStorageSystem for SimHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn iscsi_adapter(&self) -> Result<Option<IscsiAdapter>> {
        let mut state = self.cluster.state().write();
        state.check("host.iscsi_adapter")?;
        Ok(state.host(&self.name)?.adapter.clone())
    }

    async fn add_static_targets(&self, adapter: &str, targets: &[StaticTarget]) -> Result<()> {
        let mut state = self.cluster.state().write();
        state.check("host.add_static_target")?;

        let configured = self.adapter_mut(&mut state, adapter)?;
        let mut added = Vec::new();
        for target in targets {
            let present = configured
                .static_targets
                .iter()
                .any(|t| t.iqn == target.iqn && t.address == target.address && t.port == target.port);
            if !present {
                configured.static_targets.push(target.clone());
                added.push(target.iqn.clone());
            }
        }

        for iqn in added {
            state.record("host.add_static_target", format!("{} {}", self.name, iqn));
        }
        Ok(())
    }

    async fn remove_static_targets(&self, adapter: &str, targets: &[StaticTarget]) -> Result<()> {
        let mut state = self.cluster.state().write();
        state.check("host.remove_static_target")?;

        let configured = self.adapter_mut(&mut state, adapter)?;
        let before = configured.static_targets.len();
        configured
            .static_targets
            .retain(|t| !targets.iter().any(|r| r.iqn == t.iqn && r.address == t.address && r.port == t.port));
        let removed = before - configured.static_targets.len();

        if removed > 0 {
            for target in targets {
                state.record("host.remove_static_target", format!("{} {}", self.name, target.iqn));
            }
        }
        Ok(())
    }

    async fn rescan_all_hba(&self) -> Result<()> {
        let mut state = self.cluster.state().write();
        state.check("host.rescan_hba")?;

        let visible: Vec<String> = {
            let host = state.host(&self.name)?;
            state
                .luns
                .values()
                .filter(|lun| state.reaches(host, lun))
                .map(|lun| lun.device_id.clone())
                .collect()
        };

        // A datastore whose device vanished is dropped from this host
        let lost: Vec<String> = state
            .datastores
            .values()
            .filter(|ds| ds.lun.as_ref().map(|id| !visible.contains(id)).unwrap_or(false))
            .map(|ds| ds.info.name.clone())
            .collect();
        for name in lost {
            if let Some(ds) = state.datastores.get_mut(&name) {
                ds.info.mounts.remove(&self.name);
            }
        }

        state.host_mut(&self.name)?.visible_luns = visible.into_iter().collect();
        state.record("host.rescan_hba", self.name.clone());
        Ok(())
    }

    async fn rescan_vmfs(&self) -> Result<()> {
        let mut state = self.cluster.state().write();
        state.check("host.rescan_vmfs")?;

        let visible = state.host(&self.name)?.visible_luns.clone();
        let found: Vec<String> = state
            .datastores
            .values()
            .filter(|ds| ds.lun.as_ref().map(|id| visible.contains(id)).unwrap_or(false))
            .filter(|ds| !ds.info.mounts.contains_key(&self.name))
            .map(|ds| ds.info.name.clone())
            .collect();
        for name in found {
            state.mount_on(&name, std::slice::from_ref(&self.name))?;
        }

        state.record("host.rescan_vmfs", self.name.clone());
        Ok(())
    }

    async fn scsi_disks(&self) -> Result<Vec<ScsiDisk>> {
        let mut state = self.cluster.state().write();
        state.check("host.scsi_disks")?;

        let host = state.host(&self.name)?;
        Ok(host
            .visible_luns
            .iter()
            .filter_map(|id| state.luns.get(id))
            .map(|lun| ScsiDisk {
                device_path: lun.device_path(),
                device_id: lun.device_id.clone(),
                capacity_bytes: lun.capacity_bytes,
                target_iqns: vec![lun.iqn.clone()],
                claimed: lun.formatted.is_some() || lun.image.is_some(),
            })
            .collect())
    }

    async fn create_vmfs_datastore(&self, name: &str, disk: &ScsiDisk) -> Result<Datastore> {
        let mut state = self.cluster.state().write();
        state.check("host.create_vmfs")?;

        if state.datastores.contains_key(name) {
            return Err(Error::already_exists("Datastore", name));
        }
        if !state.host(&self.name)?.visible_luns.contains(&disk.device_id) {
            return Err(Error::not_found("SCSI disk", disk.device_path.clone()));
        }
        let cluster = self.cluster_name(&state)?;

        let lun = state
            .luns
            .get_mut(&disk.device_id)
            .ok_or_else(|| Error::not_found("SCSI disk", disk.device_path.clone()))?;
        if lun.formatted.is_some() {
            return Err(Error::ResourceBusy {
                resource: disk.device_path.clone(),
                reason: "disk already holds a VMFS partition".into(),
            });
        }
        lun.formatted = Some(name.to_string());
        let (storage_host, storage_port) = lun.portal();

        let info = Datastore {
            name: name.to_string(),
            kind: DatastoreKind::Vmfs,
            backing: DatastoreBacking::Lun {
                iqn: lun.iqn.clone(),
                storage_host,
                storage_port,
            },
            cluster: Some(cluster),
            capacity_bytes: lun.capacity_bytes.saturating_sub(VMFS_RESERVED),
            mounts: BTreeMap::from([(self.name.clone(), HostMount::ready())]),
        };
        state.datastores.insert(
            name.to_string(),
            DatastoreState {
                info: info.clone(),
                lun: Some(disk.device_id.clone()),
                tree: FileTree::default(),
            },
        );
        state.record("host.create_vmfs", format!("{} {}", self.name, name));
        Ok(info)
    }

    async fn create_nfs_datastore(&self, name: &str, host: &str, export_path: &str) -> Result<Datastore> {
        let mut state = self.cluster.state().write();
        state.check("host.create_nfs")?;

        if state.datastores.contains_key(name) {
            return Err(Error::already_exists("Datastore", name));
        }
        let cluster = self.cluster_name(&state)?;
        let hosts = state.cluster_hosts(&cluster);

        state.datastores.insert(
            name.to_string(),
            DatastoreState {
                info: Datastore {
                    name: name.to_string(),
                    kind: DatastoreKind::Nfs,
                    backing: DatastoreBacking::Nfs {
                        host: host.to_string(),
                        export_path: export_path.to_string(),
                    },
                    cluster: Some(cluster),
                    capacity_bytes: NFS_CAPACITY,
                    mounts: BTreeMap::new(),
                },
                lun: None,
                tree: FileTree::default(),
            },
        );
        state.mount_on(name, &hosts)?;
        state.record("host.create_nfs", format!("{} {}", self.name, name));
        Ok(state.datastore(name)?.info.clone())
    }

    async fn expand_datastore(&self, name: &str) -> Result<()> {
        let mut state = self.cluster.state().write();
        state.check("host.expand_datastore")?;

        let device = state
            .datastore(name)?
            .lun
            .clone()
            .ok_or_else(|| Error::Validation(format!("datastore {} is not on a LUN", name)))?;
        let capacity = state
            .luns
            .get(&device)
            .map(|l| l.capacity_bytes)
            .ok_or_else(|| Error::not_found("SCSI disk", device.clone()))?;

        state.datastore_mut(name)?.info.capacity_bytes = capacity;
        state.record("host.expand_datastore", format!("{} {}", self.name, name));
        Ok(())
    }

    async fn unresolved_volumes(&self) -> Result<Vec<UnresolvedVolume>> {
        let mut state = self.cluster.state().write();
        state.check("host.unresolved_volumes")?;

        let host = state.host(&self.name)?;
        Ok(host
            .visible_luns
            .iter()
            .filter_map(|id| state.luns.get(id))
            .filter_map(|lun| {
                lun.image.as_ref().map(|image| UnresolvedVolume {
                    vmfs_label: image.label.clone(),
                    extent_device_paths: vec![lun.device_path()],
                })
            })
            .collect())
    }

    async fn resignature(&self, extent_device_paths: &[String]) -> Result<String> {
        let mut state = self.cluster.state().write();
        state.check("host.resignature")?;

        let visible = state.host(&self.name)?.visible_luns.clone();
        let device = state
            .luns
            .values()
            .find(|l| l.image.is_some() && visible.contains(&l.device_id) && extent_device_paths.contains(&l.device_path()))
            .map(|l| l.device_id.clone())
            .ok_or_else(|| Error::not_found("Unresolved VMFS volume", extent_device_paths.join(",")))?;
        let cluster = self.cluster_name(&state)?;

        let mut name;
        loop {
            state.next_signature += 1;
            let label = state
                .luns
                .get(&device)
                .and_then(|l| l.image.as_ref())
                .map(|i| i.label.clone())
                .unwrap_or_default();
            name = format!("snap-{:08x}-{}", state.next_signature, label);
            if !state.datastores.contains_key(&name) {
                break;
            }
        }

        let lun = state
            .luns
            .get_mut(&device)
            .ok_or_else(|| Error::not_found("SCSI disk", device.clone()))?;
        let image = lun
            .image
            .take()
            .ok_or_else(|| Error::not_found("Unresolved VMFS volume", device.clone()))?;
        lun.formatted = Some(name.clone());
        let mut ds = datastore_from_image(&name, lun, image, &cluster);
        ds.info.mounts.insert(self.name.clone(), HostMount::ready());

        state.datastores.insert(name.clone(), ds);
        state.record("host.resignature", format!("{} {}", self.name, name));
        Ok(name)
    }

    async fn mount_datastore(&self, name: &str) -> Result<()> {
        let mut state = self.cluster.state().write();
        state.check("host.mount")?;

        let visible = state.host(&self.name)?.visible_luns.clone();
        let ds = state.datastore_mut(name)?;
        if let Some(device) = ds.lun.as_ref() {
            if !visible.contains(device) {
                return Err(Error::ResourceBusy {
                    resource: name.to_string(),
                    reason: format!("backing device not visible on {}", self.name),
                });
            }
        }
        ds.info.mounts.insert(self.name.clone(), HostMount::ready());
        state.record("host.mount", format!("{} {}", self.name, name));
        Ok(())
    }

    async fn unmount_datastore(&self, name: &str) -> Result<()> {
        let mut state = self.cluster.state().write();
        state.check("host.unmount")?;

        if state
            .vms
            .values()
            .any(|vm| vm.datastore == name && vm.power == crate::domain::model::PowerState::PoweredOn)
        {
            return Err(Error::ResourceBusy {
                resource: name.to_string(),
                reason: "a running VM lives on this datastore".into(),
            });
        }

        let host = self.name.clone();
        let mount = state
            .datastore_mut(name)?
            .info
            .mounts
            .get_mut(&host)
            .ok_or_else(|| Error::not_found("Mount", format!("{} on {}", name, host)))?;
        *mount = HostMount::default();
        state.record("host.unmount", format!("{} {}", self.name, name));
        Ok(())
    }

    async fn datastore_mount(&self, name: &str) -> Result<Option<HostMount>> {
        let mut state = self.cluster.state().write();
        state.check("host.datastore_mount")?;
        Ok(state
            .datastores
            .get(name)
            .and_then(|ds| ds.info.mounts.get(&self.name))
            .copied())
    }
}
