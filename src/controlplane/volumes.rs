//! Volume lifecycle: create, clone, delete, attach, detach, resize

use crate::controlplane::command::{ObjectDescriptor, ObjectType, PrimaryStore, StorageAnswer};
use crate::controlplane::helper::HelperVm;
use crate::controlplane::orchestrator::{clone_strategy, StorageOrchestrator};
use crate::domain::model::{CloneMode, ControllerKind, ManagedStorageTarget, VmInfo};
use crate::domain::path::{DatastorePath, DISK_EXTENSION};
use crate::domain::ports::{CloneSpec, SessionRef};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

fn require_path(volume: &ObjectDescriptor) -> Result<&str> {
    if volume.path.is_empty() {
        return Err(Error::Validation("volume has no path".into()));
    }
    Ok(&volume.path)
}

/// Whether a disk sits where the layout conventions put it for `vm`
fn in_conventional_place(disk: &DatastorePath, vm: &str) -> bool {
    match disk.parent() {
        Some(parent) => parent.is_root() || parent.relative() == vm,
        None => true,
    }
}

impl StorageOrchestrator {
    /// Create a blank disk at the datastore root through a helper VM
    pub(super) async fn create_volume(
        &self,
        session: &SessionRef,
        volume: &ObjectDescriptor,
        context: &BTreeMap<String, String>,
    ) -> Result<StorageAnswer> {
        let store = volume.store.primary()?;
        let datastore = self.resolve_datastore(session, store).await?;
        let base = volume.base_name();
        let size = volume.size;
        let vms = session.vms();
        let files = session.files();

        let helper = HelperVm::create(vms.clone(), &self.helper_name(context), &datastore.name).await?;
        let disk = helper.folder().join(&format!("{}.{}", base, DISK_EXTENSION));
        let controller = self.config.default_controller;

        let created = helper
            .run(|name| {
                let base = base.clone();
                async move {
                    vms.create_virtual_disk(&disk, size).await?;
                    vms.attach_disk(&name, &disk, controller).await?;
                    vms.detach_disk(&name, &disk).await?;
                    self.resolver
                        .sync_to_root_folder(files.as_ref(), disk.datastore(), &name, &base)
                        .await
                }
            })
            .await?;

        info!("Created volume {} ({} bytes)", created, size);
        let mut updated = volume.clone();
        updated.path = base;
        updated.vm_name = None;
        Ok(StorageAnswer::ok(Some(updated))
            .with_detail("datastore", &datastore.name)
            .with_detail("descriptor", &created))
    }

    /// Clone a template VM's root disk into a new volume. An ISO source has
    /// no disk to clone, so a blank volume is created instead.
    pub(super) async fn clone_volume_from_template(
        &self,
        session: &SessionRef,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
        context: &BTreeMap<String, String>,
    ) -> Result<StorageAnswer> {
        if source.object_type == ObjectType::Iso {
            debug!("No template to clone from ISO {}, creating blank volume", source.path);
            return self.create_volume(session, destination, context).await;
        }

        let store = destination.store.primary()?;
        let datastore = self.resolve_datastore(session, store).await?;
        let template_vm = source.name.clone().unwrap_or_else(|| source.path.clone());
        let vms = session.vms();
        let files = session.files();

        let template = vms
            .find_vm(&template_vm)
            .await?
            .ok_or_else(|| Error::not_found("Template VM", template_vm.as_str()))?;
        let template_size = if source.size > 0 {
            source.size
        } else {
            template.disks.first().map(|d| d.capacity_bytes).unwrap_or(0)
        };

        let requested = destination.size;
        let mode = clone_strategy(requested, template_size, &self.config.template_base_snapshot);
        let base = destination.base_name();
        info!(
            "Cloning {} from template {} ({:?}, requested {} bytes, template {} bytes)",
            base, template_vm, mode, requested, template_size
        );

        let wrapper = HelperVm::clone_from(
            vms.clone(),
            &CloneSpec {
                source_vm: template_vm,
                name: base.clone(),
                datastore: datastore.name.clone(),
                mode: mode.clone(),
                only_disk: None,
            },
        )
        .await?;
        let wrapper_folder = wrapper.folder();
        let grow = mode == CloneMode::Full;
        let files_ref = &files;

        let root = wrapper
            .run(|name| async move {
                let info = vms
                    .find_vm(&name)
                    .await?
                    .ok_or_else(|| Error::not_found("VM", name.as_str()))?;
                let first = info
                    .disks
                    .first()
                    .ok_or_else(|| Error::not_found("Disk", format!("root disk of {}", name)))?;
                let top = first
                    .top()
                    .cloned()
                    .ok_or_else(|| Error::not_found("Disk", format!("root disk of {}", name)))?;
                let disk_base = top
                    .disk_base_name()
                    .ok_or_else(|| Error::Validation(format!("{} is not a disk descriptor", top)))?
                    .to_string();

                vms.detach_disk(&name, &top).await?;
                let moved = self
                    .resolver
                    .sync_to_root_folder(files_ref.as_ref(), top.datastore(), &name, &disk_base)
                    .await?;
                if grow && requested > first.capacity_bytes {
                    vms.extend_disk(&moved, requested).await?;
                }
                Ok(moved)
            })
            .await?;

        self.resolver
            .remove_folder_if_empty(files.as_ref(), &wrapper_folder)
            .await?;

        let mut updated = destination.clone();
        updated.path = root.disk_base_name().unwrap_or(&base).to_string();
        updated.size = requested.max(template_size);
        let mode_name = match mode {
            CloneMode::Full => "full",
            CloneMode::Linked { .. } => "linked",
        };
        Ok(StorageAnswer::ok(Some(updated))
            .with_detail("clone_mode", mode_name)
            .with_detail("descriptor", &root))
    }

    pub(super) async fn delete_volume(&self, session: &SessionRef, volume: &ObjectDescriptor) -> Result<StorageAnswer> {
        let store = volume.store.primary()?;
        require_path(volume)?;

        if volume.is_root() {
            if let Some(vm) = &volume.vm_name {
                if let Some(owner) = session.vms().find_vm(vm).await? {
                    return self.delete_root_with_vm(session, store, volume, owner).await;
                }
            }
        }
        self.delete_standalone(session, store, volume).await
    }

    /// Tear down the VM owning a root volume. Managed datastores behind the
    /// VM are released only after the VM is gone.
    async fn delete_root_with_vm(
        &self,
        session: &SessionRef,
        store: &PrimaryStore,
        volume: &ObjectDescriptor,
        owner: VmInfo,
    ) -> Result<StorageAnswer> {
        let vms = session.vms();
        let inventory = session.inventory();
        let files = session.files();
        info!("Deleting root volume {} with its VM {}", volume.path, owner.name);

        if owner.is_running() {
            vms.power_off(&owner.name).await?;
        }

        let mut backing: BTreeSet<String> = owner
            .disk_backed_by(&volume.path)
            .map(|d| d.chain.iter().map(|p| p.datastore().to_string()).collect())
            .unwrap_or_default();
        backing.insert(owner.datastore.clone());

        let mut managed: Vec<(String, ManagedStorageTarget)> = Vec::new();
        for name in &backing {
            if let Some(ds) = inventory.find_datastore(name).await? {
                if let Some(target) = ds.managed_target() {
                    managed.push((ds.name.clone(), target));
                }
            }
        }

        let mut returned = 0usize;
        for disk in owner.disks.iter().filter(|d| !d.backs(&volume.path)) {
            if let Some(top) = disk.top() {
                debug!("Detaching {} from {} before teardown", top, owner.name);
                vms.detach_disk(&owner.name, top).await?;
                // back to the root layout so another VM can take it
                if top.top_folder() == Some(owner.name.as_str()) {
                    if let Some(base) = top.disk_base_name() {
                        self.resolver
                            .sync_to_root_folder(files.as_ref(), top.datastore(), &owner.name, base)
                            .await?;
                        returned += 1;
                    }
                }
            }
        }

        if managed.is_empty() {
            vms.destroy_vm(&owner.name).await?;
        } else {
            vms.unregister_vm(&owner.name).await?;
        }

        for (name, target) in &managed {
            self.gateway.teardown(session, &store.cluster, name, target).await?;
        }

        Ok(StorageAnswer::ok(None)
            .with_detail("released_datastores", managed.len())
            .with_detail("returned_disks", returned))
    }

    async fn delete_standalone(
        &self,
        session: &SessionRef,
        store: &PrimaryStore,
        volume: &ObjectDescriptor,
    ) -> Result<StorageAnswer> {
        let vms = session.vms();
        let files = session.files();
        let datastore = store.datastore_name();
        let mut removed = 0;

        if session.inventory().find_datastore(&datastore).await?.is_some() {
            match self
                .resolver
                .locate(files.as_ref(), &datastore, volume.vm_name.as_deref(), &volume.path)
                .await
            {
                Ok(disk) => {
                    if let Some(vm) = &volume.vm_name {
                        let attached = vms
                            .find_vm(vm)
                            .await?
                            .map(|info| info.disk_backed_by(&volume.path).is_some())
                            .unwrap_or(false);
                        if attached {
                            vms.detach_disk(vm, &disk).await?;
                        }
                    }
                    removed = self.resolver.delete_disk(files.as_ref(), &disk).await?;
                    if let Some(parent) = disk.parent() {
                        self.resolver.remove_folder_if_empty(files.as_ref(), &parent).await?;
                    }
                    info!("Deleted volume {} ({} file(s))", disk, removed);
                }
                Err(e) if e.is_not_found() => debug!("Volume {} already gone from {}", volume.path, datastore),
                Err(e) => return Err(e),
            }
        }

        if let Some(target) = &store.managed {
            self.gateway
                .teardown(session, &store.cluster, &datastore, target)
                .await?;
        }
        Ok(StorageAnswer::ok(None).with_detail("deleted_files", removed))
    }

    pub(super) async fn attach_volume(
        &self,
        session: &SessionRef,
        volume: &ObjectDescriptor,
        vm_name: &str,
        controller: ControllerKind,
    ) -> Result<StorageAnswer> {
        let store = volume.store.primary()?;
        let base = require_path(volume)?;
        let vms = session.vms();
        let files = session.files();

        let owner = vms
            .find_vm(vm_name)
            .await?
            .ok_or_else(|| Error::not_found("VM", vm_name))?;
        let datastore = self.resolve_datastore(session, store).await?;

        let grow_to = (store.managed.is_some() && datastore.capacity_bytes > volume.size)
            .then_some(datastore.capacity_bytes);
        if grow_to.is_some() && owner.is_running() && !controller.supports_hot_extend() {
            return Err(Error::ResourceBusy {
                resource: format!("{}/{}", vm_name, base),
                reason: format!("{:?} disks cannot grow while the VM is running", controller),
            });
        }

        let located = match self
            .resolver
            .locate(files.as_ref(), &datastore.name, Some(vm_name), base)
            .await
        {
            Ok(path) => Some(path),
            Err(e) if e.is_not_found() && store.managed.is_some() => None,
            Err(e) => return Err(e),
        };

        let disk = match located {
            None => {
                let fresh = DatastorePath::new(datastore.name.as_str(), format!("{}.{}", base, DISK_EXTENSION));
                info!("Creating {} on fresh datastore {}", fresh, datastore.name);
                vms.create_virtual_disk(&fresh, volume.size).await?;
                self.resolver
                    .sync_to_canonical_folder(files.as_ref(), &datastore.name, vm_name, base)
                    .await?
            }
            Some(path) if in_conventional_place(&path, vm_name) => {
                self.resolver
                    .sync_to_canonical_folder(files.as_ref(), &datastore.name, vm_name, base)
                    .await?
            }
            Some(path) => path,
        };

        let mut size = volume.size;
        if let Some(capacity) = grow_to {
            info!("Growing {} to the {} bytes of its LUN", disk, capacity);
            vms.extend_disk(&disk, capacity).await?;
            size = capacity;
        }

        vms.attach_disk(vm_name, &disk, controller).await?;
        info!("Attached {} to {}", disk, vm_name);

        let mut updated = volume.clone();
        updated.vm_name = Some(vm_name.to_string());
        updated.size = size;
        Ok(StorageAnswer::ok(Some(updated)).with_detail("descriptor", &disk))
    }

    pub(super) async fn detach_volume(
        &self,
        session: &SessionRef,
        volume: &ObjectDescriptor,
        vm_name: &str,
    ) -> Result<StorageAnswer> {
        let store = volume.store.primary()?;
        let base = require_path(volume)?;
        let vms = session.vms();
        let files = session.files();
        let datastore = store.datastore_name();

        let disk = self
            .resolver
            .locate(files.as_ref(), &datastore, Some(vm_name), base)
            .await?;
        vms.detach_disk(vm_name, &disk).await?;

        let in_vm_folder = disk.parent().map(|p| p.relative() == vm_name).unwrap_or(false);
        let disk = if in_vm_folder {
            self.resolver
                .sync_to_root_folder(files.as_ref(), &datastore, vm_name, base)
                .await?
        } else {
            disk
        };
        info!("Detached {} from {}", disk, vm_name);

        if let Some(target) = &store.managed {
            self.gateway
                .teardown(session, &store.cluster, &datastore, target)
                .await?;
        }

        let mut updated = volume.clone();
        updated.vm_name = None;
        Ok(StorageAnswer::ok(Some(updated)).with_detail("descriptor", &disk))
    }

    pub(super) async fn resize_volume(
        &self,
        session: &SessionRef,
        volume: &ObjectDescriptor,
        new_size: u64,
    ) -> Result<StorageAnswer> {
        let store = volume.store.primary()?;
        let base = require_path(volume)?;
        if new_size < volume.size {
            return Err(Error::Validation(format!(
                "cannot shrink {} from {} to {} bytes",
                base, volume.size, new_size
            )));
        }

        let vms = session.vms();
        let files = session.files();
        let disk = self
            .resolver
            .locate(files.as_ref(), &store.datastore_name(), volume.vm_name.as_deref(), base)
            .await?;

        if let Some(vm) = &volume.vm_name {
            if let Some(owner) = vms.find_vm(vm).await? {
                let fixed_bus = owner
                    .disk_backed_by(base)
                    .map(|d| !d.controller.supports_hot_extend())
                    .unwrap_or(false);
                if owner.is_running() && fixed_bus {
                    return Err(Error::ResourceBusy {
                        resource: disk.to_string(),
                        reason: format!("{} is running and the disk bus cannot grow live", vm),
                    });
                }
            }
        }

        if new_size > volume.size {
            vms.extend_disk(&disk, new_size).await?;
            info!("Resized {} to {} bytes", disk, new_size);
        }

        let mut updated = volume.clone();
        updated.size = new_size;
        Ok(StorageAnswer::ok(Some(updated)))
    }
}

#[cfg(test)]
mod tests {
    use crate::controlplane::command::{
        CopyCommand, ObjectDescriptor, ObjectType, StorageCommand, StoreRef,
    };
    use crate::controlplane::testing::{p, Fixture, GIB};
    use crate::domain::model::{ControllerKind, PowerState, VolumeKind};
    use crate::domain::ports::{DatastoreBrowser, VmManager, VmSpec};
    use crate::layout::DatastoreLayoutResolver;
    use crate::sim::SimFault;
    use std::collections::BTreeMap;

    fn create(volume: ObjectDescriptor) -> StorageCommand {
        StorageCommand::CreateVolume {
            volume,
            context: BTreeMap::new(),
        }
    }

    fn copy(source: ObjectDescriptor, destination: ObjectDescriptor) -> StorageCommand {
        StorageCommand::Copy(CopyCommand {
            source,
            destination,
            wait_seconds: Some(600),
            context: BTreeMap::new(),
        })
    }

    async fn make_vm(fx: &Fixture, name: &str, datastore: &str) {
        fx.sim
            .create_vm(&VmSpec {
                name: name.into(),
                datastore: datastore.into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_volume_leaves_no_helper() {
        let fx = Fixture::new(2).await;
        let before = fx.sim.vm_names();

        let answer = fx.orchestrator.execute(create(fx.volume("data1", 10 * GIB))).await;
        assert!(answer.success, "{:?}", answer.error_message);
        let updated = answer.updated.unwrap();
        assert_eq!(updated.path, "data1");

        let resolver = DatastoreLayoutResolver::default();
        let located = resolver.locate(&fx.sim, "ds1", None, &updated.path).await.unwrap();
        assert_eq!(located, p("[ds1] data1.vmdk"));
        assert!(fx.sim.file_size(&p("[ds1] data1-flat.vmdk")).await.unwrap() >= 10 * GIB);
        assert_eq!(fx.sim.vm_names(), before);
        assert_eq!(fx.sim.list_files("ds1"), vec!["data1-flat.vmdk", "data1.vmdk"]);
    }

    #[tokio::test]
    async fn test_create_volume_releases_helper_on_failure() {
        let fx = Fixture::new(1).await;
        fx.sim.inject_fault("vm.attach_disk", SimFault::Failure("bus full".into()));

        let answer = fx.orchestrator.execute(create(fx.volume("data1", GIB))).await;
        assert!(!answer.success);
        assert!(fx.sim.vm_names().is_empty());
        assert!(fx.sim.event_log().iter().any(|e| e.starts_with("vm.destroy helper-")));
    }

    #[tokio::test]
    async fn test_clone_strategy_follows_requested_size() {
        let fx = Fixture::new(1).await;
        make_vm(&fx, "tmpl", "ds1").await;
        fx.sim.create_virtual_disk(&p("[ds1] tmpl/tmpl.vmdk"), 2 * GIB).await.unwrap();
        fx.sim
            .attach_disk("tmpl", &p("[ds1] tmpl/tmpl.vmdk"), ControllerKind::Scsi)
            .await
            .unwrap();
        fx.sim.create_snapshot("tmpl", "cloud.template.base").await.unwrap();

        let template = ObjectDescriptor::new(ObjectType::Template, "tmpl", StoreRef::Primary(fx.primary()))
            .with_size(2 * GIB);

        let linked = fx
            .orchestrator
            .execute(copy(template.clone(), fx.volume("root1", 2 * GIB)))
            .await;
        assert!(linked.success, "{:?}", linked.error_message);
        assert_eq!(linked.details["clone_mode"], "linked");
        assert!(fx.sim.file_exists(&p("[ds1] root1-delta.vmdk")).await.unwrap());
        assert!(!fx.sim.folder_exists(&p("[ds1] root1")).await.unwrap());

        let full = fx
            .orchestrator
            .execute(copy(template, fx.volume("root2", 4 * GIB)))
            .await;
        assert!(full.success, "{:?}", full.error_message);
        assert_eq!(full.details["clone_mode"], "full");
        assert_eq!(fx.sim.file_size(&p("[ds1] root2-flat.vmdk")).await.unwrap(), 4 * GIB);
        assert_eq!(fx.sim.vm_names(), vec!["tmpl"]);
    }

    #[tokio::test]
    async fn test_attach_and_detach_move_between_layouts() {
        let fx = Fixture::new(1).await;
        make_vm(&fx, "vm1", "ds1").await;
        assert!(fx.orchestrator.execute(create(fx.volume("data1", GIB))).await.success);

        let attach = StorageCommand::AttachVolume {
            volume: fx.volume("data1", GIB),
            vm_name: "vm1".into(),
            controller: None,
        };
        assert!(fx.orchestrator.execute(attach.clone()).await.success);
        assert!(fx.orchestrator.execute(attach).await.success);
        assert!(fx.sim.file_exists(&p("[ds1] vm1/data1-flat.vmdk")).await.unwrap());
        let vm = fx.sim.find_vm("vm1").await.unwrap().unwrap();
        assert_eq!(vm.disks.len(), 1);

        let answer = fx
            .orchestrator
            .execute(StorageCommand::DetachVolume {
                volume: fx.volume("data1", GIB).with_vm("vm1"),
                vm_name: "vm1".into(),
            })
            .await;
        assert!(answer.success, "{:?}", answer.error_message);
        assert!(fx.sim.file_exists(&p("[ds1] data1.vmdk")).await.unwrap());
        assert!(fx.sim.find_vm("vm1").await.unwrap().unwrap().disks.is_empty());
    }

    #[tokio::test]
    async fn test_attach_managed_grows_to_lun() {
        let fx = Fixture::new(2).await;
        let store = fx.managed_primary("iqn.2024-01.com.example:vol7", 20 * GIB);
        let volume = ObjectDescriptor::new(ObjectType::Volume, "vol7", StoreRef::Primary(store)).with_size(10 * GIB);
        let datastore = "iqn.2024-01.com.example:vol7";

        make_vm(&fx, "vm1", "ds1").await;
        fx.sim.set_power("vm1", PowerState::PoweredOn);

        let ide = fx
            .orchestrator
            .execute(StorageCommand::AttachVolume {
                volume: volume.clone(),
                vm_name: "vm1".into(),
                controller: Some(ControllerKind::Ide),
            })
            .await;
        assert!(!ide.success);
        assert!(ide.error_message.unwrap().contains("Resource busy"));
        assert!(fx.sim.find_vm("vm1").await.unwrap().unwrap().disks.is_empty());

        let answer = fx
            .orchestrator
            .execute(StorageCommand::AttachVolume {
                volume,
                vm_name: "vm1".into(),
                controller: None,
            })
            .await;
        assert!(answer.success, "{:?}", answer.error_message);
        assert_eq!(answer.updated.unwrap().size, 20 * GIB);
        for host in fx.sim.host_names("c1") {
            assert!(fx.sim.is_mounted(&host, datastore));
        }
        let descriptor = p(&format!("[{}] vm1/vol7.vmdk", datastore));
        assert!(fx.sim.file_exists(&descriptor).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_managed_root_releases_target_after_vm() {
        let fx = Fixture::new(2).await;
        let iqn = "iqn.2024-01.com.example:root9";
        let store = fx.managed_primary(iqn, 20 * GIB);
        let mut volume = ObjectDescriptor::new(ObjectType::Volume, "root9", StoreRef::Primary(store)).with_size(20 * GIB);
        volume.volume_kind = Some(VolumeKind::Root);

        assert!(fx.orchestrator.execute(create(volume.clone())).await.success);
        make_vm(&fx, "vm9", iqn).await;
        let attach = fx
            .orchestrator
            .execute(StorageCommand::AttachVolume {
                volume: volume.clone(),
                vm_name: "vm9".into(),
                controller: None,
            })
            .await;
        assert!(attach.success, "{:?}", attach.error_message);
        fx.sim.set_power("vm9", PowerState::PoweredOn);

        let answer = fx
            .orchestrator
            .execute(StorageCommand::DeleteVolume {
                volume: volume.with_vm("vm9"),
            })
            .await;
        assert!(answer.success, "{:?}", answer.error_message);

        assert!(!fx.sim.vm_names().contains(&"vm9".to_string()));
        for host in fx.sim.host_names("c1") {
            assert!(fx.sim.static_targets(&host).is_empty());
            assert!(!fx.sim.is_mounted(&host, iqn));
        }

        let log = fx.sim.event_log();
        let position = |prefix: &str| log.iter().position(|e| e.starts_with(prefix));
        let unregistered = position("vm.unregister vm9").unwrap();
        let target_removed = position("host.remove_static_target").unwrap();
        let unmounted = position("host.unmount").unwrap();
        assert!(unregistered < target_removed);
        assert!(unregistered < unmounted);
        assert!(position("vm.power_off vm9").unwrap() < unregistered);
    }

    #[tokio::test]
    async fn test_delete_root_returns_data_disks_to_root() {
        let fx = Fixture::new(1).await;
        make_vm(&fx, "vm9", "ds1").await;
        let root = p("[ds1] vm9/root9.vmdk");
        fx.sim.create_virtual_disk(&root, GIB).await.unwrap();
        fx.sim.attach_disk("vm9", &root, ControllerKind::Scsi).await.unwrap();

        assert!(fx.orchestrator.execute(create(fx.volume("data1", GIB))).await.success);
        let attach = fx
            .orchestrator
            .execute(StorageCommand::AttachVolume {
                volume: fx.volume("data1", GIB),
                vm_name: "vm9".into(),
                controller: None,
            })
            .await;
        assert!(attach.success, "{:?}", attach.error_message);
        assert!(fx.sim.file_exists(&p("[ds1] vm9/data1.vmdk")).await.unwrap());

        let mut volume = fx.volume("root9", GIB).with_vm("vm9");
        volume.volume_kind = Some(VolumeKind::Root);
        let answer = fx
            .orchestrator
            .execute(StorageCommand::DeleteVolume { volume })
            .await;
        assert!(answer.success, "{:?}", answer.error_message);
        assert_eq!(answer.details["returned_disks"], "1");

        assert!(!fx.sim.vm_names().contains(&"vm9".to_string()));
        assert!(fx.sim.file_exists(&p("[ds1] data1.vmdk")).await.unwrap());
        assert!(fx.sim.file_exists(&p("[ds1] data1-flat.vmdk")).await.unwrap());
        assert!(!fx.sim.file_exists(&p("[ds1] vm9/data1.vmdk")).await.unwrap());
        assert!(!fx.sim.file_exists(&p("[ds1] vm9/root9.vmdk")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_standalone_volume() {
        let fx = Fixture::new(1).await;
        assert!(fx.orchestrator.execute(create(fx.volume("data1", GIB))).await.success);

        let delete = StorageCommand::DeleteVolume {
            volume: fx.volume("data1", GIB),
        };
        let answer = fx.orchestrator.execute(delete.clone()).await;
        assert!(answer.success);
        assert_eq!(answer.details["deleted_files"], "2");
        assert!(fx.sim.list_files("ds1").is_empty());

        // already gone is not an error
        let again = fx.orchestrator.execute(delete).await;
        assert!(again.success);
        assert_eq!(again.details["deleted_files"], "0");
    }

    #[tokio::test]
    async fn test_resize_rules() {
        let fx = Fixture::new(1).await;
        make_vm(&fx, "vm1", "ds1").await;
        assert!(fx.orchestrator.execute(create(fx.volume("data1", 2 * GIB))).await.success);

        let shrink = fx
            .orchestrator
            .execute(StorageCommand::ResizeVolume {
                volume: fx.volume("data1", 2 * GIB),
                new_size: GIB,
            })
            .await;
        assert!(!shrink.success);

        let attach = StorageCommand::AttachVolume {
            volume: fx.volume("data1", 2 * GIB),
            vm_name: "vm1".into(),
            controller: Some(ControllerKind::Ide),
        };
        assert!(fx.orchestrator.execute(attach).await.success);
        fx.sim.set_power("vm1", PowerState::PoweredOn);

        let live = fx
            .orchestrator
            .execute(StorageCommand::ResizeVolume {
                volume: fx.volume("data1", 2 * GIB).with_vm("vm1"),
                new_size: 4 * GIB,
            })
            .await;
        assert!(!live.success);
        assert!(live.error_message.unwrap().contains("Resource busy"));

        fx.sim.set_power("vm1", PowerState::PoweredOff);
        let offline = fx
            .orchestrator
            .execute(StorageCommand::ResizeVolume {
                volume: fx.volume("data1", 2 * GIB).with_vm("vm1"),
                new_size: 4 * GIB,
            })
            .await;
        assert!(offline.success, "{:?}", offline.error_message);
        assert_eq!(fx.sim.file_size(&p("[ds1] vm1/data1-flat.vmdk")).await.unwrap(), 4 * GIB);
    }
}
