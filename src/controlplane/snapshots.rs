//! Volume snapshot backups on secondary storage

use crate::controlplane::command::{ObjectDescriptor, StorageAnswer};
use crate::controlplane::orchestrator::StorageOrchestrator;
use crate::domain::ports::SessionRef;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

impl StorageOrchestrator {
    /// Export the current state of a snapshot's volume into a fresh backup
    /// directory on secondary storage.
    ///
    /// The answer carries the volume's base name afterwards, which changes
    /// when exporting a running VM consolidates its disk chain.
    pub(super) async fn backup_snapshot(
        &self,
        session: &SessionRef,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
        context: &BTreeMap<String, String>,
    ) -> Result<StorageAnswer> {
        let root_dir = destination.secondary_dir("backupSnapshot")?;
        let volume = source
            .volume
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("snapshot {} names no volume", source.path)))?;
        let store = volume.store.primary()?;
        let datastore = self.resolve_datastore(session, store).await?;

        let backup_uuid = uuid::Uuid::new_v4().to_string();
        let backup_dir = root_dir.join(&backup_uuid);
        info!("Backing up {} of volume {} to {}", source.path, volume.path, backup_dir.display());

        let backed_up = async {
            let export = self
                .export_volume(session, &datastore.name, volume, &backup_dir, &backup_uuid, context)
                .await?;
            debug!("Exported {} to {}", volume.path, export.descriptor.display());
            let archive = self.pipeline.seal(&backup_dir).await?;
            Ok::<_, Error>((export, archive))
        }
        .await;

        let (export, archive) = match backed_up {
            Ok(done) => done,
            Err(e) => {
                self.discard_partial(&backup_dir).await;
                return Err(e);
            }
        };

        let mut updated_volume = volume.clone();
        updated_volume.path = export.volume_path.clone();
        let mut updated = destination.clone();
        updated.path = format!("{}/{}", destination.path.trim_end_matches('/'), backup_uuid);
        updated.volume = Some(Box::new(updated_volume));

        Ok(StorageAnswer::ok(Some(updated))
            .with_detail("backup_uuid", &backup_uuid)
            .with_detail("volume_path", &export.volume_path)
            .with_detail("archive", archive.display()))
    }

    /// Remove a backup directory. Removing a missing backup succeeds.
    pub(super) async fn delete_snapshot(&self, snapshot: &ObjectDescriptor) -> Result<StorageAnswer> {
        if snapshot.path.is_empty() {
            return Err(Error::Validation("snapshot has no path".into()));
        }
        let dir = snapshot.secondary_dir("deleteSnapshot")?;
        let removed = self.pipeline.remove_directory(&dir).await?;
        Ok(StorageAnswer::ok(None).with_detail("removed", removed))
    }
}

#[cfg(test)]
mod tests {
    use crate::controlplane::command::{CopyCommand, ObjectDescriptor, ObjectType, StorageCommand, StoreRef};
    use crate::controlplane::testing::{p, Fixture, GIB};
    use crate::domain::model::{ControllerKind, PowerState};
    use crate::domain::ports::{DatastoreBrowser, VmManager, VmSpec};
    use std::collections::BTreeMap;

    fn copy(source: ObjectDescriptor, destination: ObjectDescriptor) -> StorageCommand {
        StorageCommand::Copy(CopyCommand {
            source,
            destination,
            wait_seconds: None,
            context: BTreeMap::new(),
        })
    }

    async fn vm_with_disk(fx: &Fixture, vm: &str, disk: &str) {
        fx.sim
            .create_vm(&VmSpec {
                name: vm.into(),
                datastore: "ds1".into(),
            })
            .await
            .unwrap();
        let disk = p(disk);
        fx.sim.create_virtual_disk(&disk, GIB).await.unwrap();
        fx.sim.attach_disk(vm, &disk, ControllerKind::Scsi).await.unwrap();
    }

    fn snapshot_of(fx: &Fixture, volume: ObjectDescriptor) -> ObjectDescriptor {
        ObjectDescriptor::new(ObjectType::Snapshot, "snap-1", StoreRef::Primary(fx.primary())).with_volume(volume)
    }

    fn backup_target(fx: &Fixture) -> ObjectDescriptor {
        ObjectDescriptor::new(ObjectType::Snapshot, "snapshots/2/14", fx.secondary())
    }

    #[tokio::test]
    async fn test_backup_of_stopped_vm() {
        let fx = Fixture::new(1).await;
        vm_with_disk(&fx, "vm2", "[ds1] vm2/data2.vmdk").await;

        let source = snapshot_of(&fx, fx.volume("data2", GIB).with_vm("vm2"));
        let answer = fx.orchestrator.execute(copy(source, backup_target(&fx))).await;
        assert!(answer.success, "{:?}", answer.error_message);

        let uuid = answer.details["backup_uuid"].clone();
        let updated = answer.updated.unwrap();
        assert_eq!(updated.path, format!("snapshots/2/14/{}", uuid));
        assert_eq!(updated.volume.unwrap().path, "data2");

        let dir = fx.secondary_dir.path().join("snapshots/2/14").join(&uuid);
        assert!(dir.join(format!("{}.ova", uuid)).exists());
        assert!(!dir.join(format!("{}.ovf", uuid)).exists());
        assert_eq!(fx.sim.vm_names(), vec!["vm2".to_string()]);
    }

    #[tokio::test]
    async fn test_backup_reports_consolidated_volume() {
        let fx = Fixture::new(1).await;
        vm_with_disk(&fx, "vm2", "[ds1] vm2/root.vmdk").await;
        fx.sim.create_snapshot("vm2", "s1").await.unwrap();
        fx.sim.forget_snapshots("vm2");
        fx.sim.set_power("vm2", PowerState::PoweredOn);

        let source = snapshot_of(&fx, fx.volume("root-000001", GIB).with_vm("vm2"));
        let answer = fx.orchestrator.execute(copy(source, backup_target(&fx))).await;
        assert!(answer.success, "{:?}", answer.error_message);

        assert_eq!(answer.details["volume_path"], "root");
        assert_eq!(answer.updated.unwrap().volume.unwrap().path, "root");
        assert!(fx.sim.file_exists(&p("[ds1] vm2/root.vmdk")).await.unwrap());
        assert!(!fx.sim.file_exists(&p("[ds1] vm2/root-000001.vmdk")).await.unwrap());

        let vm = fx.sim.find_vm("vm2").await.unwrap().unwrap();
        assert!(vm.snapshots.is_empty());
        assert_eq!(vm.disks[0].top(), Some(&p("[ds1] vm2/root.vmdk")));
    }

    #[tokio::test]
    async fn test_backup_requires_nfs_secondary() {
        let fx = Fixture::new(1).await;
        vm_with_disk(&fx, "vm2", "[ds1] vm2/data2.vmdk").await;

        let source = snapshot_of(&fx, fx.volume("data2", GIB).with_vm("vm2"));
        let destination = ObjectDescriptor::new(
            ObjectType::Snapshot,
            "snapshots/2/14",
            StoreRef::Secondary {
                url: "s3://bucket/backups".into(),
                mount_point: fx.secondary_dir.path().to_path_buf(),
            },
        );
        let before = fx.sim.event_log().len();
        let answer = fx.orchestrator.execute(copy(source, destination)).await;
        assert!(!answer.success);
        assert!(answer.error_message.unwrap().contains("s3"));
        // rejected before any helper VM is created
        assert_eq!(fx.sim.event_log().len(), before);
        assert!(!fx.sim.event_log().iter().any(|e| e.starts_with("vm.create helper-")));
    }

    #[tokio::test]
    async fn test_backup_becomes_template_and_volume() {
        let fx = Fixture::new(1).await;
        vm_with_disk(&fx, "vm2", "[ds1] vm2/data2.vmdk").await;
        let source = snapshot_of(&fx, fx.volume("data2", GIB).with_vm("vm2"));
        let answer = fx.orchestrator.execute(copy(source, backup_target(&fx))).await;
        let backup = answer.updated.unwrap();

        let template = ObjectDescriptor::new(ObjectType::Template, "template/tmpl/2/300", fx.secondary())
            .with_name("tmpl300");
        let answer = fx.orchestrator.execute(copy(backup.clone(), template)).await;
        assert!(answer.success, "{:?}", answer.error_message);
        let dir = fx.secondary_dir.path().join("template/tmpl/2/300");
        assert!(dir.join("tmpl300.ova").exists());
        assert!(dir.join("template.properties").exists());

        // the backup itself is left sealed
        let backup_dir = fx.secondary_dir.path().join(&backup.path);
        assert_eq!(std::fs::read_dir(&backup_dir).unwrap().count(), 1);

        let answer = fx.orchestrator.execute(copy(backup, fx.volume("fromsnap", 0))).await;
        assert!(answer.success, "{:?}", answer.error_message);
        assert_eq!(answer.updated.unwrap().size, GIB);
        assert!(fx.sim.file_exists(&p("[ds1] fromsnap.vmdk")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_snapshot_is_idempotent() {
        let fx = Fixture::new(1).await;
        vm_with_disk(&fx, "vm2", "[ds1] vm2/data2.vmdk").await;
        let source = snapshot_of(&fx, fx.volume("data2", GIB).with_vm("vm2"));
        let backup = fx
            .orchestrator
            .execute(copy(source, backup_target(&fx)))
            .await
            .updated
            .unwrap();

        let answer = fx
            .orchestrator
            .execute(StorageCommand::DeleteSnapshot {
                snapshot: backup.clone(),
            })
            .await;
        assert!(answer.success);
        assert_eq!(answer.details["removed"], "true");
        assert!(!fx.secondary_dir.path().join(&backup.path).exists());

        let answer = fx
            .orchestrator
            .execute(StorageCommand::DeleteSnapshot { snapshot: backup })
            .await;
        assert!(answer.success);
        assert_eq!(answer.details["removed"], "false");
    }
}
