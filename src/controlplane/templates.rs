//! Template and secondary-storage copies

use crate::controlplane::command::{ObjectDescriptor, StorageAnswer, StoreRef};
use crate::controlplane::helper::HelperVm;
use crate::controlplane::orchestrator::StorageOrchestrator;
use crate::domain::model::{ArchiveFormat, Template};
use crate::domain::path::DatastorePath;
use crate::domain::ports::SessionRef;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Join a secondary-store relative directory and a file name
fn secondary_path(dir: &str, file: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", dir, file)
    }
}

fn unique_name(destination: &ObjectDescriptor) -> String {
    destination
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

fn template_answer(destination: &ObjectDescriptor, template: &Template) -> StorageAnswer {
    let mut updated = destination.clone();
    let file = format!("{}.{}", template.name, template.format.extension());
    updated.path = secondary_path(&destination.path, &file);
    updated.name = Some(template.name.clone());
    updated.size = template.virtual_size;
    StorageAnswer::ok(Some(updated))
        .with_detail("physical_size", template.physical_size)
        .with_detail("virtual_size", template.virtual_size)
}

impl StorageOrchestrator {
    /// Import a published template into a primary datastore as a template
    /// VM carrying the base snapshot linked clones start from
    pub(super) async fn copy_template_to_primary(
        &self,
        session: &SessionRef,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
    ) -> Result<StorageAnswer> {
        let src_dir = source.secondary_dir("copyTemplateToPrimary")?;
        let store = destination.store.primary()?;
        let datastore = self.resolve_datastore(session, store).await?;

        let properties = match self.pipeline.read_properties(&src_dir).await {
            Ok(properties) => Some(properties),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let name = if !destination.path.is_empty() {
            destination.path.clone()
        } else if let Some(properties) = &properties {
            properties.unique_name.clone()
        } else {
            return Err(Error::Validation(format!(
                "no template name for {} and no properties file",
                src_dir.display()
            )));
        };

        let vms = session.vms();
        let base_snapshot = &self.config.template_base_snapshot;

        if let Some(existing) = vms.find_vm(&name).await? {
            if !existing.snapshots.iter().any(|s| s == base_snapshot) {
                vms.create_snapshot(&name, base_snapshot).await?;
            }
            info!("Template {} already present on {}", name, existing.datastore);
            let mut updated = destination.clone();
            updated.path = name;
            updated.size = existing.disks.first().map(|d| d.capacity_bytes).unwrap_or(0);
            return Ok(StorageAnswer::ok(Some(updated)).with_detail("imported", false));
        }

        let opened = self.pipeline.open_archive(&src_dir).await?;
        let imported = async {
            vms.import_ovf(&opened.descriptor, &name, &datastore.name).await?;
            vms.create_snapshot(&name, base_snapshot).await
        }
        .await;
        if let Err(e) = self.pipeline.close_archive(opened).await {
            warn!("Failed to remove extracted files in {}: {}", src_dir.display(), e);
        }

        if let Err(e) = imported {
            if vms.find_vm(&name).await.ok().flatten().is_some() {
                if let Err(cleanup) = vms.destroy_vm(&name).await {
                    error!("Failed to destroy partially imported template {}: {}", name, cleanup);
                }
            }
            return Err(e);
        }

        let info = vms
            .find_vm(&name)
            .await?
            .ok_or_else(|| Error::not_found("Template VM", name.as_str()))?;
        let size = match &properties {
            Some(properties) => properties.virtual_size,
            None => info.disks.iter().map(|d| d.capacity_bytes).sum(),
        };
        info!("Imported template {} on {}", name, datastore.name);

        let mut updated = destination.clone();
        updated.path = name;
        updated.size = size;
        Ok(StorageAnswer::ok(Some(updated)).with_detail("imported", true))
    }

    pub(super) async fn create_template_from_volume(
        &self,
        session: &SessionRef,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
        context: &BTreeMap<String, String>,
    ) -> Result<StorageAnswer> {
        let dir = destination.secondary_dir("createTemplateFromVolume")?;
        let store = source.store.primary()?;
        let datastore = self.resolve_datastore(session, store).await?;
        let unique = unique_name(destination);

        let published = async {
            self.export_volume(session, &datastore.name, source, &dir, &unique, context)
                .await?;
            self.pipeline.publish(&dir, &unique, destination.id).await
        }
        .await;

        match published {
            Ok(template) => Ok(template_answer(destination, &template)),
            Err(e) => {
                self.discard_partial(&dir).await;
                Err(e)
            }
        }
    }

    /// Publish a template from a snapshot, either a backup already on
    /// secondary storage or a LUN snapshot exposed as a managed datastore
    pub(super) async fn create_template_from_snapshot(
        &self,
        session: &SessionRef,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
        context: &BTreeMap<String, String>,
    ) -> Result<StorageAnswer> {
        let operation = "createTemplateFromSnapshot";
        let dest_dir = destination.secondary_dir(operation)?;
        let unique = unique_name(destination);

        let published = match &source.store {
            StoreRef::Secondary { .. } => {
                let src_dir = source.secondary_dir(operation)?;
                self.template_from_backup(&src_dir, &dest_dir, &unique, destination.id)
                    .await
            }
            StoreRef::Primary(store) => {
                let datastore = self.resolve_datastore(session, store).await?;
                let mut disk = source.clone();
                disk.vm_name = None;

                let published = async {
                    self.export_volume(session, &datastore.name, &disk, &dest_dir, &unique, context)
                        .await?;
                    self.pipeline.publish(&dest_dir, &unique, destination.id).await
                }
                .await;

                match &store.managed {
                    Some(target) => {
                        let released = self
                            .gateway
                            .teardown(session, &store.cluster, &datastore.name, target)
                            .await;
                        match (published, released) {
                            (Ok(template), Ok(())) => Ok(template),
                            (Ok(_), Err(e)) => Err(e),
                            (Err(e), Err(release_err)) => {
                                error!("Failed to release snapshot datastore {}: {}", datastore.name, release_err);
                                Err(e)
                            }
                            (Err(e), Ok(())) => Err(e),
                        }
                    }
                    None => published,
                }
            }
        };

        match published {
            Ok(template) => Ok(template_answer(destination, &template)),
            Err(e) => {
                self.discard_partial(&dest_dir).await;
                Err(e)
            }
        }
    }

    async fn template_from_backup(&self, src_dir: &Path, dest_dir: &Path, unique: &str, id: u64) -> Result<Template> {
        let opened = self.pipeline.open_archive(src_dir).await?;
        let src_base = opened
            .descriptor
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Validation(format!("bad descriptor name {}", opened.descriptor.display())))?;

        let copied = self
            .pipeline
            .copy_export(src_dir, &src_base, dest_dir, unique)
            .await;
        match (copied, self.pipeline.close_archive(opened).await) {
            (Ok(_), Ok(())) => {}
            (Ok(_), Err(e)) | (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(close_err)) => {
                warn!("Failed to remove extracted files in {}: {}", src_dir.display(), close_err);
                return Err(e);
            }
        }

        self.pipeline.publish(dest_dir, unique, id).await
    }

    pub(super) async fn copy_volume_to_secondary(
        &self,
        session: &SessionRef,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
        context: &BTreeMap<String, String>,
    ) -> Result<StorageAnswer> {
        let dir = destination.secondary_dir("copyVolumeToSecondary")?;
        let store = source.store.primary()?;
        let datastore = self.resolve_datastore(session, store).await?;
        let base = source.base_name();

        let sealed = async {
            self.export_volume(session, &datastore.name, source, &dir, &base, context)
                .await?;
            self.pipeline.seal(&dir).await
        }
        .await;

        let archive = match sealed {
            Ok(archive) => archive,
            Err(e) => {
                self.discard_partial(&dir).await;
                return Err(e);
            }
        };

        let file = format!("{}.{}", base, ArchiveFormat::Ova.extension());
        info!("Copied volume {} to {}", base, archive.display());
        let mut updated = destination.clone();
        updated.path = secondary_path(&destination.path, &file);
        updated.size = source.size;
        Ok(StorageAnswer::ok(Some(updated)).with_detail("archive", archive.display()))
    }

    /// Import an exported disk from secondary storage and leave it at the
    /// root of the destination datastore
    pub(super) async fn restore_volume(
        &self,
        session: &SessionRef,
        source: &ObjectDescriptor,
        destination: &ObjectDescriptor,
        operation: &str,
    ) -> Result<StorageAnswer> {
        let src_dir = source.secondary_dir(operation)?;
        let store = destination.store.primary()?;
        let datastore = self.resolve_datastore(session, store).await?;
        let base = destination.base_name();

        let opened = self.pipeline.open_archive(&src_dir).await?;
        let restored = self
            .import_as_volume(session, &opened.descriptor, &datastore.name, &base)
            .await;
        match (restored, self.pipeline.close_archive(opened).await) {
            (Ok((disk, capacity)), closed) => {
                if let Err(e) = closed {
                    warn!("Failed to remove extracted files in {}: {}", src_dir.display(), e);
                }
                info!("Restored {} from {}", disk, src_dir.display());
                let mut updated = destination.clone();
                updated.path = disk.disk_base_name().unwrap_or(&base).to_string();
                updated.size = capacity;
                updated.vm_name = None;
                Ok(StorageAnswer::ok(Some(updated)).with_detail("descriptor", &disk))
            }
            (Err(e), _) => Err(e),
        }
    }

    async fn import_as_volume(
        &self,
        session: &SessionRef,
        descriptor: &Path,
        datastore: &str,
        base: &str,
    ) -> Result<(DatastorePath, u64)> {
        let vms = session.vms();
        let files = session.files();
        let files_ref = &files;

        let helper = HelperVm::import(vms.clone(), descriptor, base, datastore).await?;
        let folder = helper.folder();
        let restored = helper
            .run(|name| async move {
                let info = vms
                    .find_vm(&name)
                    .await?
                    .ok_or_else(|| Error::not_found("VM", name.as_str()))?;
                let first = info
                    .disks
                    .first()
                    .ok_or_else(|| Error::not_found("Disk", format!("imported disk of {}", name)))?;
                let top = first
                    .top()
                    .cloned()
                    .ok_or_else(|| Error::not_found("Disk", format!("imported disk of {}", name)))?;
                let disk_base = top
                    .disk_base_name()
                    .ok_or_else(|| Error::Validation(format!("{} is not a disk descriptor", top)))?
                    .to_string();

                vms.detach_disk(&name, &top).await?;
                let moved = self
                    .resolver
                    .sync_to_root_folder(files_ref.as_ref(), top.datastore(), &name, &disk_base)
                    .await?;
                Ok((moved, first.capacity_bytes))
            })
            .await?;

        self.resolver
            .remove_folder_if_empty(files.as_ref(), &folder)
            .await?;
        Ok(restored)
    }

    /// Best-effort removal of a half-written secondary directory
    pub(super) async fn discard_partial(&self, dir: &Path) {
        match self.pipeline.remove_directory(dir).await {
            Ok(true) => debug!("Discarded partial output in {}", dir.display()),
            Ok(false) => {}
            Err(e) => warn!("Failed to discard partial output in {}: {}", dir.display(), e),
        }
    }
}
