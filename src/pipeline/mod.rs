//! Template and Snapshot Pipeline
//!
//! Moves disks between primary datastores and secondary storage. Secondary
//! storage is a locally mounted export directory holding OVF descriptors,
//! OVA archives and their sidecar metadata.

pub mod archive;
pub mod metadata;
pub mod ovf;

pub use metadata::{MetaDisk, OvaMeta, TemplateProperties};
pub use ovf::OvfEnvelope;

use crate::config::PipelineConfig;
use crate::domain::model::{ArchiveFormat, Template};
use crate::domain::ports::VmManager;
use crate::error::{Error, Result};
use ovf::OVF_EXTENSION;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prefix of snapshots taken only to export a running VM
pub const TEMPORARY_SNAPSHOT_PREFIX: &str = "cloud.export";

/// A descriptor opened from a secondary-storage directory. Files that were
/// extracted to open it are removed again by
/// [`TemplateSnapshotPipeline::close_archive`].
#[derive(Debug)]
pub struct OpenedArchive {
    pub descriptor: PathBuf,
    extracted: bool,
}

/// Sizes of an exported disk image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSizes {
    /// Bytes of disk data on secondary storage
    pub physical: u64,
    /// Declared capacity of the disks
    pub virtual_size: u64,
}

pub fn temporary_snapshot_name() -> String {
    format!("{}-{}", TEMPORARY_SNAPSHOT_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Run `body` while `vm` holds a snapshot named `name`.
///
/// The snapshot is removed on every exit path. A removal failure is
/// surfaced only when `body` succeeded.
pub async fn with_temporary_snapshot<T, F, Fut>(vms: &dyn VmManager, vm: &str, name: &str, body: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    vms.create_snapshot(vm, name).await?;
    debug!("Took temporary snapshot {} on {}", name, vm);

    let result = body().await;

    match vms.remove_snapshot(vm, name).await {
        Ok(()) => {
            debug!("Removed temporary snapshot {} on {}", name, vm);
            result
        }
        Err(e) => match result {
            Ok(_) => Err(e),
            Err(body_err) => {
                warn!("Failed to remove temporary snapshot {} on {}: {}", name, vm, e);
                Err(body_err)
            }
        },
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct TemplateSnapshotPipeline {
    config: PipelineConfig,
}

impl TemplateSnapshotPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Export a VM into `dest_dir` as `<base_name>.ovf` plus data files.
    /// A running VM is exported from a temporary snapshot.
    pub async fn export_disk(&self, vms: &dyn VmManager, vm: &str, dest_dir: &Path, base_name: &str) -> Result<PathBuf> {
        let info = vms
            .find_vm(vm)
            .await?
            .ok_or_else(|| Error::not_found("VM", vm))?;
        tokio::fs::create_dir_all(dest_dir).await?;

        if info.is_running() {
            let snapshot = temporary_snapshot_name();
            with_temporary_snapshot(vms, vm, &snapshot, || vms.export_ovf(vm, dest_dir, base_name)).await?;
        } else {
            vms.export_ovf(vm, dest_dir, base_name).await?;
        }

        let descriptor = dest_dir.join(format!("{}.{}", base_name, OVF_EXTENSION));
        info!("Exported {} to {}", vm, descriptor.display());
        Ok(descriptor)
    }

    /// Make sure `dir` holds both an archive and its unpacked descriptor.
    ///
    /// Packs the archive when only the descriptor is present and unpacks it
    /// when only the archive is present. Returns the descriptor path.
    pub async fn package_archive(&self, dir: &Path) -> Result<PathBuf> {
        let dir = dir.to_path_buf();
        blocking(move || {
            let layout = archive::scan(&dir)?;
            match (layout.descriptor, layout.archive) {
                (Some(descriptor), Some(_)) => Ok(descriptor),
                (Some(descriptor), None) => {
                    archive::pack(&descriptor)?;
                    Ok(descriptor)
                }
                (None, Some(archive_path)) => archive::unpack(&archive_path),
                (None, None) => Err(Error::not_found("OVF descriptor or archive in", dir.display().to_string())),
            }
        })
        .await
    }

    /// Pack the unpacked export in `dir` and remove the unpacked files.
    /// Returns the archive path.
    pub async fn seal(&self, dir: &Path) -> Result<PathBuf> {
        let descriptor = self.package_archive(dir).await?;
        let archive_path = descriptor.with_extension(ArchiveFormat::Ova.extension());
        blocking(move || archive::prune_unpacked(&descriptor)).await?;
        info!("Sealed {}", archive_path.display());
        Ok(archive_path)
    }

    /// Get at the descriptor in `dir`, extracting the archive when needed
    pub async fn open_archive(&self, dir: &Path) -> Result<OpenedArchive> {
        let dir = dir.to_path_buf();
        blocking(move || {
            let layout = archive::scan(&dir)?;
            match (layout.descriptor, layout.archive) {
                (Some(descriptor), _) => Ok(OpenedArchive {
                    descriptor,
                    extracted: false,
                }),
                (None, Some(archive_path)) => Ok(OpenedArchive {
                    descriptor: archive::unpack(&archive_path)?,
                    extracted: true,
                }),
                (None, None) => Err(Error::not_found("OVF descriptor or archive in", dir.display().to_string())),
            }
        })
        .await
    }

    pub async fn close_archive(&self, opened: OpenedArchive) -> Result<()> {
        if opened.extracted {
            let descriptor = opened.descriptor;
            blocking(move || archive::prune_unpacked(&descriptor)).await?;
        }
        Ok(())
    }

    /// Physical size from the data files on disk, virtual size from the
    /// descriptor's declared capacities
    pub async fn compute_sizes(&self, dir: &Path, base_name: &str) -> Result<DiskSizes> {
        let envelope = read_envelope(dir, base_name).await?;

        let mut physical = 0u64;
        for file in &envelope.files {
            physical += tokio::fs::metadata(dir.join(&file.href)).await?.len();
        }
        Ok(DiskSizes {
            physical,
            virtual_size: envelope.virtual_size()?,
        })
    }

    /// Write the properties file and the `<uniquename>.ova.meta` manifest
    pub async fn write_metadata(&self, dir: &Path, properties: &TemplateProperties) -> Result<()> {
        let envelope = read_envelope(dir, &properties.unique_name).await?;

        let mut disks = Vec::with_capacity(envelope.files.len());
        for file in &envelope.files {
            disks.push(MetaDisk {
                name: file.href.clone(),
                size: tokio::fs::metadata(dir.join(&file.href)).await?.len(),
            });
        }
        let meta = OvaMeta {
            ova_filename: properties.filename.clone(),
            version: self.config.meta_version.clone(),
            ovf: format!("{}.{}", properties.unique_name, OVF_EXTENSION),
            disks,
        };

        tokio::fs::write(dir.join(&self.config.properties_file), properties.render()).await?;
        tokio::fs::write(
            dir.join(format!("{}.{}.meta", properties.unique_name, ArchiveFormat::Ova.extension())),
            meta.render(),
        )
        .await?;
        debug!("Wrote metadata for {} in {}", properties.unique_name, dir.display());
        Ok(())
    }

    pub async fn read_properties(&self, dir: &Path) -> Result<TemplateProperties> {
        let path = dir.join(&self.config.properties_file);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("Template properties", path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        TemplateProperties::parse(&text)
    }

    /// Package an exported image in `dir` and describe it: archive, sizes,
    /// sidecar metadata. The unpacked files are removed afterwards.
    pub async fn publish(&self, dir: &Path, unique_name: &str, id: u64) -> Result<Template> {
        let descriptor = self.package_archive(dir).await?;
        let sizes = self.compute_sizes(dir, unique_name).await?;

        let filename = format!("{}.{}", unique_name, ArchiveFormat::Ova.extension());
        let ova_size = tokio::fs::metadata(dir.join(&filename)).await?.len();
        let properties = TemplateProperties {
            filename: filename.clone(),
            size: sizes.physical,
            id,
            unique_name: unique_name.to_string(),
            virtual_size: sizes.virtual_size,
            ova_size,
        };
        self.write_metadata(dir, &properties).await?;

        let pruned = blocking(move || archive::prune_unpacked(&descriptor)).await?;
        info!(
            "Published {} ({} bytes, {} virtual), pruned {} file(s)",
            filename, ova_size, sizes.virtual_size, pruned
        );

        Ok(Template {
            id,
            name: unique_name.to_string(),
            archive_path: dir.join(&filename).display().to_string(),
            format: ArchiveFormat::Ova,
            virtual_size: sizes.virtual_size,
            physical_size: sizes.physical,
        })
    }

    /// Copy an unpacked export to another directory under a new base name,
    /// rewriting the descriptor's file references
    pub async fn copy_export(&self, src_dir: &Path, src_base: &str, dest_dir: &Path, dest_base: &str) -> Result<PathBuf> {
        let mut envelope = read_envelope(src_dir, src_base).await?;
        tokio::fs::create_dir_all(dest_dir).await?;

        for file in envelope.files.iter_mut() {
            let renamed = match file.href.strip_prefix(src_base) {
                Some(rest) => format!("{}{}", dest_base, rest),
                None => file.href.clone(),
            };
            tokio::fs::copy(src_dir.join(&file.href), dest_dir.join(&renamed)).await?;
            file.href = renamed;
        }
        envelope.name = dest_base.to_string();

        let descriptor = dest_dir.join(format!("{}.{}", dest_base, OVF_EXTENSION));
        tokio::fs::write(&descriptor, envelope.render()).await?;
        info!("Copied export {} to {}", src_base, descriptor.display());
        Ok(descriptor)
    }

    /// Remove a directory tree. Returns false when it did not exist.
    pub async fn remove_directory(&self, dir: &Path) -> Result<bool> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!("Removed {}", dir.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} already gone", dir.display());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_envelope(dir: &Path, base_name: &str) -> Result<OvfEnvelope> {
    let path = dir.join(format!("{}.{}", base_name, OVF_EXTENSION));
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found("OVF descriptor", path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    OvfEnvelope::parse(&text)
}
