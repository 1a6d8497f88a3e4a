//! Datastore Layout Resolver
//!
//! A virtual disk's backing files live either at the datastore root
//! (`[ds] disk.vmdk`) or inside the owning VM's folder
//! (`[ds] vm/disk.vmdk`). File moves on a datastore are not atomic, so a
//! crash mid-move can leave a disk split across both places. The resolver
//! computes both conventions and finishes interrupted moves.

use crate::config::LayoutConfig;
use crate::domain::model::DiskLayout;
use crate::domain::path::{DatastorePath, DISK_EXTENSION};
use crate::domain::ports::DatastoreBrowser;
use crate::error::{Error, Result};
use tracing::{debug, info, warn};

/// Suffix of the data file behind a non-linked descriptor
const FLAT_SUFFIX: &str = "flat";

// =============================================================================
// Resolver
// =============================================================================

#[derive(Debug, Clone)]
pub struct DatastoreLayoutResolver {
    config: LayoutConfig,
}

impl Default for DatastoreLayoutResolver {
    fn default() -> Self {
        Self::new(LayoutConfig::default())
    }
}

impl DatastoreLayoutResolver {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    /// Descriptor and data file paths for a disk under one convention.
    ///
    /// The first element is always the descriptor. A non-linked disk has a
    /// single flat data file; a linked disk has one data file per configured
    /// differencing extension.
    pub fn resolve_pair(
        &self,
        datastore: &str,
        vm_name: &str,
        disk_base: &str,
        layout: DiskLayout,
        is_linked: bool,
    ) -> Vec<DatastorePath> {
        let folder = match layout {
            DiskLayout::RootFlat => DatastorePath::root(datastore),
            DiskLayout::PerVmFolder => DatastorePath::new(datastore, vm_name),
        };

        let mut paths = vec![folder.join(&descriptor_name(disk_base))];
        if is_linked {
            paths.extend(
                self.config
                    .linked_extensions
                    .iter()
                    .map(|ext| folder.join(&data_name(disk_base, ext))),
            );
        } else {
            paths.push(folder.join(&data_name(disk_base, FLAT_SUFFIX)));
        }
        paths
    }

    /// Every file that may belong to the disk described by `descriptor`:
    /// the descriptor, the flat file and all differencing files.
    pub fn backing_set(&self, descriptor: &DatastorePath) -> Vec<DatastorePath> {
        let folder = descriptor
            .parent()
            .unwrap_or_else(|| DatastorePath::root(descriptor.datastore()));
        let base = descriptor
            .disk_base_name()
            .unwrap_or_else(|| descriptor.file_name())
            .to_string();

        let mut set = vec![descriptor.clone()];
        set.push(folder.join(&data_name(&base, FLAT_SUFFIX)));
        set.extend(
            self.config
                .linked_extensions
                .iter()
                .map(|ext| folder.join(&data_name(&base, ext))),
        );
        set
    }

    /// Find a disk descriptor: per-VM folder first, then the legacy root
    /// location, then a bounded recursive search.
    pub async fn locate(
        &self,
        files: &dyn DatastoreBrowser,
        datastore: &str,
        vm_name: Option<&str>,
        disk_name: &str,
    ) -> Result<DatastorePath> {
        let file_name = descriptor_name(strip_disk_extension(disk_name));

        if let Some(vm) = vm_name {
            let in_folder = DatastorePath::new(datastore, format!("{}/{}", vm, file_name));
            if files.file_exists(&in_folder).await? {
                return Ok(in_folder);
            }
        }

        let at_root = DatastorePath::new(datastore, file_name.as_str());
        if files.file_exists(&at_root).await? {
            return Ok(at_root);
        }

        debug!("Disk {} not at expected locations on {}, searching", file_name, datastore);
        let mut found = files
            .search(
                datastore,
                &file_name,
                &self.config.search_exclusions,
                self.config.search_max_depth,
            )
            .await?;
        found.sort();

        if found.len() > 1 {
            warn!("Disk {} found {} times on {}, using {}", file_name, found.len(), datastore, found[0]);
        }

        found
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("Disk", format!("[{}] {}", datastore, file_name)))
    }

    /// Bring a disk into `vm_name/`. Idempotent; also completes a move that
    /// was interrupted half way. Returns the descriptor in its folder.
    pub async fn sync_to_canonical_folder(
        &self,
        files: &dyn DatastoreBrowser,
        datastore: &str,
        vm_name: &str,
        disk_base: &str,
    ) -> Result<DatastorePath> {
        let root = DatastorePath::new(datastore, descriptor_name(disk_base));
        let folder = DatastorePath::new(datastore, format!("{}/{}", vm_name, descriptor_name(disk_base)));
        self.move_disk(files, &root, &folder).await
    }

    /// Bring a disk out of `vm_name/` back to the datastore root, so another
    /// VM can take ownership. Idempotent.
    pub async fn sync_to_root_folder(
        &self,
        files: &dyn DatastoreBrowser,
        datastore: &str,
        vm_name: &str,
        disk_base: &str,
    ) -> Result<DatastorePath> {
        let folder = DatastorePath::new(datastore, format!("{}/{}", vm_name, descriptor_name(disk_base)));
        let root = DatastorePath::new(datastore, descriptor_name(disk_base));
        self.move_disk(files, &folder, &root).await
    }

    /// Move every present backing file of `from` next to `to`, renaming
    /// them after `to`'s base name. Re-running after a partial move
    /// finishes the job. A member present at both ends is a different disk
    /// under the same name and fails with `AlreadyExists` before anything
    /// is moved.
    pub async fn move_disk(
        &self,
        files: &dyn DatastoreBrowser,
        from: &DatastorePath,
        to: &DatastorePath,
    ) -> Result<DatastorePath> {
        if from == to {
            return Ok(to.clone());
        }

        let source_present = files.file_exists(from).await?;
        let target_present = files.file_exists(to).await?;
        if !source_present && !target_present {
            return Err(Error::not_found("Disk", from.to_string()));
        }

        let pairs: Vec<_> = self
            .backing_set(from)
            .into_iter()
            .zip(self.backing_set(to))
            .collect();

        let mut pending = Vec::with_capacity(pairs.len());
        for (src, dst) in pairs {
            if !files.file_exists(&src).await? {
                continue;
            }
            if files.file_exists(&dst).await? {
                warn!("Both {} and {} exist, refusing to move {}", src, dst, from);
                return Err(Error::already_exists("Disk", dst.to_string()));
            }
            pending.push((src, dst));
        }

        let mut moved = 0usize;
        for (src, dst) in pending {
            if moved == 0 {
                if let Some(folder) = dst.parent().filter(|p| !p.is_root()) {
                    files.make_directory(&folder).await?;
                }
            }
            debug!("Moving {} -> {}", src, dst);
            files.move_file(&src, &dst).await?;
            moved += 1;
        }

        if moved > 0 {
            info!("Moved {} backing file(s) of {} to {}", moved, from, to);
        }
        Ok(to.clone())
    }

    /// Delete every present backing file of a disk. Returns how many were removed.
    pub async fn delete_disk(&self, files: &dyn DatastoreBrowser, descriptor: &DatastorePath) -> Result<usize> {
        let mut deleted = 0usize;
        for path in self.backing_set(descriptor) {
            if files.file_exists(&path).await? {
                files.delete_file(&path).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete a folder that holds nothing. Returns whether it was removed.
    pub async fn remove_folder_if_empty(&self, files: &dyn DatastoreBrowser, folder: &DatastorePath) -> Result<bool> {
        if folder.is_root() || !files.folder_exists(folder).await? {
            return Ok(false);
        }
        if !files.list_folder(folder).await?.is_empty() {
            return Ok(false);
        }
        info!("Removing empty folder {}", folder);
        files.delete_folder(folder).await?;
        Ok(true)
    }
}

fn strip_disk_extension(name: &str) -> &str {
    name.strip_suffix(DISK_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(name)
}

fn descriptor_name(base: &str) -> String {
    format!("{}.{}", base, DISK_EXTENSION)
}

fn data_name(base: &str, suffix: &str) -> String {
    format!("{}-{}.{}", base, suffix, DISK_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCluster;
    use assert_matches::assert_matches;

    fn sim_with_datastore() -> SimulatedCluster {
        SimulatedCluster::builder()
            .cluster("c1", 1)
            .local_datastore("ds1", "c1", 100 << 30)
            .build()
    }

    fn p(s: &str) -> DatastorePath {
        s.parse().unwrap()
    }

    #[test]
    fn test_resolve_pair_layouts() {
        let resolver = DatastoreLayoutResolver::default();

        let flat = resolver.resolve_pair("ds1", "vm-1", "vol", DiskLayout::RootFlat, false);
        assert_eq!(flat, vec![p("[ds1] vol.vmdk"), p("[ds1] vol-flat.vmdk")]);

        let linked = resolver.resolve_pair("ds1", "vm-1", "vol", DiskLayout::PerVmFolder, true);
        assert_eq!(
            linked,
            vec![
                p("[ds1] vm-1/vol.vmdk"),
                p("[ds1] vm-1/vol-delta.vmdk"),
                p("[ds1] vm-1/vol-sesparse.vmdk"),
            ]
        );
    }

    #[test]
    fn test_resolve_pair_uses_configured_extensions() {
        let resolver = DatastoreLayoutResolver::new(LayoutConfig {
            linked_extensions: vec!["seSparse".into()],
            ..Default::default()
        });
        let linked = resolver.resolve_pair("ds1", "vm", "d", DiskLayout::RootFlat, true);
        assert_eq!(linked, vec![p("[ds1] d.vmdk"), p("[ds1] d-seSparse.vmdk")]);
    }

    #[tokio::test]
    async fn test_locate_prefers_folder_then_root_then_search() {
        let sim = sim_with_datastore();
        let resolver = DatastoreLayoutResolver::default();

        sim.put_file(&p("[ds1] vol.vmdk"), 1);
        assert_eq!(
            resolver.locate(&sim, "ds1", Some("vm-1"), "vol").await.unwrap(),
            p("[ds1] vol.vmdk")
        );

        sim.put_file(&p("[ds1] vm-1/vol.vmdk"), 1);
        assert_eq!(
            resolver.locate(&sim, "ds1", Some("vm-1"), "vol.vmdk").await.unwrap(),
            p("[ds1] vm-1/vol.vmdk")
        );

        sim.put_file(&p("[ds1] other/deep/lost.vmdk"), 1);
        assert_eq!(
            resolver.locate(&sim, "ds1", Some("vm-1"), "lost").await.unwrap(),
            p("[ds1] other/deep/lost.vmdk")
        );

        sim.put_file(&p("[ds1] .snapshot/hidden.vmdk"), 1);
        assert!(resolver
            .locate(&sim, "ds1", None, "hidden")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_sync_to_canonical_folder_is_idempotent() {
        let sim = sim_with_datastore();
        let resolver = DatastoreLayoutResolver::default();
        sim.put_file(&p("[ds1] vol.vmdk"), 1);
        sim.put_file(&p("[ds1] vol-flat.vmdk"), 4096);

        let first = resolver
            .sync_to_canonical_folder(&sim, "ds1", "vm-1", "vol")
            .await
            .unwrap();
        let after_first = sim.list_files("ds1");

        let second = resolver
            .sync_to_canonical_folder(&sim, "ds1", "vm-1", "vol")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(after_first, sim.list_files("ds1"));
        assert_eq!(
            after_first,
            vec!["vm-1/vol-flat.vmdk".to_string(), "vm-1/vol.vmdk".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sync_completes_split_disk() {
        let sim = sim_with_datastore();
        let resolver = DatastoreLayoutResolver::default();
        // Descriptor already moved, data file left behind by an interrupted move
        sim.put_file(&p("[ds1] vm-1/vol.vmdk"), 1);
        sim.put_file(&p("[ds1] vol-flat.vmdk"), 4096);

        resolver
            .sync_to_canonical_folder(&sim, "ds1", "vm-1", "vol")
            .await
            .unwrap();
        assert_eq!(
            sim.list_files("ds1"),
            vec!["vm-1/vol-flat.vmdk".to_string(), "vm-1/vol.vmdk".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sync_refuses_name_collision() {
        let sim = sim_with_datastore();
        let resolver = DatastoreLayoutResolver::default();
        sim.put_file(&p("[ds1] vol.vmdk"), 1);
        sim.put_file(&p("[ds1] vol-flat.vmdk"), 4096);
        sim.put_file(&p("[ds1] vm-1/vol.vmdk"), 1);
        sim.put_file(&p("[ds1] vm-1/vol-flat.vmdk"), 8192);

        let err = resolver
            .sync_to_canonical_folder(&sim, "ds1", "vm-1", "vol")
            .await
            .unwrap_err();
        assert_matches!(err, Error::AlreadyExists { .. });
        assert_eq!(
            sim.list_files("ds1"),
            vec![
                "vm-1/vol-flat.vmdk".to_string(),
                "vm-1/vol.vmdk".to_string(),
                "vol-flat.vmdk".to_string(),
                "vol.vmdk".to_string(),
            ]
        );
        assert_eq!(sim.file_size(&p("[ds1] vm-1/vol-flat.vmdk")).await.unwrap(), 8192);
    }

    #[tokio::test]
    async fn test_sync_to_root_and_missing_disk() {
        let sim = sim_with_datastore();
        let resolver = DatastoreLayoutResolver::default();
        sim.put_file(&p("[ds1] vm-1/vol.vmdk"), 1);
        sim.put_file(&p("[ds1] vm-1/vol-delta.vmdk"), 512);

        let root = resolver
            .sync_to_root_folder(&sim, "ds1", "vm-1", "vol")
            .await
            .unwrap();
        assert_eq!(root, p("[ds1] vol.vmdk"));
        assert!(resolver
            .remove_folder_if_empty(&sim, &p("[ds1] vm-1"))
            .await
            .unwrap());

        let err = resolver
            .sync_to_root_folder(&sim, "ds1", "vm-1", "missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
