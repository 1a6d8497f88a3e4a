//! Storage Orchestrator - entry point for storage commands
//!
//! Each command runs to completion or fails as a whole. Helper VMs and
//! temporary snapshots are released before a failure is reported, and a
//! session fault drops the cached session so the next command reconnects.

use crate::cluster::ClusterHostCoordinator;
use crate::config::OrchestratorConfig;
use crate::controlplane::command::{
    route, CopyCommand, CopyOperation, ObjectDescriptor, PrimaryStore, StorageAnswer, StorageCommand,
};
use crate::controlplane::helper::HelperVm;
use crate::controlplane::metrics::CommandMetrics;
use crate::domain::model::{CloneMode, Datastore, VmInfo};
use crate::domain::path::DatastorePath;
use crate::domain::ports::{CloneSpec, SessionRef, VmManager};
use crate::error::{Error, Result};
use crate::gateway::ManagedStorageGateway;
use crate::layout::DatastoreLayoutResolver;
use crate::pipeline::{temporary_snapshot_name, with_temporary_snapshot, TemplateSnapshotPipeline};
use crate::session::OrchestratorContext;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Context key naming the helper VM to use
pub const WORKER_NAME_KEY: &str = "worker_name";

/// Full clone iff the requested size exceeds the template's declared size
pub fn clone_strategy(requested_bytes: u64, template_bytes: u64, base_snapshot: &str) -> CloneMode {
    if requested_bytes > template_bytes {
        CloneMode::Full
    } else {
        CloneMode::Linked {
            snapshot: base_snapshot.to_string(),
        }
    }
}

/// Result of exporting a volume to a local directory
#[derive(Debug, Clone)]
pub(super) struct VolumeExport {
    pub descriptor: PathBuf,
    /// The volume's base name afterwards; differs from the input when the
    /// export consolidated the disk chain
    pub volume_path: String,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct StorageOrchestrator {
    pub(super) config: OrchestratorConfig,
    pub(super) context: OrchestratorContext,
    pub(super) resolver: DatastoreLayoutResolver,
    pub(super) gateway: ManagedStorageGateway,
    pub(super) pipeline: TemplateSnapshotPipeline,
    metrics: CommandMetrics,
}

impl StorageOrchestrator {
    pub fn new(config: OrchestratorConfig, context: OrchestratorContext) -> Result<Self> {
        let coordinator = ClusterHostCoordinator::new(config.coordinator.clone());
        Ok(Self {
            resolver: DatastoreLayoutResolver::new(config.layout.clone()),
            gateway: ManagedStorageGateway::new(coordinator),
            pipeline: TemplateSnapshotPipeline::new(config.pipeline.clone()),
            metrics: CommandMetrics::new()?,
            config,
            context,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CommandMetrics {
        &self.metrics
    }

    /// Execute one command and report its outcome
    pub async fn execute(&self, command: StorageCommand) -> StorageAnswer {
        let started = Instant::now();
        let operation = match command.operation() {
            Ok(operation) => operation,
            Err(e) => {
                warn!("Rejected command: {}", e);
                self.metrics.observe("unroutable", false, started.elapsed());
                return StorageAnswer::failed(&e);
            }
        };

        info!("Executing {}", operation);
        let result = self
            .dispatch(command)
            .await
            .map_err(|e| e.in_operation(operation));
        self.metrics.observe(operation, result.is_ok(), started.elapsed());

        match result {
            Ok(answer) => {
                info!("{} completed in {:?}", operation, started.elapsed());
                answer
            }
            Err(e) => {
                error!("{}", e);
                self.context.observe_failure(&e);
                StorageAnswer::failed(&e)
            }
        }
    }

    async fn dispatch(&self, command: StorageCommand) -> Result<StorageAnswer> {
        let session = self.context.session().await?;

        match command {
            StorageCommand::Copy(copy) => self.dispatch_copy(&session, copy).await,
            StorageCommand::CreateVolume { volume, context } => {
                self.create_volume(&session, &volume, &context).await
            }
            StorageCommand::DeleteVolume { volume } => self.delete_volume(&session, &volume).await,
            StorageCommand::AttachVolume {
                volume,
                vm_name,
                controller,
            } => {
                let controller = controller.unwrap_or(self.config.default_controller);
                self.attach_volume(&session, &volume, &vm_name, controller).await
            }
            StorageCommand::DetachVolume { volume, vm_name } => {
                self.detach_volume(&session, &volume, &vm_name).await
            }
            StorageCommand::ResizeVolume { volume, new_size } => {
                self.resize_volume(&session, &volume, new_size).await
            }
            StorageCommand::DeleteSnapshot { snapshot } => self.delete_snapshot(&snapshot).await,
            StorageCommand::ResignatureDatastore {
                cluster,
                scsi_device_id,
                target,
            } => {
                let datastore = self
                    .gateway
                    .resignature(&session, &cluster, &scsi_device_id, &target)
                    .await?;
                Ok(StorageAnswer::ok(None)
                    .with_detail("datastore", &datastore.name)
                    .with_detail("capacity_bytes", datastore.capacity_bytes))
            }
        }
    }

    async fn dispatch_copy(&self, session: &SessionRef, copy: CopyCommand) -> Result<StorageAnswer> {
        let operation = route(&copy.source, &copy.destination)?;
        if let Some(wait) = copy.wait_seconds {
            debug!("{} carries a {}s wait budget", operation.name(), wait);
        }

        let CopyCommand {
            source,
            destination,
            context,
            ..
        } = copy;
        match operation {
            CopyOperation::CopyTemplateToPrimary => {
                self.copy_template_to_primary(session, &source, &destination).await
            }
            CopyOperation::CloneVolumeFromTemplate => {
                self.clone_volume_from_template(session, &source, &destination, &context)
                    .await
            }
            CopyOperation::CreateTemplateFromVolume => {
                self.create_template_from_volume(session, &source, &destination, &context)
                    .await
            }
            CopyOperation::BackupSnapshot => {
                self.backup_snapshot(session, &source, &destination, &context).await
            }
            CopyOperation::CreateTemplateFromSnapshot => {
                self.create_template_from_snapshot(session, &source, &destination, &context)
                    .await
            }
            CopyOperation::CreateVolumeFromSnapshot | CopyOperation::CopyVolumeFromSecondary => {
                self.restore_volume(session, &source, &destination, operation.name())
                    .await
            }
            CopyOperation::CopyVolumeToSecondary => {
                self.copy_volume_to_secondary(session, &source, &destination, &context)
                    .await
            }
        }
    }

    // =========================================================================
    // Shared Steps
    // =========================================================================

    /// The datastore behind a primary store, provisioning managed and NFS
    /// datastores on demand
    pub(super) async fn resolve_datastore(&self, session: &SessionRef, store: &PrimaryStore) -> Result<Datastore> {
        if let Some(target) = &store.managed {
            return self
                .gateway
                .provision_block_datastore(session, &store.cluster, target)
                .await;
        }
        if let Some(nfs) = &store.nfs {
            return self
                .gateway
                .provision_file_datastore(session, &store.cluster, &nfs.host, &nfs.export_path, &nfs.unique_id)
                .await;
        }
        session
            .inventory()
            .find_datastore(&store.datastore)
            .await?
            .ok_or_else(|| Error::not_found("Datastore", store.datastore.as_str()))
    }

    pub(super) fn helper_name(&self, context: &BTreeMap<String, String>) -> String {
        match context.get(WORKER_NAME_KEY) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}{}", self.config.helper_vm_prefix, uuid::Uuid::new_v4().simple()),
        }
    }

    /// Export a volume's current state to `dest_dir`.
    ///
    /// A disk owned by a running VM is exported through a linked clone of a
    /// temporary snapshot; any other disk is attached to a helper VM.
    pub(super) async fn export_volume(
        &self,
        session: &SessionRef,
        datastore: &str,
        volume: &ObjectDescriptor,
        dest_dir: &Path,
        base_name: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<VolumeExport> {
        let vms = session.vms();
        let owner = match &volume.vm_name {
            Some(vm) => vms.find_vm(vm).await?,
            None => None,
        };

        if let Some(owner) = owner.filter(VmInfo::is_running) {
            return self
                .export_from_running(session, &owner, datastore, volume, dest_dir, base_name, context)
                .await;
        }

        let files = session.files();
        let disk = self
            .resolver
            .locate(files.as_ref(), datastore, volume.vm_name.as_deref(), &volume.path)
            .await?;
        let helper = HelperVm::create(vms.clone(), &self.helper_name(context), datastore).await?;
        let descriptor = helper
            .run(|name| async move { self.export_attached(&vms, &name, &disk, dest_dir, base_name).await })
            .await?;

        Ok(VolumeExport {
            descriptor,
            volume_path: volume.path.clone(),
        })
    }

    /// Attach a disk to a helper, export it, and detach it again so that
    /// releasing the helper never touches the disk
    async fn export_attached(
        &self,
        vms: &Arc<dyn VmManager>,
        helper: &str,
        disk: &DatastorePath,
        dest_dir: &Path,
        base_name: &str,
    ) -> Result<PathBuf> {
        vms.attach_disk(helper, disk, self.config.default_controller).await?;
        let exported = self
            .pipeline
            .export_disk(vms.as_ref(), helper, dest_dir, base_name)
            .await;

        if let Err(e) = vms.detach_disk(helper, disk).await {
            warn!("Failed to detach {} from helper {}: {}", disk, helper, e);
            if exported.is_ok() {
                return Err(e);
            }
        }
        exported
    }

    #[allow(clippy::too_many_arguments)]
    async fn export_from_running(
        &self,
        session: &SessionRef,
        owner: &VmInfo,
        datastore: &str,
        volume: &ObjectDescriptor,
        dest_dir: &Path,
        base_name: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<VolumeExport> {
        let vms = session.vms();
        let files = session.files();

        let (index, pre_top) = owner
            .disks
            .iter()
            .enumerate()
            .find(|(_, d)| d.backs(&volume.path))
            .and_then(|(i, d)| d.top().map(|top| (i, top.clone())))
            .ok_or_else(|| Error::not_found("Disk", format!("{} on {}", volume.path, owner.name)))?;

        let snapshot = temporary_snapshot_name();
        let spec = CloneSpec {
            source_vm: owner.name.clone(),
            name: self.helper_name(context),
            datastore: datastore.to_string(),
            mode: CloneMode::Linked {
                snapshot: snapshot.clone(),
            },
            only_disk: Some(pre_top.clone()),
        };

        let vms_ref = &vms;
        let spec_ref = &spec;
        let descriptor = with_temporary_snapshot(vms.as_ref(), &owner.name, &snapshot, || async move {
            let helper = HelperVm::clone_from(vms_ref.clone(), spec_ref).await?;
            helper
                .run(|name| async move {
                    self.pipeline
                        .export_disk(vms_ref.as_ref(), &name, dest_dir, base_name)
                        .await
                })
                .await
        })
        .await?;

        let volume_path = if files.file_exists(&pre_top).await? {
            volume.path.clone()
        } else {
            let refreshed = vms
                .find_vm(&owner.name)
                .await?
                .ok_or_else(|| Error::not_found("VM", owner.name.as_str()))?;
            let top = refreshed
                .disks
                .get(index)
                .and_then(|d| d.top())
                .ok_or_else(|| Error::not_found("Disk", format!("#{} on {}", index, owner.name)))?;
            info!("Export consolidated {}, top of chain is now {}", pre_top, top);
            top.disk_base_name().unwrap_or(&volume.path).to_string()
        };

        Ok(VolumeExport {
            descriptor,
            volume_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::command::{ObjectType, StoreRef};
    use crate::controlplane::testing::Fixture;
    use crate::error::ErrorAction;
    use crate::sim::SimFault;

    #[test]
    fn test_clone_strategy_is_deterministic() {
        let gib = 1u64 << 30;
        for _ in 0..3 {
            assert_eq!(clone_strategy(20 * gib, 10 * gib, "base"), CloneMode::Full);
            assert_eq!(
                clone_strategy(10 * gib, 10 * gib, "base"),
                CloneMode::Linked {
                    snapshot: "base".into()
                }
            );
            assert_eq!(
                clone_strategy(gib, 10 * gib, "base"),
                CloneMode::Linked {
                    snapshot: "base".into()
                }
            );
        }
    }

    #[tokio::test]
    async fn test_session_fault_invalidates_session() {
        let fx = Fixture::new(1).await;
        let volume = fx.volume("vol1", 1 << 30);
        assert!(fx.orchestrator.execute(StorageCommand::CreateVolume { volume, context: BTreeMap::new() }).await.success);
        assert_eq!(fx.sim.connection_count(), 1);

        fx.sim.inject_fault("vm.create", SimFault::SessionExpired);
        let answer = fx
            .orchestrator
            .execute(StorageCommand::CreateVolume {
                volume: fx.volume("vol2", 1 << 30),
                context: BTreeMap::new(),
            })
            .await;
        assert!(!answer.success);
        assert!(answer.error_message.unwrap().starts_with("createVolume failed"));
        assert_eq!(fx.pool.cached_sessions(), 0);

        let answer = fx
            .orchestrator
            .execute(StorageCommand::CreateVolume {
                volume: fx.volume("vol2", 1 << 30),
                context: BTreeMap::new(),
            })
            .await;
        assert!(answer.success);
        assert_eq!(fx.sim.connection_count(), 2);
        assert_eq!(fx.orchestrator.metrics().count("createVolume", false), 1);
    }

    #[tokio::test]
    async fn test_unroutable_copy_is_rejected() {
        let fx = Fixture::new(1).await;
        let template = ObjectDescriptor::new(ObjectType::Template, "t", fx.secondary());
        let snapshot = ObjectDescriptor::new(ObjectType::Snapshot, "s", StoreRef::Primary(fx.primary()));

        let answer = fx
            .orchestrator
            .execute(StorageCommand::Copy(CopyCommand {
                source: template,
                destination: snapshot,
                wait_seconds: None,
                context: BTreeMap::new(),
            }))
            .await;
        assert!(!answer.success);
        assert!(fx.sim.event_log().is_empty());
    }

    #[test]
    fn test_session_fault_action() {
        let err = Error::RemoteSessionFault("expired".into()).in_operation("attachVolume");
        assert_eq!(err.action(), ErrorAction::Reconnect);
    }
}
