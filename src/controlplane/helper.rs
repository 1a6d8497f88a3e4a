//! Disposable helper VMs
//!
//! Several operations need a VM only to own a disk for a moment. A
//! [`HelperVm`] is acquired, handed to a body, and destroyed afterwards
//! whatever the body returned.

use crate::domain::path::DatastorePath;
use crate::domain::ports::{CloneSpec, VmManager, VmSpec};
use crate::error::Result;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct HelperVm {
    name: String,
    datastore: String,
    vms: Arc<dyn VmManager>,
    released: bool,
}

impl HelperVm {
    /// Create an empty helper VM
    pub async fn create(vms: Arc<dyn VmManager>, name: &str, datastore: &str) -> Result<Self> {
        vms.create_vm(&VmSpec {
            name: name.to_string(),
            datastore: datastore.to_string(),
        })
        .await?;
        info!("Created helper VM {} on {}", name, datastore);
        Ok(Self::track(vms, name, datastore))
    }

    /// Clone a helper VM from another VM
    pub async fn clone_from(vms: Arc<dyn VmManager>, spec: &CloneSpec) -> Result<Self> {
        vms.clone_vm(spec).await?;
        info!("Cloned helper VM {} from {} on {}", spec.name, spec.source_vm, spec.datastore);
        Ok(Self::track(vms, &spec.name, &spec.datastore))
    }

    /// Import a helper VM from an OVF descriptor
    pub async fn import(vms: Arc<dyn VmManager>, descriptor: &Path, name: &str, datastore: &str) -> Result<Self> {
        vms.import_ovf(descriptor, name, datastore).await?;
        info!("Imported helper VM {} from {}", name, descriptor.display());
        Ok(Self::track(vms, name, datastore))
    }

    fn track(vms: Arc<dyn VmManager>, name: &str, datastore: &str) -> Self {
        Self {
            name: name.to_string(),
            datastore: datastore.to_string(),
            vms,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The helper's folder on its datastore
    pub fn folder(&self) -> DatastorePath {
        DatastorePath::new(self.datastore.as_str(), self.name.as_str())
    }

    /// Destroy the helper and every file it still owns
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.vms.destroy_vm(&self.name).await?;
        info!("Released helper VM {}", self.name);
        Ok(())
    }

    /// Run `body` with the helper's name, then release the helper.
    ///
    /// The body's error wins over a release error; a release error after a
    /// successful body fails the call.
    pub async fn run<T, F, Fut>(self, body: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = self.name.clone();
        let result = body(name.clone()).await;

        match (result, self.release().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => {
                error!("Failed to release helper VM {}: {}", name, e);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                error!("Failed to release helper VM {} after error: {}", name, release_err);
                Err(e)
            }
        }
    }
}

impl Drop for HelperVm {
    fn drop(&mut self) {
        if !self.released {
            warn!("Helper VM {} dropped without release", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sim::{SimFault, SimulatedCluster};

    fn sim() -> SimulatedCluster {
        SimulatedCluster::builder()
            .cluster("c1", 1)
            .local_datastore("ds1", "c1", 1 << 40)
            .build()
    }

    #[tokio::test]
    async fn test_released_after_failing_body() {
        let sim = sim();
        let helper = HelperVm::create(Arc::new(sim.clone()), "helper-1", "ds1").await.unwrap();

        let result: Result<()> = helper
            .run(|_| async { Err(Error::Internal("export failed".into())) })
            .await;

        assert!(result.is_err());
        assert!(sim.vm_names().is_empty());
    }

    #[tokio::test]
    async fn test_release_failure_surfaces_after_success() {
        let sim = sim();
        let helper = HelperVm::create(Arc::new(sim.clone()), "helper-1", "ds1").await.unwrap();
        sim.inject_fault("vm.destroy", SimFault::Failure("locked".into()));

        let result = helper.run(|name| async move { Ok(name) }).await;
        assert!(result.is_err());
    }
}
