//! Cluster Host Coordinator
//!
//! Runs one host-level action on every host of a cluster in parallel and
//! waits for the cluster to agree on the result.

use crate::config::CoordinatorConfig;
use crate::domain::ports::HostHandle;
use crate::error::{Error, Result};
use futures::future::try_join_all;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fans host actions out over a worker pool sized to the host count
#[derive(Debug, Clone, Default)]
pub struct ClusterHostCoordinator {
    config: CoordinatorConfig,
}

impl ClusterHostCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run `action` against every host and wait for all of them.
    ///
    /// Every host is attempted even when others fail. All failures are
    /// logged; the one from the lowest-indexed host is returned.
    pub async fn fan_out<F, Fut>(&self, action_name: &str, hosts: &[HostHandle], action: F) -> Result<()>
    where
        F: Fn(HostHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if hosts.is_empty() {
            return Ok(());
        }

        debug!("Fanning out '{}' to {} host(s)", action_name, hosts.len());

        let semaphore = Arc::new(Semaphore::new(hosts.len()));
        let action = Arc::new(action);
        let mut set = JoinSet::new();

        for (index, host) in hosts.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let action = Arc::clone(&action);
            set.spawn(async move {
                let name = host.name().to_string();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => AssertUnwindSafe((*action)(host))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(Error::Internal("host action panicked".into()))),
                    Err(_) => Err(Error::Internal("worker pool closed".into())),
                };
                (index, name, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => {}
                Ok((index, host, Err(e))) => failures.push((index, host, e)),
                Err(e) => failures.push((usize::MAX, "<unknown>".to_string(), Error::Internal(e.to_string()))),
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        failures.sort_by_key(|(index, _, _)| *index);
        for (_, host, e) in &failures {
            warn!("'{}' failed on host {}: {}", action_name, host, e);
        }

        let (_, host, source) = failures.swap_remove(0);
        Err(Error::HostAction {
            host,
            action: action_name.to_string(),
            source: Box::new(source),
        })
    }

    /// Poll `predicate` until it holds or the deadline passes.
    ///
    /// A predicate failing with NotFound means "not yet"; any other
    /// failure aborts the wait.
    pub async fn await_convergence<P, Fut>(&self, hosts: &[HostHandle], what: &str, mut predicate: P) -> Result<()>
    where
        P: FnMut(Vec<HostHandle>) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let started = Instant::now();
        let deadline = started + self.config.deadline();
        let mut polls = 0u32;

        loop {
            polls += 1;
            match predicate(hosts.to_vec()).await {
                Ok(true) => {
                    if polls > 1 {
                        info!("Cluster converged on '{}' after {} poll(s)", what, polls);
                    }
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if e.is_not_found() => debug!("'{}' not yet visible: {}", what, e),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Cluster did not converge on '{}' after {} poll(s)", what, polls);
                return Err(Error::ConvergenceTimeout {
                    what: what.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }
}

// =============================================================================
// Convergence Predicates
// =============================================================================

/// Every host has the datastore mounted and accessible
pub async fn datastore_ready_on(hosts: Vec<HostHandle>, name: String) -> Result<bool> {
    let mounts = try_join_all(hosts.iter().map(|h| h.datastore_mount(&name))).await?;
    Ok(mounts.iter().all(|m| m.map(|m| m.is_ready()).unwrap_or(false)))
}

/// Every host knows the datastore, mounted or not
pub async fn datastore_visible_on(hosts: Vec<HostHandle>, name: String) -> Result<bool> {
    let mounts = try_join_all(hosts.iter().map(|h| h.datastore_mount(&name))).await?;
    Ok(mounts.iter().all(Option::is_some))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ClusterInventory;
    use crate::sim::SimulatedCluster;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_coordinator() -> ClusterHostCoordinator {
        ClusterHostCoordinator::new(CoordinatorConfig {
            poll_interval_ms: 100,
            deadline_ms: 300,
        })
    }

    async fn hosts(count: usize) -> Vec<HostHandle> {
        let sim = SimulatedCluster::builder().cluster("c1", count).build();
        sim.cluster_hosts("c1").await.unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_host() {
        let hosts = hosts(4).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        fast_coordinator()
            .fan_out("count", &hosts, move |_host| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fan_out_first_error_wins_after_all_attempted() {
        let hosts = hosts(4).await;
        let failing = [hosts[1].name().to_string(), hosts[3].name().to_string()];
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let err = fast_coordinator()
            .fan_out("rescan", &hosts, move |host| {
                let counter = counter.clone();
                let failing = failing.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let name = host.name().to_string();
                    if name == failing[0] {
                        // The lower-indexed host finishes last
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        return Err(Error::Internal(format!("boom on {}", name)));
                    }
                    if name == failing[1] {
                        return Err(Error::Internal(format!("boom on {}", name)));
                    }
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_matches!(err, Error::HostAction { ref host, .. } if host == hosts[1].name());
    }

    #[tokio::test]
    async fn test_convergence_immediate() {
        let hosts = hosts(2).await;
        let started = std::time::Instant::now();
        fast_coordinator()
            .await_convergence(&hosts, "always", |_| async { Ok(true) })
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_convergence_timeout() {
        let hosts = hosts(2).await;
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();

        let err = fast_coordinator()
            .await_convergence(&hosts, "never", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::ConvergenceTimeout { ref what, waited } if what == "never" && waited >= Duration::from_millis(300));
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_convergence_treats_not_found_as_pending() {
        let hosts = hosts(1).await;
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();

        fast_coordinator()
            .await_convergence(&hosts, "eventually", move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::not_found("Datastore", "ds"))
                    } else {
                        Ok(n >= 1)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 2);

        let err = fast_coordinator()
            .await_convergence(&hosts, "broken", |_| async {
                Err::<bool, _>(Error::RemoteSessionFault("expired".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_session_fault());
    }
}
