//! Live registry of every node the orchestrator knows about.
//!
//! Adding reserves the node's slot under the write lock before provisioning
//! starts, so a duplicate id is rejected without side effects. Provisioning
//! and removal each run on their own task; callers await shared futures and
//! may drop them without stopping the work.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::configuration::NodeConfiguration;
use crate::error::{NodeError, ProvisionError, RegistryError, ShutdownReport};
use crate::ids::NodeId;
use crate::lifecycle::LifecycleController;
use crate::lock;
use crate::node::{NodeCell, NodeDescriptor};

type Outcome = Shared<BoxFuture<'static, Result<NodeDescriptor, NodeError>>>;

/// Resolves once a node reaches `Running` or `Failed`. Clone freely.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    outcome: Outcome,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Future for NodeHandle {
    type Output = Result<NodeDescriptor, NodeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("id", &self.id).finish()
    }
}

struct Entry {
    node: NodeCell,
    config: Arc<NodeConfiguration>,
    provisioning: Outcome,
    removal: Option<Outcome>,
}

type Entries = Arc<RwLock<BTreeMap<NodeId, Entry>>>;

/// Concurrent node registry.
#[derive(Clone)]
pub struct NodeRegistry {
    controller: LifecycleController,
    entries: Entries,
    deployments: Arc<Semaphore>,
    cancel: Arc<Mutex<watch::Sender<bool>>>,
    closed: Arc<AtomicBool>,
}

impl NodeRegistry {
    /// Create a registry running at most `max_parallel_deployments`
    /// pipelines at once.
    pub fn new(controller: LifecycleController, max_parallel_deployments: usize) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            controller,
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            deployments: Arc::new(Semaphore::new(max_parallel_deployments.max(1))),
            cancel: Arc::new(Mutex::new(cancel)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    /// Provision a node under a fresh id.
    pub async fn add(&self, config: Arc<NodeConfiguration>) -> Result<NodeHandle, RegistryError> {
        self.add_with_id(NodeId::new(), config).await
    }

    /// Provision a node under `id`.
    ///
    /// Configuration errors are returned here, before the node exists.
    pub async fn add_with_id(
        &self,
        id: NodeId,
        config: Arc<NodeConfiguration>,
    ) -> Result<NodeHandle, RegistryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        let backend = self.controller.validate(&config).await?;

        let mut entries = self.entries.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        if entries.contains_key(&id) {
            return Err(RegistryError::Conflict(id));
        }
        let node = self.controller.prepare(id, &config, backend.as_ref());

        let controller = self.controller.clone();
        let deployments = self.deployments.clone();
        let cancel = lock(&self.cancel).subscribe();
        let task_node = node.clone();
        let task_config = config.clone();
        let task = tokio::spawn(async move {
            let _permit = match deployments.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let failure =
                        NodeError::new(id, ProvisionError::Aborted("deployment limiter closed".into()));
                    task_node.fail(failure.clone()).await;
                    return Err(failure);
                }
            };
            controller.provision(task_node, task_config, backend, cancel).await
        });
        let provisioning = settle(id, node.clone(), task);

        entries.insert(
            id,
            Entry {
                node,
                config,
                provisioning: provisioning.clone(),
                removal: None,
            },
        );
        debug!(node_id = %id, tracked = entries.len(), "Node added");
        Ok(NodeHandle {
            id,
            outcome: provisioning,
        })
    }

    /// Stop and forget a node.
    ///
    /// A node still provisioning is stopped once it is running. The entry is
    /// dropped when the node terminates, and also when provisioning failed
    /// since nothing is left to clean up. A node whose stop failed stays
    /// tracked in `Failed`, and removing it again returns the same error.
    pub async fn remove(&self, id: NodeId) -> Result<NodeDescriptor, RegistryError> {
        let removal = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            match &entry.removal {
                Some(removal) => removal.clone(),
                None => {
                    let removal = self.start_removal(id, entry);
                    entry.removal = Some(removal.clone());
                    removal
                }
            }
        };
        Ok(removal.await?)
    }

    fn start_removal(&self, id: NodeId, entry: &Entry) -> Outcome {
        let controller = self.controller.clone();
        let entries = self.entries.clone();
        let provisioning = entry.provisioning.clone();
        let node = entry.node.clone();
        let config = entry.config.clone();

        let task = tokio::spawn(async move {
            let stopped = match provisioning.await {
                Ok(_) => controller.stop(&node, config).await,
                Err(e) => {
                    info!(node_id = %id, "Dropping node that failed to provision");
                    entries.write().await.remove(&id);
                    return Err(e);
                }
            };
            if stopped.is_ok() {
                entries.write().await.remove(&id);
            }
            stopped
        });
        settle(id, entry.node.clone(), task)
    }

    /// Descriptors of every tracked node, in creation order.
    pub async fn snapshot(&self) -> Vec<NodeDescriptor> {
        let cells: Vec<NodeCell> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.node.clone())
            .collect();
        let mut descriptors = Vec::with_capacity(cells.len());
        for cell in cells {
            descriptors.push(cell.descriptor().await);
        }
        descriptors
    }

    pub async fn get(&self, id: NodeId) -> Option<NodeDescriptor> {
        let cell = self.entries.read().await.get(&id).map(|e| e.node.clone())?;
        Some(cell.descriptor().await)
    }

    /// Provisioning outcome of a tracked node.
    pub async fn handle(&self, id: NodeId) -> Option<NodeHandle> {
        self.entries.read().await.get(&id).map(|e| NodeHandle {
            id,
            outcome: e.provisioning.clone(),
        })
    }

    /// UUID the grid runtime gave a running node, when a management client
    /// is configured and the node has a reachable endpoint.
    pub async fn node_uuid(&self, id: NodeId) -> Result<Option<String>, RegistryError> {
        let (node, config) = {
            let entries = self.entries.read().await;
            let entry = entries.get(&id).ok_or(RegistryError::NotFound(id))?;
            (entry.node.clone(), entry.config.clone())
        };
        Ok(self.controller.node_uuid(&node, &config).await?)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Abort deployments in flight at their next step boundary.
    ///
    /// Nodes added afterwards deploy normally.
    pub fn cancel_in_flight(&self) {
        let (fresh, _) = watch::channel(false);
        let previous = std::mem::replace(&mut *lock(&self.cancel), fresh);
        previous.send_replace(true);
        warn!("Cancelling in-flight deployments");
    }

    /// Refuse new nodes and remove every tracked one concurrently.
    pub async fn close_all(&self) -> ShutdownReport {
        let ids: Vec<NodeId> = {
            let entries = self.entries.write().await;
            self.closed.store(true, Ordering::SeqCst);
            entries.keys().copied().collect()
        };
        info!(nodes = ids.len(), "Shutting down all nodes");

        let outcomes = join_all(ids.iter().map(|id| self.remove(*id))).await;
        let mut report = ShutdownReport::default();
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.terminated.push(id),
                Err(RegistryError::NotFound(_)) => {
                    debug!(node_id = %id, "Node already removed");
                }
                Err(RegistryError::Node(e)) => report.failures.push(e),
                Err(e) => report
                    .failures
                    .push(NodeError::new(id, ProvisionError::Aborted(e.to_string()))),
            }
        }
        if report.is_clean() {
            info!(terminated = report.terminated.len(), "All nodes terminated");
        } else {
            warn!(
                terminated = report.terminated.len(),
                failed = report.failures.len(),
                "Some nodes failed to terminate"
            );
        }
        report
    }
}

/// Share the outcome of a node task. A panicked task fails the node.
fn settle(
    id: NodeId,
    node: NodeCell,
    task: tokio::task::JoinHandle<Result<NodeDescriptor, NodeError>>,
) -> Outcome {
    async move {
        match task.await {
            Ok(result) => result,
            Err(e) => {
                let failure = NodeError::new(id, ProvisionError::Aborted(e.to_string()));
                node.fail(failure.clone()).await;
                Err(failure)
            }
        }
    }
    .boxed()
    .shared()
}
