//! The node reconciliation loop.
//!
//! A single dispatch task consumes the node watch: applied nodes are keyed
//! into the work queue, deleted nodes release their CIDR synchronously, and a
//! re-list reconciles the known-node set (releasing CIDRs of nodes that
//! vanished while the watch was down). A fixed pool of workers drains the
//! queue through [`Controller::sync_node`], which is idempotent and safe
//! under replay.

use crate::cidr::{self, CidrAllocator};
use crate::k8s::{self, Event, Node, NodeEvents, Nodes, ObjectRef, ResourceExt, Store};
use crate::labels::Selector;
use crate::queue::WorkQueue;
use crate::taints::{self, TaintRemover};
use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};


pub struct Controller<N> {
    nodes: N,
    cache: Store<Node>,
    queue: Arc<WorkQueue<String>>,
    allocator: CidrAllocator,
    selector: Selector,
    taint_remover: Option<TaintRemover>,
}

// === impl Controller ===

impl<N: Nodes> Controller<N> {
    pub fn new(
        nodes: N,
        cache: Store<Node>,
        cluster_cidr: Ipv4Net,
        node_cidr_mask_size: u8,
        selector: Selector,
        taint_remover: Option<TaintRemover>,
    ) -> Result<Self, cidr::Error> {
        Ok(Self {
            nodes,
            cache,
            queue: Arc::new(WorkQueue::new()),
            allocator: CidrAllocator::new(cluster_cidr, node_cidr_mask_size)?,
            selector,
            taint_remover,
        })
    }

    /// Drives the controller until `shutdown` resolves: waits for the watch
    /// to deliver the initial node list, seeds the allocator from it, then
    /// runs `workers` queue consumers.
    pub async fn run(
        self: Arc<Self>,
        events: NodeEvents,
        ready: watch::Sender<bool>,
        workers: usize,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut synced = ready.subscribe();
        let mut dispatch = tokio::spawn(self.clone().dispatch(events, ready));
        tokio::pin!(shutdown);

        info!("Waiting for the node cache to sync");
        while !*synced.borrow() {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    dispatch.abort();
                    return Ok(());
                }
                changed = synced.changed() => {
                    if changed.is_err() {
                        bail!("node watch terminated before the cache synced");
                    }
                }
            }
        }
        self.seed_allocator();

        info!(workers, "Starting reconciliation workers");
        let handles = (0..workers)
            .map(|_| tokio::spawn(self.clone().worker()))
            .collect::<Vec<_>>();

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                dispatch.abort();
                self.queue.shut_down();
            }
            res = &mut dispatch => {
                self.queue.shut_down();
                for handle in handles {
                    let _ = handle.await;
                }
                match res {
                    Ok(()) => bail!("node watch unexpectedly terminated"),
                    Err(error) => bail!("node dispatch task failed: {}", error),
                }
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Routes watch events. Runs as a single task so the known-node map needs
    /// no synchronization; only the allocator and queue are shared.
    async fn dispatch(self: Arc<Self>, mut events: NodeEvents, ready: watch::Sender<bool>) {
        // Last observed pod CIDR per node, kept to release CIDRs of nodes
        // whose deletion was missed across a watch restart.
        let mut known: HashMap<String, Option<String>> = HashMap::new();

        loop {
            match events.recv().await {
                Event::Applied(node) => {
                    let name = node.name();
                    known.insert(name.clone(), pod_cidr(&node).map(String::from));
                    self.queue.add(name);
                }
                Event::Deleted(node) => {
                    known.remove(&node.name());
                    self.release_deleted(&node);
                }
                Event::Restarted(nodes) => {
                    let prior = std::mem::take(&mut known);
                    self.handle_restart(nodes, prior, &mut known);
                    let _ = ready.send(true);
                }
            }
        }
    }

    /// Returns a deleted node's CIDR to the pool. Foreign or malformed CIDRs
    /// were never tracked, so failures here only warrant a log line.
    fn release_deleted(&self, node: &Node) {
        let name = node.name();
        if let Some(cidr) = pod_cidr(node) {
            match self.allocator.release(cidr) {
                Ok(()) => info!(node = %name, %cidr, "Released pod CIDR of deleted node"),
                Err(error) => {
                    warn!(node = %name, %cidr, %error, "Could not release pod CIDR of deleted node")
                }
            }
        }
    }

    /// Reconciles the known-node set against a full re-list: every listed
    /// node is re-enqueued, and nodes that vanished during the watch gap have
    /// their recorded CIDRs released.
    fn handle_restart(
        &self,
        nodes: Vec<Node>,
        mut prior: HashMap<String, Option<String>>,
        known: &mut HashMap<String, Option<String>>,
    ) {
        for node in nodes {
            let name = node.name();
            prior.remove(&name);
            known.insert(name.clone(), pod_cidr(&node).map(String::from));
            self.queue.add(name);
        }

        for (name, cidr) in prior {
            debug!(node = %name, "Node disappeared during watch gap");
            if let Some(cidr) = cidr {
                match self.allocator.release(&cidr) {
                    Ok(()) => info!(node = %name, %cidr, "Released pod CIDR of vanished node"),
                    Err(error) => {
                        warn!(node = %name, %cidr, %error, "Could not release pod CIDR of vanished node")
                    }
                }
            }
        }
    }

    /// Reserves every CIDR already assigned in the cluster, selector match or
    /// not, so fresh allocations can never collide with an existing range.
    /// Best effort: foreign assignments are logged and left untracked.
    fn seed_allocator(&self) {
        for node in self.cache.state() {
            if let Some(cidr) = pod_cidr(&node) {
                match self.allocator.mark_allocated(cidr) {
                    Ok(()) => info!(node = %node.name(), %cidr, "Reserved existing pod CIDR"),
                    Err(error) => {
                        warn!(node = %node.name(), %cidr, %error, "Skipping pod CIDR outside the cluster range")
                    }
                }
            }
        }
    }

    async fn worker(self: Arc<Self>) {
        while let Some(name) = self.queue.get().await {
            match self.sync_node(&name).await {
                Ok(()) => self.queue.forget(&name),
                Err(error) => {
                    // Conflicts are routine; the retry re-reads and settles.
                    if error
                        .downcast_ref::<kube::Error>()
                        .map_or(false, k8s::is_conflict)
                    {
                        debug!(node = %name, "Node changed while updating; retrying");
                    } else {
                        warn!(node = %name, ?error, "Failed to reconcile node");
                    }
                    self.queue.add_rate_limited(name.clone());
                }
            }
            self.queue.done(&name);
        }
    }

    /// Drives one node toward its desired state. Idempotent: replays and
    /// reorderings settle on the same node and allocator state.
    #[instrument(skip(self))]
    async fn sync_node(&self, name: &str) -> Result<()> {
        // The delete handler has already released anything a missing node
        // held.
        let node = match self.cache.get(&ObjectRef::new(name)) {
            Some(node) => node,
            None => return Ok(()),
        };

        if let Some(remover) = &self.taint_remover {
            self.remove_taints(name, &node, remover).await?;
        }

        if pod_cidr(&node).is_some() {
            return Ok(());
        }

        if !self.selector.matches(&node.metadata.labels.clone().into()) {
            debug!("Node does not match the selector");
            return Ok(());
        }

        let cidr = self
            .allocator
            .allocate_next()
            .with_context(|| format!("failed to allocate a pod CIDR for node {}", name))?;

        let mut updated = node;
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.pod_cidr = Some(cidr.clone());
        spec.pod_cidrs = Some(vec![cidr.clone()]);

        if let Err(error) = self.nodes.update(&updated).await {
            // Return the block before surfacing the error so the bitmap does
            // not leak when the write loses a race.
            if let Err(release_error) = self.allocator.release(&cidr) {
                warn!(%cidr, error = %release_error, "Could not roll back allocation");
            }
            return Err(error)
                .with_context(|| format!("failed to assign CIDR {} to node {}", cidr, name));
        }

        info!(%cidr, "Assigned pod CIDR");
        Ok(())
    }

    /// Strips matching taints. The decision to act is made on the cached
    /// node, but the write is built from a fresh authoritative read so a
    /// stale cache does not produce avoidable conflicts.
    async fn remove_taints(&self, name: &str, cached: &Node, remover: &TaintRemover) -> Result<()> {
        if remover.taints_to_remove(cached).is_empty() {
            return Ok(());
        }

        let fresh = self
            .nodes
            .get(name)
            .await
            .with_context(|| format!("failed to fetch node {}", name))?;

        // Another writer may have beaten us to it.
        let to_remove = remover.taints_to_remove(&fresh);
        if to_remove.is_empty() {
            return Ok(());
        }

        let mut updated = fresh;
        let spec = updated.spec.get_or_insert_with(Default::default);
        let kept = taints::filter_out(spec.taints.as_deref().unwrap_or(&[]), &to_remove);
        spec.taints = if kept.is_empty() { None } else { Some(kept) };

        self.nodes
            .update(&updated)
            .await
            .with_context(|| format!("failed to remove taints from node {}", name))?;

        info!(taints = ?taints::taint_ids(&to_remove), "Removed taints");
        Ok(())
    }
}

/// The node's assigned pod CIDR, if any. An empty string counts as
/// unassigned.
fn pod_cidr(node: &Node) -> Option<&str> {
    node.spec
        .as_ref()?
        .pod_cidr
        .as_deref()
        .filter(|cidr| !cidr.is_empty())
}
