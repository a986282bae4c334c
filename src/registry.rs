//! NodeRegistry: the in-memory map from node identifier to whatever is
//! running that node.
//!
//! The map is sharded (`DashMap`) so calls for different nodes never wait on
//! each other. Calls for the same node are serialized by a per-node async
//! mutex ("slot"), which is the only lock held while a native command runs.
use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    process::Child,
    sync::{Mutex, OwnedMutexGuard},
};
use tracing::{debug, info, warn};

use crate::{
    error::{BridgeError, Result},
    node::{NodeId, NodeStatus},
};

/// What the registry holds for a running node.
pub enum NodeHandle {
    /// A worker process spawned and owned by this bridge.
    Process(ProcessHandle),
    /// The OS service manager tracks the unit by name; nothing to own here.
    Managed,
}

impl NodeHandle {
    pub(crate) fn from_child(child: Child) -> Self {
        NodeHandle::Process(ProcessHandle { child })
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHandle::Process(p) => write!(f, "Process(pid={:?})", p.child.id()),
            NodeHandle::Managed => f.write_str("Managed"),
        }
    }
}

/// Opaque wrapper so the child process never leaves this module.
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(?status, "worker process has exited");
                false
            }
            Err(err) => {
                warn!(error = %err, "could not probe worker process, treating as exited");
                false
            }
        }
    }

    async fn terminate(mut self, id: &NodeId) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.child.start_kill().map_err(|source| BridgeError::Terminate {
            id: id.to_string(),
            source,
        })?;
        self.child.wait().await.map_err(|source| BridgeError::Terminate {
            id: id.to_string(),
            source,
        })?;
        Ok(())
    }
}

/// The native side of one node: how to ask the OS about it and how to stop
/// it when the registry has nothing of its own to terminate.
#[async_trait]
pub trait NativeUnit: Send + Sync {
    async fn query(&self) -> NodeStatus;
    async fn halt(&self) -> Result<()>;
}

/// Handles that were tracked by name only, returned by [`NodeRegistry::drain`]
/// so the caller can stop them natively.
#[derive(Debug, Default)]
pub struct Drained {
    pub managed: Vec<NodeId>,
    pub failures: Vec<BridgeError>,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    handles: DashMap<NodeId, NodeHandle>,
    slots: DashMap<NodeId, Arc<Mutex<()>>>,
}

/// Holds the per-node lock; on release the slot is forgotten once nobody
/// else is waiting for it.
struct SlotGuard<'a> {
    registry: &'a NodeRegistry,
    id: NodeId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // waiters hold a clone of the Arc, so a count of 1 means only the map has it
        self.registry
            .slots
            .remove_if(&self.id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: &NodeId) -> SlotGuard<'_> {
        // clone the Arc out so the shard guard is released before awaiting
        let slot = self.slots.entry(id.clone()).or_default().value().clone();
        SlotGuard {
            registry: self,
            id: id.clone(),
            guard: Some(slot.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Start `id` unless it is already running.
    ///
    /// A stale entry (process exited, or the service manager reports the
    /// unit is no longer active) is dropped and the start goes ahead. A
    /// tracked unit whose state cannot be queried is not started again.
    pub async fn start<F, Fut>(&self, id: &NodeId, unit: &dyn NativeUnit, spawn: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<NodeHandle>>,
    {
        let _slot = self.slot(id).await;

        match self.verify(id, unit).await {
            Some(NodeStatus::Running) => return Err(BridgeError::AlreadyRunning(id.to_string())),
            Some(NodeStatus::Unknown) => return Err(BridgeError::StatusUnknown(id.to_string())),
            Some(NodeStatus::Stopped) | None => {}
        }

        let handle = spawn().await?;
        info!(node = %id, ?handle, "node started");
        self.handles.insert(id.clone(), handle);
        Ok(())
    }

    /// Stop `id`. Owned processes are killed and reaped here; anything else
    /// is delegated to `unit.halt()`.
    pub async fn stop(&self, id: &NodeId, unit: &dyn NativeUnit) -> Result<()> {
        let _slot = self.slot(id).await;

        match self.handles.remove(id).map(|(_, h)| h) {
            Some(NodeHandle::Process(process)) => {
                process.terminate(id).await?;
                info!(node = %id, "worker process terminated");
                Ok(())
            }
            Some(NodeHandle::Managed) => {
                if let Err(err) = unit.halt().await {
                    // keep believing it runs; the stop did not happen
                    self.handles.insert(id.clone(), NodeHandle::Managed);
                    return Err(err);
                }
                Ok(())
            }
            None => unit.halt().await,
        }
    }

    /// Current status of `id`, always verified against the process or the
    /// OS rather than trusting the cached entry.
    pub async fn status(&self, id: &NodeId, unit: &dyn NativeUnit) -> NodeStatus {
        let _slot = self.slot(id).await;
        match self.verify(id, unit).await {
            Some(status) => status,
            None => unit.query().await,
        }
    }

    /// Reconcile the cached entry for `id` with reality. Returns `None` when
    /// there is no entry, otherwise the verified status. Only entries found
    /// stopped are removed; an unknown state keeps the entry. Caller must
    /// hold the slot.
    async fn verify(&self, id: &NodeId, unit: &dyn NativeUnit) -> Option<NodeStatus> {
        let process_alive = {
            let mut entry = self.handles.get_mut(id)?;
            match entry.value_mut() {
                NodeHandle::Process(process) => Some(process.is_alive()),
                NodeHandle::Managed => None,
            }
        };

        let status = match process_alive {
            Some(true) => NodeStatus::Running,
            Some(false) => NodeStatus::Stopped,
            None => unit.query().await,
        };
        match status {
            NodeStatus::Stopped => {
                debug!(node = %id, "dropping stale registry entry");
                self.handles.remove(id);
            }
            NodeStatus::Unknown => warn!(node = %id, "node state unknown, keeping registry entry"),
            NodeStatus::Running => {}
        }
        Some(status)
    }

    /// Remove every entry, terminating owned processes.
    pub async fn drain(&self) -> Drained {
        let ids: Vec<NodeId> = self.handles.iter().map(|kv| kv.key().clone()).collect();
        let mut drained = Drained::default();
        for id in ids {
            let _slot = self.slot(&id).await;
            match self.handles.remove(&id).map(|(_, h)| h) {
                Some(NodeHandle::Process(process)) => {
                    if let Err(err) = process.terminate(&id).await {
                        drained.failures.push(err);
                    }
                }
                Some(NodeHandle::Managed) => drained.managed.push(id),
                None => {}
            }
        }
        drained
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.handles.iter().map(|kv| kv.key().clone()).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A service-manager stand-in with a switchable state.
    #[derive(Default)]
    pub(crate) struct FakeUnit {
        pub running: std::sync::atomic::AtomicBool,
        pub fail_query: std::sync::atomic::AtomicBool,
        pub halts: AtomicUsize,
    }

    #[async_trait]
    impl NativeUnit for FakeUnit {
        async fn query(&self) -> NodeStatus {
            if self.fail_query.load(Ordering::SeqCst) {
                NodeStatus::Unknown
            } else if self.running.load(Ordering::SeqCst) {
                NodeStatus::Running
            } else {
                NodeStatus::Stopped
            }
        }

        async fn halt(&self) -> Result<()> {
            self.halts.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn id(raw: &str) -> NodeId {
        NodeId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn unknown_node_is_never_running() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        assert_eq!(registry.status(&id("never-started"), &unit).await, NodeStatus::Stopped);

        unit.fail_query.store(true, Ordering::SeqCst);
        assert_eq!(registry.status(&id("never-started"), &unit).await, NodeStatus::Unknown);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        let node = id("xray-node-jp");

        registry
            .start(&node, &unit, || async {
                unit.running.store(true, Ordering::SeqCst);
                Ok(NodeHandle::Managed)
            })
            .await
            .unwrap();

        for _ in 0..3 {
            let err = registry
                .start(&node, &unit, || async { Ok(NodeHandle::Managed) })
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::AlreadyRunning(_)));
        }
        assert!(registry.contains(&node));
    }

    #[tokio::test]
    async fn failed_spawn_leaves_registry_unchanged() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        let node = id("xray-node-ca");

        let err = registry
            .start(&node, &unit, || async { Err(BridgeError::Unsupported) })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unsupported));
        assert!(!registry.contains(&node));
    }

    #[tokio::test]
    async fn externally_stopped_managed_unit_can_be_restarted() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        let node = id("xray-node-us");

        registry.start(&node, &unit, || async { Ok(NodeHandle::Managed) }).await.unwrap();
        // the fake reports stopped: the cached entry is stale
        assert_eq!(registry.status(&node, &unit).await, NodeStatus::Stopped);
        assert!(!registry.contains(&node));

        registry.start(&node, &unit, || async { Ok(NodeHandle::Managed) }).await.unwrap();
        assert!(registry.contains(&node));
    }

    #[tokio::test]
    async fn unqueryable_unit_keeps_its_entry_and_is_not_started_twice() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        let node = id("xray-node-jp");
        let spawns = AtomicUsize::new(0);
        let spawn = || async {
            spawns.fetch_add(1, Ordering::SeqCst);
            unit.running.store(true, Ordering::SeqCst);
            Ok(NodeHandle::Managed)
        };

        registry.start(&node, &unit, spawn).await.unwrap();
        unit.fail_query.store(true, Ordering::SeqCst);
        assert_eq!(registry.status(&node, &unit).await, NodeStatus::Unknown);
        assert!(registry.contains(&node));

        let err = registry
            .start(&node, &unit, || async {
                spawns.fetch_add(1, Ordering::SeqCst);
                Ok(NodeHandle::Managed)
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "status unknown: xray-node-jp");
        assert_eq!(spawns.load(Ordering::SeqCst), 1);

        // once the query works again the entry reconciles normally
        unit.fail_query.store(false, Ordering::SeqCst);
        assert_eq!(registry.status(&node, &unit).await, NodeStatus::Running);
    }

    #[tokio::test]
    async fn per_node_locks_are_released_after_use() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        for n in 0..50 {
            registry.status(&id(&format!("node-{n}")), &unit).await;
            registry.stop(&id(&format!("gone-{n}")), &unit).await.unwrap();
        }
        assert_eq!(registry.slot_count(), 0);

        unit.running.store(true, Ordering::SeqCst);
        registry.start(&id("kept"), &unit, || async { Ok(NodeHandle::Managed) }).await.unwrap();
        assert!(registry.contains(&id("kept")));
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn stop_without_entry_delegates_to_native_halt() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        registry.stop(&id("xray-node-jp"), &unit).await.unwrap();
        assert_eq!(unit.halts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_keep_distinct_handles() {
        let registry = Arc::new(NodeRegistry::new());
        let unit = Arc::new(FakeUnit::default());
        unit.running.store(true, Ordering::SeqCst);

        let mut tasks = Vec::new();
        for name in ["node-a", "node-b", "node-c", "node-d"] {
            let registry = registry.clone();
            let unit = unit.clone();
            tasks.push(tokio::spawn(async move {
                let node = id(name);
                registry.start(&node, unit.as_ref(), || async { Ok(NodeHandle::Managed) }).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut ids: Vec<String> = registry.ids().iter().map(ToString::to_string).collect();
        ids.sort();
        assert_eq!(ids, vec!["node-a", "node-b", "node-c", "node-d"]);
    }

    #[tokio::test]
    async fn same_node_races_start_exactly_once() {
        let registry = Arc::new(NodeRegistry::new());
        let unit = Arc::new(FakeUnit::default());
        let spawned = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let unit = unit.clone();
            let spawned = spawned.clone();
            tasks.push(tokio::spawn(async move {
                let node = id("xray-node-jp");
                let unit_ref = unit.clone();
                registry
                    .start(&node, unit.as_ref(), || async move {
                        spawned.fetch_add(1, Ordering::SeqCst);
                        unit_ref.running.store(true, Ordering::SeqCst);
                        Ok(NodeHandle::Managed)
                    })
                    .await
            }));
        }
        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn owned_process_is_killed_on_stop() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        let node = id("sleeper");

        registry
            .start(&node, &unit, || async {
                let child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
                Ok(NodeHandle::from_child(child))
            })
            .await
            .unwrap();
        assert_eq!(registry.status(&node, &unit).await, NodeStatus::Running);

        registry.stop(&node, &unit).await.unwrap();
        assert_eq!(unit.halts.load(Ordering::SeqCst), 0);
        assert_eq!(registry.status(&node, &unit).await, NodeStatus::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_is_reconciled_to_stopped() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        let node = id("short-lived");

        registry
            .start(&node, &unit, || async {
                let child = tokio::process::Command::new("true").spawn().unwrap();
                Ok(NodeHandle::from_child(child))
            })
            .await
            .unwrap();

        let mut status = NodeStatus::Running;
        for _ in 0..50 {
            status = registry.status(&node, &unit).await;
            if status == NodeStatus::Stopped {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(status, NodeStatus::Stopped);
        assert!(!registry.contains(&node));
    }

    #[tokio::test]
    async fn drain_reports_managed_units() {
        let registry = NodeRegistry::new();
        let unit = FakeUnit::default();
        unit.running.store(true, Ordering::SeqCst);
        registry.start(&id("a"), &unit, || async { Ok(NodeHandle::Managed) }).await.unwrap();

        let drained = registry.drain().await;
        assert_eq!(drained.managed, vec![id("a")]);
        assert!(drained.failures.is_empty());
        assert!(registry.ids().is_empty());
    }
}
