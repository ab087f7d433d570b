use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use overlay_cni_common::{PodNodeKey, PodNodeValue};
use overlay_cni_ipam::allocator::is_reserved;
use overlay_cni_ipam::codec::{HostSubnetMap, decode_host_map, decode_record};
use overlay_cni_ipam::kv::{EventKind, KvStore, WatchEvent, WatchHandle, backoff, watch};
use overlay_cni_ipam::registry::Peer;
use overlay_cni_ipam::NodeIpam;
use tokio::sync::{Mutex, watch as latest};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::bpf::{BpfMap, PodMapState};
use crate::kubernetes::{NODE_ADDRESS_TTL, NodeResolver};

/// Peers whose record did not change are re-applied this often, which picks
/// up node address changes.
const RESYNC_INTERVAL: Duration = NODE_ADDRESS_TTL;

/// The value of a peer's record key, `None` once it is deleted.
type Record = Option<String>;

struct PeerWatch {
    block: Ipv4Network,
    cancel: CancellationToken,
    handle: WatchHandle,
    worker: JoinHandle<()>,
}

impl PeerWatch {
    /// Stops the watch and the worker. Nothing is written for the peer once
    /// this returns.
    async fn stop(self) {
        self.cancel.cancel();
        self.handle.join().await;
        if let Err(e) = self.worker.await {
            warn!(%e, "peer worker failed to complete");
        }
    }
}

/// Mirrors every peer's pod record into the pod map. One watch per peer
/// record, plus one on the host subnet map to follow peers joining and
/// leaving.
///
/// The watch only publishes the latest record. A worker per peer applies it,
/// and keeps retrying with backoff while applying fails, until it succeeds or
/// a newer record replaces it.
pub struct Reconciler<S, R, M>
where
    S: KvStore,
    R: NodeResolver,
    M: BpfMap<PodNodeKey, PodNodeValue> + Send + 'static,
{
    ipam: NodeIpam<S>,
    resolver: R,
    pod_map: PodMapState<M>,
    watches: Arc<Mutex<BTreeMap<String, PeerWatch>>>,
}

impl<S, R, M> Clone for Reconciler<S, R, M>
where
    S: KvStore,
    R: NodeResolver,
    M: BpfMap<PodNodeKey, PodNodeValue> + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            ipam: self.ipam.clone(),
            resolver: self.resolver.clone(),
            pod_map: self.pod_map.clone(),
            watches: Arc::clone(&self.watches),
        }
    }
}

impl<S, R, M> Reconciler<S, R, M>
where
    S: KvStore,
    R: NodeResolver,
    M: BpfMap<PodNodeKey, PodNodeValue> + Send + 'static,
{
    pub fn new(ipam: NodeIpam<S>, resolver: R, pod_map: PodMapState<M>) -> Self {
        Self {
            ipam,
            resolver,
            pod_map,
            watches: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Loads every peer, cancels `ready`, then follows changes until `cancel`
    /// fires. Store errors during the initial load are retried.
    pub async fn run(self, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
        let mut attempt: u32 = 0;
        let revision = loop {
            match self.load(&cancel).await {
                Ok(revision) => break revision,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff(attempt);
                    warn!(%e, attempt, ?delay, "initial peer load failed");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.stop_all().await;
                            return Ok(());
                        },
                        _ = tokio::time::sleep(delay) => {},
                    }
                }
            }
        };
        let pruned = self.pod_map.prune().await?;
        let peers = self.pod_map.peers().await.len();
        info!(pruned, peers, "pod map loaded");
        ready.cancel();

        let this = self.clone();
        let maps_cancel = cancel.clone();
        let maps = watch(
            self.ipam.store(),
            self.ipam.keys().maps(),
            revision + 1,
            &cancel,
            move |event| {
                let this = this.clone();
                let cancel = maps_cancel.clone();
                async move {
                    if let Err(e) = this.on_maps_event(event, &cancel).await {
                        error!(%e, "failed to apply host subnet map change");
                    }
                }
            },
        );

        cancel.cancelled().await;
        maps.join().await;
        self.stop_all().await;
        info!("reconciler stopped");
        Ok(())
    }

    /// Starts a watch for every current peer and returns the host subnet map
    /// revision the peers were read at.
    async fn load(&self, cancel: &CancellationToken) -> Result<i64> {
        self.stop_all().await;
        let registry = self.ipam.registry();
        let (map, revision) = registry.snapshot().await?;
        let peers = registry.peers(&map, self.ipam.node())?;
        info!(peers = peers.len(), revision, "loading peers");
        for peer in peers {
            self.start_peer(peer, cancel).await?;
        }
        Ok(revision)
    }

    async fn stop_all(&self) {
        let watches = std::mem::take(&mut *self.watches.lock().await);
        for (_, peer) in watches {
            peer.stop().await;
        }
    }

    /// Reads the peer's record, writes it, and watches it from the next
    /// revision on so nothing between the read and the watch is missed. A
    /// record that fails to apply here is retried by the peer's worker.
    async fn start_peer(&self, peer: Peer, cancel: &CancellationToken) -> Result<()> {
        let previous = self.watches.lock().await.remove(&peer.node);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        // a peer that rejoins may have moved
        self.resolver.invalidate(&peer.node);
        let key = self.ipam.keys().record(&peer.node, &peer.block);
        let (current, revision) = self.ipam.store().snapshot(&key).await?;
        let current: Record = current.map(|v| v.value);
        let attempt = match self.apply(&peer, &key, current.as_deref()).await {
            Ok(()) => 0,
            Err(e) => {
                warn!(%e, node = %peer.node, "failed to load peer pods, retrying");
                self.resolver.invalidate(&peer.node);
                1
            }
        };

        let worker_cancel = cancel.child_token();
        let (publish, receiver) = latest::channel(current);
        let handle = watch(self.ipam.store(), key.clone(), revision + 1, &worker_cancel, {
            let node = peer.node.clone();
            move |event: WatchEvent| {
                debug!(%node, revision = event.revision, "peer record changed");
                publish.send_replace(match event.kind {
                    EventKind::Put => Some(event.value),
                    EventKind::Delete => None,
                });
                std::future::ready(())
            }
        });
        let worker = tokio::spawn(self.clone().follow_peer(
            peer.clone(),
            key,
            receiver,
            attempt,
            worker_cancel.clone(),
        ));
        info!(node = %peer.node, block = %peer.block, "watching peer");

        self.watches.lock().await.insert(
            peer.node,
            PeerWatch {
                block: peer.block,
                cancel: worker_cancel,
                handle,
                worker,
            },
        );
        Ok(())
    }

    /// Applies each record the watch publishes. `attempt` is how many times
    /// the current record has already failed.
    async fn follow_peer(
        self,
        peer: Peer,
        key: String,
        mut records: latest::Receiver<Record>,
        mut attempt: u32,
        cancel: CancellationToken,
    ) {
        loop {
            let wait = if attempt == 0 {
                RESYNC_INTERVAL
            } else {
                backoff(attempt)
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = records.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    attempt = 0;
                },
                _ = tokio::time::sleep(wait) => {},
            }

            let record = records.borrow_and_update().clone();
            let applied = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                applied = self.apply(&peer, &key, record.as_deref()) => applied,
            };
            match applied {
                Ok(()) => {
                    if attempt > 0 {
                        info!(node = %peer.node, attempt, "peer pods applied after retrying");
                    }
                    attempt = 0;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(%e, node = %peer.node, attempt, "failed to apply peer pods");
                    self.resolver.invalidate(&peer.node);
                }
            }
        }
    }

    async fn apply(&self, peer: &Peer, key: &str, value: Option<&str>) -> Result<()> {
        let ips: BTreeSet<Ipv4Addr> = match value {
            Some(value) => decode_record(key, value)?
                .into_iter()
                .filter(|ip| !is_reserved(&peer.block, *ip))
                .collect(),
            None => BTreeSet::new(),
        };
        // no entries to write means the node address is not needed
        let node_ip = if ips.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            self.resolver.internal_ip(&peer.node).await?
        };
        self.pod_map.replace_peer(&peer.node, &ips, node_ip).await?;
        Ok(())
    }

    async fn on_maps_event(&self, event: WatchEvent, cancel: &CancellationToken) -> Result<()> {
        let map = match event.kind {
            EventKind::Put => decode_host_map(&event.key, &event.value)?,
            EventKind::Delete => HostSubnetMap::new(),
        };
        let peers = self.ipam.registry().peers(&map, self.ipam.node())?;
        let wanted: BTreeMap<&str, Ipv4Network> =
            peers.iter().map(|p| (p.node.as_str(), p.block)).collect();

        let (gone, watched) = {
            let mut watches = self.watches.lock().await;
            let stale: Vec<String> = watches
                .iter()
                .filter(|(node, w)| wanted.get(node.as_str()) != Some(&w.block))
                .map(|(node, _)| node.clone())
                .collect();
            let gone: Vec<(String, PeerWatch)> = stale
                .into_iter()
                .filter_map(|node| watches.remove(&node).map(|w| (node, w)))
                .collect();
            let watched: BTreeSet<String> = watches.keys().cloned().collect();
            (gone, watched)
        };

        for (node, peer) in gone {
            info!(%node, block = %peer.block, "peer left");
            peer.stop().await;
            let removed = self.pod_map.remove_peer(&node).await?;
            debug!(%node, removed, "dropped peer pods");
        }
        for peer in peers {
            if watched.contains(&peer.node) {
                continue;
            }
            info!(node = %peer.node, block = %peer.block, "peer joined");
            if let Err(e) = self.start_peer(peer, cancel).await {
                error!(%e, "failed to start peer watch");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::future::Future;

    use overlay_cni_ipam::keys::DEFAULT_KEY_PREFIX;
    use overlay_cni_ipam::{MemoryStore, SubnetConfig};

    use super::*;
    use crate::kubernetes::StaticNodeResolver;

    type TestMap = ahash::HashMap<PodNodeKey, PodNodeValue>;

    const B_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 64, 20);

    fn ipam(store: &MemoryStore, node: &str) -> NodeIpam<MemoryStore> {
        let config = SubnetConfig::parse("10.244.0.0/16", None).unwrap();
        NodeIpam::new(store.clone(), DEFAULT_KEY_PREFIX, config, node).unwrap()
    }

    fn start(
        a: &NodeIpam<MemoryStore>,
    ) -> (
        PodMapState<TestMap>,
        CancellationToken,
        CancellationToken,
        impl Future<Output = Result<()>> + Send + 'static,
    ) {
        let resolver = StaticNodeResolver::default();
        resolver.insert("node-b", B_IP);
        start_with(a, resolver, TestMap::default())
    }

    fn start_with(
        a: &NodeIpam<MemoryStore>,
        resolver: StaticNodeResolver,
        pinned: TestMap,
    ) -> (
        PodMapState<TestMap>,
        CancellationToken,
        CancellationToken,
        impl Future<Output = Result<()>> + Send + 'static,
    ) {
        let pod_map = PodMapState::new(pinned);
        let reconciler = Reconciler::new(a.clone(), resolver, pod_map.clone());
        let ready = CancellationToken::new();
        let cancel = CancellationToken::new();
        let run = reconciler.run(ready.clone(), cancel.clone());
        (pod_map, ready, cancel, run)
    }

    async fn wait_for<F>(pod_map: &PodMapState<TestMap>, check: F) -> BTreeMap<Ipv4Addr, Ipv4Addr>
    where
        F: Fn(&BTreeMap<Ipv4Addr, Ipv4Addr>) -> bool,
    {
        for _ in 0..300 {
            let entries = pod_map.entries().await.unwrap();
            if check(&entries) {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pod map did not converge: {:?}", pod_map.entries().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_joining_peer_is_mirrored() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        a.bootstrap(None).await?;
        a.allocator().allocate("local").await?;

        let (pod_map, ready, cancel, run) = start(&a);
        let handle = tokio::spawn(run);
        ready.cancelled().await;

        let b = ipam(&store, "node-b");
        b.bootstrap(None).await?;
        let first = b.allocator().allocate("c1").await?;
        let second = b.allocator().allocate("c2").await?;

        let entries = wait_for(&pod_map, |e| e.len() == 2).await;
        assert_eq!(entries.get(&first), Some(&B_IP));
        assert_eq!(entries.get(&second), Some(&B_IP));

        b.allocator().release_container("c1").await?;
        let entries = wait_for(&pod_map, |e| e.len() == 1).await;
        assert_eq!(entries.get(&second), Some(&B_IP));
        assert!(!entries.contains_key(&first));

        cancel.cancel();
        handle.await.map_err(|e| crate::Error::Task(e.to_string()))??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_existing_peer_loaded_and_removed_on_teardown() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let b = ipam(&store, "node-b");
        a.bootstrap(None).await?;
        let block = b.bootstrap(None).await?;
        let base = u32::from(block.network());
        let tombstone = Ipv4Addr::from(base);
        let pod = Ipv4Addr::from(base + 5);
        store
            .put(
                &b.keys().record("node-b", &block),
                &format!("{tombstone};{pod}"),
            )
            .await?;

        let (pod_map, ready, cancel, run) = start(&a);
        let handle = tokio::spawn(run);
        ready.cancelled().await;
        let entries = pod_map.entries().await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get(&pod), Some(&B_IP));

        b.teardown().await?;
        wait_for(&pod_map, |e| e.is_empty()).await;

        cancel.cancel();
        handle.await.map_err(|e| crate::Error::Task(e.to_string()))??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_lookup_is_retried() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let b = ipam(&store, "node-b");
        a.bootstrap(None).await?;
        b.bootstrap(None).await?;
        let pod = b.allocator().allocate("c1").await?;

        // node-b cannot be resolved yet
        let resolver = StaticNodeResolver::default();
        let (pod_map, ready, cancel, run) = start_with(&a, resolver.clone(), TestMap::default());
        let handle = tokio::spawn(run);
        ready.cancelled().await;
        assert!(pod_map.entries().await?.is_empty());

        resolver.insert("node-b", B_IP);
        let entries = wait_for(&pod_map, |e| !e.is_empty()).await;
        assert_eq!(entries.get(&pod), Some(&B_IP));

        cancel.cancel();
        handle.await.map_err(|e| crate::Error::Task(e.to_string()))??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_newer_record_supersedes_failed_one() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let b = ipam(&store, "node-b");
        a.bootstrap(None).await?;
        b.bootstrap(None).await?;
        let first = b.allocator().allocate("c1").await?;

        let resolver = StaticNodeResolver::default();
        let (pod_map, ready, cancel, run) = start_with(&a, resolver.clone(), TestMap::default());
        let handle = tokio::spawn(run);
        ready.cancelled().await;

        b.allocator().release_container("c1").await?;
        let second = b.allocator().allocate("c2").await?;
        resolver.insert("node-b", B_IP);
        let entries = wait_for(&pod_map, |e| e.contains_key(&second)).await;
        assert_eq!(entries.len(), 1);
        if first != second {
            assert!(!entries.contains_key(&first));
        }

        cancel.cancel();
        handle.await.map_err(|e| crate::Error::Task(e.to_string()))??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_node_address_change_rewrites_peer() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let b = ipam(&store, "node-b");
        a.bootstrap(None).await?;
        b.bootstrap(None).await?;
        let first = b.allocator().allocate("c1").await?;

        let resolver = StaticNodeResolver::default();
        resolver.insert("node-b", B_IP);
        let (pod_map, ready, cancel, run) = start_with(&a, resolver.clone(), TestMap::default());
        let handle = tokio::spawn(run);
        ready.cancelled().await;

        let moved = Ipv4Addr::new(192, 168, 64, 21);
        resolver.insert("node-b", moved);
        let second = b.allocator().allocate("c2").await?;
        let entries = wait_for(&pod_map, |e| e.len() == 2).await;
        assert_eq!(entries.get(&first), Some(&moved));
        assert_eq!(entries.get(&second), Some(&moved));

        cancel.cancel();
        handle.await.map_err(|e| crate::Error::Task(e.to_string()))??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_over_pinned_entries() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let b = ipam(&store, "node-b");
        a.bootstrap(None).await?;
        b.bootstrap(None).await?;
        let pod = b.allocator().allocate("c1").await?;

        // left by the previous run: a pod that is gone and a stale node address
        let mut pinned = TestMap::default();
        let gone = Ipv4Addr::new(10, 99, 0, 7);
        pinned.insert(PodNodeKey::from(gone), PodNodeValue::from(B_IP));
        pinned.insert(
            PodNodeKey::from(pod),
            PodNodeValue::from(Ipv4Addr::new(192, 168, 64, 99)),
        );

        let resolver = StaticNodeResolver::default();
        resolver.insert("node-b", B_IP);
        let (pod_map, ready, cancel, run) = start_with(&a, resolver, pinned);
        let handle = tokio::spawn(run);
        ready.cancelled().await;

        let entries = pod_map.entries().await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get(&pod), Some(&B_IP));
        assert!(!entries.contains_key(&gone));

        cancel.cancel();
        handle.await.map_err(|e| crate::Error::Task(e.to_string()))??;
        Ok(())
    }

    #[tokio::test]
    async fn test_stops_on_cancel() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let (_pod_map, ready, cancel, run) = start(&a);
        cancel.cancel();
        run.await?;
        assert!(ready.is_cancelled());
        Ok(())
    }
}
