use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{decode_addrs, decode_block, decode_record, encode_addrs};
use crate::keys::KeyLayout;
use crate::kv::{Guard, KvStore, TxnOp};
use crate::subnet::SubnetConfig;
use crate::{Error, MAX_CAS_ATTEMPTS, Result};

/// The network and gateway addresses of a block. They may sit in a pod record
/// as tombstones but are never handed out.
pub fn is_reserved(block: &Ipv4Network, ip: Ipv4Addr) -> bool {
    let network = u32::from(block.network());
    let ip = u32::from(ip);
    ip == network || ip == network + 1
}

pub fn gateway(block: &Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(block.network()) + 1)
}

/// `.2` up to the address before broadcast.
pub fn default_candidates(block: &Ipv4Network) -> Vec<Ipv4Addr> {
    let first = u32::from(block.network()) + 2;
    let last = u32::from(block.broadcast()).saturating_sub(1);
    (first..=last).map(Ipv4Addr::from).collect()
}

/// Every address of `start..=end` inside `block`.
pub fn range_candidates(block: &Ipv4Network, start: Ipv4Addr, end: Ipv4Addr) -> Result<Vec<Ipv4Addr>> {
    if u32::from(start) > u32::from(end) {
        return Err(Error::Config(format!("range start {start} is after range end {end}")));
    }
    let range: Vec<Ipv4Addr> = (u32::from(start)..=u32::from(end))
        .map(Ipv4Addr::from)
        .filter(|ip| block.contains(*ip))
        .collect();
    if range.is_empty() {
        return Err(Error::Config(format!(
            "range {start}-{end} does not overlap block {block}"
        )));
    }
    Ok(range)
}

/// Allocates pod addresses inside the local node's block.
///
/// Every read-modify-write of the pod record is a transaction guarded on the
/// record revision. The mutex only keeps allocations from the same process
/// from retrying against each other.
#[derive(Clone)]
pub struct Allocator<S> {
    store: S,
    keys: KeyLayout,
    config: SubnetConfig,
    node: String,
    lock: Arc<Mutex<()>>,
}

impl<S: KvStore> Allocator<S> {
    pub fn new(store: S, keys: KeyLayout, config: SubnetConfig, node: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            config,
            node: node.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// The local node's block. Claiming it is the partitioner's job.
    pub async fn block(&self) -> Result<Ipv4Network> {
        self.block_of(&self.node).await?.ok_or_else(|| {
            Error::Config(format!("node {} has not claimed a block", self.node))
        })
    }

    async fn block_of(&self, node: &str) -> Result<Option<Ipv4Network>> {
        let key = self.keys.host(node);
        self.store
            .get(&key)
            .await?
            .map(|v| decode_block(&key, &v.value, self.config.block_prefix))
            .transpose()
    }

    pub async fn gateway(&self) -> Result<Ipv4Addr> {
        Ok(gateway(&self.block().await?))
    }

    /// Picks a free address, persists it and returns it.
    pub async fn unused_ip(&self) -> Result<Ipv4Addr> {
        let _guard = self.lock.lock().await;
        let block = self.block().await?;
        self.allocate_in(&block, None).await
    }

    /// Like [`Allocator::unused_ip`] but also binds the address to
    /// `container_id` in the same transaction. A container that already holds
    /// a binding gets its address back.
    pub async fn allocate(&self, container_id: &str) -> Result<Ipv4Addr> {
        let _guard = self.lock.lock().await;
        let block = self.block().await?;
        self.allocate_in(&block, Some(container_id)).await
    }

    async fn allocate_in(&self, block: &Ipv4Network, container_id: Option<&str>) -> Result<Ipv4Addr> {
        let record_key = self.keys.record(&self.node, block);
        let binding_key = container_id.map(|id| self.keys.binding(&self.node, block, id));
        let candidates = self.candidates(block).await?;

        let mut conflicts = 0;
        loop {
            if let Some(binding_key) = &binding_key
                && let Some(bound) = self.store.get(binding_key).await?
            {
                let ip = bound.value.trim().parse::<Ipv4Addr>()?;
                debug!(ip = %ip, key = %binding_key, "container already holds an address");
                return Ok(ip);
            }

            let current = self.store.get(&record_key).await?;
            let mut record = match &current {
                Some(v) => decode_record(&record_key, &v.value)?,
                None => BTreeSet::new(),
            };
            let free: Vec<Ipv4Addr> = candidates
                .iter()
                .filter(|ip| !record.contains(ip))
                .copied()
                .collect();
            if free.is_empty() {
                return Err(Error::ExhaustedRange(block.to_string()));
            }
            let ip = free[rand::rng().random_range(0..free.len())];
            let reserved = is_reserved(block, ip);
            record.insert(ip);

            let mut guards = vec![Guard::unchanged(&record_key, &current)];
            let mut ops = vec![TxnOp::put(&record_key, encode_addrs(&record))];
            if let Some(binding_key) = &binding_key {
                guards.push(Guard::absent(binding_key));
                if !reserved {
                    ops.push(TxnOp::put(binding_key, ip.to_string()));
                }
            }

            if !self.store.transaction(guards, ops).await? {
                conflicts += 1;
                if conflicts >= MAX_CAS_ATTEMPTS {
                    warn!(key = %record_key, "giving up on allocation");
                    return Err(Error::Contention(conflicts));
                }
                debug!(key = %record_key, conflicts, "pod record changed underneath, retrying");
                continue;
            }
            if reserved {
                debug!(%ip, "tombstoned reserved address");
                continue;
            }
            info!(%ip, %block, container = container_id.unwrap_or_default(), "allocated address");
            return Ok(ip);
        }
    }

    async fn candidates(&self, block: &Ipv4Network) -> Result<Vec<Ipv4Addr>> {
        let key = self.keys.range(&self.node, block);
        match self.store.get(&key).await? {
            Some(v) => Ok(decode_addrs(&key, &v.value)?
                .into_iter()
                .filter(|ip| block.contains(*ip))
                .collect()),
            None => Ok(default_candidates(block)),
        }
    }

    /// Removes `ips` from the local pod record. Addresses not present and
    /// reserved addresses are ignored.
    pub async fn release(&self, ips: &[Ipv4Addr]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let block = self.block().await?;
        self.release_in(&block, ips, None).await
    }

    /// Releases the address bound to `container_id` and drops the binding.
    /// Returns `None` when the container holds nothing.
    pub async fn release_container(&self, container_id: &str) -> Result<Option<Ipv4Addr>> {
        let _guard = self.lock.lock().await;
        let Some(block) = self.block_of(&self.node).await? else {
            return Ok(None);
        };
        let binding_key = self.keys.binding(&self.node, &block, container_id);
        let Some(bound) = self.store.get(&binding_key).await? else {
            debug!(container = container_id, "no address bound, nothing to release");
            return Ok(None);
        };
        let ip = bound.value.trim().parse::<Ipv4Addr>()?;
        self.release_in(&block, &[ip], Some(&binding_key)).await?;
        info!(%ip, container = container_id, "released address");
        Ok(Some(ip))
    }

    async fn release_in(&self, block: &Ipv4Network, ips: &[Ipv4Addr], binding_key: Option<&str>) -> Result<()> {
        let record_key = self.keys.record(&self.node, block);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&record_key).await?;
            let mut record = match &current {
                Some(v) => decode_record(&record_key, &v.value)?,
                None => BTreeSet::new(),
            };
            let before = record.len();
            record.retain(|ip| is_reserved(block, *ip) || !ips.contains(ip));

            let mut ops = vec![];
            if record.len() != before {
                ops.push(TxnOp::put(&record_key, encode_addrs(&record)));
            }
            if let Some(binding_key) = binding_key {
                ops.push(TxnOp::delete(binding_key));
            }
            if ops.is_empty() {
                return Ok(());
            }
            if self
                .store
                .transaction(vec![Guard::unchanged(&record_key, &current)], ops)
                .await?
            {
                return Ok(());
            }
        }
        Err(Error::Contention(MAX_CAS_ATTEMPTS))
    }

    /// Address bound to `container_id`, if any.
    pub async fn binding(&self, container_id: &str) -> Result<Option<Ipv4Addr>> {
        let Some(block) = self.block_of(&self.node).await? else {
            return Ok(None);
        };
        let key = self.keys.binding(&self.node, &block, container_id);
        match self.store.get(&key).await? {
            Some(v) => Ok(Some(v.value.trim().parse()?)),
            None => Ok(None),
        }
    }

    /// Addresses recorded for the local node, tombstones included.
    pub async fn record(&self) -> Result<BTreeSet<Ipv4Addr>> {
        self.record_by_host(&self.node).await
    }

    /// Addresses recorded for `node`, tombstones included.
    pub async fn record_by_host(&self, node: &str) -> Result<BTreeSet<Ipv4Addr>> {
        let Some(block) = self.block_of(node).await? else {
            return Ok(BTreeSet::new());
        };
        let key = self.keys.record(node, &block);
        match self.store.get(&key).await? {
            Some(v) => decode_record(&key, &v.value),
            None => Ok(BTreeSet::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryStore;
    use crate::keys::DEFAULT_KEY_PREFIX;

    const NODE: &str = "node-a";

    async fn setup(store: &MemoryStore) -> Result<(Allocator<MemoryStore>, KeyLayout, Ipv4Network)> {
        let config = SubnetConfig::parse("10.244.0.0/16", Some(24))?;
        let keys = KeyLayout::new(DEFAULT_KEY_PREFIX, config.cluster);
        let block: Ipv4Network = "10.244.7.0/24".parse().unwrap();
        store.put(&keys.host(NODE), "10.244.7.0").await?;
        Ok((Allocator::new(store.clone(), keys.clone(), config, NODE), keys, block))
    }

    #[test]
    fn test_reserved_and_defaults() {
        let block: Ipv4Network = "10.244.7.0/24".parse().unwrap();
        assert!(is_reserved(&block, Ipv4Addr::new(10, 244, 7, 0)));
        assert!(is_reserved(&block, Ipv4Addr::new(10, 244, 7, 1)));
        assert!(!is_reserved(&block, Ipv4Addr::new(10, 244, 7, 2)));
        assert_eq!(gateway(&block), Ipv4Addr::new(10, 244, 7, 1));
        let candidates = default_candidates(&block);
        assert_eq!(candidates.len(), 253);
        assert_eq!(candidates[0], Ipv4Addr::new(10, 244, 7, 2));
        assert_eq!(candidates[252], Ipv4Addr::new(10, 244, 7, 254));
    }

    #[test]
    fn test_range_candidates_clip_to_block() -> Result<()> {
        let block: Ipv4Network = "10.244.7.0/24".parse().unwrap();
        let range = range_candidates(
            &block,
            Ipv4Addr::new(10, 244, 6, 250),
            Ipv4Addr::new(10, 244, 7, 3),
        )?;
        assert_eq!(range.first(), Some(&Ipv4Addr::new(10, 244, 7, 0)));
        assert_eq!(range.len(), 4);
        assert!(
            range_candidates(&block, Ipv4Addr::new(10, 1, 0, 1), Ipv4Addr::new(10, 1, 0, 9)).is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_two_allocations_are_distinct_and_recorded() -> Result<()> {
        let store = MemoryStore::default();
        let (allocator, _, block) = setup(&store).await?;
        let first = allocator.unused_ip().await?;
        let second = allocator.unused_ip().await?;
        assert_ne!(first, second);
        for ip in [first, second] {
            assert!(block.contains(ip));
            assert!(!is_reserved(&block, ip));
        }
        let record = allocator.record().await?;
        assert!(record.contains(&first) && record.contains(&second));
        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_then_release_restores_record() -> Result<()> {
        let store = MemoryStore::default();
        let (allocator, keys, block) = setup(&store).await?;
        store
            .put(&keys.record(NODE, &block), "10.244.7.9;10.244.7.10")
            .await?;
        let before = allocator.record().await?;

        let ip = allocator.unused_ip().await?;
        allocator.release(&[ip]).await?;
        assert_eq!(allocator.record().await?, before);

        allocator.release(&[Ipv4Addr::new(10, 244, 7, 200)]).await?;
        assert_eq!(allocator.record().await?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_last_free_address_in_range() -> Result<()> {
        let store = MemoryStore::default();
        let (allocator, keys, block) = setup(&store).await?;
        store
            .put(&keys.range(NODE, &block), "10.244.7.2;10.244.7.3;10.244.7.4")
            .await?;
        store
            .put(&keys.record(NODE, &block), "10.244.7.2;10.244.7.4")
            .await?;
        assert_eq!(allocator.unused_ip().await?, Ipv4Addr::new(10, 244, 7, 3));
        let err = allocator.unused_ip().await.unwrap_err();
        assert!(matches!(err, Error::ExhaustedRange(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_reserved_addresses_in_range_become_tombstones() -> Result<()> {
        let store = MemoryStore::default();
        let (allocator, keys, block) = setup(&store).await?;
        store
            .put(&keys.range(NODE, &block), "10.244.7.0;10.244.7.1;10.244.7.2")
            .await?;
        assert_eq!(allocator.unused_ip().await?, Ipv4Addr::new(10, 244, 7, 2));
        let record = allocator.record().await?;
        assert_eq!(record.len(), 3);
        assert!(matches!(
            allocator.unused_ip().await,
            Err(Error::ExhaustedRange(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_container_binding_is_idempotent() -> Result<()> {
        let store = MemoryStore::default();
        let (allocator, _, _) = setup(&store).await?;
        let ip = allocator.allocate("container-1").await?;
        assert_eq!(allocator.allocate("container-1").await?, ip);
        assert_eq!(allocator.record().await?.len(), 1);
        assert_eq!(allocator.binding("container-1").await?, Some(ip));

        assert_eq!(allocator.release_container("container-1").await?, Some(ip));
        assert_eq!(allocator.release_container("container-1").await?, None);
        assert!(allocator.record().await?.is_empty());
        assert_eq!(allocator.binding("container-1").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_unknown_container_writes_nothing() -> Result<()> {
        let store = MemoryStore::default();
        let (allocator, _, _) = setup(&store).await?;
        let revision = store.revision().await;
        assert_eq!(allocator.release_container("ghost").await?, None);
        assert_eq!(store.revision().await, revision);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_allocators_in_separate_processes_do_not_collide() -> Result<()> {
        let store = MemoryStore::default();
        let (_, keys, _) = setup(&store).await?;
        let config = SubnetConfig::parse("10.244.0.0/16", Some(24))?;
        let mut handles = vec![];
        for _ in 0..16 {
            // a fresh allocator per task has its own mutex, like separate
            // plugin invocations
            let allocator = Allocator::new(store.clone(), keys.clone(), config, NODE);
            handles.push(tokio::spawn(async move { allocator.unused_ip().await }));
        }
        let mut ips = BTreeSet::new();
        for handle in handles {
            ips.insert(handle.await.unwrap()?);
        }
        assert_eq!(ips.len(), 16);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_by_host_reads_named_node() -> Result<()> {
        let store = MemoryStore::default();
        let (allocator, keys, _) = setup(&store).await?;
        let other: Ipv4Network = "10.244.11.0/24".parse().unwrap();
        store.put(&keys.host("node-b"), "10.244.11.0").await?;
        store
            .put(&keys.record("node-b", &other), "10.244.11.5;10.244.11.6")
            .await?;
        assert_eq!(allocator.record_by_host("node-b").await?.len(), 2);
        assert!(allocator.record().await?.is_empty());
        Ok(())
    }
}
