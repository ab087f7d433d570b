use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::{debug, info};

use crate::allocator::{Allocator, range_candidates};
use crate::codec::{decode_blocks, decode_host_map, encode_addrs, encode_blocks, encode_host_map};
use crate::keys::KeyLayout;
use crate::kv::{Guard, KvStore, TxnOp};
use crate::registry::Registry;
use crate::subnet::{Partitioner, SubnetConfig};
use crate::{Error, MAX_CAS_ATTEMPTS, Result};

/// The ipam view of one node: its partitioner, allocator and registry over a
/// shared store.
#[derive(Clone)]
pub struct NodeIpam<S> {
    store: S,
    node: String,
    keys: KeyLayout,
    config: SubnetConfig,
    partitioner: Partitioner<S>,
    allocator: Allocator<S>,
    registry: Registry<S>,
}

impl<S: KvStore> NodeIpam<S> {
    pub fn new(store: S, prefix: &str, config: SubnetConfig, node: impl Into<String>) -> Result<Self> {
        let node = node.into();
        if node.is_empty() || node.contains('/') || KeyLayout::is_reserved_node_name(&node) {
            return Err(Error::Config(format!("invalid node name {node:?}")));
        }
        let keys = KeyLayout::new(prefix, config.cluster);
        Ok(Self {
            partitioner: Partitioner::new(store.clone(), keys.clone(), config),
            allocator: Allocator::new(store.clone(), keys.clone(), config, node.clone()),
            registry: Registry::new(store.clone(), keys.clone(), config.block_prefix),
            store,
            node,
            keys,
            config,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub fn config(&self) -> &SubnetConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn partitioner(&self) -> &Partitioner<S> {
        &self.partitioner
    }

    pub fn allocator(&self) -> &Allocator<S> {
        &self.allocator
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// Makes sure the pool and host map exist and this node owns a block.
    /// With a range, the legal pod addresses of the block are written once.
    pub async fn bootstrap(&self, range: Option<(Ipv4Addr, Ipv4Addr)>) -> Result<Ipv4Network> {
        self.partitioner.init_pool().await?;
        self.registry.init().await?;
        let block = self.partitioner.claim(&self.node).await?;
        if let Some((start, end)) = range {
            self.ensure_range(&block, start, end).await?;
        }
        Ok(block)
    }

    async fn ensure_range(&self, block: &Ipv4Network, start: Ipv4Addr, end: Ipv4Addr) -> Result<()> {
        let key = self.keys.range(&self.node, block);
        let range = range_candidates(block, start, end)?;
        let written = self
            .store
            .transaction(vec![Guard::absent(&key)], vec![TxnOp::put(&key, encode_addrs(&range))])
            .await?;
        if written {
            info!(%block, %start, %end, "recorded address range");
        } else {
            debug!(%block, "address range already recorded");
        }
        Ok(())
    }

    /// Returns this node's block to the pool, drops it from the host map and
    /// removes every record the node owns.
    pub async fn teardown(&self) -> Result<Option<Ipv4Network>> {
        let pool_key = self.keys.pool();
        let maps_key = self.keys.maps();
        let host_key = self.keys.host(&self.node);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(block) = self.partitioner.host_block(&self.node).await? else {
                self.store.delete(&self.keys.node_prefix(&self.node), true).await?;
                return Ok(None);
            };
            let host = self.store.get(&host_key).await?;
            let pool_current = self.store.get(&pool_key).await?;
            let maps_current = self.store.get(&maps_key).await?;

            let mut pool = match &pool_current {
                Some(v) => decode_blocks(&pool_key, &v.value, self.config.block_prefix)?,
                None => vec![],
            };
            if !pool.contains(&block) {
                pool.push(block);
            }
            let mut map = match &maps_current {
                Some(v) => decode_host_map(&maps_key, &v.value)?,
                None => Default::default(),
            };
            map.remove(&block.network().to_string());

            let done = self
                .store
                .transaction(
                    vec![
                        Guard::unchanged(&host_key, &host),
                        Guard::unchanged(&pool_key, &pool_current),
                        Guard::unchanged(&maps_key, &maps_current),
                    ],
                    vec![
                        TxnOp::put(&pool_key, encode_blocks(&pool)),
                        TxnOp::put(&maps_key, encode_host_map(&map)?),
                        TxnOp::delete(&host_key),
                    ],
                )
                .await?;
            if done {
                self.store.delete(&self.keys.node_prefix(&self.node), true).await?;
                info!(node = %self.node, %block, "returned block to pool");
                return Ok(Some(block));
            }
        }
        Err(Error::Contention(MAX_CAS_ATTEMPTS))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryStore;
    use crate::keys::DEFAULT_KEY_PREFIX;

    fn ipam(store: &MemoryStore, node: &str) -> NodeIpam<MemoryStore> {
        let config = SubnetConfig::parse("10.244.0.0/16", None).unwrap();
        NodeIpam::new(store.clone(), DEFAULT_KEY_PREFIX, config, node).unwrap()
    }

    #[test]
    fn test_reserved_node_names_rejected() {
        let config = SubnetConfig::parse("10.244.0.0/16", None).unwrap();
        for node in ["", "pool", "maps", "a/b"] {
            assert!(NodeIpam::new(MemoryStore::default(), DEFAULT_KEY_PREFIX, config, node).is_err());
        }
    }

    #[tokio::test]
    async fn test_bootstrap_with_range() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let block = a.bootstrap(None).await?;
        let start = Ipv4Addr::from(u32::from(block.network()) + 10);
        let end = Ipv4Addr::from(u32::from(block.network()) + 11);
        assert_eq!(a.bootstrap(Some((start, end))).await?, block);

        let first = a.allocator().unused_ip().await?;
        let second = a.allocator().unused_ip().await?;
        let mut got = [first, second];
        got.sort();
        assert_eq!(got, [start, end]);
        Ok(())
    }

    #[tokio::test]
    async fn test_teardown_returns_block() -> Result<()> {
        let store = MemoryStore::default();
        let a = ipam(&store, "node-a");
        let b = ipam(&store, "node-b");
        let block = a.bootstrap(None).await?;
        b.bootstrap(None).await?;
        a.allocator().allocate("c1").await?;

        assert_eq!(a.teardown().await?, Some(block));
        assert!(a.partitioner().pool().await?.contains(&block));
        assert_eq!(a.registry().get().await?.len(), 1);
        assert!(store.get_all_keys(&a.keys().node_prefix("node-a")).await?.is_empty());
        assert!(store.get(&a.keys().host("node-a")).await?.is_none());
        assert_eq!(a.teardown().await?, None);
        Ok(())
    }
}
