use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::codec::{decode_block, decode_blocks, encode_blocks};
use crate::keys::KeyLayout;
use crate::kv::{Guard, KvStore, TxnOp};
use crate::registry::Registry;
use crate::{Error, MAX_CAS_ATTEMPTS, Result};

pub const DEFAULT_CLUSTER_PREFIX: u8 = 16;
pub const DEFAULT_BLOCK_PREFIX: u8 = 24;
pub const DEFAULT_POD_PREFIX: u8 = 32;
/// Smallest block that still leaves room for the gateway and one pod.
const MAX_BLOCK_PREFIX: u8 = 30;
/// Caps the pool at 65536 blocks.
const MAX_BLOCK_BITS: u8 = 16;

/// How the cluster subnet is carved up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubnetConfig {
    /// Normalized to its network address.
    pub cluster: Ipv4Network,
    pub block_prefix: u8,
    pub pod_prefix: u8,
}

impl SubnetConfig {
    pub fn new(cluster: Ipv4Network, block_prefix: u8) -> Result<Self> {
        let cluster = Ipv4Network::new(cluster.network(), cluster.prefix())?;
        if block_prefix <= cluster.prefix() || block_prefix > MAX_BLOCK_PREFIX {
            return Err(Error::Config(format!(
                "block prefix /{block_prefix} must be longer than /{} and at most /{MAX_BLOCK_PREFIX}",
                cluster.prefix()
            )));
        }
        if block_prefix - cluster.prefix() > MAX_BLOCK_BITS {
            return Err(Error::Config(format!(
                "/{block_prefix} blocks in {cluster} exceed the pool limit"
            )));
        }
        Ok(Self {
            cluster,
            block_prefix,
            pod_prefix: DEFAULT_POD_PREFIX,
        })
    }

    /// Accepts `10.244.0.0/16` or a bare `10.244.0.0`, which means /16.
    pub fn parse(subnet: &str, block_prefix: Option<u8>) -> Result<Self> {
        let subnet = subnet.trim();
        let cluster = if subnet.contains('/') {
            subnet.parse::<Ipv4Network>()?
        } else {
            Ipv4Network::new(subnet.parse::<Ipv4Addr>()?, DEFAULT_CLUSTER_PREFIX)?
        };
        Self::new(cluster, block_prefix.unwrap_or(DEFAULT_BLOCK_PREFIX))
    }

    /// Every block of the cluster subnet in address order.
    pub fn candidate_blocks(&self) -> Vec<Ipv4Network> {
        let count = 1u32 << (self.block_prefix - self.cluster.prefix());
        let size = 1u32 << (32 - self.block_prefix);
        let base = u32::from(self.cluster.network());
        (0..count)
            .filter_map(|i| Ipv4Network::new(Ipv4Addr::from(base + i * size), self.block_prefix).ok())
            .collect()
    }

    pub fn block_of(&self, addr: Ipv4Addr) -> Result<Ipv4Network> {
        let block = Ipv4Network::new(addr, self.block_prefix)?;
        Ok(Ipv4Network::new(block.network(), self.block_prefix)?)
    }
}

/// Hands each node one block out of the cluster pool.
#[derive(Clone)]
pub struct Partitioner<S> {
    store: S,
    keys: KeyLayout,
    config: SubnetConfig,
    registry: Registry<S>,
}

impl<S: KvStore> Partitioner<S> {
    pub fn new(store: S, keys: KeyLayout, config: SubnetConfig) -> Self {
        let registry = Registry::new(store.clone(), keys.clone(), config.block_prefix);
        Self {
            store,
            keys,
            config,
            registry,
        }
    }

    pub fn config(&self) -> &SubnetConfig {
        &self.config
    }

    /// Creates the pool with every candidate block unless the pool key exists.
    /// An existing pool is never rewritten, even when it is empty.
    pub async fn init_pool(&self) -> Result<bool> {
        let key = self.keys.pool();
        if self.store.get(&key).await?.is_some() {
            return Ok(false);
        }
        let blocks = self.config.candidate_blocks();
        let created = self
            .store
            .transaction(
                vec![Guard::absent(&key)],
                vec![TxnOp::put(&key, encode_blocks(&blocks))],
            )
            .await?;
        if created {
            info!(%key, blocks = blocks.len(), "initialized subnet pool");
        } else {
            debug!(%key, "subnet pool initialized by another node");
        }
        Ok(created)
    }

    /// Unclaimed blocks.
    pub async fn pool(&self) -> Result<Vec<Ipv4Network>> {
        let key = self.keys.pool();
        match self.store.get(&key).await? {
            Some(v) => decode_blocks(&key, &v.value, self.config.block_prefix),
            None => Ok(vec![]),
        }
    }

    pub async fn host_block(&self, node: &str) -> Result<Option<Ipv4Network>> {
        let key = self.keys.host(node);
        self.store
            .get(&key)
            .await?
            .map(|v| decode_block(&key, &v.value, self.config.block_prefix))
            .transpose()
    }

    /// Returns the block owned by `node`, claiming a random unclaimed one on
    /// first use, and makes sure the host subnet map lists it.
    ///
    /// The pool update and the host key are written in one transaction
    /// guarded on the pool revision and on the host key being absent, so two
    /// claimers can never take the same block and a node never holds two.
    pub async fn claim(&self, node: &str) -> Result<Ipv4Network> {
        let block = self.claim_block(node).await?;
        self.registry.upsert(&block, node).await?;
        Ok(block)
    }

    async fn claim_block(&self, node: &str) -> Result<Ipv4Network> {
        let pool_key = self.keys.pool();
        let host_key = self.keys.host(node);
        for attempt in 0..MAX_CAS_ATTEMPTS {
            if let Some(block) = self.host_block(node).await? {
                return Ok(block);
            }

            let current = self.store.get(&pool_key).await?;
            let mut pool = match &current {
                Some(v) => decode_blocks(&pool_key, &v.value, self.config.block_prefix)?,
                None => vec![],
            };
            if pool.is_empty() {
                return Err(Error::ExhaustedPool(self.config.cluster.to_string()));
            }
            let idx = rand::rng().random_range(0..pool.len());
            let block = pool.remove(idx);

            let claimed = self
                .store
                .transaction(
                    vec![
                        Guard::unchanged(&pool_key, &current),
                        Guard::absent(&host_key),
                    ],
                    vec![
                        TxnOp::put(&pool_key, encode_blocks(&pool)),
                        TxnOp::put(&host_key, block.network().to_string()),
                    ],
                )
                .await?;
            if claimed {
                info!(node, %block, "claimed block");
                return Ok(block);
            }
            debug!(node, attempt, "pool changed underneath claim, retrying");
        }
        warn!(node, "giving up on block claim");
        Err(Error::Contention(MAX_CAS_ATTEMPTS))
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::*;
    use crate::MemoryStore;
    use crate::keys::DEFAULT_KEY_PREFIX;

    fn partitioner(store: &MemoryStore, subnet: &str, prefix: u8) -> Partitioner<MemoryStore> {
        let config = SubnetConfig::parse(subnet, Some(prefix)).unwrap();
        let keys = KeyLayout::new(DEFAULT_KEY_PREFIX, config.cluster);
        Partitioner::new(store.clone(), keys, config)
    }

    #[test]
    fn test_parse_normalizes_and_defaults() -> Result<()> {
        let config = SubnetConfig::parse("10.244.3.9", None)?;
        assert_eq!(config.cluster, "10.244.0.0/16".parse().unwrap());
        assert_eq!(config.block_prefix, 24);
        assert_eq!(config.pod_prefix, 32);
        assert!(SubnetConfig::parse("10.244.0.0/16", Some(16)).is_err());
        assert!(SubnetConfig::parse("10.0.0.0/8", Some(30)).is_err());
        Ok(())
    }

    #[test]
    fn test_candidate_blocks_vary_third_octet() -> Result<()> {
        let config = SubnetConfig::parse("10.244.0.0/16", Some(24))?;
        let blocks = config.candidate_blocks();
        assert_eq!(blocks.len(), 256);
        assert_eq!(blocks[0], "10.244.0.0/24".parse().unwrap());
        assert_eq!(blocks[255], "10.244.255.0/24".parse().unwrap());
        Ok(())
    }

    #[tokio::test]
    async fn test_two_nodes_claim_disjoint_blocks() -> Result<()> {
        let store = MemoryStore::default();
        let a = partitioner(&store, "10.244.0.0/16", 24);
        let b = partitioner(&store, "10.244.0.0/16", 24);
        assert!(a.init_pool().await?);
        assert!(!b.init_pool().await?);

        let block_a = a.claim("a").await?;
        let block_b = b.claim("b").await?;
        assert_ne!(block_a, block_b);

        let pool = a.pool().await?;
        assert_eq!(pool.len(), 254);
        assert!(!pool.contains(&block_a));
        assert!(!pool.contains(&block_b));

        let map = a.registry.get().await?;
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&block_a.network().to_string()).map(String::as_str), Some("a"));
        assert_eq!(map.get(&block_b.network().to_string()).map(String::as_str), Some("b"));
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_twice_is_one_write() -> Result<()> {
        let store = MemoryStore::default();
        let a = partitioner(&store, "10.244.0.0/16", 24);
        a.init_pool().await?;
        let first = a.claim("a").await?;
        let revision = store.revision().await;
        let second = a.claim("a").await?;
        assert_eq!(first, second);
        assert_eq!(store.revision().await, revision);
        Ok(())
    }

    #[tokio::test]
    async fn test_every_block_in_pool_or_owned() -> Result<()> {
        let store = MemoryStore::default();
        let p = partitioner(&store, "10.244.0.0/16", 20);
        p.init_pool().await?;
        let mut owned = BTreeSet::new();
        for node in ["a", "b", "c", "d", "e"] {
            owned.insert(p.claim(node).await?);
        }
        assert_eq!(owned.len(), 5);
        let pool: BTreeSet<_> = p.pool().await?.into_iter().collect();
        assert!(pool.is_disjoint(&owned));
        let all: BTreeSet<_> = p.config().candidate_blocks().into_iter().collect();
        let union: BTreeSet<_> = pool.union(&owned).cloned().collect();
        assert_eq!(union, all);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_an_error_and_not_refilled() -> Result<()> {
        let store = MemoryStore::default();
        let p = partitioner(&store, "10.244.0.0/23", 24);
        p.init_pool().await?;
        p.claim("a").await?;
        p.claim("b").await?;
        let err = p.claim("c").await.unwrap_err();
        assert!(matches!(err, Error::ExhaustedPool(_)));

        assert!(!p.init_pool().await?);
        assert!(p.pool().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_claims_for_last_block() -> Result<()> {
        let store = MemoryStore::default();
        let p = partitioner(&store, "10.244.0.0/23", 24);
        p.init_pool().await?;
        p.claim("a").await?;

        let b = p.clone();
        let c = p.clone();
        let (rb, rc) = tokio::join!(
            tokio::spawn(async move { b.claim("b").await }),
            tokio::spawn(async move { c.claim("c").await })
        );
        let results = [rb.unwrap(), rc.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(Error::ExhaustedPool(_))))
            .count();
        assert_eq!((ok, exhausted), (1, 1));
        assert!(p.pool().await?.is_empty());
        Ok(())
    }
}
