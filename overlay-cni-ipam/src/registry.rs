use ipnetwork::Ipv4Network;
use tracing::{debug, info};

use crate::codec::{HostSubnetMap, decode_block, decode_host_map, encode_host_map};
use crate::keys::KeyLayout;
use crate::kv::{Guard, KvStore, TxnOp, Versioned};
use crate::{Error, MAX_CAS_ATTEMPTS, Result};

/// A node other than the local one, with the block it owns.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Peer {
    pub node: String,
    pub block: Ipv4Network,
}

/// Cluster wide {block: node} map every node reads to find its peers.
#[derive(Clone)]
pub struct Registry<S> {
    store: S,
    keys: KeyLayout,
    block_prefix: u8,
}

impl<S: KvStore> Registry<S> {
    pub fn new(store: S, keys: KeyLayout, block_prefix: u8) -> Self {
        Self {
            store,
            keys,
            block_prefix,
        }
    }

    /// Creates an empty map unless one exists.
    pub async fn init(&self) -> Result<()> {
        let created = self
            .store
            .transaction(
                vec![Guard::absent(self.keys.maps())],
                vec![TxnOp::put(self.keys.maps(), encode_host_map(&HostSubnetMap::new())?)],
            )
            .await?;
        if created {
            info!(key = %self.keys.maps(), "initialized host subnet map");
        }
        Ok(())
    }

    pub async fn get(&self) -> Result<HostSubnetMap> {
        Ok(self.snapshot().await?.0)
    }

    /// Current map with the store revision it was read at.
    pub async fn snapshot(&self) -> Result<(HostSubnetMap, i64)> {
        let key = self.keys.maps();
        let (current, revision) = self.store.snapshot(&key).await?;
        let map = match current {
            Some(v) => decode_host_map(&key, &v.value)?,
            None => HostSubnetMap::new(),
        };
        Ok((map, revision))
    }

    pub async fn read_versioned(&self) -> Result<(HostSubnetMap, Option<Versioned>)> {
        let key = self.keys.maps();
        let current = self.store.get(&key).await?;
        let map = match &current {
            Some(v) => decode_host_map(&key, &v.value)?,
            None => HostSubnetMap::new(),
        };
        Ok((map, current))
    }

    /// Records `block -> node`. Returns false when the entry already existed.
    pub async fn upsert(&self, block: &Ipv4Network, node: &str) -> Result<bool> {
        let key = self.keys.maps();
        let block_key = block.network().to_string();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut map, current) = self.read_versioned().await?;
            match map.get(&block_key) {
                Some(owner) if owner == node => return Ok(false),
                Some(owner) => {
                    return Err(Error::Fatal(format!(
                        "block {block} is registered to {owner}, not {node}"
                    )));
                }
                None => {}
            }
            map.insert(block_key.clone(), node.to_owned());
            let written = self
                .store
                .transaction(
                    vec![Guard::unchanged(&key, &current)],
                    vec![TxnOp::put(&key, encode_host_map(&map)?)],
                )
                .await?;
            if written {
                info!(%block, node, "registered block");
                return Ok(true);
            }
            debug!(%block, node, "host subnet map changed underneath, retrying");
        }
        Err(Error::Contention(MAX_CAS_ATTEMPTS))
    }

    /// Every node except `local`, ordered by node name.
    pub fn peers(&self, map: &HostSubnetMap, local: &str) -> Result<Vec<Peer>> {
        let key = self.keys.maps();
        let mut peers = map
            .iter()
            .filter(|(_, node)| node.as_str() != local)
            .map(|(block, node)| {
                Ok(Peer {
                    node: node.clone(),
                    block: decode_block(&key, block, self.block_prefix)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        peers.sort();
        Ok(peers)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryStore;
    use crate::keys::DEFAULT_KEY_PREFIX;

    fn registry(store: &MemoryStore) -> Registry<MemoryStore> {
        let keys = KeyLayout::new(DEFAULT_KEY_PREFIX, "10.244.0.0/16".parse().unwrap());
        Registry::new(store.clone(), keys, 24)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() -> Result<()> {
        let store = MemoryStore::default();
        let registry = registry(&store);
        registry.init().await?;
        let block = "10.244.7.0/24".parse().unwrap();

        assert!(registry.upsert(&block, "node-a").await?);
        let revision = store.revision().await;
        assert!(!registry.upsert(&block, "node-a").await?);
        assert_eq!(store.revision().await, revision);

        registry.init().await?;
        assert_eq!(registry.get().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_block_cannot_change_owner() -> Result<()> {
        let store = MemoryStore::default();
        let registry = registry(&store);
        let block = "10.244.7.0/24".parse().unwrap();
        registry.upsert(&block, "node-a").await?;
        let err = registry.upsert(&block, "node-b").await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_both_entries() -> Result<()> {
        let store = MemoryStore::default();
        let a = registry(&store);
        let b = registry(&store);
        let block_a = "10.244.7.0/24".parse().unwrap();
        let block_b = "10.244.11.0/24".parse().unwrap();
        let (ra, rb) = tokio::join!(a.upsert(&block_a, "node-a"), b.upsert(&block_b, "node-b"));
        ra?;
        rb?;

        let map = a.get().await?;
        let peers = a.peers(&map, "node-a")?;
        assert_eq!(
            peers,
            vec![Peer {
                node: "node-b".into(),
                block: block_b
            }]
        );
        Ok(())
    }
}
