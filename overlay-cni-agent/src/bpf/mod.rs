pub mod loader;
pub mod state;

use std::borrow::BorrowMut;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use aya::Pod;
use aya::maps::{HashMap, Map, MapData};
use overlay_cni_common::{
    EndpointInfo, EndpointKey, LXC_MAP_NAME, NODE_LOCAL_MAP_NAME, NodeLocalKey, NodeLocalValue,
    POD_MAP_NAME, PodNodeKey, PodNodeValue,
};
use tracing::info;

use crate::{Error, Result};

pub use state::PodMapState;

/// Maps are pinned by name under this directory of the bpf fs, where tc
/// looks for global maps.
pub const PIN_DIR: &str = "tc/globals";

pub type LxcMap = HashMap<MapData, EndpointKey, EndpointInfo>;
pub type PodMap = HashMap<MapData, PodNodeKey, PodNodeValue>;
pub type NodeLocalMap = HashMap<MapData, NodeLocalKey, NodeLocalValue>;

pub trait BpfMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()>;
    fn delete(&mut self, key: &K) -> Result<()>;
    fn get_state(&self) -> Result<ahash::HashMap<K, V>>;
}

impl<T: BorrowMut<MapData>, K: Pod + Eq + Hash, V: Pod> BpfMap<K, V> for HashMap<T, K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        Ok(self.remove(key)?)
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for v in self.iter() {
            let (k, v) = v?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<K: Pod + Eq + Hash, V: Pod> BpfMap<K, V> for ahash::HashMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// Caches what was last written so unchanged values never reach the kernel.
pub struct BpfState<M, K, V>
where
    M: BpfMap<K, V>,
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    cache: ahash::HashMap<K, V>,
    bpf_map: M,
}

impl<M, K, V> BpfState<M, K, V>
where
    M: BpfMap<K, V>,
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    pub fn new(bpf_map: M) -> Self {
        let cache = ahash::HashMap::default();
        Self { cache, bpf_map }
    }

    /// Returns false when the cached value already matched.
    pub fn update(&mut self, key: K, value: V) -> Result<bool> {
        if let Some(current) = self.cache.get(&key)
            && *current == value
        {
            return Ok(false);
        };
        self.bpf_map.update(key.clone(), value.clone())?;
        self.cache.insert(key, value);
        Ok(true)
    }

    pub fn delete(&mut self, key: &K) -> Result<()> {
        self.bpf_map.delete(key)?;
        self.cache.remove(key);
        Ok(())
    }

    pub fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        self.bpf_map.get_state()
    }
}

pub fn pin_dir(bpf_fs: &Path) -> PathBuf {
    bpf_fs.join(PIN_DIR)
}

pub fn map_path(bpf_fs: &Path, name: &str) -> PathBuf {
    pin_dir(bpf_fs).join(name)
}

pub fn maps_pinned(bpf_fs: &Path) -> bool {
    [LXC_MAP_NAME, POD_MAP_NAME, NODE_LOCAL_MAP_NAME]
        .iter()
        .all(|name| map_path(bpf_fs, name).exists())
}

fn open_hash_map<K: Pod, V: Pod>(bpf_fs: &Path, name: &str) -> Result<HashMap<MapData, K, V>> {
    let path = map_path(bpf_fs, name);
    if !path.exists() {
        return Err(Error::MapNotFound { name: name.into() });
    }
    info!("loading pinned map {}", path.display());
    let map = MapData::from_pin(&path)?;
    let map = Map::HashMap(map);
    Ok(map.try_into()?)
}

pub fn open_lxc_map(bpf_fs: &Path) -> Result<LxcMap> {
    open_hash_map(bpf_fs, LXC_MAP_NAME)
}

pub fn open_pod_map(bpf_fs: &Path) -> Result<PodMap> {
    open_hash_map(bpf_fs, POD_MAP_NAME)
}

pub fn open_node_local_map(bpf_fs: &Path) -> Result<NodeLocalMap> {
    open_hash_map(bpf_fs, NODE_LOCAL_MAP_NAME)
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_unchanged_value_is_not_written() -> Result<()> {
        let mut state = BpfState::new(ahash::HashMap::<PodNodeKey, PodNodeValue>::default());
        let key = PodNodeKey::from(Ipv4Addr::new(10, 244, 11, 5));
        let value = PodNodeValue::from(Ipv4Addr::new(192, 168, 64, 20));
        assert!(state.update(key, value)?);
        assert!(!state.update(key, value)?);
        assert_eq!(state.get_state()?.get(&key), Some(&value));

        // a delete drops the cached value, so the same write goes out again
        state.delete(&key)?;
        assert!(state.get_state()?.is_empty());
        assert!(state.update(key, value)?);
        Ok(())
    }

    #[test]
    fn test_pin_paths() {
        let fs = Path::new("/sys/fs/bpf");
        assert_eq!(
            map_path(fs, POD_MAP_NAME),
            PathBuf::from("/sys/fs/bpf/tc/globals/overlay_pod")
        );
        assert!(!maps_pinned(Path::new("/nonexistent")));
    }
}
