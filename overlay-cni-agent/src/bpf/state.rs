use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use overlay_cni_common::{PodNodeKey, PodNodeValue, ipv4_from_map};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;
use crate::bpf::{BpfMap, BpfState};

struct Shared<M>
where
    M: BpfMap<PodNodeKey, PodNodeValue>,
{
    shared: Mutex<State<M>>,
}

struct State<M>
where
    M: BpfMap<PodNodeKey, PodNodeValue>,
{
    /// Last record seen for every peer.
    peers: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    /// Which peer currently owns each pod address, and that peer's address.
    owners: BTreeMap<Ipv4Addr, (String, Ipv4Addr)>,
    pod_map: BpfState<M, PodNodeKey, PodNodeValue>,
}

/// The pod to node map, written as per peer diffs.
pub struct PodMapState<M>
where
    M: BpfMap<PodNodeKey, PodNodeValue>,
{
    state: Arc<Shared<M>>,
}

impl<M> Clone for PodMapState<M>
where
    M: BpfMap<PodNodeKey, PodNodeValue>,
{
    fn clone(&self) -> Self {
        let new = Arc::clone(&self.state);
        Self { state: new }
    }
}

impl<M> PodMapState<M>
where
    M: BpfMap<PodNodeKey, PodNodeValue>,
{
    pub fn new(pod_map: M) -> Self {
        let state = State {
            peers: BTreeMap::new(),
            owners: BTreeMap::new(),
            pod_map: BpfState::new(pod_map),
        };
        Self {
            state: Arc::new(Shared {
                shared: Mutex::new(state),
            }),
        }
    }

    /// Makes `ips` the whole contribution of `node`. Only addresses that left
    /// the record are deleted and only new or changed entries are written, so
    /// unchanged entries stay in place. Returns the number of map writes.
    pub async fn replace_peer(
        &self,
        node: &str,
        ips: &BTreeSet<Ipv4Addr>,
        node_ip: Ipv4Addr,
    ) -> Result<usize> {
        let mut state = self.state.shared.lock().await;
        let previous = state.peers.get(node).cloned().unwrap_or_default();
        let mut writes = 0;

        for ip in previous.difference(ips) {
            let owned = matches!(state.owners.get(ip), Some((owner, _)) if owner == node);
            if !owned {
                continue;
            }
            state.pod_map.delete(&PodNodeKey::from(*ip))?;
            state.owners.remove(ip);
            writes += 1;
        }

        for ip in ips {
            if let Some((owner, current)) = state.owners.get(ip)
                && owner == node
                && *current == node_ip
            {
                continue;
            }
            if let Some((owner, _)) = state.owners.get(ip)
                && owner != node
            {
                warn!(%ip, from = %owner, to = node, "pod address moved between nodes");
            }
            state
                .pod_map
                .update(PodNodeKey::from(*ip), PodNodeValue::from(node_ip))?;
            state.owners.insert(*ip, (node.to_owned(), node_ip));
            writes += 1;
        }

        state.peers.insert(node.to_owned(), ips.clone());
        debug!(node, %node_ip, pods = ips.len(), writes, "replaced peer entries");
        Ok(writes)
    }

    /// Drops every entry contributed by `node`.
    pub async fn remove_peer(&self, node: &str) -> Result<usize> {
        let mut state = self.state.shared.lock().await;
        let Some(previous) = state.peers.remove(node) else {
            return Ok(0);
        };
        let mut writes = 0;
        for ip in previous {
            let owned = matches!(state.owners.get(&ip), Some((owner, _)) if owner == node);
            if !owned {
                continue;
            }
            state.pod_map.delete(&PodNodeKey::from(ip))?;
            state.owners.remove(&ip);
            writes += 1;
        }
        Ok(writes)
    }

    /// Deletes map entries no peer accounts for, left behind by an earlier
    /// run against the same pinned map.
    pub async fn prune(&self) -> Result<usize> {
        let mut state = self.state.shared.lock().await;
        let current = state.pod_map.get_state()?;
        let mut removed = 0;
        for key in current.keys() {
            let ip = ipv4_from_map(key.ip);
            if state.owners.contains_key(&ip) {
                continue;
            }
            state.pod_map.delete(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Entries as the map holds them, keyed by pod address.
    pub async fn entries(&self) -> Result<BTreeMap<Ipv4Addr, Ipv4Addr>> {
        let state = self.state.shared.lock().await;
        Ok(state
            .pod_map
            .get_state()?
            .into_iter()
            .map(|(k, v)| (ipv4_from_map(k.ip), ipv4_from_map(v.ip)))
            .collect())
    }

    pub async fn peers(&self) -> BTreeSet<String> {
        let state = self.state.shared.lock().await;
        state.peers.keys().cloned().collect()
    }
}
