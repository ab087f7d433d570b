use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use overlay_cni_ipam::credentials::find_kubeconfig;
use tracing::{debug, info};

use crate::{Error, Result};

const ADDRESS_INTERNAL_IP: &str = "InternalIP";

/// How long a resolved node address is trusted before the api server is asked
/// again.
pub const NODE_ADDRESS_TTL: Duration = Duration::from_secs(60);

/// Looks up the address other nodes reach a node on.
#[tonic::async_trait]
pub trait NodeResolver: Clone + Send + Sync + 'static {
    async fn internal_ip(&self, node: &str) -> Result<Ipv4Addr>;

    /// Drops anything remembered about `node`.
    fn invalidate(&self, _node: &str) {}
}

/// Node addresses with the time they were resolved.
#[derive(Clone)]
pub struct AddressCache {
    ttl: Duration,
    entries: Arc<DashMap<String, (Ipv4Addr, Instant)>>,
}

impl AddressCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// The cached address, unless it is older than the ttl.
    pub fn get(&self, node: &str) -> Option<Ipv4Addr> {
        let entry = self.entries.get(node)?;
        let (ip, resolved) = *entry;
        if resolved.elapsed() < self.ttl {
            return Some(ip);
        }
        drop(entry);
        self.entries.remove(node);
        None
    }

    pub fn insert(&self, node: &str, ip: Ipv4Addr) {
        self.entries.insert(node.to_owned(), (ip, Instant::now()));
    }

    pub fn invalidate(&self, node: &str) {
        self.entries.remove(node);
    }
}

/// Resolves through the api server, caching each node address for
/// [`NODE_ADDRESS_TTL`].
#[derive(Clone)]
pub struct KubeNodeResolver {
    client: Client,
    cache: AddressCache,
}

impl KubeNodeResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: AddressCache::new(NODE_ADDRESS_TTL),
        }
    }
}

#[tonic::async_trait]
impl NodeResolver for KubeNodeResolver {
    async fn internal_ip(&self, node: &str) -> Result<Ipv4Addr> {
        if let Some(ip) = self.cache.get(node) {
            return Ok(ip);
        }
        let node_api: Api<Node> = Api::all(self.client.clone());
        let found = node_api.get(node).await?;
        let ip = internal_ip(&found).ok_or_else(|| Error::NodeAddress(node.to_owned()))?;
        debug!(node, %ip, "resolved node address");
        self.cache.insert(node, ip);
        Ok(ip)
    }

    fn invalidate(&self, node: &str) {
        self.cache.invalidate(node);
    }
}

/// Fixed node addresses.
#[derive(Clone, Default)]
pub struct StaticNodeResolver {
    nodes: Arc<DashMap<String, Ipv4Addr>>,
}

impl StaticNodeResolver {
    pub fn insert(&self, node: impl Into<String>, ip: Ipv4Addr) {
        self.nodes.insert(node.into(), ip);
    }
}

#[tonic::async_trait]
impl NodeResolver for StaticNodeResolver {
    async fn internal_ip(&self, node: &str) -> Result<Ipv4Addr> {
        self.nodes
            .get(node)
            .map(|ip| *ip)
            .ok_or_else(|| Error::NodeAddress(node.to_owned()))
    }
}

/// First IPv4 InternalIP in the node status.
pub fn internal_ip(node: &Node) -> Option<Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .filter(|a| a.type_ == ADDRESS_INTERNAL_IP)
        .find_map(|a| a.address.parse().ok())
}

/// Client for the node's own kubeconfig, falling back to the usual
/// in-cluster and `KUBECONFIG` discovery.
pub async fn client() -> Result<Client> {
    let home = std::env::var_os("HOME").map(std::path::PathBuf::from);
    let Some(path) = find_kubeconfig(home.as_deref()) else {
        return Ok(Client::try_default().await?);
    };
    info!("using kubeconfig {}", path.display());
    let kubeconfig = Kubeconfig::read_from(&path)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Node names default to the hostname, as the kubelet does.
pub fn local_node_name() -> Result<String> {
    let name = nix::unistd::gethostname()?;
    let name = name
        .into_string()
        .map_err(|_| Error::Other("hostname is not valid utf-8".into()))?;
    Ok(name.to_lowercase())
}

#[cfg(test)]
mod test {
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};

    use super::*;

    fn node(addresses: &[(&str, &str)]) -> Node {
        Node {
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(t, a)| NodeAddress {
                            type_: t.to_string(),
                            address: a.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_internal_ip_skips_other_addresses() {
        let n = node(&[
            ("Hostname", "node-b"),
            ("InternalIP", "fd00::20"),
            ("InternalIP", "192.168.64.20"),
        ]);
        assert_eq!(internal_ip(&n), Some(Ipv4Addr::new(192, 168, 64, 20)));
        assert_eq!(internal_ip(&node(&[("ExternalIP", "1.2.3.4")])), None);
        assert_eq!(internal_ip(&Node::default()), None);
    }

    #[test]
    fn test_address_cache_expires() {
        let ip = Ipv4Addr::new(192, 168, 64, 20);
        let cache = AddressCache::new(NODE_ADDRESS_TTL);
        cache.insert("node-b", ip);
        assert_eq!(cache.get("node-b"), Some(ip));
        cache.invalidate("node-b");
        assert_eq!(cache.get("node-b"), None);

        let expired = AddressCache::new(Duration::ZERO);
        expired.insert("node-b", ip);
        assert_eq!(expired.get("node-b"), None);
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticNodeResolver::default();
        resolver.insert("node-b", Ipv4Addr::new(192, 168, 64, 20));
        assert_eq!(
            resolver.internal_ip("node-b").await.unwrap(),
            Ipv4Addr::new(192, 168, 64, 20)
        );
        assert!(matches!(
            resolver.internal_ip("node-c").await,
            Err(Error::NodeAddress(_))
        ));
    }
}
