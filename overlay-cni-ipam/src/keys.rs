use ipnetwork::Ipv4Network;

pub const DEFAULT_KEY_PREFIX: &str = "/cni-demo/ipam";

const POOL: &str = "pool";
const MAPS: &str = "maps";
const RANGE: &str = "range";
const CONTAINERS: &str = "containers";

/// Key names under `<prefix>/<subnet>/<mask>`.
///
/// ```text
/// .../pool                               unclaimed blocks
/// .../maps                               {block: node}
/// .../<node>                             block claimed by node
/// .../<node>/<block>                     pod ips live on node
/// .../<node>/<block>/range               legal pod ips, optional
/// .../<node>/<block>/containers/<id>     ip bound to a container
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(prefix: &str, cluster: Ipv4Network) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            root: format!("{}/{}/{}", prefix, cluster.network(), cluster.prefix()),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn pool(&self) -> String {
        format!("{}/{POOL}", self.root)
    }

    pub fn maps(&self) -> String {
        format!("{}/{MAPS}", self.root)
    }

    pub fn host(&self, node: &str) -> String {
        format!("{}/{node}", self.root)
    }

    /// Everything owned by a node except its host key.
    pub fn node_prefix(&self, node: &str) -> String {
        format!("{}/{node}/", self.root)
    }

    pub fn record(&self, node: &str, block: &Ipv4Network) -> String {
        format!("{}/{node}/{}", self.root, block.network())
    }

    pub fn range(&self, node: &str, block: &Ipv4Network) -> String {
        format!("{}/{RANGE}", self.record(node, block))
    }

    pub fn binding(&self, node: &str, block: &Ipv4Network, container_id: &str) -> String {
        format!("{}/{CONTAINERS}/{container_id}", self.record(node, block))
    }

    /// Node name owning a pod record key, which is the parent directory of the
    /// key.
    pub fn node_of_record<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(&self.root)?.strip_prefix('/')?;
        let (node, block) = rest.split_once('/')?;
        if node.is_empty() || block.is_empty() || block.contains('/') {
            return None;
        }
        Some(node)
    }

    /// Names that would collide with the fixed keys.
    pub fn is_reserved_node_name(node: &str) -> bool {
        node == POOL || node == MAPS
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn layout() -> KeyLayout {
        KeyLayout::new(DEFAULT_KEY_PREFIX, "10.244.0.0/16".parse().unwrap())
    }

    #[test]
    fn test_key_names() {
        let keys = layout();
        let block: Ipv4Network = "10.244.7.0/24".parse().unwrap();
        assert_eq!(keys.pool(), "/cni-demo/ipam/10.244.0.0/16/pool");
        assert_eq!(keys.maps(), "/cni-demo/ipam/10.244.0.0/16/maps");
        assert_eq!(keys.host("node-a"), "/cni-demo/ipam/10.244.0.0/16/node-a");
        assert_eq!(
            keys.record("node-a", &block),
            "/cni-demo/ipam/10.244.0.0/16/node-a/10.244.7.0"
        );
        assert_eq!(
            keys.range("node-a", &block),
            "/cni-demo/ipam/10.244.0.0/16/node-a/10.244.7.0/range"
        );
        assert_eq!(
            keys.binding("node-a", &block, "abc"),
            "/cni-demo/ipam/10.244.0.0/16/node-a/10.244.7.0/containers/abc"
        );
    }

    #[test]
    fn test_node_of_record() {
        let keys = layout();
        let block: Ipv4Network = "10.244.11.0/24".parse().unwrap();
        assert_eq!(
            keys.node_of_record(&keys.record("node-b", &block)),
            Some("node-b")
        );
        assert_eq!(keys.node_of_record(&keys.range("node-b", &block)), None);
        assert_eq!(keys.node_of_record(&keys.host("node-b")), None);
        assert_eq!(keys.node_of_record("/elsewhere/node-b/10.244.11.0"), None);
    }

    #[test]
    fn test_trailing_slash_in_prefix() {
        let keys = KeyLayout::new("/cni-demo/ipam/", "10.244.0.0/16".parse().unwrap());
        assert_eq!(keys, layout());
    }
}
