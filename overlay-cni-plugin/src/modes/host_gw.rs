use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use overlay_cni_agent::kubernetes::{self, KubeNodeResolver, NodeResolver};
use overlay_cni_ipam::registry::Peer;
use overlay_cni_ipam::{KvStore, allocator};
use tracing::{debug, info, warn};

use crate::config::Args;
use crate::context::PluginContext;
use crate::modes::veth::{VethTeardown, create_pod_veth};
use crate::modes::{Mode, check_interface, success, verify_binding};
use crate::netlink::Netlink;
use crate::response::Success;
use crate::types::NetConf;
use crate::{Error, Result};

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// Plain routing: every node routes each peer's block to that peer's
/// InternalIP, so nodes must share an L2 segment.
pub struct HostGw;

#[tonic::async_trait]
impl<S: KvStore> Mode<S> for HostGw {
    fn mode_name(&self) -> &'static str {
        "host-gw"
    }

    async fn bootstrap(
        &self,
        ctx: &PluginContext<S>,
        args: &Args,
        conf: &NetConf,
    ) -> Result<Success> {
        let ipam = ctx.ipam();
        let block = ipam.bootstrap(None).await?;
        let ip = ipam.allocator().allocate(args.container_id()?).await?;
        let gw = allocator::gateway(&block);

        let nl = Netlink::new()?;
        let veth = create_pod_veth(&nl, args, conf.mtu, ip, gw).await?;
        let address = Ipv4Network::new(ip, 32).map_err(|e| Error::Link(e.to_string()))?;
        nl.add_link_route(address, veth.host.index).await?;
        enable_ip_forward()?;

        sync_peer_routes(ctx, &nl).await?;

        Ok(success(
            conf,
            args.ifname()?,
            &veth.pod.mac,
            args.net_ns()?.clone(),
            address,
            Some(gw),
        ))
    }

    async fn unmount(&self, ctx: &PluginContext<S>, args: &Args, _conf: &NetConf) -> Result<()> {
        let id = args.container_id()?;
        let released = ctx.ipam().allocator().release_container(id).await?;
        if let Some(ip) = released {
            debug!(%ip, "released pod address");
        }
        // host-gw keeps no endpoint map, the pod route goes with the link
        let teardown = VethTeardown::plan(id, released, false);
        let nl = Netlink::new()?;
        if nl.delete_link(&teardown.host_name).await? {
            debug!(host = %teardown.host_name, "deleted pod veth");
        }
        Ok(())
    }

    async fn check(&self, ctx: &PluginContext<S>, args: &Args, _conf: &NetConf) -> Result<()> {
        let ip = verify_binding(ctx, args).await?;
        check_interface(args.net_ns()?, args.ifname()?, ip).await
    }
}

fn enable_ip_forward() -> Result<()> {
    let current = std::fs::read_to_string(IP_FORWARD)?;
    if current.trim() != "1" {
        std::fs::write(IP_FORWARD, "1")?;
        info!("enabled ipv4 forwarding");
    }
    Ok(())
}

/// Routes every peer block via its node. Peers whose address cannot be
/// resolved are skipped; the next ADD tries again.
async fn sync_peer_routes<S: KvStore>(ctx: &PluginContext<S>, nl: &Netlink) -> Result<()> {
    let registry = ctx.ipam().registry();
    let map = registry.get().await?;
    let peers = registry.peers(&map, ctx.ipam().node())?;
    if peers.is_empty() {
        return Ok(());
    }

    let resolver = KubeNodeResolver::new(kubernetes::client().await?);
    let mut addresses = BTreeMap::new();
    for peer in &peers {
        match resolver.internal_ip(&peer.node).await {
            Ok(ip) => {
                addresses.insert(peer.node.clone(), ip);
            }
            Err(e) => warn!(%e, node = %peer.node, "skipping peer without an address"),
        }
    }

    for (block, via) in plan_routes(&peers, &addresses) {
        if nl.ensure_gateway_route(block, via).await? {
            info!(%block, %via, "added peer route");
        }
    }
    Ok(())
}

/// `(peer block, next hop)` for every peer with a known address.
pub fn plan_routes(
    peers: &[Peer],
    addresses: &BTreeMap<String, Ipv4Addr>,
) -> Vec<(Ipv4Network, Ipv4Addr)> {
    peers
        .iter()
        .filter_map(|peer| addresses.get(&peer.node).map(|ip| (peer.block, *ip)))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plan_routes_skips_unresolved() {
        let peers = vec![
            Peer {
                node: "node-b".into(),
                block: "10.244.1.0/24".parse().unwrap(),
            },
            Peer {
                node: "node-c".into(),
                block: "10.244.2.0/24".parse().unwrap(),
            },
        ];
        let mut addresses = BTreeMap::new();
        addresses.insert("node-c".to_string(), Ipv4Addr::new(192, 168, 64, 21));

        assert_eq!(
            plan_routes(&peers, &addresses),
            vec![(
                "10.244.2.0/24".parse().unwrap(),
                Ipv4Addr::new(192, 168, 64, 21)
            )]
        );
        assert!(plan_routes(&[], &addresses).is_empty());
    }
}
