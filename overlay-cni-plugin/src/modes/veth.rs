use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::Args;
use crate::netlink::{LinkInfo, Netlink, in_netns, open_netns};
use crate::{Error, Result};

/// Host end names are `lxc_` plus the first 8 hex chars of the container id
/// digest, which keeps them under IFNAMSIZ for any id.
pub fn host_veth_name(container_id: &str) -> String {
    format!("lxc_{}", short_hash(container_id))
}

/// Name the pod end carries between creation and the rename in the netns.
fn temp_peer_name(container_id: &str) -> String {
    format!("tmp_{}", short_hash(container_id))
}

pub(crate) fn short_hash(container_id: &str) -> String {
    let digest = Sha256::digest(container_id.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// The two ends of a pod's veth pair.
#[derive(Clone, Debug)]
pub struct PodVeth {
    pub host_name: String,
    pub host: LinkInfo,
    pub pod: LinkInfo,
}

/// Creates the pod's veth pair, moves one end into the netns as the CNI
/// interface and points the pod's default route at `gw` through it.
pub async fn create_pod_veth(
    nl: &Netlink,
    args: &Args,
    mtu: u32,
    ip: Ipv4Addr,
    gw: Ipv4Addr,
) -> Result<PodVeth> {
    let id = args.container_id()?;
    let ifname = args.ifname()?.to_owned();
    let netns_path = args.net_ns()?.clone();
    let host_name = host_veth_name(id);
    let peer_name = temp_peer_name(id);

    let (host, peer) = nl.create_veth(&host_name, &peer_name).await?;
    nl.set_mtu(host.index, mtu).await?;
    nl.set_mtu(peer.index, mtu).await?;
    let netns = open_netns(&netns_path)?;
    nl.move_to(peer.index, &netns).await?;
    nl.set_up(host.index).await?;
    debug!(host = %host_name, netns = %netns_path.display(), "moved pod veth end");

    let host_mac = host.mac.clone();
    let pod = in_netns(netns_path, move |nl| async move {
        let peer = nl.require_link(&peer_name).await?;
        nl.rename(peer.index, &ifname).await?;
        nl.add_address(peer.index, ip, 32).await?;
        if let Some(lo) = nl.link("lo").await? {
            nl.set_up(lo.index).await?;
        }
        nl.set_up(peer.index).await?;
        let gw_net = Ipv4Network::new(gw, 32).map_err(|e| Error::Link(e.to_string()))?;
        nl.add_link_route(gw_net, peer.index).await?;
        nl.add_default_route(gw, peer.index).await?;
        nl.add_permanent_neighbour(peer.index, gw, &host_mac).await?;
        nl.require_link(&ifname).await
    })
    .await?;

    info!(host = %host_name, %ip, %gw, "pod veth ready");
    Ok(PodVeth {
        host_name,
        host,
        pod,
    })
}

/// What a DEL still has to undo for a veth backed pod. Deleting the host end
/// takes the pod end with it, and every step accepts state that is already
/// gone, so a repeated DEL plans the same link delete and nothing else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VethTeardown {
    pub host_name: String,
    /// Set only when this DEL released the address and the maps exist.
    pub endpoint: Option<Ipv4Addr>,
}

impl VethTeardown {
    pub fn plan(container_id: &str, released: Option<Ipv4Addr>, maps_pinned: bool) -> Self {
        Self {
            host_name: host_veth_name(container_id),
            endpoint: released.filter(|_| maps_pinned),
        }
    }
}
