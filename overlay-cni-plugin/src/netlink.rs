use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_packet_route::{LinkMessage, RouteMessage};
use netns_rs::NetNs;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{Error, Result};

const RT_SCOPE_LINK: u8 = 253;
const NUD_PERMANENT: u16 = 0x80;
pub const IPVLAN_MODE_L2: u16 = 0;
pub const MACVLAN_MODE_BRIDGE: u32 = 4;

/// Index and hardware address of a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub mac: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubInterface {
    Ipvlan,
    Macvlan,
}

/// A rtnetlink connection bound to the network namespace of the thread that
/// opened it.
pub struct Netlink {
    handle: rtnetlink::Handle,
    _conn_task: JoinHandle<()>,
}

fn exists(e: &rtnetlink::Error) -> bool {
    e.to_string().contains("File exists")
}

fn missing(e: &rtnetlink::Error) -> bool {
    let e = e.to_string();
    e.contains("No such device") || e.contains("No such process")
}

impl Netlink {
    pub fn new() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    pub async fn link(&self, name: &str) -> Result<Option<LinkInfo>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(link_info(&msg))),
            Ok(None) => Ok(None),
            Err(e) if missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn require_link(&self, name: &str) -> Result<LinkInfo> {
        self.link(name)
            .await?
            .ok_or_else(|| Error::Link(format!("link {name} not found")))
    }

    /// Returns false when there was nothing to delete.
    pub async fn delete_link(&self, name: &str) -> Result<bool> {
        let Some(link) = self.link(name).await? else {
            return Ok(false);
        };
        match self.handle.link().del(link.index).execute().await {
            Ok(()) => Ok(true),
            Err(e) if missing(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_up(&self, index: u32) -> Result<()> {
        Ok(self.handle.link().set(index).up().execute().await?)
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        Ok(self.handle.link().set(index).mtu(mtu).execute().await?)
    }

    pub async fn rename(&self, index: u32, name: &str) -> Result<()> {
        Ok(self
            .handle
            .link()
            .set(index)
            .name(name.to_string())
            .execute()
            .await?)
    }

    pub async fn move_to(&self, index: u32, ns: &NetNs) -> Result<()> {
        Ok(self
            .handle
            .link()
            .set(index)
            .setns_by_fd(ns.file().as_raw_fd())
            .execute()
            .await?)
    }

    /// Creates the pair unless `name` already exists.
    pub async fn ensure_veth(&self, name: &str, peer: &str) -> Result<(LinkInfo, LinkInfo)> {
        if let (Some(link), Some(peer_link)) = (self.link(name).await?, self.link(peer).await?) {
            return Ok((link, peer_link));
        }
        self.create_veth(name, peer).await
    }

    /// Creates a fresh pair, removing stale links of the same names first.
    pub async fn create_veth(&self, name: &str, peer: &str) -> Result<(LinkInfo, LinkInfo)> {
        self.delete_link(name).await?;
        self.delete_link(peer).await?;
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await?;
        debug!("created veth pair {} / {}", name, peer);
        Ok((self.require_link(name).await?, self.require_link(peer).await?))
    }

    /// Creates a collect-metadata vxlan device unless it exists, and makes
    /// sure it is up with the wanted mtu.
    pub async fn ensure_vxlan(&self, name: &str, vni: u32, port: u16, mtu: u32) -> Result<LinkInfo> {
        if self.link(name).await?.is_none() {
            let result = self
                .handle
                .link()
                .add()
                .vxlan(name.to_string(), vni)
                .port(port)
                .collect_metadata(1)
                .learning(0)
                .execute()
                .await;
            match result {
                Ok(()) => debug!("created vxlan device {}", name),
                Err(e) if exists(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let link = self.require_link(name).await?;
        self.set_mtu(link.index, mtu).await?;
        self.set_up(link.index).await?;
        Ok(link)
    }

    pub async fn create_sub_interface(
        &self,
        name: &str,
        master: u32,
        kind: SubInterface,
    ) -> Result<LinkInfo> {
        self.delete_link(name).await?;
        let request = self.handle.link().add();
        let request = match kind {
            SubInterface::Ipvlan => request.ipvlan(name.to_string(), master, IPVLAN_MODE_L2),
            SubInterface::Macvlan => {
                request.macvlan(name.to_string(), master, MACVLAN_MODE_BRIDGE)
            }
        };
        request.execute().await?;
        self.require_link(name).await
    }

    pub async fn add_address(&self, index: u32, ip: Ipv4Addr, prefix: u8) -> Result<()> {
        match self
            .handle
            .address()
            .add(index, IpAddr::V4(ip), prefix)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// IPv4 addresses assigned to `index`.
    pub async fn addresses(&self, index: u32) -> Result<Vec<Ipv4Network>> {
        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut found = vec![];
        while let Some(msg) = addresses.try_next().await? {
            for nla in &msg.nlas {
                if let AddressNla::Address(bytes) = nla
                    && let Some(ip) = ipv4(bytes)
                {
                    let network = Ipv4Network::new(ip, msg.header.prefix_len)
                        .map_err(|e| Error::Link(e.to_string()))?;
                    found.push(network);
                }
            }
        }
        Ok(found)
    }

    /// The link holding `ip`, if any.
    pub async fn link_with_address(&self, ip: Ipv4Addr) -> Result<Option<u32>> {
        let mut addresses = self.handle.address().get().execute();
        while let Some(msg) = addresses.try_next().await? {
            let holds = msg
                .nlas
                .iter()
                .any(|nla| matches!(nla, AddressNla::Address(bytes) if ipv4(bytes) == Some(ip)));
            if holds {
                return Ok(Some(msg.header.index));
            }
        }
        Ok(None)
    }

    /// `ip route add <dst> dev <index> scope link`
    pub async fn add_link_route(&self, dst: Ipv4Network, index: u32) -> Result<()> {
        let result = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst.network(), dst.prefix())
            .output_interface(index)
            .scope(RT_SCOPE_LINK)
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `ip route add default via <gw> dev <index>`
    pub async fn add_default_route(&self, gw: Ipv4Addr, index: u32) -> Result<()> {
        let result = self
            .handle
            .route()
            .add()
            .v4()
            .gateway(gw)
            .output_interface(index)
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Routes `dst` via `gw`, removing a route to `dst` through another
    /// gateway first. Returns false when the route was already in place.
    pub async fn ensure_gateway_route(&self, dst: Ipv4Network, gw: Ipv4Addr) -> Result<bool> {
        for route in self.routes_to(dst).await? {
            if route_gateway(&route) == Some(gw) {
                return Ok(false);
            }
            match self.handle.route().del(route).execute().await {
                Ok(()) => debug!(%dst, "removed stale route"),
                Err(e) if missing(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let result = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst.network(), dst.prefix())
            .gateway(gw)
            .execute()
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(e) if exists(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn routes_to(&self, dst: Ipv4Network) -> Result<Vec<RouteMessage>> {
        let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        let mut found = vec![];
        while let Some(route) = routes.try_next().await? {
            if route.header.destination_prefix_length != dst.prefix() {
                continue;
            }
            let destination = route.nlas.iter().find_map(|nla| match nla {
                RouteNla::Destination(bytes) => ipv4(bytes),
                _ => None,
            });
            if destination == Some(dst.network()) {
                found.push(route);
            }
        }
        Ok(found)
    }

    /// Permanent neighbour entry, so the pod never has to resolve `ip`.
    pub async fn add_permanent_neighbour(&self, index: u32, ip: Ipv4Addr, mac: &[u8]) -> Result<()> {
        let result = self
            .handle
            .neighbours()
            .add(index, IpAddr::V4(ip))
            .link_local_address(mac)
            .state(NUD_PERMANENT)
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn link_info(msg: &LinkMessage) -> LinkInfo {
    let mac = msg
        .nlas
        .iter()
        .find_map(|nla| match nla {
            LinkNla::Address(mac) => Some(mac.clone()),
            _ => None,
        })
        .unwrap_or_default();
    LinkInfo {
        index: msg.header.index,
        mac,
    }
}

fn route_gateway(route: &RouteMessage) -> Option<Ipv4Addr> {
    route.nlas.iter().find_map(|nla| match nla {
        RouteNla::Gateway(bytes) => ipv4(bytes),
        _ => None,
    })
}

fn ipv4(bytes: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = bytes.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn open_netns(path: &Path) -> Result<NetNs> {
    Ok(netns_rs::get_from_path(path)?)
}

/// Runs `f` against a netlink connection opened inside the namespace at
/// `path`.
///
/// Entering a namespace changes the calling thread, so the work happens on a
/// dedicated thread with its own runtime and never on a tokio worker.
pub async fn in_netns<F, Fut, T>(path: PathBuf, f: F) -> Result<T>
where
    F: FnOnce(Netlink) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>>,
    T: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let result = (|| {
            let netns = open_netns(&path)?;
            netns.enter()?;
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(async {
                let netlink = Netlink::new()?;
                f(netlink).await
            })
        })();
        let _ = tx.send(result);
    });
    rx.await
        .map_err(|_| Error::Fatal("in-namespace thread panicked".into()))?
}
