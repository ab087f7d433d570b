pub mod host_gw;
pub mod veth;
pub mod vxlan;
pub mod xvlan;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use ipnetwork::{IpNetwork, Ipv4Network};
use overlay_cni_ipam::KvStore;
use semver::Version;
use tracing::debug;

use crate::config::Args;
use crate::context::PluginContext;
use crate::netlink::{format_mac, in_netns};
use crate::response::Success;
use crate::types::{Interface, Ip, NetConf};
use crate::{Error, Result};

/// A way of wiring pods into the overlay, picked by the `mode` config key.
#[tonic::async_trait]
pub trait Mode<S: KvStore>: Send + Sync {
    fn mode_name(&self) -> &'static str;

    /// ADD: allocate an address and plumb the pod.
    async fn bootstrap(&self, ctx: &PluginContext<S>, args: &Args, conf: &NetConf)
    -> Result<Success>;

    /// DEL: release the address and remove what ADD created. Must succeed
    /// when repeated or when ADD never ran.
    async fn unmount(&self, ctx: &PluginContext<S>, args: &Args, conf: &NetConf) -> Result<()>;

    /// CHECK: the pod still holds the address ADD gave it.
    async fn check(&self, ctx: &PluginContext<S>, args: &Args, conf: &NetConf) -> Result<()>;
}

pub struct ModeRegistry<S> {
    modes: BTreeMap<&'static str, Box<dyn Mode<S>>>,
}

impl<S: KvStore> Default for ModeRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: KvStore> ModeRegistry<S> {
    pub fn new() -> Self {
        Self {
            modes: BTreeMap::new(),
        }
    }

    /// vxlan, host-gw, ipvlan and macvlan.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(vxlan::Vxlan))?;
        registry.register(Box::new(host_gw::HostGw))?;
        registry.register(Box::new(xvlan::Xvlan::ipvlan()))?;
        registry.register(Box::new(xvlan::Xvlan::macvlan()))?;
        Ok(registry)
    }

    pub fn register(&mut self, mode: Box<dyn Mode<S>>) -> Result<()> {
        let name = mode.mode_name();
        if self.modes.contains_key(name) {
            return Err(Error::Fatal(format!("mode {name} registered twice")));
        }
        debug!(mode = name, "registered mode");
        self.modes.insert(name, mode);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Mode<S>> {
        self.modes
            .get(name)
            .map(|m| m.as_ref())
            .ok_or_else(|| {
                Error::InvalidNetworkConfig(format!(
                    "unknown mode {name:?}, expected one of {:?}",
                    self.modes.keys().collect::<Vec<_>>()
                ))
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modes.keys().copied().collect()
    }
}

/// The address ADD recorded for the container, provided it is still in the
/// node's record.
pub async fn verify_binding<S: KvStore>(ctx: &PluginContext<S>, args: &Args) -> Result<Ipv4Addr> {
    let id = args.container_id()?;
    let allocator = ctx.ipam().allocator();
    let Some(ip) = allocator.binding(id).await? else {
        return Err(Error::ContainerUnknown(format!("no address bound to {id}")));
    };
    if !allocator.record().await?.contains(&ip) {
        return Err(Error::ContainerUnknown(format!(
            "{ip} bound to {id} is not in the node record"
        )));
    }
    Ok(ip)
}

/// Fails unless `ifname` inside the namespace carries `ip`.
pub async fn check_interface(netns: &Path, ifname: &str, ip: Ipv4Addr) -> Result<()> {
    let ifname = ifname.to_owned();
    in_netns(netns.to_owned(), move |nl| async move {
        let link = nl.require_link(&ifname).await?;
        let addresses = nl.addresses(link.index).await?;
        if !addresses.iter().any(|a| a.ip() == ip) {
            return Err(Error::Link(format!("{ifname} does not hold {ip}")));
        }
        Ok(())
    })
    .await
}

/// The ADD result for a single interface inside the sandbox.
pub fn success(
    conf: &NetConf,
    ifname: &str,
    mac: &[u8],
    netns: PathBuf,
    address: Ipv4Network,
    gateway: Option<Ipv4Addr>,
) -> Success {
    let version = (conf.cni_version < Version::new(1, 0, 0)).then(|| "4".to_string());
    Success {
        cni_version: conf.cni_version.clone(),
        interfaces: vec![Interface {
            name: ifname.to_owned(),
            mac: (!mac.is_empty()).then(|| format_mac(mac)),
            mtu: None,
            sandbox: Some(netns),
        }],
        ips: vec![Ip {
            version,
            address: IpNetwork::V4(address),
            gateway: gateway.map(IpAddr::V4),
            interface: Some(0),
        }],
        routes: vec![],
        dns: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn conf(version: &str) -> NetConf {
        NetConf::parse(&format!(
            r#"{{"cniVersion":"{version}","name":"overlay","subnet":"10.244.0.0/16"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_success_shape() {
        let address = Ipv4Network::new(Ipv4Addr::new(10, 244, 7, 5), 32).unwrap();
        let gw = Some(Ipv4Addr::new(10, 244, 7, 1));
        let mac = [0x0a, 0x58, 0x0a, 0xf4, 0x07, 0x05];

        let old = success(&conf("0.3.1"), "eth0", &mac, "/var/run/netns/a".into(), address, gw);
        let json = serde_json::to_value(&old).unwrap();
        assert_eq!(json["cniVersion"], "0.3.1");
        assert_eq!(json["ips"][0]["version"], "4");
        assert_eq!(json["ips"][0]["gateway"], "10.244.7.1");
        assert_eq!(json["ips"][0]["interface"], 0);
        assert_eq!(json["interfaces"][0]["mac"], "0a:58:0a:f4:07:05");
        assert_eq!(json["interfaces"][0]["sandbox"], "/var/run/netns/a");

        let new = success(&conf("1.0.0"), "eth0", &[], "/var/run/netns/a".into(), address, None);
        let json = serde_json::to_value(&new).unwrap();
        assert!(json["ips"][0].get("version").is_none());
        assert!(json["ips"][0].get("gateway").is_none());
        assert!(json["interfaces"][0].get("mac").is_none());
    }

    #[test]
    fn test_builtin_modes() {
        let registry = ModeRegistry::<overlay_cni_ipam::MemoryStore>::builtin().unwrap();
        assert_eq!(registry.names(), vec!["host-gw", "ipvlan", "macvlan", "vxlan"]);
        assert!(registry.get("vxlan").is_ok());
        let err = registry.get("bridge").err().unwrap();
        assert_eq!(err.code().0, 7);

        let mut registry = registry;
        assert!(registry.register(Box::new(vxlan::Vxlan)).is_err());
    }
}
