use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use overlay_cni_common::MAP_MAX_ENTRIES;
use overlay_cni_ipam::keys::DEFAULT_KEY_PREFIX;
use overlay_cni_ipam::subnet::DEFAULT_BLOCK_PREFIX;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_MODE: &str = "host-gw";
pub const DEFAULT_MTU: u32 = 1450;
pub const DEFAULT_VXLAN_MTU: u32 = 1500;
pub const DEFAULT_BPF_OBJECT_DIR: &str = "/opt/cni/bin/overlay-cni-bpf";
pub const DEFAULT_LOG_DIR: &str = "/var/log/overlay-cni";

/// Network configuration handed to the plugin on stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// A config without a version is read as 0.1.0.
    #[serde(
        default = "unversioned",
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub r#type: String,

    #[serde(default = "default_mode")]
    pub mode: String,

    /// Cluster pod subnet, with or without a prefix length.
    #[serde(default)]
    pub subnet: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_prefix: Option<u8>,

    #[serde(default = "default_mtu")]
    pub mtu: u32,

    #[serde(default = "default_vxlan_mtu")]
    pub vxlan_mtu: u32,

    #[serde(default = "default_kv_prefix")]
    pub kv_prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_endpoint: Option<String>,

    #[serde(default = "default_bpf_object_dir")]
    pub bpf_object_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Size of each pinned map when this invocation is the one creating them.
    #[serde(default = "default_map_max_entries")]
    pub map_max_entries: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
}

fn unversioned() -> Version {
    Version::new(0, 1, 0)
}

fn default_mode() -> String {
    DEFAULT_MODE.into()
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_vxlan_mtu() -> u32 {
    DEFAULT_VXLAN_MTU
}

fn default_kv_prefix() -> String {
    DEFAULT_KEY_PREFIX.into()
}

fn default_bpf_object_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BPF_OBJECT_DIR)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

fn default_map_max_entries() -> u32 {
    MAP_MAX_ENTRIES
}

impl NetConf {
    /// Decodes and checks the config. Nothing here touches the network.
    pub fn parse(input: &str) -> Result<Self> {
        let conf: NetConf = serde_json::from_str(input)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidNetworkConfig("name is required".into()));
        }
        if self.mode.is_empty() {
            return Err(Error::InvalidNetworkConfig("mode is empty".into()));
        }
        if self.subnet.trim().is_empty() {
            return Err(Error::InvalidNetworkConfig("subnet is required".into()));
        }
        if self.mtu < 68 || self.vxlan_mtu < 68 {
            return Err(Error::InvalidNetworkConfig(format!(
                "mtu {} / vxlanMtu {} is below the IPv4 minimum",
                self.mtu, self.vxlan_mtu
            )));
        }
        if self.map_max_entries == 0 {
            return Err(Error::InvalidNetworkConfig(
                "mapMaxEntries must be positive".into(),
            ));
        }
        self.range()?;
        Ok(())
    }

    pub fn block_prefix(&self) -> u8 {
        self.block_prefix.unwrap_or(DEFAULT_BLOCK_PREFIX)
    }

    /// The `ipam.rangeStart`-`ipam.rangeEnd` pair. Empty strings count as
    /// unset, and setting only one end is an error.
    pub fn range(&self) -> Result<Option<(Ipv4Addr, Ipv4Addr)>> {
        let Some(ipam) = &self.ipam else {
            return Ok(None);
        };
        let start = ipam.range_start.as_deref().filter(|s| !s.is_empty());
        let end = ipam.range_end.as_deref().filter(|s| !s.is_empty());
        match (start, end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => Ok(Some((parse_ip(start)?, parse_ip(end)?))),
            _ => Err(Error::InvalidNetworkConfig(
                "ipam needs both rangeStart and rangeEnd".into(),
            )),
        }
    }
}

fn parse_ip(s: &str) -> Result<Ipv4Addr> {
    s.trim()
        .parse()
        .map_err(|_| Error::InvalidNetworkConfig(format!("{s} is not an IPv4 address")))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ip {
    /// Only results older than 1.0.0 carry the address family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub address: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub dst: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}
