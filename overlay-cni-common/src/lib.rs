#![no_std]

use core::net::Ipv4Addr;

/// Name of the map holding local endpoints, also the pin name under the bpf fs.
pub const LXC_MAP_NAME: &str = "overlay_lxc";
/// Name of the map holding remote pod to node bindings.
pub const POD_MAP_NAME: &str = "overlay_pod";
/// Name of the map holding node local device indexes.
pub const NODE_LOCAL_MAP_NAME: &str = "overlay_local";

pub const MAP_MAX_ENTRIES: u32 = 255;

/// Tunnel id the vxlan programs stamp on encapsulated traffic.
pub const VXLAN_TUNNEL_ID: u32 = 13190;

/// Converts an address into the u32 layout the tc programs compare against,
/// which is the address as it sits in the packet header.
pub fn ipv4_to_map(ip: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(ip.octets())
}

pub fn ipv4_from_map(ip: u32) -> Ipv4Addr {
    Ipv4Addr::from(ip.to_ne_bytes())
}

/// Pads a 6 byte hardware address into the 8 byte slot used by the maps.
pub fn mac_to_map(mac: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    let len = mac.len().min(6);
    out[..len].copy_from_slice(&mac[..len]);
    out
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub ip: u32,
}

impl From<Ipv4Addr> for EndpointKey {
    fn from(value: Ipv4Addr) -> Self {
        Self {
            ip: ipv4_to_map(value),
        }
    }
}

/// A pod attached to this node.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    /// pod side veth
    pub if_index: u32,
    /// host side veth, the redirect target for traffic to the pod
    pub lxc_if_index: u32,
    pub mac: [u8; 8],
    pub node_mac: [u8; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PodNodeKey {
    pub ip: u32,
}

impl From<Ipv4Addr> for PodNodeKey {
    fn from(value: Ipv4Addr) -> Self {
        Self {
            ip: ipv4_to_map(value),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PodNodeValue {
    pub ip: u32,
}

impl From<Ipv4Addr> for PodNodeValue {
    fn from(value: Ipv4Addr) -> Self {
        Self {
            ip: ipv4_to_map(value),
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLocalKind {
    VxlanDev = 1,
    Veth = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeLocalKey {
    pub kind: u32,
}

impl From<NodeLocalKind> for NodeLocalKey {
    fn from(value: NodeLocalKind) -> Self {
        Self { kind: value as u32 }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLocalValue {
    pub if_index: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for EndpointKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for EndpointInfo {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for PodNodeKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for PodNodeValue {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for NodeLocalKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for NodeLocalValue {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_map_ip_layout_matches_packet_order() {
        let ip = Ipv4Addr::new(10, 244, 7, 2);
        let raw = ipv4_to_map(ip);
        assert_eq!(raw.to_ne_bytes(), [10, 244, 7, 2]);
        assert_eq!(ipv4_from_map(raw), ip);
    }

    #[test]
    fn test_mac_padding() {
        let mac = mac_to_map(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0, 0]);
    }
}
