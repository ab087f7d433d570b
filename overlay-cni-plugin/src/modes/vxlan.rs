use std::net::Ipv4Addr;
use std::path::Path;

use aya::maps::MapError;
use ipnetwork::Ipv4Network;
use overlay_cni_agent::bpf::loader::TcProgram;
use overlay_cni_agent::bpf::{BpfMap, maps_pinned, open_lxc_map, open_node_local_map};
use overlay_cni_common::{
    EndpointInfo, EndpointKey, NodeLocalKey, NodeLocalKind, NodeLocalValue, VXLAN_TUNNEL_ID,
    mac_to_map,
};
use overlay_cni_ipam::{KvStore, allocator};
use tracing::{debug, info, warn};

use crate::config::Args;
use crate::context::PluginContext;
use crate::daemon::ensure_reconciler;
use crate::modes::veth::{PodVeth, VethTeardown, create_pod_veth};
use crate::modes::{Mode, check_interface, success, verify_binding};
use crate::netlink::Netlink;
use crate::response::Success;
use crate::types::NetConf;
use crate::{Error, Result};

pub const HOST_VETH: &str = "veth_host";
pub const NET_VETH: &str = "veth_net";
pub const VXLAN_DEV: &str = "overlay_vxlan";
pub const VXLAN_PORT: u16 = 4789;

/// Pods reach each other through a collect-metadata vxlan device, with the
/// tc programs picking the remote node out of the pinned maps.
pub struct Vxlan;

#[tonic::async_trait]
impl<S: KvStore> Mode<S> for Vxlan {
    fn mode_name(&self) -> &'static str {
        "vxlan"
    }

    async fn bootstrap(
        &self,
        ctx: &PluginContext<S>,
        args: &Args,
        conf: &NetConf,
    ) -> Result<Success> {
        let ipam = ctx.ipam();
        let block = ipam.bootstrap(None).await?;
        ctx.tc().ensure_maps()?;
        if let Some(pid) = ensure_reconciler(ctx, args, conf)? {
            info!(pid, "spawned reconciler");
        }

        let ip = ipam.allocator().allocate(args.container_id()?).await?;
        let gw = allocator::gateway(&block);

        let nl = Netlink::new()?;
        setup_node_devices(&nl, ctx.bpf_fs(), gw, conf.vxlan_mtu).await?;

        let veth = create_pod_veth(&nl, args, conf.mtu, ip, gw).await?;
        ctx.tc().attach(TcProgram::VethIngress, &veth.host_name)?;
        ctx.tc().attach(TcProgram::VxlanIngress, VXLAN_DEV)?;
        ctx.tc().attach(TcProgram::VxlanEgress, VXLAN_DEV)?;
        insert_endpoint(ctx.bpf_fs(), ip, &veth)?;

        let address = Ipv4Network::new(ip, 32).map_err(|e| Error::Link(e.to_string()))?;
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
        let teardown = VethTeardown::plan(id, released, maps_pinned(ctx.bpf_fs()));
        if let Some(ip) = teardown.endpoint {
            remove_endpoint(ctx.bpf_fs(), ip)?;
        }

        ctx.tc().detach(TcProgram::VethIngress, &teardown.host_name)?;
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

/// The node wide devices every pod shares: the gateway veth pair and the
/// vxlan device, with their indexes published to the node local map.
async fn setup_node_devices(nl: &Netlink, bpf_fs: &Path, gw: Ipv4Addr, vxlan_mtu: u32) -> Result<()> {
    let (host, net) = nl.ensure_veth(HOST_VETH, NET_VETH).await?;
    nl.add_address(host.index, gw, 32).await?;
    nl.set_up(host.index).await?;
    nl.set_up(net.index).await?;

    let vxlan = nl
        .ensure_vxlan(VXLAN_DEV, VXLAN_TUNNEL_ID, VXLAN_PORT, vxlan_mtu)
        .await?;

    let mut node_local = open_node_local_map(bpf_fs)?;
    node_local.update(
        NodeLocalKey::from(NodeLocalKind::VxlanDev),
        NodeLocalValue {
            if_index: vxlan.index,
        },
    )?;
    node_local.update(
        NodeLocalKey::from(NodeLocalKind::Veth),
        NodeLocalValue {
            if_index: host.index,
        },
    )?;
    debug!(vxlan = vxlan.index, veth = host.index, "node local map updated");
    Ok(())
}

fn insert_endpoint(bpf_fs: &Path, ip: Ipv4Addr, veth: &PodVeth) -> Result<()> {
    let mut lxc = open_lxc_map(bpf_fs)?;
    lxc.update(
        EndpointKey::from(ip),
        EndpointInfo {
            if_index: veth.pod.index,
            lxc_if_index: veth.host.index,
            mac: mac_to_map(&veth.pod.mac),
            node_mac: mac_to_map(&veth.host.mac),
        },
    )?;
    debug!(%ip, host = %veth.host_name, "lxc map entry written");
    Ok(())
}

fn remove_endpoint(bpf_fs: &Path, ip: Ipv4Addr) -> Result<()> {
    let mut lxc = open_lxc_map(bpf_fs)?;
    match lxc.delete(&EndpointKey::from(ip)) {
        Ok(()) => Ok(()),
        Err(overlay_cni_agent::Error::MapError(e)) if key_missing(&e) => {
            warn!(%ip, "lxc map entry already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn key_missing(e: &MapError) -> bool {
    match e {
        MapError::KeyNotFound => true,
        MapError::SyscallError(err) => err.io_error.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_missing_key_detection() {
        assert!(key_missing(&MapError::KeyNotFound));
        assert!(!key_missing(&MapError::ElementNotFound));
    }
}
